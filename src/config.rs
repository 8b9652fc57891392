use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

// Default values for configuration
// These serve as fallback values and can be used for "reset to defaults" functionality
pub const DEFAULT_ATLAS_SIZE: u32 = 512;
pub const DEFAULT_OVERSIZED_LIMIT: u32 = 512;
pub const DEFAULT_STATS_LOG_INTERVAL: usize = 100;

/// Side length of one occupancy-grid unit in the variable allocator.
/// Image dimensions round up to multiples of this before placement.
pub const GRID_UNIT: u32 = 16;

/// Tunable knobs for the atlas manager, loadable from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Side length of shared (non-dedicated) atlases. Power of two.
    #[serde(default = "default_atlas_size")]
    pub atlas_size: u32,

    /// Images with a dimension above this get a dedicated atlas.
    #[serde(default = "default_oversized_limit")]
    pub oversized_limit: u32,

    /// Log registry hit/miss stats every this many cache hits.
    #[serde(default = "default_stats_log_interval")]
    pub stats_log_interval: usize,
}

fn default_atlas_size() -> u32 {
    DEFAULT_ATLAS_SIZE
}

fn default_oversized_limit() -> u32 {
    DEFAULT_OVERSIZED_LIMIT
}

fn default_stats_log_interval() -> usize {
    DEFAULT_STATS_LOG_INTERVAL
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            atlas_size: DEFAULT_ATLAS_SIZE,
            oversized_limit: DEFAULT_OVERSIZED_LIMIT,
            stats_log_interval: DEFAULT_STATS_LOG_INTERVAL,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file, falling back to defaults if the file
    /// is missing, unreadable, or invalid.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str::<Settings>(&contents) {
                Ok(settings) => {
                    info!("Loaded atlas settings from {:?}", path);
                    settings.sanitized()
                }
                Err(e) => {
                    warn!("Failed to parse settings file {:?}: {}", path, e);
                    Settings::default()
                }
            },
            Err(e) => {
                warn!("Could not read settings file {:?}: {}", path, e);
                Settings::default()
            }
        }
    }

    /// Clamp out-of-range values back to defaults, with a warning.
    pub fn sanitized(mut self) -> Self {
        if self.atlas_size == 0 || !self.atlas_size.is_power_of_two() {
            warn!(
                "atlas_size {} is not a power of two, using {}",
                self.atlas_size, DEFAULT_ATLAS_SIZE
            );
            self.atlas_size = DEFAULT_ATLAS_SIZE;
        }
        if self.oversized_limit == 0 {
            warn!(
                "oversized_limit 0 is invalid, using {}",
                DEFAULT_OVERSIZED_LIMIT
            );
            self.oversized_limit = DEFAULT_OVERSIZED_LIMIT;
        }
        if self.stats_log_interval == 0 {
            self.stats_log_interval = DEFAULT_STATS_LOG_INTERVAL;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings: Settings = serde_yaml::from_str("atlas_size: 1024").unwrap();
        assert_eq!(settings.atlas_size, 1024);
        assert_eq!(settings.oversized_limit, DEFAULT_OVERSIZED_LIMIT);
        assert_eq!(settings.stats_log_interval, DEFAULT_STATS_LOG_INTERVAL);
    }

    #[test]
    fn sanitize_rejects_non_power_of_two() {
        let settings = Settings {
            atlas_size: 500,
            ..Settings::default()
        };
        assert_eq!(settings.sanitized().atlas_size, DEFAULT_ATLAS_SIZE);
    }

    #[test]
    fn yaml_round_trip() {
        let settings = Settings {
            atlas_size: 256,
            oversized_limit: 256,
            stats_log_interval: 50,
        };
        let yaml = serde_yaml::to_string(&settings).unwrap();
        let back: Settings = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.atlas_size, 256);
        assert_eq!(back.oversized_limit, 256);
        assert_eq!(back.stats_log_interval, 50);
    }
}
