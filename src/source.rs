use std::path::PathBuf;

use image::GenericImageView;
use log::{debug, warn};

use crate::error::AtlasError;

/// A decoded RGBA8 bitmap, 4 bytes per pixel, row-major, tightly packed.
#[derive(Debug, Clone)]
pub struct PixelData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl PixelData {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), (width * height * 4) as usize);
        Self {
            width,
            height,
            pixels,
        }
    }

    /// A solid-color bitmap. Handy for placeholders and tests.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            pixels.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// Supplies pixels for an image key, both on first load and when atlases
/// are rebuilt after device loss.
pub trait PixelSource {
    fn fetch(&mut self, key: &str) -> Result<PixelData, AtlasError>;
}

/// Decodes image files from disk, resolving keys as paths relative to an
/// optional base directory.
pub struct FileSource {
    base_dir: Option<PathBuf>,
}

impl FileSource {
    pub fn new() -> Self {
        Self { base_dir: None }
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.join(key),
            None => PathBuf::from(key),
        }
    }
}

impl Default for FileSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelSource for FileSource {
    fn fetch(&mut self, key: &str) -> Result<PixelData, AtlasError> {
        let path = self.resolve(key);
        let img = image::open(&path).map_err(|e| {
            warn!("Failed to decode {:?}: {}", path, e);
            AtlasError::Decode {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })?;

        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(AtlasError::Validation { width, height });
        }

        let rgba = img.to_rgba8();
        debug!("Decoded {:?} ({}x{})", path, width, height);

        Ok(PixelData::new(width, height, rgba.into_raw()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;

    /// In-memory pixel source that counts fetches per key, so tests can
    /// assert that restore paths skip decoding.
    pub struct CountingSource {
        images: HashMap<String, PixelData>,
        pub fetches: HashMap<String, usize>,
    }

    impl CountingSource {
        pub fn new() -> Self {
            Self {
                images: HashMap::new(),
                fetches: HashMap::new(),
            }
        }

        pub fn insert(&mut self, key: &str, data: PixelData) {
            self.images.insert(key.to_string(), data);
        }

        pub fn remove(&mut self, key: &str) {
            self.images.remove(key);
        }

        pub fn fetch_count(&self, key: &str) -> usize {
            self.fetches.get(key).copied().unwrap_or(0)
        }
    }

    impl PixelSource for CountingSource {
        fn fetch(&mut self, key: &str) -> Result<PixelData, AtlasError> {
            *self.fetches.entry(key.to_string()).or_insert(0) += 1;
            self.images
                .get(key)
                .cloned()
                .ok_or_else(|| AtlasError::Decode {
                    key: key.to_string(),
                    reason: "no such image".to_string(),
                })
        }
    }
}
