use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::atlas::record::{Frame, ImageHandle};
use crate::error::{AtlasError, ReloadReport};
use crate::manager::{AtlasManager, PlaceRequest, PlacementBatch, ReleaseOutcome};
use crate::source::{PixelData, PixelSource};

/// Key-addressed front door over the atlas manager.
///
/// Deduplicates images by key, drives ref counts, and keeps the key→record
/// map honest when placements displace stale records: displaced keys are
/// dropped from the map before the new record is published, so a stale key
/// can never resolve to someone else's pixels.
pub struct ImageRegistry<S: PixelSource> {
    manager: AtlasManager,
    source: S,
    entries: HashMap<String, ImageHandle>,
    hits: usize,
    misses: usize,
}

impl<S: PixelSource> ImageRegistry<S> {
    pub fn new(manager: AtlasManager, source: S) -> Self {
        Self {
            manager,
            source,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn manager(&self) -> &AtlasManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut AtlasManager {
        &mut self.manager
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Where a key currently lives, if it is mapped at all.
    pub fn handle(&self, key: &str) -> Option<ImageHandle> {
        self.entries.get(key).copied()
    }

    pub fn ref_count(&self, key: &str) -> Option<u32> {
        let handle = *self.entries.get(key)?;
        self.manager.record(handle).map(|r| r.ref_count)
    }

    /// Hit/miss counters, in that order.
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }

    fn note_hit(&mut self) {
        self.hits += 1;
        let interval = self.manager.settings().stats_log_interval;
        if self.hits % interval == 0 {
            debug!("ImageRegistry: {} hits, {} misses", self.hits, self.misses);
        }
    }

    fn apply_evictions(&mut self, evicted: &[String]) {
        for key in evicted {
            if self.entries.remove(key).is_some() {
                debug!("ImageRegistry: '{}' evicted from key map", key);
            }
        }
    }

    /// Share an already-placed record: bump its ref count, restoring it in
    /// place first if it was freed. No decoding happens on this path.
    fn share_existing(&mut self, handle: ImageHandle) -> Result<Frame, AtlasError> {
        let ref_count = self
            .manager
            .record(handle)
            .map(|r| r.ref_count)
            .ok_or_else(|| {
                AtlasError::Consistency("key map points at a missing record".to_string())
            })?;
        if ref_count == 0 {
            self.manager.revive(handle)?;
        } else {
            self.manager.acquire(handle)?;
        }
        self.note_hit();
        self.manager.frame(handle)
    }

    /// Fetch an image by key, decoding and placing it on first use and
    /// sharing the existing placement afterwards. Every successful call
    /// adds one reference; pair each with a [`ImageRegistry::release`].
    pub fn load(&mut self, key: &str, is_static: bool) -> Result<Frame, AtlasError> {
        if let Some(&handle) = self.entries.get(key) {
            return self.share_existing(handle);
        }

        self.misses += 1;
        let data = self.source.fetch(key)?;
        self.place_new(key, data, is_static, true)
    }

    /// Register procedurally produced pixels (e.g. rendered to texture)
    /// under a key. These cannot be re-fetched from the source, so they
    /// are snapshotted across device loss. Re-inserting a key with
    /// matching dimensions refreshes its pixels and adds a reference.
    pub fn insert_raw(
        &mut self,
        key: &str,
        data: PixelData,
        is_static: bool,
    ) -> Result<Frame, AtlasError> {
        if let Some(&handle) = self.entries.get(key) {
            let record = self.manager.record(handle).ok_or_else(|| {
                AtlasError::Consistency("key map points at a missing record".to_string())
            })?;
            if (record.width, record.height) != (data.width, data.height) {
                return Err(AtlasError::Validation {
                    width: data.width,
                    height: data.height,
                });
            }
            let frame = self.share_existing(handle)?;
            self.manager
                .update_pixels(handle, 0, 0, data.width, data.height, &data.pixels)?;
            return Ok(frame);
        }

        self.misses += 1;
        self.place_new(key, data, is_static, false)
    }

    fn place_new(
        &mut self,
        key: &str,
        data: PixelData,
        is_static: bool,
        derivable: bool,
    ) -> Result<Frame, AtlasError> {
        let request = PlaceRequest {
            key: key.to_string(),
            width: data.width,
            height: data.height,
            pixels: data.pixels,
            is_static,
            derivable,
        };
        let placed = self.manager.place_image(&request)?;

        // Displaced keys leave the map before the new one enters it.
        self.apply_evictions(&placed.evicted);
        self.entries.insert(key.to_string(), placed.handle);
        self.manager.frame(placed.handle)
    }

    /// Drop one reference. At zero the record is freed (shared atlases;
    /// the key stays mapped so a quick re-load can restore it without
    /// decoding) or destroyed together with its dedicated atlas.
    pub fn release(&mut self, key: &str) -> Result<u32, AtlasError> {
        let handle = *self
            .entries
            .get(key)
            .ok_or_else(|| AtlasError::UnknownImage(key.to_string()))?;
        match self.manager.release(handle)? {
            ReleaseOutcome::InUse(remaining) => Ok(remaining),
            ReleaseOutcome::Freed => Ok(0),
            ReleaseOutcome::Removed => {
                self.entries.remove(key);
                Ok(0)
            }
        }
    }

    /// Renderer view of a live image. Freed and unknown keys draw nothing.
    pub fn frame(&self, key: &str) -> Option<Frame> {
        let handle = *self.entries.get(key)?;
        let record = self.manager.record(handle)?;
        if !record.is_live() {
            return None;
        }
        self.manager.frame(handle).ok()
    }

    /// Preload a set of keys in one batch, largest first. Keys are
    /// deduplicated: each distinct key gains exactly one reference.
    /// Already-loaded keys are shared as usual.
    pub fn load_many(&mut self, keys: &[&str], is_static: bool) -> Vec<Result<Frame, AtlasError>> {
        let mut batch = PlacementBatch::new();
        let mut queued: HashSet<&str> = HashSet::new();
        let mut decode_failures: HashMap<&str, AtlasError> = HashMap::new();

        for &key in keys {
            if self.entries.contains_key(key) || queued.contains(key) {
                continue;
            }
            match self.source.fetch(key) {
                Ok(data) => {
                    self.misses += 1;
                    batch.push(PlaceRequest {
                        key: key.to_string(),
                        width: data.width,
                        height: data.height,
                        pixels: data.pixels,
                        is_static,
                        derivable: true,
                    });
                    queued.insert(key);
                }
                Err(e) => {
                    self.misses += 1;
                    decode_failures.insert(key, e);
                }
            }
        }
        batch.sort_largest_first();

        let mut placements: HashMap<String, Result<Frame, AtlasError>> = HashMap::new();
        for (key, result) in self.manager.commit_batch(batch) {
            match result {
                Ok(placed) => {
                    self.apply_evictions(&placed.evicted);
                    self.entries.insert(key.clone(), placed.handle);
                    placements.insert(key, self.manager.frame(placed.handle));
                }
                Err(e) => {
                    placements.insert(key, Err(e));
                }
            }
        }

        // Keys resident before this call get exactly one new reference, no
        // matter how often they repeat in the input.
        let mut shared: HashSet<&str> = HashSet::new();
        keys.iter()
            .map(|&key| {
                if let Some(e) = decode_failures.get(key) {
                    return Err(e.clone());
                }
                if let Some(result) = placements.get(key) {
                    return result.clone();
                }
                if shared.contains(key) {
                    return self
                        .frame(key)
                        .ok_or_else(|| AtlasError::UnknownImage(key.to_string()));
                }
                match self.entries.get(key).copied() {
                    Some(handle) => {
                        shared.insert(key);
                        self.share_existing(handle)
                    }
                    None => Err(AtlasError::UnknownImage(key.to_string())),
                }
            })
            .collect()
    }

    /// Device-loss entry point: drop every surface, snapshotting
    /// procedural images first.
    pub fn unload_all(&mut self) {
        self.manager.unload_all();
    }

    /// Rebuild all surfaces and re-upload every live record. Keys that
    /// could not be re-obtained are evicted from the map; holders must
    /// re-request them (and may render a placeholder meanwhile).
    pub fn reload_all(&mut self) -> ReloadReport {
        let report = self.manager.reload_all(&mut self.source);
        for key in &report.evicted {
            if self.entries.remove(key).is_some() {
                warn!("ImageRegistry: '{}' lost during reload", key);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::device::SoftwareDevice;
    use crate::source::testing::CountingSource;

    fn registry() -> ImageRegistry<CountingSource> {
        let manager = AtlasManager::new(Box::new(SoftwareDevice::new()), Settings::default());
        let mut source = CountingSource::new();
        source.insert("sword", PixelData::solid(32, 32, [1, 0, 0, 255]));
        source.insert("shield", PixelData::solid(32, 32, [0, 1, 0, 255]));
        source.insert("portrait", PixelData::solid(17, 93, [0, 0, 1, 255]));
        source.insert("boss", PixelData::solid(600, 600, [9, 9, 9, 255]));
        ImageRegistry::new(manager, source)
    }

    fn placed_pixels(reg: &mut ImageRegistry<CountingSource>, key: &str) -> Vec<u8> {
        let handle = reg.handle(key).expect("key is mapped");
        let (x, y, w, h) = reg.manager().record(handle).unwrap().rect();
        let surface = reg.manager().frame(handle).unwrap().surface;
        reg.manager_mut()
            .device_mut()
            .read_sub_rect(surface, x, y, w, h)
            .unwrap()
    }

    #[test]
    fn dedup_shares_one_placement() {
        let mut reg = registry();
        let first = reg.load("sword", false).unwrap();
        let second = reg.load("sword", false).unwrap();

        assert_eq!(reg.ref_count("sword"), Some(2));
        assert_eq!(first.surface, second.surface);
        assert_eq!(first.uv, second.uv);
        // Only one decode.
        assert_eq!(reg.source_mut().fetch_count("sword"), 1);

        assert_eq!(reg.release("sword").unwrap(), 1);
        assert_eq!(reg.release("sword").unwrap(), 0);
        assert_eq!(reg.ref_count("sword"), Some(0));
    }

    #[test]
    fn freed_record_restores_without_decoding() {
        let mut reg = registry();
        let first = reg.load("sword", false).unwrap();
        reg.release("sword").unwrap();

        let again = reg.load("sword", false).unwrap();
        assert_eq!(again.uv, first.uv);
        assert_eq!(again.surface, first.surface);
        assert_eq!(reg.ref_count("sword"), Some(1));
        assert_eq!(reg.source_mut().fetch_count("sword"), 1);
    }

    #[test]
    fn stolen_slot_notifies_eviction_exactly_once() {
        let manager = AtlasManager::new(
            Box::new(SoftwareDevice::new()),
            Settings {
                atlas_size: 32, // single 32x32 cell per fixed atlas
                ..Settings::default()
            },
        );
        let mut source = CountingSource::new();
        source.insert("old", PixelData::solid(32, 32, [1; 4]));
        source.insert("new", PixelData::solid(32, 32, [2; 4]));
        let mut reg = ImageRegistry::new(manager, source);

        reg.load("old", false).unwrap();
        reg.release("old").unwrap();
        assert!(reg.contains("old"));

        // The only cell is stolen; "old" must leave the key map and its
        // displacement is counted once.
        reg.load("new", false).unwrap();
        assert!(!reg.contains("old"));
        assert_eq!(reg.manager().stats().evictions, 1);

        // A fresh load of the displaced key decodes again into a new slot.
        reg.load("old", false).unwrap();
        assert_eq!(reg.source_mut().fetch_count("old"), 2);
    }

    #[test]
    fn oversized_release_destroys_dedicated_atlas() {
        let mut reg = registry();
        let frame = reg.load("boss", false).unwrap();
        assert_eq!(reg.manager().atlas_count(), 1);
        assert!(frame.width == 600 && frame.height == 600);

        assert_eq!(reg.release("boss").unwrap(), 0);
        assert_eq!(reg.manager().atlas_count(), 0);
        assert!(!reg.contains("boss"));
        assert!(reg.frame("boss").is_none());
    }

    #[test]
    fn frame_hidden_while_freed() {
        let mut reg = registry();
        reg.load("sword", false).unwrap();
        assert!(reg.frame("sword").is_some());
        reg.release("sword").unwrap();
        assert!(reg.frame("sword").is_none());
    }

    #[test]
    fn reload_keeps_rects_and_content() {
        let mut reg = registry();
        let sword = reg.load("sword", false).unwrap();
        let portrait = reg.load("portrait", false).unwrap();
        let drawn = reg
            .insert_raw("minimap", PixelData::solid(48, 48, [4, 5, 6, 255]), false)
            .unwrap();

        let sword_before = placed_pixels(&mut reg, "sword");
        let minimap_before = placed_pixels(&mut reg, "minimap");

        reg.unload_all();
        let report = reg.reload_all();
        assert!(report.is_clean());
        assert_eq!(report.reloaded, 3);

        let sword2 = reg.frame("sword").unwrap();
        assert_eq!(sword2.uv, sword.uv);
        let portrait2 = reg.frame("portrait").unwrap();
        assert_eq!(portrait2.uv, portrait.uv);

        // File-backed records decoded again on reload.
        assert_eq!(reg.source_mut().fetch_count("sword"), 2);
        // Snapshot-backed record did not touch the source at all.
        assert_eq!(reg.source_mut().fetch_count("minimap"), 0);
        let minimap2 = reg.frame("minimap").unwrap();
        assert_eq!(minimap2.uv, drawn.uv);

        // Content equality across the unload/reload cycle, for both the
        // file-backed and the snapshot-backed record.
        assert_eq!(placed_pixels(&mut reg, "sword"), sword_before);
        assert_eq!(placed_pixels(&mut reg, "minimap"), minimap_before);
    }

    #[test]
    fn reload_failure_evicts_only_missing_key() {
        let mut reg = registry();
        reg.load("sword", false).unwrap();
        reg.load("shield", false).unwrap();

        reg.unload_all();
        reg.source_mut().remove("shield");
        let report = reg.reload_all();

        assert_eq!(report.reloaded, 1);
        assert_eq!(report.evicted, vec!["shield".to_string()]);
        assert!(!reg.contains("shield"));
        assert!(reg.frame("sword").is_some());
        // Re-requesting the lost key must not fail catastrophically; it
        // simply decodes again once the source has it back.
        reg.source_mut()
            .insert("shield", PixelData::solid(32, 32, [0, 1, 0, 255]));
        assert!(reg.load("shield", false).is_ok());
    }

    #[test]
    fn load_many_dedups_and_orders_by_size() {
        let mut reg = registry();
        let results = reg.load_many(&["portrait", "sword", "sword", "missing"], false);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(results[2].is_ok());
        assert!(matches!(results[3], Err(AtlasError::Decode { .. })));

        // Distinct keys gain exactly one reference each.
        assert_eq!(reg.ref_count("sword"), Some(1));
        assert_eq!(reg.ref_count("portrait"), Some(1));
        reg.manager().check_consistency().unwrap();
    }
}
