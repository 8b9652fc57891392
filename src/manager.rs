use std::collections::HashMap;

use log::{debug, info, warn};

use crate::atlas::record::{AtlasId, Frame, ImageHandle, ImageRecord, RecordId};
use crate::atlas::{Atlas, SizeClass};
use crate::config::Settings;
use crate::device::GraphicsDevice;
use crate::error::{AtlasError, ReloadReport};
use crate::source::{PixelData, PixelSource};

/// One queued placement.
#[derive(Debug, Clone)]
pub struct PlaceRequest {
    pub key: String,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub is_static: bool,
    /// Whether the pixel source can re-produce this image by key. False
    /// for procedurally generated content, which is snapshotted across
    /// device loss instead.
    pub derivable: bool,
}

/// Successful placement: where the image went, plus the keys of stale
/// records the placement displaced. Callers caching key lookups must drop
/// the displaced keys before exposing the new handle.
#[derive(Debug)]
pub struct Placed {
    pub handle: ImageHandle,
    pub evicted: Vec<String>,
}

/// What happened to a record when its ref count hit zero.
#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Still referenced elsewhere; contains the remaining count.
    InUse(u32),
    /// Freed in place; metadata kept, restorable until the slot is stolen.
    Freed,
    /// Removed outright and its dedicated atlas destroyed.
    Removed,
}

/// A queue of placements processed together at commit, strictly in queue
/// order. Exists to amortize per-call overhead and to let the caller pick
/// an insertion order; it adds no concurrency.
#[derive(Debug, Default)]
pub struct PlacementBatch {
    requests: Vec<PlaceRequest>,
}

impl PlacementBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: PlaceRequest) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Reorder by pixel area, largest first. Stable, so equal-area
    /// requests keep their enqueue order. Packing big rectangles first
    /// measurably reduces variable-atlas fragmentation.
    pub fn sort_largest_first(&mut self) {
        self.requests
            .sort_by_key(|r| std::cmp::Reverse(r.width as u64 * r.height as u64));
    }
}

/// Running totals, mostly for diagnostics and tests.
#[derive(Debug, Default, Clone)]
pub struct ManagerStats {
    pub atlases_created: usize,
    pub dedicated_destroyed: usize,
    pub images_placed: usize,
    pub evictions: usize,
    pub reload_evictions: usize,
}

/// Owns every atlas and the graphics device, and decides where images go.
///
/// Construct one per graphics-device lifetime and tear it down with the
/// device; there is deliberately no global instance.
pub struct AtlasManager {
    device: Box<dyn GraphicsDevice>,
    settings: Settings,
    atlases: Vec<Option<Atlas>>,
    free_atlas_slots: Vec<u32>,
    snapshots: HashMap<String, PixelData>,
    stats: ManagerStats,
}

impl AtlasManager {
    pub fn new(device: Box<dyn GraphicsDevice>, settings: Settings) -> Self {
        Self {
            device,
            settings: settings.sanitized(),
            atlases: Vec::new(),
            free_atlas_slots: Vec::new(),
            snapshots: HashMap::new(),
            stats: ManagerStats::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    pub fn device(&self) -> &dyn GraphicsDevice {
        self.device.as_ref()
    }

    pub fn device_mut(&mut self) -> &mut dyn GraphicsDevice {
        self.device.as_mut()
    }

    pub fn atlas(&self, id: AtlasId) -> Option<&Atlas> {
        self.atlases.get(id.0 as usize).and_then(|a| a.as_ref())
    }

    fn atlas_mut(&mut self, id: AtlasId) -> Option<&mut Atlas> {
        self.atlases.get_mut(id.0 as usize).and_then(|a| a.as_mut())
    }

    pub fn atlas_count(&self) -> usize {
        self.atlases.iter().filter(|a| a.is_some()).count()
    }

    pub fn record(&self, handle: ImageHandle) -> Option<&ImageRecord> {
        self.atlas(handle.atlas).and_then(|a| a.record(handle.record))
    }

    fn require_atlas(&mut self, id: AtlasId) -> Result<&mut Atlas, AtlasError> {
        self.atlas_mut(id)
            .ok_or_else(|| AtlasError::Consistency(format!("no atlas {:?}", id)))
    }

    fn create_atlas(
        &mut self,
        width: u32,
        height: u32,
        class: SizeClass,
        is_static: bool,
    ) -> Result<AtlasId, AtlasError> {
        let slot = match self.free_atlas_slots.pop() {
            Some(slot) => slot,
            None => {
                self.atlases.push(None);
                self.atlases.len() as u32 - 1
            }
        };
        let id = AtlasId(slot);

        match Atlas::new(id, width, height, class, is_static, self.device.as_mut()) {
            Ok(atlas) => {
                info!(
                    "AtlasManager: new {}x{} {:?} atlas {:?} (static: {}, total: {})",
                    width,
                    height,
                    class,
                    id,
                    is_static,
                    self.atlas_count() + 1
                );
                self.atlases[slot as usize] = Some(atlas);
                self.stats.atlases_created += 1;
                Ok(id)
            }
            Err(e) => {
                self.free_atlas_slots.push(slot);
                warn!("AtlasManager: surface creation failed: {}", e);
                Err(AtlasError::AllocationFailed { width, height })
            }
        }
    }

    fn destroy_atlas(&mut self, id: AtlasId) {
        if let Some(mut atlas) = self
            .atlases
            .get_mut(id.0 as usize)
            .and_then(|slot| slot.take())
        {
            atlas.unload(self.device.as_mut());
            self.free_atlas_slots.push(id.0);
            self.stats.dedicated_destroyed += 1;
            info!("AtlasManager: destroyed dedicated atlas {:?}", id);
        }
    }

    /// Place an image according to the routing rules: oversized images get
    /// a dedicated atlas; exact fixed-class sizes go to that class's
    /// slabs; everything else packs variably. Existing atlases of the
    /// matching class and static-ness are tried in creation order before a
    /// new one is made.
    pub fn place_image(&mut self, request: &PlaceRequest) -> Result<Placed, AtlasError> {
        let (width, height) = (request.width, request.height);
        if width == 0 || height == 0 {
            return Err(AtlasError::Validation { width, height });
        }

        let class = SizeClass::classify(width, height, self.settings.oversized_limit);

        if class == SizeClass::Dedicated {
            return self.place_dedicated(request);
        }

        // Scan shared atlases in creation order.
        let mut scanned: Option<Result<Placed, AtlasError>> = None;
        {
            let Self {
                atlases, device, ..
            } = self;
            for slot in atlases.iter_mut() {
                let atlas = match slot {
                    Some(a) if a.class() == class && a.is_static() == request.is_static => a,
                    _ => continue,
                };
                match atlas.add_image(
                    &request.key,
                    width,
                    height,
                    &request.pixels,
                    request.derivable,
                    device.as_mut(),
                ) {
                    Ok((record, evicted)) => {
                        scanned = Some(Ok(Placed {
                            handle: ImageHandle {
                                atlas: atlas.id(),
                                record,
                            },
                            evicted,
                        }));
                        break;
                    }
                    Err(e) if e.is_recoverable() => continue,
                    Err(e) => {
                        scanned = Some(Err(e));
                        break;
                    }
                }
            }
        }
        match scanned {
            Some(Ok(placed)) => {
                self.stats.images_placed += 1;
                self.stats.evictions += placed.evicted.len();
                return Ok(placed);
            }
            Some(Err(e)) => return Err(e),
            None => {}
        }

        // No room anywhere: open a fresh shared atlas.
        let size = self.settings.atlas_size;
        let id = self.create_atlas(size, size, class, request.is_static)?;
        self.add_to(id, request)
    }

    fn place_dedicated(&mut self, request: &PlaceRequest) -> Result<Placed, AtlasError> {
        let width = request.width.next_power_of_two();
        let height = request.height.next_power_of_two();
        let id = self.create_atlas(width, height, SizeClass::Dedicated, request.is_static)?;
        self.add_to(id, request)
    }

    fn add_to(&mut self, id: AtlasId, request: &PlaceRequest) -> Result<Placed, AtlasError> {
        let Self {
            atlases, device, ..
        } = self;
        let atlas = atlases[id.0 as usize]
            .as_mut()
            .ok_or_else(|| AtlasError::Consistency(format!("no atlas {:?}", id)))?;
        let (record, evicted) = atlas.add_image(
            &request.key,
            request.width,
            request.height,
            &request.pixels,
            request.derivable,
            device.as_mut(),
        )?;
        self.stats.images_placed += 1;
        self.stats.evictions += evicted.len();
        Ok(Placed {
            handle: ImageHandle { atlas: id, record },
            evicted,
        })
    }

    /// Process a batch strictly in queue order.
    pub fn commit_batch(
        &mut self,
        batch: PlacementBatch,
    ) -> Vec<(String, Result<Placed, AtlasError>)> {
        debug!("AtlasManager: committing batch of {}", batch.len());
        batch
            .requests
            .into_iter()
            .map(|request| {
                let result = self.place_image(&request);
                (request.key, result)
            })
            .collect()
    }

    /// Bump a live record's ref count.
    pub fn acquire(&mut self, handle: ImageHandle) -> Result<u32, AtlasError> {
        let atlas = self.require_atlas(handle.atlas)?;
        let record = atlas.record_mut(handle.record).ok_or_else(|| {
            AtlasError::Consistency(format!("no record {:?} in atlas {:?}", handle.record, handle.atlas))
        })?;
        if record.ref_count == 0 {
            return Err(AtlasError::Consistency(format!(
                "acquire of freed record '{}'",
                record.key
            )));
        }
        record.ref_count += 1;
        Ok(record.ref_count)
    }

    /// Bring a freed record back without re-uploading pixels. Fails if its
    /// cells were stolen since the free.
    pub fn revive(&mut self, handle: ImageHandle) -> Result<(), AtlasError> {
        let atlas = self.require_atlas(handle.atlas)?;
        match atlas.record(handle.record) {
            Some(record) if record.ref_count == 0 => {}
            Some(record) => {
                return Err(AtlasError::Consistency(format!(
                    "revive of live record '{}'",
                    record.key
                )))
            }
            None => {
                return Err(AtlasError::Consistency(format!(
                    "no record {:?} in atlas {:?}",
                    handle.record, handle.atlas
                )))
            }
        }
        atlas.restore(handle.record)?;
        if let Some(record) = atlas.record_mut(handle.record) {
            record.ref_count = 1;
        }
        Ok(())
    }

    /// Drop one reference. At zero the record is freed in place (shared
    /// atlases) or removed together with its dedicated atlas.
    pub fn release(&mut self, handle: ImageHandle) -> Result<ReleaseOutcome, AtlasError> {
        let dedicated = {
            let atlas = self.require_atlas(handle.atlas)?;
            atlas.class() == SizeClass::Dedicated
        };

        let atlas = self.require_atlas(handle.atlas)?;
        let record = atlas.record_mut(handle.record).ok_or_else(|| {
            AtlasError::Consistency(format!("no record {:?} in atlas {:?}", handle.record, handle.atlas))
        })?;
        if record.ref_count == 0 {
            return Err(AtlasError::Consistency(format!(
                "release of already-freed record '{}'",
                record.key
            )));
        }
        record.ref_count -= 1;
        if record.ref_count > 0 {
            return Ok(ReleaseOutcome::InUse(record.ref_count));
        }

        if dedicated {
            atlas.remove(handle.record)?;
            self.destroy_atlas(handle.atlas);
            Ok(ReleaseOutcome::Removed)
        } else {
            atlas.free(handle.record)?;
            Ok(ReleaseOutcome::Freed)
        }
    }

    pub fn frame(&self, handle: ImageHandle) -> Result<Frame, AtlasError> {
        let atlas = self
            .atlas(handle.atlas)
            .ok_or_else(|| AtlasError::Consistency(format!("no atlas {:?}", handle.atlas)))?;
        atlas.frame(handle.record)
    }

    /// Overwrite pixels inside a record's rectangle. `x`/`y` are relative
    /// to the record's own origin.
    pub fn update_pixels(
        &mut self,
        handle: ImageHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), AtlasError> {
        let Self {
            atlases, device, ..
        } = self;
        let atlas = atlases
            .get_mut(handle.atlas.0 as usize)
            .and_then(|a| a.as_mut())
            .ok_or_else(|| AtlasError::Consistency(format!("no atlas {:?}", handle.atlas)))?;
        let record = atlas.record(handle.record).ok_or_else(|| {
            AtlasError::Consistency(format!("no record {:?} in atlas {:?}", handle.record, handle.atlas))
        })?;
        if x + width > record.width || y + height > record.height {
            return Err(AtlasError::Validation { width, height });
        }
        let (rx, ry) = (record.x + x, record.y + y);
        atlas.upload_sub_rect(rx, ry, width, height, pixels, device.as_mut())
    }

    /// Release every atlas's device surface after the device reports
    /// resource loss. CPU-side bookkeeping is untouched. Live records that
    /// cannot be re-derived from the pixel source are snapshotted first so
    /// reload can restore them.
    pub fn unload_all(&mut self) {
        let Self {
            atlases,
            device,
            snapshots,
            ..
        } = self;

        let mut snapshotted = 0usize;
        for atlas in atlases.iter_mut().flatten() {
            if let Some(surface) = atlas.surface() {
                for (_, record) in atlas.records() {
                    if !record.is_live() || record.derivable {
                        continue;
                    }
                    match device.read_sub_rect(surface, record.x, record.y, record.width, record.height)
                    {
                        Ok(pixels) => {
                            snapshots.insert(
                                record.key.clone(),
                                PixelData::new(record.width, record.height, pixels),
                            );
                            snapshotted += 1;
                        }
                        Err(e) => {
                            warn!(
                                "AtlasManager: could not snapshot '{}' before unload: {}",
                                record.key, e
                            );
                        }
                    }
                }
            }
            atlas.unload(device.as_mut());
        }
        info!(
            "AtlasManager: unloaded {} atlases ({} snapshots taken)",
            self.atlas_count(),
            snapshotted
        );
    }

    /// Rebuild every atlas surface and re-upload all live records, from
    /// the pixel source (derivable records) or the snapshot store
    /// (procedural records). Per-record failures evict just that record.
    pub fn reload_all(&mut self, source: &mut dyn PixelSource) -> ReloadReport {
        let mut report = ReloadReport::default();
        {
            let Self {
                atlases,
                device,
                snapshots,
                ..
            } = self;

            for atlas in atlases.iter_mut().flatten() {
                let mut fetch = |record: &ImageRecord| -> Result<PixelData, AtlasError> {
                    if record.derivable {
                        source.fetch(&record.key)
                    } else {
                        snapshots
                            .get(&record.key)
                            .cloned()
                            .ok_or_else(|| AtlasError::Decode {
                                key: record.key.clone(),
                                reason: "no snapshot for procedural image".to_string(),
                            })
                    }
                };
                match atlas.reload(device.as_mut(), &mut fetch) {
                    Ok(atlas_report) => report.merge(atlas_report),
                    Err(e) => {
                        // Surface recreation failed; every record of this
                        // atlas is lost.
                        warn!("AtlasManager: atlas {:?} failed to reload: {}", atlas.id(), e);
                        let ids: Vec<RecordId> = atlas.records().map(|(id, _)| id).collect();
                        for id in ids {
                            if let Ok(record) = atlas.remove(id) {
                                report.evicted.push(record.key);
                            }
                        }
                    }
                }
            }
        }

        // Dedicated atlases whose only record was evicted are gone.
        let empty_dedicated: Vec<AtlasId> = self
            .atlases
            .iter()
            .flatten()
            .filter(|a| a.class() == SizeClass::Dedicated && a.is_empty())
            .map(|a| a.id())
            .collect();
        for id in empty_dedicated {
            self.destroy_atlas(id);
        }

        self.snapshots.clear();
        self.stats.reload_evictions += report.evicted.len();
        info!(
            "AtlasManager: reload complete, {} records restored, {} evicted",
            report.reloaded,
            report.evicted.len()
        );
        report
    }

    /// Invariant sweep over every atlas, for tests and debug builds.
    pub fn check_consistency(&self) -> Result<(), AtlasError> {
        for atlas in self.atlases.iter().flatten() {
            atlas.check_consistency()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;

    fn manager() -> AtlasManager {
        AtlasManager::new(Box::new(SoftwareDevice::new()), Settings::default())
    }

    fn request(key: &str, width: u32, height: u32) -> PlaceRequest {
        PlaceRequest {
            key: key.to_string(),
            width,
            height,
            pixels: PixelData::solid(width, height, [8; 4]).pixels,
            is_static: false,
            derivable: true,
        }
    }

    #[test]
    fn routes_fixed_and_variable_to_separate_atlases() {
        let mut mgr = manager();
        let a = mgr.place_image(&request("a", 32, 32)).unwrap();
        let b = mgr.place_image(&request("b", 33, 32)).unwrap();
        let c = mgr.place_image(&request("c", 32, 32)).unwrap();

        assert_ne!(a.handle.atlas, b.handle.atlas);
        assert_eq!(a.handle.atlas, c.handle.atlas);
        assert_eq!(mgr.atlas(a.handle.atlas).unwrap().class(), SizeClass::Fixed32x32);
        assert_eq!(mgr.atlas(b.handle.atlas).unwrap().class(), SizeClass::Variable);
    }

    #[test]
    fn static_and_dynamic_never_share() {
        let mut mgr = manager();
        let mut stat = request("s", 48, 48);
        stat.is_static = true;
        let dynamic = request("d", 48, 48);

        let a = mgr.place_image(&stat).unwrap();
        let b = mgr.place_image(&dynamic).unwrap();
        assert_ne!(a.handle.atlas, b.handle.atlas);
        assert!(mgr.atlas(a.handle.atlas).unwrap().is_static());
        assert!(!mgr.atlas(b.handle.atlas).unwrap().is_static());
    }

    #[test]
    fn oversized_gets_dedicated_power_of_two_atlas() {
        let mut mgr = manager();
        let placed = mgr.place_image(&request("big", 600, 600)).unwrap();
        let atlas = mgr.atlas(placed.handle.atlas).unwrap();
        assert_eq!(atlas.class(), SizeClass::Dedicated);
        assert_eq!(atlas.size(), (1024, 1024));
        assert_eq!(atlas.live_count(), 1);
    }

    #[test]
    fn dedicated_atlas_destroyed_at_zero_refs() {
        let mut mgr = manager();
        let placed = mgr.place_image(&request("big", 600, 600)).unwrap();
        let id = placed.handle.atlas;
        assert_eq!(mgr.atlas_count(), 1);

        assert_eq!(mgr.release(placed.handle).unwrap(), ReleaseOutcome::Removed);
        assert!(mgr.atlas(id).is_none());
        assert_eq!(mgr.atlas_count(), 0);
    }

    #[test]
    fn shared_atlas_survives_zero_refs() {
        let mut mgr = manager();
        let placed = mgr.place_image(&request("a", 32, 32)).unwrap();
        assert_eq!(mgr.release(placed.handle).unwrap(), ReleaseOutcome::Freed);
        assert_eq!(mgr.atlas_count(), 1);
        // Metadata survives the free.
        assert_eq!(mgr.record(placed.handle).unwrap().key, "a");

        mgr.revive(placed.handle).unwrap();
        assert_eq!(mgr.record(placed.handle).unwrap().ref_count, 1);
    }

    #[test]
    fn overflow_opens_second_atlas_in_creation_order() {
        let mut mgr = manager();
        // A 512x512 Fixed32x32 atlas holds 256 cells.
        let mut handles = Vec::new();
        for i in 0..256 {
            let placed = mgr.place_image(&request(&format!("i{}", i), 32, 32)).unwrap();
            handles.push(placed.handle);
        }
        let first_atlas = handles[0].atlas;
        assert!(handles.iter().all(|h| h.atlas == first_atlas));

        let overflow = mgr.place_image(&request("overflow", 32, 32)).unwrap();
        assert_ne!(overflow.handle.atlas, first_atlas);
        assert_eq!(mgr.atlas_count(), 2);

        // Freeing a cell in the first atlas makes it win the scan again.
        mgr.release(handles[10]).unwrap();
        let refill = mgr.place_image(&request("refill", 32, 32)).unwrap();
        assert_eq!(refill.handle.atlas, first_atlas);
        assert_eq!(refill.evicted, vec!["i10".to_string()]);
        mgr.check_consistency().unwrap();
    }

    #[test]
    fn surface_failure_propagates_as_allocation_failure() {
        let mut device = SoftwareDevice::new();
        device.fail_next_create();
        let mut mgr = AtlasManager::new(Box::new(device), Settings::default());
        let err = mgr.place_image(&request("a", 32, 32)).unwrap_err();
        assert!(matches!(err, AtlasError::AllocationFailed { .. }));
        assert_eq!(mgr.atlas_count(), 0);

        // The failure is not sticky; the next placement succeeds.
        assert!(mgr.place_image(&request("a", 32, 32)).is_ok());
    }

    #[test]
    fn zero_dimension_is_validation_error() {
        let mut mgr = manager();
        let err = mgr.place_image(&request("zero", 0, 32)).unwrap_err();
        assert!(matches!(err, AtlasError::Validation { .. }));
    }

    #[test]
    fn batch_commits_in_queue_order_and_sorts_by_area() {
        let mut mgr = manager();
        let mut batch = PlacementBatch::new();
        batch.push(request("small", 20, 20));
        batch.push(request("large", 100, 100));
        batch.push(request("medium", 50, 50));
        batch.sort_largest_first();

        let results = mgr.commit_batch(batch);
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["large", "medium", "small"]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        // Largest-first means "large" got the top-left corner.
        let large = results
            .iter()
            .find(|(k, _)| k == "large")
            .and_then(|(_, r)| r.as_ref().ok())
            .unwrap();
        assert_eq!(mgr.record(large.handle).unwrap().rect(), (0, 0, 100, 100));
    }
}
