use log::{debug, warn};

use crate::atlas::fixed::FixedAllocator;
use crate::atlas::record::{AtlasId, Frame, ImageRecord, RecordId, UvRect};
use crate::atlas::variable::VariableAllocator;
use crate::atlas::SizeClass;
use crate::device::{GraphicsDevice, SurfaceId};
use crate::error::{AtlasError, ReloadReport};
use crate::source::PixelData;

#[derive(Debug)]
enum Placement {
    Fixed(FixedAllocator),
    Variable(VariableAllocator),
    /// Dedicated atlas: the whole surface belongs to one record.
    Whole,
}

/// One device surface packed with image records.
///
/// The atlas owns its records by value in a dense arena; everything else
/// refers to them through `RecordId` indices, so tearing an atlas down
/// cannot leave a dangling back-pointer. The surface handle may be absent
/// while the graphics device is lost; CPU-side bookkeeping is untouched by
/// unload/reload.
#[derive(Debug)]
pub struct Atlas {
    id: AtlasId,
    width: u32,
    height: u32,
    class: SizeClass,
    is_static: bool,
    surface: Option<SurfaceId>,
    records: Vec<Option<ImageRecord>>,
    free_slots: Vec<RecordId>,
    placement: Placement,
}

impl Atlas {
    pub fn new(
        id: AtlasId,
        width: u32,
        height: u32,
        class: SizeClass,
        is_static: bool,
        device: &mut dyn GraphicsDevice,
    ) -> Result<Self, AtlasError> {
        let placement = match class {
            SizeClass::Fixed32x32 | SizeClass::Fixed32x64 | SizeClass::Fixed64x64 => {
                let (cw, ch) = class.cell_size().expect("fixed class has a cell size");
                Placement::Fixed(FixedAllocator::new(width, height, cw, ch))
            }
            SizeClass::Variable => Placement::Variable(VariableAllocator::new(width, height)),
            SizeClass::Dedicated => Placement::Whole,
        };

        let surface = device.create_surface(width, height)?;
        debug!(
            "Atlas {:?}: created {}x{} {:?} (static: {})",
            id, width, height, class, is_static
        );

        Ok(Self {
            id,
            width,
            height,
            class,
            is_static,
            surface: Some(surface),
            records: Vec::new(),
            free_slots: Vec::new(),
            placement,
        })
    }

    pub fn id(&self) -> AtlasId {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn is_loaded(&self) -> bool {
        self.surface.is_some()
    }

    pub fn surface(&self) -> Option<SurfaceId> {
        self.surface
    }

    pub fn record(&self, id: RecordId) -> Option<&ImageRecord> {
        self.records.get(id.0 as usize).and_then(|r| r.as_ref())
    }

    pub fn record_mut(&mut self, id: RecordId) -> Option<&mut ImageRecord> {
        self.records.get_mut(id.0 as usize).and_then(|r| r.as_mut())
    }

    /// All present records (live and freed) with their ids.
    pub fn records(&self) -> impl Iterator<Item = (RecordId, &ImageRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (RecordId(i as u32), r)))
    }

    pub fn live_count(&self) -> usize {
        self.records().filter(|(_, r)| r.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.records.iter().all(|r| r.is_none())
    }

    fn get(&self, id: RecordId) -> Result<&ImageRecord, AtlasError> {
        self.record(id).ok_or_else(|| {
            AtlasError::Consistency(format!("record {:?} not present in atlas {:?}", id, self.id))
        })
    }

    /// Claim an empty arena slot. The slot id must be fixed before the
    /// allocator runs, because the allocator tags cells with it.
    fn reserve_slot(&mut self) -> RecordId {
        match self.free_slots.pop() {
            Some(id) => id,
            None => {
                self.records.push(None);
                RecordId(self.records.len() as u32 - 1)
            }
        }
    }

    fn unreserve_slot(&mut self, id: RecordId) {
        debug_assert!(self.records[id.0 as usize].is_none());
        self.free_slots.push(id);
    }

    fn release_slot(&mut self, id: RecordId) -> Option<ImageRecord> {
        let taken = self.records.get_mut(id.0 as usize)?.take();
        if taken.is_some() {
            self.free_slots.push(id);
        }
        taken
    }

    /// Place and upload an image. On success returns the new record's id
    /// plus the keys of any stale records displaced by the placement; the
    /// caller must drop those keys from its lookup cache before exposing
    /// the new record.
    pub fn add_image(
        &mut self,
        key: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
        derivable: bool,
        device: &mut dyn GraphicsDevice,
    ) -> Result<(RecordId, Vec<String>), AtlasError> {
        if width == 0 || height == 0 {
            return Err(AtlasError::Validation { width, height });
        }
        let surface = self.surface.ok_or_else(|| {
            AtlasError::Consistency(format!("add_image on unloaded atlas {:?}", self.id))
        })?;

        // Reserve the slot id up front so the allocator can tag cells with
        // it; nothing is published until the record is written below.
        let new_id = self.reserve_slot();
        let atlas_size = (self.width, self.height);
        let placed = match &mut self.placement {
            Placement::Fixed(alloc) => {
                if (width, height) != alloc.cell_size() {
                    Err(AtlasError::Validation { width, height })
                } else {
                    match alloc.insert(new_id) {
                        Some(slot) => Ok((slot.x, slot.y, slot.displaced.into_iter().collect())),
                        None => Err(AtlasError::AllocationFailed { width, height }),
                    }
                }
            }
            Placement::Variable(alloc) => match alloc.place(width, height, new_id) {
                Some(slot) => Ok((slot.x, slot.y, slot.displaced)),
                None => Err(AtlasError::AllocationFailed { width, height }),
            },
            Placement::Whole => {
                if width > atlas_size.0 || height > atlas_size.1 {
                    Err(AtlasError::Validation { width, height })
                } else if self.records.iter().any(|r| r.is_some()) {
                    Err(AtlasError::AllocationFailed { width, height })
                } else {
                    Ok((0, 0, Vec::new()))
                }
            }
        };
        let (x, y, displaced) = match placed {
            Ok(v) => v,
            Err(e) => {
                self.unreserve_slot(new_id);
                return Err(e);
            }
        };

        // Evict displaced records before the new one becomes visible.
        let mut evicted = Vec::new();
        for old_id in displaced {
            if let Some(old) = self.release_slot(old_id) {
                debug!(
                    "Atlas {:?}: evicting stale record '{}' displaced at ({}, {})",
                    self.id, old.key, x, y
                );
                evicted.push(old.key);
            }
        }

        let record = ImageRecord {
            key: key.to_string(),
            width,
            height,
            ref_count: 1,
            x,
            y,
            uv: UvRect::from_rect(x, y, width, height, self.width, self.height),
            derivable,
        };
        self.records[new_id.0 as usize] = Some(record);

        if let Err(e) = device.upload_sub_rect(surface, x, y, width, height, pixels) {
            // Roll the placement back; a record without pixels must not
            // survive.
            let _ = self.remove(new_id);
            return Err(e);
        }
        debug!(
            "Atlas {:?}: added '{}' ({}x{}) at ({}, {})",
            self.id, key, width, height, x, y
        );
        Ok((new_id, evicted))
    }

    /// Mark a record's cells reusable without dropping its metadata, so a
    /// later [`Atlas::restore`] can bring it back without re-uploading.
    pub fn free(&mut self, id: RecordId) -> Result<(), AtlasError> {
        let (x, y, width, height) = self.get(id)?.rect();
        match &mut self.placement {
            Placement::Fixed(alloc) => alloc.free(x, y, id),
            Placement::Variable(alloc) => alloc.free(x, y, width, height, id),
            Placement::Whole => Err(AtlasError::Consistency(
                "dedicated atlas records are removed, not freed".to_string(),
            )),
        }
    }

    /// Undo a free. Fails if the record's cells were stolen in between.
    pub fn restore(&mut self, id: RecordId) -> Result<(), AtlasError> {
        let (x, y, width, height) = self.get(id)?.rect();
        match &mut self.placement {
            Placement::Fixed(alloc) => alloc.restore(x, y, id),
            Placement::Variable(alloc) => alloc.restore(x, y, width, height, id),
            Placement::Whole => Err(AtlasError::Consistency(
                "dedicated atlas records cannot be restored".to_string(),
            )),
        }
    }

    /// Fully delete a record: cells vacated, metadata dropped.
    pub fn remove(&mut self, id: RecordId) -> Result<ImageRecord, AtlasError> {
        let (x, y, width, height) = self.get(id)?.rect();
        match &mut self.placement {
            Placement::Fixed(alloc) => alloc.remove(x, y, id)?,
            Placement::Variable(alloc) => alloc.remove(x, y, width, height, id)?,
            Placement::Whole => {}
        }
        let record = self.release_slot(id).ok_or_else(|| {
            AtlasError::Consistency(format!("record {:?} vanished during remove", id))
        })?;
        debug!("Atlas {:?}: removed '{}'", self.id, record.key);
        Ok(record)
    }

    /// Renderer view of a record. Only available while the atlas is loaded.
    pub fn frame(&self, id: RecordId) -> Result<Frame, AtlasError> {
        let record = self.get(id)?;
        let surface = self.surface.ok_or_else(|| {
            AtlasError::Consistency(format!("frame requested from unloaded atlas {:?}", self.id))
        })?;
        Ok(Frame {
            surface,
            uv: record.uv,
            width: record.width,
            height: record.height,
        })
    }

    /// Overwrite part of a record's pixels in place (render-to-texture
    /// style updates).
    pub fn upload_sub_rect(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
        device: &mut dyn GraphicsDevice,
    ) -> Result<(), AtlasError> {
        let surface = self.surface.ok_or_else(|| {
            AtlasError::Consistency(format!("upload to unloaded atlas {:?}", self.id))
        })?;
        if x + width > self.width || y + height > self.height {
            return Err(AtlasError::Validation { width, height });
        }
        device.upload_sub_rect(surface, x, y, width, height, pixels)
    }

    /// Release the device surface. Allocator and record bookkeeping are
    /// left exactly as they are; only the GPU side is invalidated.
    pub fn unload(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some(surface) = self.surface.take() {
            device.destroy_surface(surface);
            debug!("Atlas {:?}: unloaded", self.id);
        }
    }

    /// Recreate the device surface and re-upload every live record's
    /// pixels via `fetch`. A record whose pixels cannot be re-obtained is
    /// evicted and reported; the rest of the walk continues. Records that
    /// were freed at unload time have no pixels left to restore from and
    /// are evicted as well.
    pub fn reload(
        &mut self,
        device: &mut dyn GraphicsDevice,
        fetch: &mut dyn FnMut(&ImageRecord) -> Result<PixelData, AtlasError>,
    ) -> Result<ReloadReport, AtlasError> {
        if self.surface.is_some() {
            debug!("Atlas {:?}: reload skipped, already loaded", self.id);
            return Ok(ReloadReport::default());
        }
        let surface = device.create_surface(self.width, self.height)?;
        self.surface = Some(surface);

        let mut report = ReloadReport::default();
        let ids: Vec<RecordId> = self.records().map(|(id, _)| id).collect();
        for id in ids {
            let record = match self.record(id) {
                Some(r) => r.clone(),
                None => continue,
            };

            if !record.is_live() {
                debug!(
                    "Atlas {:?}: dropping freed record '{}' during reload",
                    self.id, record.key
                );
                self.remove(id)?;
                report.evicted.push(record.key);
                continue;
            }

            match fetch(&record) {
                Ok(data) if (data.width, data.height) == (record.width, record.height) => {
                    device.upload_sub_rect(
                        surface,
                        record.x,
                        record.y,
                        record.width,
                        record.height,
                        &data.pixels,
                    )?;
                    report.reloaded += 1;
                }
                Ok(data) => {
                    warn!(
                        "Atlas {:?}: '{}' came back {}x{}, expected {}x{}; evicting",
                        self.id, record.key, data.width, data.height, record.width, record.height
                    );
                    self.remove(id)?;
                    report.evicted.push(record.key);
                }
                Err(e) => {
                    warn!(
                        "Atlas {:?}: failed to refetch '{}': {}; evicting",
                        self.id, record.key, e
                    );
                    self.remove(id)?;
                    report.evicted.push(record.key);
                }
            }
        }

        debug!(
            "Atlas {:?}: reloaded {} records ({} evicted)",
            self.id,
            report.reloaded,
            report.evicted.len()
        );
        Ok(report)
    }

    /// Verify the no-overlap invariant across live records plus the
    /// allocator's own structural checks.
    pub fn check_consistency(&self) -> Result<(), AtlasError> {
        let live: Vec<&ImageRecord> = self.records().map(|(_, r)| r).filter(|r| r.is_live()).collect();
        for i in 0..live.len() {
            for j in i + 1..live.len() {
                if live[i].overlaps(live[j]) {
                    return Err(AtlasError::Consistency(format!(
                        "live records '{}' and '{}' overlap",
                        live[i].key, live[j].key
                    )));
                }
            }
        }
        if let Placement::Fixed(alloc) = &self.placement {
            alloc.check_consistency()?;
        }
        Ok(())
    }
}
