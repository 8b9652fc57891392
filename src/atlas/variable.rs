use log::debug;

use crate::atlas::record::RecordId;
use crate::config::GRID_UNIT;
use crate::error::AtlasError;

#[derive(Debug, Clone)]
struct GridCell {
    occupant: Option<RecordId>,
    free: bool,
}

/// Outcome of a variable-size placement: the pixel origin plus every stale
/// record whose freed cells were overwritten. Displaced records must be
/// evicted from any key cache before the new record is published.
#[derive(Debug)]
pub struct VariableSlot {
    pub x: u32,
    pub y: u32,
    pub displaced: Vec<RecordId>,
}

/// Round a pixel dimension up to the next multiple of the grid unit.
pub fn round_up(px: u32) -> u32 {
    px.div_ceil(GRID_UNIT) * GRID_UNIT
}

/// Placement for arbitrarily sized images over a coarse occupancy grid.
///
/// Dimensions round up to multiples of [`GRID_UNIT`] pixels and placement
/// is a row-major first-fit scan. Deliberately simple: no best-fit, no
/// defragmentation. Freed footprints keep their occupant so a restore can
/// undo the free; placement over still-free cells displaces the stale
/// occupants.
#[derive(Debug)]
pub struct VariableAllocator {
    cols: u32,
    rows: u32,
    cells: Vec<GridCell>,
}

impl VariableAllocator {
    pub fn new(atlas_width: u32, atlas_height: u32) -> Self {
        let cols = atlas_width / GRID_UNIT;
        let rows = atlas_height / GRID_UNIT;
        Self {
            cols,
            rows,
            cells: vec![
                GridCell {
                    occupant: None,
                    free: true,
                };
                (cols * rows) as usize
            ],
        }
    }

    pub fn total_units(&self) -> u32 {
        self.cols * self.rows
    }

    pub fn free_units(&self) -> u32 {
        self.cells.iter().filter(|c| c.free).count() as u32
    }

    fn at(&self, gx: u32, gy: u32) -> &GridCell {
        &self.cells[(gy * self.cols + gx) as usize]
    }

    fn at_mut(&mut self, gx: u32, gy: u32) -> &mut GridCell {
        &mut self.cells[(gy * self.cols + gx) as usize]
    }

    /// Grid footprint of a pixel rectangle, `(gx, gy, gw, gh)`.
    fn footprint(&self, x: u32, y: u32, width: u32, height: u32) -> Result<(u32, u32, u32, u32), AtlasError> {
        if x % GRID_UNIT != 0 || y % GRID_UNIT != 0 {
            return Err(AtlasError::Consistency(format!(
                "({}, {}) is not a grid origin",
                x, y
            )));
        }
        let gx = x / GRID_UNIT;
        let gy = y / GRID_UNIT;
        let gw = round_up(width) / GRID_UNIT;
        let gh = round_up(height) / GRID_UNIT;
        if gx + gw > self.cols || gy + gh > self.rows {
            return Err(AtlasError::Consistency(format!(
                "footprint {}x{}+{}+{} outside {}x{} grid",
                gw, gh, gx, gy, self.cols, self.rows
            )));
        }
        Ok((gx, gy, gw, gh))
    }

    /// First-fit scan for a free `width` x `height` pixel block.
    ///
    /// Candidates advance in row-major order; hitting an occupied cell
    /// inside a candidate rectangle skips the scan past that cell rather
    /// than retrying every intermediate column.
    pub fn place(&mut self, width: u32, height: u32, record: RecordId) -> Option<VariableSlot> {
        let gw = round_up(width) / GRID_UNIT;
        let gh = round_up(height) / GRID_UNIT;
        if gw == 0 || gh == 0 || gw > self.cols || gh > self.rows {
            return None;
        }

        let mut gy = 0;
        while gy + gh <= self.rows {
            let mut gx = 0;
            'candidates: while gx + gw <= self.cols {
                for dy in 0..gh {
                    for dx in 0..gw {
                        if !self.at(gx + dx, gy + dy).free {
                            gx += dx + 1;
                            continue 'candidates;
                        }
                    }
                }
                return Some(self.claim(gx, gy, gw, gh, record));
            }
            gy += 1;
        }
        None
    }

    fn claim(&mut self, gx: u32, gy: u32, gw: u32, gh: u32, record: RecordId) -> VariableSlot {
        // Collect stale occupants under the footprint before overwriting.
        let mut displaced: Vec<RecordId> = Vec::new();
        for dy in 0..gh {
            for dx in 0..gw {
                if let Some(old) = self.at(gx + dx, gy + dy).occupant {
                    if !displaced.contains(&old) {
                        displaced.push(old);
                    }
                }
            }
        }

        // A displaced record's footprint can extend past the new one;
        // clear all of its cells so the stale id cannot alias a future
        // record that reuses the same arena slot.
        if !displaced.is_empty() {
            debug!(
                "VariableAllocator: placement at ({}, {}) displaces {:?}",
                gx, gy, displaced
            );
            for cell in &mut self.cells {
                if let Some(old) = cell.occupant {
                    if displaced.contains(&old) {
                        cell.occupant = None;
                    }
                }
            }
        }

        for dy in 0..gh {
            for dx in 0..gw {
                let cell = self.at_mut(gx + dx, gy + dy);
                cell.occupant = Some(record);
                cell.free = false;
            }
        }

        VariableSlot {
            x: gx * GRID_UNIT,
            y: gy * GRID_UNIT,
            displaced,
        }
    }

    /// Mark `record`'s footprint reusable, leaving the occupant in place
    /// for a later restore.
    pub fn free(&mut self, x: u32, y: u32, width: u32, height: u32, record: RecordId) -> Result<(), AtlasError> {
        let (gx, gy, gw, gh) = self.footprint(x, y, width, height)?;
        for dy in 0..gh {
            for dx in 0..gw {
                let cell = self.at(gx + dx, gy + dy);
                if cell.occupant != Some(record) || cell.free {
                    return Err(AtlasError::Consistency(format!(
                        "free of record {:?} but cell ({}, {}) is free={} holding {:?}",
                        record,
                        gx + dx,
                        gy + dy,
                        cell.free,
                        cell.occupant
                    )));
                }
            }
        }
        for dy in 0..gh {
            for dx in 0..gw {
                self.at_mut(gx + dx, gy + dy).free = true;
            }
        }
        Ok(())
    }

    /// Undo a free. Fails if any cell of the footprint was stolen.
    pub fn restore(&mut self, x: u32, y: u32, width: u32, height: u32, record: RecordId) -> Result<(), AtlasError> {
        let (gx, gy, gw, gh) = self.footprint(x, y, width, height)?;
        for dy in 0..gh {
            for dx in 0..gw {
                let cell = self.at(gx + dx, gy + dy);
                if cell.occupant != Some(record) || !cell.free {
                    return Err(AtlasError::Consistency(format!(
                        "restore of record {:?} but cell ({}, {}) is free={} holding {:?}",
                        record,
                        gx + dx,
                        gy + dy,
                        cell.free,
                        cell.occupant
                    )));
                }
            }
        }
        for dy in 0..gh {
            for dx in 0..gw {
                self.at_mut(gx + dx, gy + dy).free = false;
            }
        }
        Ok(())
    }

    /// Fully vacate `record`'s footprint: occupant cleared, cells free.
    pub fn remove(&mut self, x: u32, y: u32, width: u32, height: u32, record: RecordId) -> Result<(), AtlasError> {
        let (gx, gy, gw, gh) = self.footprint(x, y, width, height)?;
        for dy in 0..gh {
            for dx in 0..gw {
                let cell = self.at_mut(gx + dx, gy + dy);
                if cell.occupant != Some(record) {
                    return Err(AtlasError::Consistency(format!(
                        "remove of record {:?} but cell ({}, {}) holds {:?}",
                        record,
                        gx + dx,
                        gy + dy,
                        cell.occupant
                    )));
                }
                cell.occupant = None;
                cell.free = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlaps(a: (u32, u32, u32, u32), b: (u32, u32, u32, u32)) -> bool {
        a.0 < b.0 + b.2 && b.0 < a.0 + a.2 && a.1 < b.1 + b.3 && b.1 < a.1 + a.3
    }

    #[test]
    fn rounds_up_to_grid_unit() {
        assert_eq!(round_up(17), 32);
        assert_eq!(round_up(93), 96);
        assert_eq!(round_up(16), 16);
        assert_eq!(round_up(1), 16);
        assert_eq!(round_up(200), 208);
    }

    #[test]
    fn mixed_sizes_never_overlap() {
        let mut alloc = VariableAllocator::new(512, 512);
        let sizes = [(17u32, 93u32), (64, 64), (200, 10)];
        let mut rects = Vec::new();
        for (i, &(w, h)) in sizes.iter().enumerate() {
            let slot = alloc.place(w, h, RecordId(i as u32)).unwrap();
            assert!(slot.displaced.is_empty());
            // Footprints are what must not collide, so compare rounded rects.
            rects.push((slot.x, slot.y, round_up(w), round_up(h)));
        }
        for i in 0..rects.len() {
            for j in i + 1..rects.len() {
                assert!(
                    !overlaps(rects[i], rects[j]),
                    "{:?} overlaps {:?}",
                    rects[i],
                    rects[j]
                );
            }
        }
    }

    #[test]
    fn first_fit_is_deterministic() {
        let mut alloc = VariableAllocator::new(512, 512);
        let a = alloc.place(17, 93, RecordId(0)).unwrap();
        assert_eq!((a.x, a.y), (0, 0));
        // 17 rounds to 32 wide, so the next image starts at x = 32.
        let b = alloc.place(64, 64, RecordId(1)).unwrap();
        assert_eq!((b.x, b.y), (32, 0));
        let c = alloc.place(200, 10, RecordId(2)).unwrap();
        assert_eq!((c.x, c.y), (96, 0));
    }

    #[test]
    fn fills_and_fails_when_full() {
        let mut alloc = VariableAllocator::new(64, 64);
        // Four 32x32 blocks fill the 4x4-unit grid.
        for i in 0..4u32 {
            assert!(alloc.place(32, 32, RecordId(i)).is_some());
        }
        assert_eq!(alloc.free_units(), 0);
        assert!(alloc.place(16, 16, RecordId(9)).is_none());
    }

    #[test]
    fn scan_skips_past_occupied_cells() {
        let mut alloc = VariableAllocator::new(128, 128);
        // Block the left half of the first row band.
        let wall = alloc.place(64, 16, RecordId(0)).unwrap();
        assert_eq!((wall.x, wall.y), (0, 0));
        let next = alloc.place(64, 16, RecordId(1)).unwrap();
        assert_eq!((next.x, next.y), (64, 0));
        // Too wide for the remaining gap on row 0; lands on the next row.
        let wide = alloc.place(128, 16, RecordId(2)).unwrap();
        assert_eq!((wide.x, wide.y), (0, 16));
    }

    #[test]
    fn free_restore_round_trip() {
        let mut alloc = VariableAllocator::new(128, 128);
        let slot = alloc.place(40, 40, RecordId(0)).unwrap();
        let before = alloc.free_units();
        alloc.free(slot.x, slot.y, 40, 40, RecordId(0)).unwrap();
        assert_eq!(alloc.free_units(), before + 9); // 48x48 = 3x3 units
        alloc.restore(slot.x, slot.y, 40, 40, RecordId(0)).unwrap();
        assert_eq!(alloc.free_units(), before);
    }

    #[test]
    fn placement_displaces_freed_footprint() {
        let mut alloc = VariableAllocator::new(64, 64);
        let old = alloc.place(64, 64, RecordId(0)).unwrap();
        alloc.free(old.x, old.y, 64, 64, RecordId(0)).unwrap();

        let new = alloc.place(32, 32, RecordId(1)).unwrap();
        assert_eq!(new.displaced, vec![RecordId(0)]);
        // The whole stale footprint is cleared, not just the stolen part.
        assert!(alloc
            .restore(old.x, old.y, 64, 64, RecordId(0))
            .is_err());

        // Cells outside the new placement are free with no occupant, so a
        // reused arena id cannot be aliased by them.
        assert_eq!(alloc.free_units(), 16 - 4);
    }

    #[test]
    fn restore_fails_after_partial_steal() {
        let mut alloc = VariableAllocator::new(64, 64);
        let a = alloc.place(48, 48, RecordId(0)).unwrap();
        alloc.free(a.x, a.y, 48, 48, RecordId(0)).unwrap();

        let b = alloc.place(16, 16, RecordId(1)).unwrap();
        assert_eq!((b.x, b.y), (0, 0));
        assert_eq!(b.displaced, vec![RecordId(0)]);
        assert!(alloc.restore(a.x, a.y, 48, 48, RecordId(0)).is_err());
    }
}
