pub mod atlas;
pub mod fixed;
pub mod record;
pub mod variable;

pub use atlas::Atlas;
pub use fixed::{FixedAllocator, FixedSlot};
pub use record::{AtlasId, Frame, ImageHandle, ImageRecord, RecordId, UvRect};
pub use variable::{round_up, VariableAllocator, VariableSlot};

/// Which allocation strategy governs an atlas.
///
/// The fixed classes are slabs of one uniform cell size with O(1)
/// allocation; `Variable` packs arbitrary sizes over a coarse grid;
/// `Dedicated` is a single-occupant atlas for oversized images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Fixed32x32,
    Fixed32x64,
    Fixed64x64,
    Variable,
    Dedicated,
}

impl SizeClass {
    /// Route an image size to its class. Exact matches go to the fixed
    /// slabs; anything with a dimension over `oversized_limit` gets a
    /// dedicated atlas; the rest is packed variably.
    pub fn classify(width: u32, height: u32, oversized_limit: u32) -> SizeClass {
        if width.max(height) > oversized_limit {
            return SizeClass::Dedicated;
        }
        match (width, height) {
            (32, 32) => SizeClass::Fixed32x32,
            (32, 64) => SizeClass::Fixed32x64,
            (64, 64) => SizeClass::Fixed64x64,
            _ => SizeClass::Variable,
        }
    }

    /// Cell dimensions for fixed classes, `None` otherwise.
    pub fn cell_size(self) -> Option<(u32, u32)> {
        match self {
            SizeClass::Fixed32x32 => Some((32, 32)),
            SizeClass::Fixed32x64 => Some((32, 64)),
            SizeClass::Fixed64x64 => Some((64, 64)),
            SizeClass::Variable | SizeClass::Dedicated => None,
        }
    }

    /// Shared classes participate in the selection scan and live for the
    /// process lifetime; dedicated atlases are per-image.
    pub fn is_shared(self) -> bool {
        !matches!(self, SizeClass::Dedicated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_routes_exact_fixed_sizes() {
        assert_eq!(SizeClass::classify(32, 32, 512), SizeClass::Fixed32x32);
        assert_eq!(SizeClass::classify(32, 64, 512), SizeClass::Fixed32x64);
        assert_eq!(SizeClass::classify(64, 64, 512), SizeClass::Fixed64x64);
        // Near misses pack variably.
        assert_eq!(SizeClass::classify(64, 32, 512), SizeClass::Variable);
        assert_eq!(SizeClass::classify(33, 32, 512), SizeClass::Variable);
        assert_eq!(SizeClass::classify(17, 93, 512), SizeClass::Variable);
    }

    #[test]
    fn classify_routes_oversized() {
        assert_eq!(SizeClass::classify(600, 600, 512), SizeClass::Dedicated);
        assert_eq!(SizeClass::classify(513, 8, 512), SizeClass::Dedicated);
        assert_eq!(SizeClass::classify(512, 512, 512), SizeClass::Variable);
    }
}
