pub mod software;

#[cfg(feature = "wgpu-device")]
pub mod wgpu;

pub use software::SoftwareDevice;

#[cfg(feature = "wgpu-device")]
pub use self::wgpu::WgpuDevice;

use crate::error::AtlasError;

/// Opaque handle to one device surface. Minted by the device, meaningless
/// outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// The slice of a graphics API this crate needs: create a surface, move
/// RGBA8 pixels in and out of a sub-rectangle, destroy a surface.
///
/// All pixel buffers are tightly packed RGBA8 (4 bytes per pixel).
pub trait GraphicsDevice {
    /// Create a `width` x `height` surface. Fails if the device is out of
    /// memory or the dimensions exceed its limits.
    fn create_surface(&mut self, width: u32, height: u32) -> Result<SurfaceId, AtlasError>;

    /// Upload pixels into a sub-rectangle of a surface.
    fn upload_sub_rect(
        &mut self,
        surface: SurfaceId,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), AtlasError>;

    /// Read a sub-rectangle of a surface back into a tightly packed buffer.
    fn read_sub_rect(
        &mut self,
        surface: SurfaceId,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, AtlasError>;

    /// Release a surface. Unknown ids are ignored.
    fn destroy_surface(&mut self, surface: SurfaceId);
}
