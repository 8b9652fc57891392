use std::collections::HashMap;

use log::debug;

use crate::device::{GraphicsDevice, SurfaceId};
use crate::error::AtlasError;

const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug)]
struct SoftSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

/// CPU-backed implementation of [`GraphicsDevice`]: every surface is a
/// dense RGBA8 buffer in host memory. Used for headless operation and as
/// the reference device in tests, where uploaded pixel content can be
/// inspected directly.
#[derive(Debug, Default)]
pub struct SoftwareDevice {
    surfaces: HashMap<SurfaceId, SoftSurface>,
    next_id: u64,
    /// When set, the next `create_surface` call fails. Simulates device
    /// out-of-memory in tests.
    fail_next_create: bool,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn surface_size(&self, id: SurfaceId) -> Option<(u32, u32)> {
        self.surfaces.get(&id).map(|s| (s.width, s.height))
    }

    /// Full pixel buffer of a surface, row-major RGBA8.
    pub fn surface_pixels(&self, id: SurfaceId) -> Option<&[u8]> {
        self.surfaces.get(&id).map(|s| s.pixels.as_slice())
    }

    pub fn fail_next_create(&mut self) {
        self.fail_next_create = true;
    }

    fn surface_mut(&mut self, id: SurfaceId) -> Result<&mut SoftSurface, AtlasError> {
        self.surfaces
            .get_mut(&id)
            .ok_or_else(|| AtlasError::Device(format!("unknown surface {:?}", id)))
    }

    fn check_rect(
        surface: &SoftSurface,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<(), AtlasError> {
        if x + width > surface.width || y + height > surface.height {
            return Err(AtlasError::Device(format!(
                "rect {}x{}+{}+{} outside {}x{} surface",
                width, height, x, y, surface.width, surface.height
            )));
        }
        Ok(())
    }
}

impl GraphicsDevice for SoftwareDevice {
    fn create_surface(&mut self, width: u32, height: u32) -> Result<SurfaceId, AtlasError> {
        if self.fail_next_create {
            self.fail_next_create = false;
            return Err(AtlasError::Device("surface creation failed".to_string()));
        }
        if width == 0 || height == 0 {
            return Err(AtlasError::Device(format!(
                "cannot create {}x{} surface",
                width, height
            )));
        }

        let id = SurfaceId(self.next_id);
        self.next_id += 1;
        self.surfaces.insert(
            id,
            SoftSurface {
                width,
                height,
                pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
            },
        );
        debug!("SoftwareDevice: created {}x{} surface {:?}", width, height, id);
        Ok(id)
    }

    fn upload_sub_rect(
        &mut self,
        surface: SurfaceId,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), AtlasError> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(AtlasError::Device(format!(
                "upload buffer is {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }

        let surface = self.surface_mut(surface)?;
        Self::check_rect(surface, x, y, width, height)?;

        let src_stride = width as usize * BYTES_PER_PIXEL;
        let dst_stride = surface.width as usize * BYTES_PER_PIXEL;
        for row in 0..height as usize {
            let src = row * src_stride;
            let dst = (y as usize + row) * dst_stride + x as usize * BYTES_PER_PIXEL;
            surface.pixels[dst..dst + src_stride].copy_from_slice(&pixels[src..src + src_stride]);
        }
        Ok(())
    }

    fn read_sub_rect(
        &mut self,
        surface: SurfaceId,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, AtlasError> {
        let surface = self.surface_mut(surface)?;
        Self::check_rect(surface, x, y, width, height)?;

        let row_len = width as usize * BYTES_PER_PIXEL;
        let dst_stride = surface.width as usize * BYTES_PER_PIXEL;
        let mut out = Vec::with_capacity(row_len * height as usize);
        for row in 0..height as usize {
            let start = (y as usize + row) * dst_stride + x as usize * BYTES_PER_PIXEL;
            out.extend_from_slice(&surface.pixels[start..start + row_len]);
        }
        Ok(out)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        if self.surfaces.remove(&surface).is_some() {
            debug!("SoftwareDevice: destroyed surface {:?}", surface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_places_bytes_at_correct_stride() {
        let mut device = SoftwareDevice::new();
        let id = device.create_surface(8, 8).unwrap();

        // 2x2 red block at (3, 2)
        let red = [255, 0, 0, 255].repeat(4);
        device.upload_sub_rect(id, 3, 2, 2, 2, &red).unwrap();

        let pixels = device.surface_pixels(id).unwrap();
        let at = |px: usize, py: usize| &pixels[(py * 8 + px) * 4..(py * 8 + px) * 4 + 4];
        assert_eq!(at(3, 2), &[255, 0, 0, 255]);
        assert_eq!(at(4, 3), &[255, 0, 0, 255]);
        assert_eq!(at(2, 2), &[0, 0, 0, 0]);
        assert_eq!(at(5, 2), &[0, 0, 0, 0]);

        let read = device.read_sub_rect(id, 3, 2, 2, 2).unwrap();
        assert_eq!(read, red);
    }

    #[test]
    fn rejects_out_of_bounds_rect() {
        let mut device = SoftwareDevice::new();
        let id = device.create_surface(4, 4).unwrap();
        let buf = vec![0; 4 * 4 * 4];
        assert!(device.upload_sub_rect(id, 2, 2, 4, 4, &buf).is_err());
    }

    #[test]
    fn destroy_then_upload_fails() {
        let mut device = SoftwareDevice::new();
        let id = device.create_surface(4, 4).unwrap();
        device.destroy_surface(id);
        assert!(device.upload_sub_rect(id, 0, 0, 1, 1, &[0; 4]).is_err());
        assert_eq!(device.surface_count(), 0);
    }
}
