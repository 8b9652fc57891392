use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::device::{GraphicsDevice, SurfaceId};
use crate::error::AtlasError;

/// [`GraphicsDevice`] implementation over a `wgpu` device/queue pair.
///
/// Surfaces are plain `Rgba8UnormSrgb` 2D textures. Uploads go through
/// `Queue::write_texture`; readback does a texture-to-buffer copy followed
/// by a blocking map, which is only used on the device-loss snapshot path.
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    textures: HashMap<SurfaceId, wgpu::Texture>,
    next_id: u64,
}

impl WgpuDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            textures: HashMap::new(),
            next_id: 0,
        }
    }

    /// The texture behind a surface, for building renderer bind groups.
    pub fn texture(&self, id: SurfaceId) -> Option<&wgpu::Texture> {
        self.textures.get(&id)
    }

    fn texture_for(&self, id: SurfaceId) -> Result<&wgpu::Texture, AtlasError> {
        self.textures
            .get(&id)
            .ok_or_else(|| AtlasError::Device(format!("unknown surface {:?}", id)))
    }
}

impl GraphicsDevice for WgpuDevice {
    fn create_surface(&mut self, width: u32, height: u32) -> Result<SurfaceId, AtlasError> {
        let max_dim = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max_dim || height > max_dim {
            return Err(AtlasError::Device(format!(
                "cannot create {}x{} texture (device limit {})",
                width, height, max_dim
            )));
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("spritepack atlas texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });

        let id = SurfaceId(self.next_id);
        self.next_id += 1;
        self.textures.insert(id, texture);
        debug!("WgpuDevice: created {}x{} texture {:?}", width, height, id);
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
        let expected = (width * height * 4) as usize;
        if pixels.len() != expected {
            return Err(AtlasError::Device(format!(
                "upload buffer is {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }
        let texture = self.texture_for(surface)?;

        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(pixels),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
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
        let texture = self.texture_for(surface)?;

        // Buffer copies require bytes_per_row alignment, so rows are padded
        // on the way out and stripped after the map.
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let unpadded_bpr = 4 * width;
        let padding = (align - unpadded_bpr % align) % align;
        let padded_bpr = unpadded_bpr + padding;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("spritepack readback buffer"),
            size: padded_bpr as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("spritepack readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bpr),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Readback map failed: {:?}", e);
                return Err(AtlasError::Device(format!("buffer map failed: {:?}", e)));
            }
            Err(_) => {
                return Err(AtlasError::Device("buffer map never completed".to_string()));
            }
        }

        let mapped = slice.get_mapped_range();
        let mut out = Vec::with_capacity((unpadded_bpr * height) as usize);
        for row in 0..height as usize {
            let start = row * padded_bpr as usize;
            out.extend_from_slice(&mapped[start..start + unpadded_bpr as usize]);
        }
        drop(mapped);
        buffer.unmap();

        Ok(out)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        if let Some(texture) = self.textures.remove(&surface) {
            texture.destroy();
            debug!("WgpuDevice: destroyed surface {:?}", surface);
        }
    }
}
