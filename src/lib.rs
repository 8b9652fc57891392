//! Texture atlas allocation and management for 2D sprite rendering.
//!
//! Packs many small, variably-sized RGBA images onto a few large device
//! surfaces so a renderer can draw thousands of sprites and UI glyphs per
//! frame while binding almost no textures. Exact 32x32 / 32x64 / 64x64
//! images go to slab atlases with O(1) allocation; everything else is
//! rectangle-packed over a coarse occupancy grid; oversized images get a
//! dedicated surface of their own. Images are shared by key with reference
//! counting, freed lazily with fast restoration, and survive total
//! graphics-device resource loss via re-decode or pixel snapshots.
//!
//! The graphics API is abstracted behind [`device::GraphicsDevice`]; a
//! CPU-backed [`device::SoftwareDevice`] ships for headless use, and a
//! `wgpu` implementation is available behind the `wgpu-device` feature.
//!
//! ```
//! use spritepack::config::Settings;
//! use spritepack::device::SoftwareDevice;
//! use spritepack::manager::AtlasManager;
//! use spritepack::registry::ImageRegistry;
//! use spritepack::source::FileSource;
//!
//! let manager = AtlasManager::new(Box::new(SoftwareDevice::new()), Settings::default());
//! let mut images = ImageRegistry::new(manager, FileSource::new());
//! // let frame = images.load("sprites/hero.png", false)?;
//! // renderer draws (frame.surface, frame.uv) at frame.width x frame.height
//! ```

pub mod atlas;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod registry;
pub mod source;

pub use atlas::{Atlas, AtlasId, Frame, ImageHandle, ImageRecord, RecordId, SizeClass, UvRect};
pub use config::Settings;
pub use device::{GraphicsDevice, SoftwareDevice, SurfaceId};
pub use error::{AtlasError, ReloadReport};
pub use manager::{AtlasManager, PlaceRequest, PlacementBatch, Placed, ReleaseOutcome};
pub use registry::ImageRegistry;
pub use source::{FileSource, PixelData, PixelSource};

#[cfg(feature = "wgpu-device")]
pub use device::WgpuDevice;
