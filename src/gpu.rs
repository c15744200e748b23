//! GPU upload seam.
//!
//! The manager never talks to a graphics API directly; the host supplies a
//! [`GpuFactory`] and receives opaque [`Texture`] handles back through
//! observer notifications.

use crate::pixel::PixelBuffer;

/// Creates GPU textures from decoded pixel buffers. Called on the manager's
/// thread, never from workers.
pub trait GpuFactory: Send + Sync {
    fn create_texture(&self, buffer: &PixelBuffer) -> Texture;
}

/// Handle to an uploaded texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texture {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

/// Group of textures rendered together. Uploads from this crate always
/// produce a single-texture set; externally supplied sets may hold more.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureSet {
    pub textures: Vec<Texture>,
}

impl TextureSet {
    pub fn from_texture(texture: Texture) -> Self {
        Self {
            textures: vec![texture],
        }
    }
}
