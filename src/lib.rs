//! De-duplicating, reference-counted asynchronous texture loading for UI
//! visuals.
//!
//! The entry point is [`manager::TextureManager`]: hosts request loads with a
//! URL plus decode parameters, identical requests share one cache entry, and
//! decoded results come back through [`observer::TextureUploadObserver`]
//! callbacks driven from the host's frame tick via `update()`.

pub mod config;
pub mod error;
pub mod gpu;
pub mod loader;
pub mod manager;
pub mod observer;
pub mod pixel;
pub mod types;
pub mod url;

mod cache;
mod pool;

pub use config::TextureManagerConfig;
pub use error::LoadError;
pub use gpu::{GpuFactory, Texture, TextureSet};
pub use loader::{AnimatedImageLoading, FsImageLoader, ImageLoader};
pub use manager::{MaskingData, TextureLoadResult, TextureManager};
pub use observer::{ObserverHandle, PixelBufferLoaded, TextureUploadObserver, TextureUploaded};
pub use pixel::{PixelBuffer, PixelFormat};
pub use types::{
    FULL_ATLAS_RECT, FittingMode, ImageDimensions, LoadState, MultiplyOnLoad, ReloadPolicy,
    SamplingMode, StorageType, TextureId, UseAtlas,
};
pub use url::{UrlProtocol, VisualUrl};
