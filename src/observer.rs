//! Completion notification.
//!
//! Observers are held by the cache as weak references, so destroying an
//! observer implicitly unsubscribes it. Each observer is detached from the
//! entry before its callback runs; re-requesting the same texture from
//! inside the callback therefore re-subscribes cleanly instead of looping.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::gpu::TextureSet;
use crate::manager::TextureManager;
use crate::pixel::PixelBuffer;
use crate::types::{TextureId, UseAtlas};
use crate::url::VisualUrl;

/// Receives load results. Callbacks get mutable access to the manager so
/// they may issue follow-up requests or removals re-entrantly; such requests
/// are queued and replayed once notification finishes.
pub trait TextureUploadObserver {
    /// A GPU-bound load finished (successfully or not).
    fn upload_complete(&mut self, manager: &mut TextureManager, event: &TextureUploaded);

    /// A pixel-buffer load finished. Only called for requests made through
    /// `load_pixel_buffer`.
    fn load_complete(&mut self, manager: &mut TextureManager, event: &PixelBufferLoaded) {
        let _ = (manager, event);
    }
}

/// Shared observer handle passed into load requests.
pub type ObserverHandle = Rc<RefCell<dyn TextureUploadObserver>>;

/// Weak form stored inside cache entries.
pub(crate) type ObserverRef = Weak<RefCell<dyn TextureUploadObserver>>;

/// Payload for [`TextureUploadObserver::upload_complete`].
#[derive(Debug, Clone)]
pub struct TextureUploaded {
    pub success: bool,
    pub texture_id: TextureId,
    pub texture_set: Option<TextureSet>,
    pub use_atlas: UseAtlas,
    pub atlas_rect: [f32; 4],
    pub pre_multiplied: bool,
}

/// Payload for [`TextureUploadObserver::load_complete`].
#[derive(Debug, Clone)]
pub struct PixelBufferLoaded {
    pub success: bool,
    pub buffer: Option<PixelBuffer>,
    pub url: VisualUrl,
    pub pre_multiplied: bool,
}
