use thiserror::Error;

/// Failure producing a decoded pixel buffer.
///
/// These never escape the manager: async failures are absorbed into
/// `LoadState::LoadFailed` and surfaced through the observer's success flag.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The URL scheme is not served by this loader (e.g. a `texture:` URL, or
    /// a remote URL handed to a filesystem-only loader).
    #[error("unsupported url: {0}")]
    UnsupportedUrl(String),

    /// Underlying IO error while reading the resource.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The image bytes could not be decoded.
    #[error(transparent)]
    Decode(#[from] image::ImageError),

    /// An animated source has no such frame.
    #[error("animated source has no frame {index}")]
    MissingFrame { index: u32 },
}
