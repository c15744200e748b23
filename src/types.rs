//! Request parameters and lifecycle state shared across the crate.

use std::fmt;

/// Identity of a cached (or externally supplied) texture. Ids are handed out
/// by the manager from a single monotonically increasing counter, so a
/// texture id never refers to two different resources within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Requested decode dimensions. Zero-by-zero means "natural size".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

impl ImageDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_zero(self) -> bool {
        self.width == 0 && self.height == 0
    }
}

/// How a decoded image is fitted into the desired dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FittingMode {
    /// Fill the desired box, cropping overflow.
    #[default]
    ScaleToFill,
    /// Fit inside the desired box, never upscaling.
    ShrinkToFit,
    /// Match the desired width, height follows the aspect ratio.
    FitWidth,
    /// Match the desired height, width follows the aspect ratio.
    FitHeight,
}

impl FittingMode {
    pub(crate) fn bits(self) -> u64 {
        match self {
            Self::ScaleToFill => 0,
            Self::ShrinkToFit => 1,
            Self::FitWidth => 2,
            Self::FitHeight => 3,
        }
    }
}

/// Resampling filter used when the decode dimensions differ from the
/// natural size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplingMode {
    #[default]
    Box,
    Nearest,
    Linear,
    BoxThenLinear,
    NoFilter,
}

impl SamplingMode {
    pub(crate) fn bits(self) -> u64 {
        match self {
            Self::Box => 0,
            Self::Nearest => 1,
            Self::Linear => 2,
            Self::BoxThenLinear => 3,
            Self::NoFilter => 4,
        }
    }
}

/// What the manager should do with the decoded pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    /// Upload to the GPU and notify with a texture set.
    UploadToGpu,
    /// Hand the decoded buffer back to the caller; the entry is not cached.
    ReturnPixelBuffer,
    /// Keep the decoded buffer CPU-side; used for mask sources.
    KeepPixelBuffer,
}

impl StorageType {
    pub(crate) fn bits(self) -> u64 {
        match self {
            Self::UploadToGpu => 0,
            Self::ReturnPixelBuffer => 1,
            Self::KeepPixelBuffer => 2,
        }
    }
}

/// Whether the caller would accept an atlased texture. Atlas packing itself
/// is not performed; requests are answered with a full-texture rect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UseAtlas {
    #[default]
    NoAtlas,
    UseAtlas,
}

/// Texture coordinates covering the whole texture; reported to observers
/// since uploads are never atlased.
pub const FULL_ATLAS_RECT: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

/// Whether a cached entry may satisfy this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReloadPolicy {
    /// Reuse a cached entry when the parameters match.
    #[default]
    Cached,
    /// Always reload from the source, replacing the uploaded texture.
    Forced,
}

/// Requested alpha premultiplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MultiplyOnLoad {
    #[default]
    LoadWithoutMultiply,
    MultiplyOnLoad,
}

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadState {
    NotStarted,
    Loading,
    LoadFinished,
    WaitingForMask,
    MaskApplying,
    MaskApplied,
    Uploaded,
    Cancelled,
    LoadFailed,
}

impl LoadState {
    /// States with work outstanding on a worker thread or a pending mask
    /// dependency. Removing an entry in one of these states defers the erase
    /// to the completion handler instead.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Loading | Self::WaitingForMask | Self::MaskApplying)
    }
}
