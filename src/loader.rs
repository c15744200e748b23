//! Decoded-image providers.
//!
//! The manager only ever talks to the [`ImageLoader`] trait; the bundled
//! [`FsImageLoader`] serves local files. Hosts that need network fetch plug
//! in their own implementation and the manager will route those URLs through
//! the remote loader pool unchanged.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use image::DynamicImage;
use tracing::debug;

use crate::error::LoadError;
use crate::pixel::{PixelBuffer, PixelFormat};
use crate::types::{FittingMode, ImageDimensions, SamplingMode};
use crate::url::{UrlProtocol, VisualUrl};

/// Produces decoded pixel buffers for the worker pool. Implementations are
/// called from worker threads and must be thread-safe.
pub trait ImageLoader: Send + Sync {
    fn load(
        &self,
        url: &VisualUrl,
        desired_size: ImageDimensions,
        fitting_mode: FittingMode,
        sampling_mode: SamplingMode,
        orientation_correction: bool,
    ) -> Result<PixelBuffer, LoadError>;
}

/// A multi-frame image source (GIF, WebP, ...). The manager loads one frame
/// per request; the frame index participates in cache identity.
pub trait AnimatedImageLoading: Send + Sync {
    /// URL identifying the whole animated source.
    fn url(&self) -> &VisualUrl;

    fn frame_count(&self) -> u32;

    fn load_frame(&self, frame_index: u32) -> Result<PixelBuffer, LoadError>;
}

/// Filesystem-backed loader: decodes with the `image` crate and applies EXIF
/// orientation when requested.
#[derive(Debug, Default)]
pub struct FsImageLoader;

impl FsImageLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ImageLoader for FsImageLoader {
    fn load(
        &self,
        url: &VisualUrl,
        desired_size: ImageDimensions,
        fitting_mode: FittingMode,
        sampling_mode: SamplingMode,
        orientation_correction: bool,
    ) -> Result<PixelBuffer, LoadError> {
        if url.protocol() != UrlProtocol::File {
            return Err(LoadError::UnsupportedUrl(url.url().to_owned()));
        }
        let path = Path::new(url.file_path());
        let img = image::ImageReader::open(path)?
            .with_guessed_format()? // sniff based on content/extension
            .decode()?;

        let img = if orientation_correction {
            apply_exif_orientation(img, path)
        } else {
            img
        };

        let img = fit_image(img, desired_size, fitting_mode, sampling_mode);

        // Preserve "no alpha" so premultiplication can report the real
        // outcome downstream.
        Ok(if img.color().has_alpha() {
            PixelBuffer::from_rgba_image(img.to_rgba8())
        } else {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            PixelBuffer::new(w, h, PixelFormat::Rgb888, rgb.into_raw())
        })
    }
}

/// Maps common EXIF orientations; unsupported values fall through as-is.
fn apply_exif_orientation(img: DynamicImage, path: &Path) -> DynamicImage {
    let orientation = read_orientation(path).unwrap_or(1);
    match orientation {
        1 => img,
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn read_orientation(path: &Path) -> Option<u16> {
    let file = File::open(path).ok()?;
    let mut buf = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut buf).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    let val = field.value.get_uint(0)?;
    debug!(orientation = val, path = %path.display(), "exif orientation");
    Some(val as u16)
}

fn filter_for(sampling_mode: SamplingMode) -> image::imageops::FilterType {
    match sampling_mode {
        SamplingMode::Box | SamplingMode::Linear => image::imageops::FilterType::Triangle,
        SamplingMode::Nearest | SamplingMode::NoFilter => image::imageops::FilterType::Nearest,
        SamplingMode::BoxThenLinear => image::imageops::FilterType::CatmullRom,
    }
}

/// Resizes towards the desired dimensions per the fitting mode. A zero
/// desired size keeps the natural size; a single zero axis is derived from
/// the aspect ratio.
fn fit_image(
    img: DynamicImage,
    desired: ImageDimensions,
    fitting: FittingMode,
    sampling: SamplingMode,
) -> DynamicImage {
    if desired.is_zero() {
        return img;
    }
    let (w, h) = (img.width().max(1), img.height().max(1));
    let dw = if desired.width > 0 {
        desired.width
    } else {
        (desired.height as u64 * w as u64 / h as u64).max(1) as u32
    };
    let dh = if desired.height > 0 {
        desired.height
    } else {
        (desired.width as u64 * h as u64 / w as u64).max(1) as u32
    };
    let filter = filter_for(sampling);

    match fitting {
        FittingMode::ScaleToFill => img.resize_to_fill(dw, dh, filter),
        FittingMode::ShrinkToFit => {
            if w > dw || h > dh {
                img.resize(dw, dh, filter)
            } else {
                img
            }
        }
        FittingMode::FitWidth => {
            let target_h = (dw as u64 * h as u64 / w as u64).max(1) as u32;
            img.resize_exact(dw, target_h, filter)
        }
        FittingMode::FitHeight => {
            let target_w = (dh as u64 * w as u64 / h as u64).max(1) as u32;
            img.resize_exact(target_w, dh, filter)
        }
    }
}
