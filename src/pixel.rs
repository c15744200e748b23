//! CPU-side decoded pixel buffers: premultiplication and alpha-mask
//! compositing.

use image::RgbaImage;

use crate::types::MultiplyOnLoad;

/// Channel layout of a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Single-channel luminance.
    L8,
    /// Packed RGB, no alpha.
    Rgb888,
    /// Packed RGBA.
    Rgba8888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::L8 => 1,
            Self::Rgb888 => 3,
            Self::Rgba8888 => 4,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, Self::Rgba8888)
    }
}

/// A decoded image owned on the CPU.
///
/// Tracks whether its color channels have already been multiplied by alpha so
/// that cache-hit compatibility checks can use the actual outcome rather than
/// what was requested.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    pre_multiplied: bool,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * format.bytes_per_pixel()
        );
        Self {
            width,
            height,
            format,
            data,
            pre_multiplied: false,
        }
    }

    pub fn from_rgba_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(width, height, PixelFormat::Rgba8888, image.into_raw())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn has_alpha(&self) -> bool {
        self.format.has_alpha()
    }

    pub fn pre_multiplied(&self) -> bool {
        self.pre_multiplied
    }

    /// A zero-dimension buffer counts as a failed decode.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Multiplies color channels by alpha in place. No-op for formats
    /// without an alpha channel.
    pub fn multiply_color_by_alpha(&mut self) {
        if self.format != PixelFormat::Rgba8888 || self.pre_multiplied {
            return;
        }
        for px in self.data.chunks_exact_mut(4) {
            let a = px[3] as u16;
            px[0] = ((px[0] as u16 * a + 127) / 255) as u8;
            px[1] = ((px[1] as u16 * a + 127) / 255) as u8;
            px[2] = ((px[2] as u16 * a + 127) / 255) as u8;
        }
        self.pre_multiplied = true;
    }

    /// Applies the requested premultiplication policy and reports the actual
    /// outcome: a buffer without an alpha channel downgrades the policy to
    /// [`MultiplyOnLoad::LoadWithoutMultiply`] regardless of the request.
    pub fn premultiply(&mut self, policy: MultiplyOnLoad) -> MultiplyOnLoad {
        if !self.has_alpha() {
            return MultiplyOnLoad::LoadWithoutMultiply;
        }
        if policy == MultiplyOnLoad::MultiplyOnLoad {
            self.multiply_color_by_alpha();
        }
        policy
    }

    /// Mask value for the pixel at (x, y): alpha when the mask has an alpha
    /// channel, luminance otherwise.
    fn mask_value(&self, x: u32, y: u32) -> u8 {
        let idx = (y as usize * self.width as usize + x as usize) * self.format.bytes_per_pixel();
        match self.format {
            PixelFormat::L8 => self.data[idx],
            PixelFormat::Rgb888 => {
                let (r, g, b) = (
                    self.data[idx] as u32,
                    self.data[idx + 1] as u32,
                    self.data[idx + 2] as u32,
                );
                ((r * 299 + g * 587 + b * 114) / 1000) as u8
            }
            PixelFormat::Rgba8888 => self.data[idx + 3],
        }
    }

    /// Expands to RGBA for compositing and resizing.
    fn to_rgba_image(&self) -> RgbaImage {
        match self.format {
            PixelFormat::Rgba8888 => {
                RgbaImage::from_raw(self.width, self.height, self.data.clone())
                    .unwrap_or_else(|| RgbaImage::new(0, 0))
            }
            PixelFormat::Rgb888 => {
                let mut out = Vec::with_capacity(self.data.len() / 3 * 4);
                for px in self.data.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
                RgbaImage::from_raw(self.width, self.height, out)
                    .unwrap_or_else(|| RgbaImage::new(0, 0))
            }
            PixelFormat::L8 => {
                let mut out = Vec::with_capacity(self.data.len() * 4);
                for &l in &self.data {
                    out.extend_from_slice(&[l, l, l, 255]);
                }
                RgbaImage::from_raw(self.width, self.height, out)
                    .unwrap_or_else(|| RgbaImage::new(0, 0))
            }
        }
    }

    /// Composites `mask` onto this buffer, deriving output alpha from the
    /// mask's alpha (or luminance for alpha-less masks).
    ///
    /// The content is first scaled by `content_scale`. With `crop_to_mask`
    /// the scaled content is then cropped to the mask's dimensions; otherwise
    /// the mask is scaled to the content's dimensions before being applied.
    /// The result is always RGBA and never premultiplied; premultiplication
    /// runs after masking.
    pub fn apply_mask(&self, mask: &PixelBuffer, content_scale: f32, crop_to_mask: bool) -> Self {
        if self.is_empty() || mask.is_empty() {
            return self.clone();
        }

        let scale = if content_scale > 0.0 { content_scale } else { 1.0 };
        let scaled_w = ((self.width as f32 * scale).round() as u32).max(1);
        let scaled_h = ((self.height as f32 * scale).round() as u32).max(1);

        let mut content = self.to_rgba_image();
        if (scaled_w, scaled_h) != (self.width, self.height) {
            content = image::imageops::resize(
                &content,
                scaled_w,
                scaled_h,
                image::imageops::FilterType::Triangle,
            );
        }

        let (out_w, out_h, mask_at): (u32, u32, Box<dyn Fn(u32, u32) -> u8>) = if crop_to_mask {
            let w = mask.width.min(content.width());
            let h = mask.height.min(content.height());
            content = image::imageops::crop_imm(&content, 0, 0, w, h).to_image();
            let mask = mask.clone();
            (w, h, Box::new(move |x, y| mask.mask_value(x, y)))
        } else {
            // Scale the mask over the content instead.
            let (w, h) = (content.width(), content.height());
            let mask_rgba = image::imageops::resize(
                &mask.to_rgba_image(),
                w,
                h,
                image::imageops::FilterType::Triangle,
            );
            let has_alpha = mask.has_alpha();
            let scaled = PixelBuffer::from_rgba_image(mask_rgba);
            (
                w,
                h,
                Box::new(move |x, y| {
                    if has_alpha {
                        scaled.mask_value(x, y)
                    } else {
                        // Alpha-less masks were expanded to opaque RGBA; use
                        // luminance of the scaled pixels.
                        let idx = (y as usize * scaled.width as usize + x as usize) * 4;
                        let (r, g, b) = (
                            scaled.data[idx] as u32,
                            scaled.data[idx + 1] as u32,
                            scaled.data[idx + 2] as u32,
                        );
                        ((r * 299 + g * 587 + b * 114) / 1000) as u8
                    }
                }),
            )
        };

        let mut out = content.into_raw();
        for y in 0..out_h {
            for x in 0..out_w {
                let idx = (y as usize * out_w as usize + x as usize) * 4 + 3;
                let m = mask_at(x, y) as u16;
                out[idx] = ((out[idx] as u16 * m + 127) / 255) as u8;
            }
        }
        Self::new(out_w, out_h, PixelFormat::Rgba8888, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(width: u32, height: u32, px: [u8; 4]) -> PixelBuffer {
        let data = px
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        PixelBuffer::new(width, height, PixelFormat::Rgba8888, data)
    }

    #[test]
    fn multiplies_color_by_alpha() {
        let mut buf = rgba(1, 1, [200, 100, 50, 128]);
        buf.multiply_color_by_alpha();
        assert!(buf.pre_multiplied());
        assert_eq!(&buf.data()[..3], &[100, 50, 25]);
        assert_eq!(buf.data()[3], 128);
    }

    #[test]
    fn premultiply_downgrades_policy_without_alpha() {
        let mut buf = PixelBuffer::new(1, 1, PixelFormat::Rgb888, vec![10, 20, 30]);
        let actual = buf.premultiply(MultiplyOnLoad::MultiplyOnLoad);
        assert_eq!(actual, MultiplyOnLoad::LoadWithoutMultiply);
        assert!(!buf.pre_multiplied());
    }

    #[test]
    fn premultiply_honors_request_with_alpha() {
        let mut buf = rgba(1, 1, [255, 255, 255, 0]);
        let actual = buf.premultiply(MultiplyOnLoad::MultiplyOnLoad);
        assert_eq!(actual, MultiplyOnLoad::MultiplyOnLoad);
        assert!(buf.pre_multiplied());
        assert_eq!(buf.data(), &[0, 0, 0, 0]);
    }

    #[test]
    fn mask_alpha_carves_out_transparency() {
        let src = rgba(2, 2, [255, 255, 255, 255]);
        // Left column opaque, right column transparent.
        let mask = PixelBuffer::new(
            2,
            2,
            PixelFormat::Rgba8888,
            vec![
                0, 0, 0, 255, 0, 0, 0, 0, //
                0, 0, 0, 255, 0, 0, 0, 0,
            ],
        );
        let out = src.apply_mask(&mask, 1.0, true);
        assert_eq!((out.width(), out.height()), (2, 2));
        assert_eq!(out.data()[3], 255);
        assert_eq!(out.data()[7], 0);
    }

    #[test]
    fn luminance_mask_when_no_alpha_channel() {
        let src = rgba(1, 1, [10, 10, 10, 255]);
        let mask = PixelBuffer::new(1, 1, PixelFormat::L8, vec![0]);
        let out = src.apply_mask(&mask, 1.0, true);
        assert_eq!(out.data()[3], 0);
    }

    #[test]
    fn crop_to_mask_clamps_dimensions() {
        let src = rgba(4, 4, [1, 2, 3, 255]);
        let mask = rgba(2, 2, [0, 0, 0, 255]);
        let out = src.apply_mask(&mask, 1.0, true);
        assert_eq!((out.width(), out.height()), (2, 2));
    }

    #[test]
    fn mask_scales_to_content_without_crop() {
        let src = rgba(4, 4, [9, 9, 9, 255]);
        let mask = rgba(2, 2, [0, 0, 0, 128]);
        let out = src.apply_mask(&mask, 1.0, false);
        assert_eq!((out.width(), out.height()), (4, 4));
    }

    #[test]
    fn content_scale_resizes_before_masking() {
        let src = rgba(2, 2, [7, 7, 7, 255]);
        let mask = rgba(4, 4, [0, 0, 0, 255]);
        let out = src.apply_mask(&mask, 2.0, true);
        assert_eq!((out.width(), out.height()), (4, 4));
    }
}
