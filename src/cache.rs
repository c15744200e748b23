//! The de-duplicating texture cache.
//!
//! Entries are keyed by a 64-bit hash of every parameter that affects the
//! decoded pixels; hash hits are confirmed with a full parameter comparison
//! so collisions merely cost a few extra compares.

use std::hash::Hasher;
use std::sync::Arc;

use twox_hash::XxHash64;

use crate::gpu::TextureSet;
use crate::loader::AnimatedImageLoading;
use crate::observer::ObserverRef;
use crate::pixel::PixelBuffer;
use crate::types::{
    FittingMode, ImageDimensions, LoadState, MultiplyOnLoad, SamplingMode, StorageType, TextureId,
    UseAtlas,
};
use crate::url::VisualUrl;

/// Everything the manager tracks about one cached load.
pub(crate) struct TextureInfo {
    pub texture_id: TextureId,
    pub url: VisualUrl,
    pub desired_size: ImageDimensions,
    pub fitting_mode: FittingMode,
    pub sampling_mode: SamplingMode,
    pub storage_type: StorageType,
    pub use_atlas: UseAtlas,
    pub hash: u64,
    pub mask_texture_id: Option<TextureId>,
    pub content_scale: f32,
    pub crop_to_mask: bool,
    pub orientation_correction: bool,
    /// What the caller asked for.
    pub pre_multiply_on_load: MultiplyOnLoad,
    /// What actually happened to the pixels (alpha-less images never get
    /// multiplied regardless of the request).
    pub pre_multiplied: bool,
    pub reference_count: u32,
    pub load_state: LoadState,
    pub pixel_buffer: Option<PixelBuffer>,
    pub texture_set: Option<TextureSet>,
    pub observers: Vec<ObserverRef>,
    pub animated: Option<Arc<dyn AnimatedImageLoading>>,
    pub frame_index: Option<u32>,
}

/// Parameters that determine cache identity for a load request.
#[derive(Clone)]
pub(crate) struct CacheKey<'a> {
    pub url: &'a VisualUrl,
    pub desired_size: ImageDimensions,
    pub fitting_mode: FittingMode,
    pub sampling_mode: SamplingMode,
    pub storage_type: StorageType,
    pub use_atlas: UseAtlas,
    pub mask_texture_id: Option<TextureId>,
    pub frame_index: Option<u32>,
}

pub(crate) struct TextureCache {
    entries: Vec<TextureInfo>,
}

impl TextureCache {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, info: TextureInfo) {
        self.entries.push(info);
    }

    pub fn index_of(&self, id: TextureId) -> Option<usize> {
        self.entries.iter().position(|e| e.texture_id == id)
    }

    pub fn get(&self, id: TextureId) -> Option<&TextureInfo> {
        self.entries.iter().find(|e| e.texture_id == id)
    }

    pub fn get_mut(&mut self, id: TextureId) -> Option<&mut TextureInfo> {
        self.entries.iter_mut().find(|e| e.texture_id == id)
    }

    pub fn remove(&mut self, id: TextureId) -> Option<TextureInfo> {
        let index = self.index_of(id)?;
        Some(self.entries.swap_remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TextureInfo> {
        self.entries.iter()
    }

    /// Hash over every identity-affecting parameter. The layout is flat
    /// bytes rather than a derived `Hash` impl so identity stays stable
    /// across field reordering.
    pub fn generate_hash(key: &CacheKey<'_>) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key.url.url().as_bytes());
        // Fitting and sampling only matter when a decode size was requested,
        // so they only contribute then; otherwise natural-size requests with
        // different fitting modes would never share an entry.
        if !key.desired_size.is_zero() {
            // Width and height packed to 16 bits each; desired sizes beyond
            // 65535 are not meaningful decode targets.
            let dims =
                (key.desired_size.width & 0xffff) | ((key.desired_size.height & 0xffff) << 16);
            hasher.write(&dims.to_le_bytes());
            let fit_bits = key.fitting_mode.bits() | (key.sampling_mode.bits() << 2);
            hasher.write(&[fit_bits as u8]);
        }
        let bits = key.storage_type.bits()
            | (match key.use_atlas {
                UseAtlas::NoAtlas => 0,
                UseAtlas::UseAtlas => 1,
            } << 2);
        hasher.write(&[bits as u8]);
        if let Some(frame) = key.frame_index {
            hasher.write(&frame.to_le_bytes());
        }
        if let Some(mask) = key.mask_texture_id {
            hasher.write(&mask.0.to_le_bytes());
        }
        hasher.finish()
    }

    /// Finds an entry this request can share. The hash narrows candidates;
    /// the full comparison rejects collisions, and the premultiplication
    /// check keeps callers with incompatible alpha expectations apart:
    /// a multiply-on-load request only matches entries that also asked for
    /// it, and a plain request never matches already-multiplied pixels.
    pub fn find_cached(
        &self,
        hash: u64,
        key: &CacheKey<'_>,
        premultiply: MultiplyOnLoad,
    ) -> Option<TextureId> {
        self.entries
            .iter()
            .filter(|e| e.hash == hash)
            .find(|e| {
                e.url == *key.url
                    && e.desired_size == key.desired_size
                    && e.storage_type == key.storage_type
                    && e.use_atlas == key.use_atlas
                    && e.mask_texture_id == key.mask_texture_id
                    && e.frame_index == key.frame_index
                    && (key.desired_size.is_zero()
                        || (e.fitting_mode == key.fitting_mode
                            && e.sampling_mode == key.sampling_mode))
                    && match premultiply {
                        MultiplyOnLoad::MultiplyOnLoad => {
                            e.pre_multiply_on_load == MultiplyOnLoad::MultiplyOnLoad
                        }
                        MultiplyOnLoad::LoadWithoutMultiply => !e.pre_multiplied,
                    }
            })
            .map(|e| e.texture_id)
    }
}

impl TextureInfo {
    pub fn new(
        texture_id: TextureId,
        key: &CacheKey<'_>,
        hash: u64,
        content_scale: f32,
        crop_to_mask: bool,
        orientation_correction: bool,
        pre_multiply_on_load: MultiplyOnLoad,
    ) -> Self {
        Self {
            texture_id,
            url: key.url.clone(),
            desired_size: key.desired_size,
            fitting_mode: key.fitting_mode,
            sampling_mode: key.sampling_mode,
            storage_type: key.storage_type,
            use_atlas: key.use_atlas,
            hash,
            mask_texture_id: key.mask_texture_id,
            content_scale,
            crop_to_mask,
            orientation_correction,
            pre_multiply_on_load,
            pre_multiplied: false,
            reference_count: 1,
            load_state: LoadState::NotStarted,
            pixel_buffer: None,
            texture_set: None,
            observers: Vec::new(),
            animated: None,
            frame_index: key.frame_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(url: &VisualUrl) -> CacheKey<'_> {
        CacheKey {
            url,
            desired_size: ImageDimensions::default(),
            fitting_mode: FittingMode::default(),
            sampling_mode: SamplingMode::default(),
            storage_type: StorageType::UploadToGpu,
            use_atlas: UseAtlas::NoAtlas,
            mask_texture_id: None,
            frame_index: None,
        }
    }

    fn entry(id: u32, key: &CacheKey<'_>, hash: u64) -> TextureInfo {
        TextureInfo::new(
            TextureId(id),
            key,
            hash,
            1.0,
            false,
            true,
            MultiplyOnLoad::LoadWithoutMultiply,
        )
    }

    #[test]
    fn hash_distinguishes_parameters() {
        let url = VisualUrl::new("a.png");
        let base = key(&url);
        let base_hash = TextureCache::generate_hash(&base);

        let mut sized = base.clone();
        sized.desired_size = ImageDimensions::new(64, 64);
        assert_ne!(TextureCache::generate_hash(&sized), base_hash);

        let mut masked = base.clone();
        masked.mask_texture_id = Some(TextureId(3));
        assert_ne!(TextureCache::generate_hash(&masked), base_hash);

        let mut framed = base.clone();
        framed.frame_index = Some(1);
        assert_ne!(TextureCache::generate_hash(&framed), base_hash);

        let other = VisualUrl::new("b.png");
        assert_ne!(TextureCache::generate_hash(&key(&other)), base_hash);
    }

    #[test]
    fn find_cached_matches_identical_request() {
        let url = VisualUrl::new("a.png");
        let k = key(&url);
        let hash = TextureCache::generate_hash(&k);
        let mut cache = TextureCache::new();
        cache.insert(entry(1, &k, hash));
        assert_eq!(
            cache.find_cached(hash, &k, MultiplyOnLoad::LoadWithoutMultiply),
            Some(TextureId(1))
        );
    }

    #[test]
    fn hash_collision_is_rejected_by_comparison() {
        let url_a = VisualUrl::new("a.png");
        let url_b = VisualUrl::new("b.png");
        let key_a = key(&url_a);
        let key_b = key(&url_b);
        // Fabricate a collision: both entries stored under key_a's hash.
        let hash = TextureCache::generate_hash(&key_a);
        let mut cache = TextureCache::new();
        cache.insert(entry(1, &key_b, hash));
        assert_eq!(
            cache.find_cached(hash, &key_a, MultiplyOnLoad::LoadWithoutMultiply),
            None
        );
    }

    #[test]
    fn fitting_ignored_for_natural_size_requests() {
        let url = VisualUrl::new("a.png");
        let k = key(&url);
        let hash = TextureCache::generate_hash(&k);
        let mut cache = TextureCache::new();
        cache.insert(entry(1, &k, hash));

        let mut request = k.clone();
        request.fitting_mode = FittingMode::FitWidth;
        request.sampling_mode = SamplingMode::Nearest;
        // Natural-size requests hash and compare without fitting/sampling.
        let request_hash = TextureCache::generate_hash(&request);
        assert_eq!(request_hash, hash);
        assert_eq!(
            cache.find_cached(request_hash, &request, MultiplyOnLoad::LoadWithoutMultiply),
            Some(TextureId(1))
        );
    }

    #[test]
    fn premultiply_requests_do_not_share_plain_entries() {
        let url = VisualUrl::new("a.png");
        let k = key(&url);
        let hash = TextureCache::generate_hash(&k);
        let mut cache = TextureCache::new();
        cache.insert(entry(1, &k, hash));

        assert_eq!(
            cache.find_cached(hash, &k, MultiplyOnLoad::MultiplyOnLoad),
            None
        );
    }

    #[test]
    fn plain_requests_do_not_share_multiplied_pixels() {
        let url = VisualUrl::new("a.png");
        let k = key(&url);
        let hash = TextureCache::generate_hash(&k);
        let mut cache = TextureCache::new();
        let mut info = entry(1, &k, hash);
        info.pre_multiply_on_load = MultiplyOnLoad::MultiplyOnLoad;
        info.pre_multiplied = true;
        cache.insert(info);

        assert_eq!(
            cache.find_cached(hash, &k, MultiplyOnLoad::LoadWithoutMultiply),
            None
        );
        assert_eq!(
            cache.find_cached(hash, &k, MultiplyOnLoad::MultiplyOnLoad),
            Some(TextureId(1))
        );
    }
}
