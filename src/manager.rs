//! The texture manager: de-duplicating, reference-counted orchestration of
//! asynchronous image loads.
//!
//! The manager itself is single-threaded. Worker threads only decode and
//! composite; their results come back over a channel that the host drains
//! from its frame tick via [`TextureManager::update`]. All cache mutation and
//! observer notification happens on the calling thread, so observer callbacks
//! may freely issue new requests or removals; requests made while a
//! notification is in progress are queued and replayed afterwards.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};
use tracing::{debug, warn};

use crate::cache::{CacheKey, TextureCache, TextureInfo};
use crate::config::TextureManagerConfig;
use crate::gpu::{GpuFactory, TextureSet};
use crate::loader::{AnimatedImageLoading, ImageLoader};
use crate::observer::{
    ObserverHandle, ObserverRef, PixelBufferLoaded, TextureUploaded,
};
use crate::pixel::PixelBuffer;
use crate::pool::{LoadCompletion, LoaderPool, PoolKind};
use crate::types::{
    FULL_ATLAS_RECT, FittingMode, ImageDimensions, LoadState, MultiplyOnLoad, ReloadPolicy,
    SamplingMode, StorageType, TextureId, UseAtlas,
};
use crate::url::{UrlProtocol, VisualUrl};

/// Mask parameters attached to a [`TextureManager::load_texture`] request.
/// `mask_texture_id` is filled in by the manager on first use so the caller
/// can pass the same `MaskingData` for subsequent requests and removals.
#[derive(Debug, Clone)]
pub struct MaskingData {
    pub mask_url: VisualUrl,
    pub mask_texture_id: Option<TextureId>,
    pub content_scale: f32,
    pub crop_to_mask: bool,
}

impl MaskingData {
    pub fn new(mask_url: impl Into<VisualUrl>) -> Self {
        Self {
            mask_url: mask_url.into(),
            mask_texture_id: None,
            content_scale: 1.0,
            crop_to_mask: false,
        }
    }
}

/// Outcome of [`TextureManager::load_texture`].
#[derive(Debug, Clone, Default)]
pub struct TextureLoadResult {
    pub texture_set: Option<TextureSet>,
    pub texture_id: Option<TextureId>,
    /// True while the load is still in flight; the observer fires when it
    /// settles.
    pub loading: bool,
}

struct ExternalTexture {
    texture_id: TextureId,
    texture_set: TextureSet,
}

struct LoadQueueElement {
    texture_id: TextureId,
    observer: Option<ObserverRef>,
}

enum Notification {
    Upload(TextureUploaded),
    Buffer(PixelBufferLoaded),
}

fn same_observer(weak: &ObserverRef, handle: &ObserverHandle) -> bool {
    std::ptr::addr_eq(weak.as_ptr(), Rc::as_ptr(handle))
}

pub struct TextureManager {
    cache: TextureCache,
    local_pool: LoaderPool,
    remote_pool: LoaderPool,
    external_textures: Vec<ExternalTexture>,
    load_queue: Vec<LoadQueueElement>,
    /// Set while observers are being notified; requests arriving re-entrantly
    /// go to `load_queue` instead of starting inline.
    queue_load_flag: bool,
    next_texture_id: u32,
    completion_rx: Receiver<LoadCompletion>,
    loader: Arc<dyn ImageLoader>,
    gpu: Arc<dyn GpuFactory>,
}

impl TextureManager {
    pub fn new(
        config: TextureManagerConfig,
        loader: Arc<dyn ImageLoader>,
        gpu: Arc<dyn GpuFactory>,
    ) -> Self {
        let config = config.clamped();
        let (completion_tx, completion_rx) = unbounded();
        Self {
            cache: TextureCache::new(),
            local_pool: LoaderPool::new(
                PoolKind::Local,
                config.local_loader_count,
                Arc::clone(&loader),
                completion_tx.clone(),
            ),
            remote_pool: LoaderPool::new(
                PoolKind::Remote,
                config.remote_loader_count,
                Arc::clone(&loader),
                completion_tx,
            ),
            external_textures: Vec::new(),
            load_queue: Vec::new(),
            queue_load_flag: false,
            next_texture_id: 0,
            completion_rx,
            loader,
            gpu,
        }
    }

    // ------------------------------------------------------------------
    // Requests

    /// Requests an asynchronous GPU-bound load. Returns the id of the cache
    /// entry serving the request, which may be shared with earlier callers.
    /// `premultiply` is in/out: on a hit against a finished entry it is
    /// updated to what actually happened to the pixels.
    #[allow(clippy::too_many_arguments)]
    pub fn request_load(
        &mut self,
        url: &VisualUrl,
        desired_size: ImageDimensions,
        fitting_mode: FittingMode,
        sampling_mode: SamplingMode,
        use_atlas: UseAtlas,
        observer: Option<&ObserverHandle>,
        orientation_correction: bool,
        reload_policy: ReloadPolicy,
        premultiply: &mut MultiplyOnLoad,
    ) -> TextureId {
        self.request_load_internal(
            url,
            None,
            1.0,
            false,
            desired_size,
            fitting_mode,
            sampling_mode,
            use_atlas,
            false,
            StorageType::UploadToGpu,
            observer,
            orientation_correction,
            reload_policy,
            premultiply,
            None,
            None,
        )
    }

    /// As [`request_load`](Self::request_load), with an alpha mask applied
    /// before upload. The mask must already have been requested through
    /// [`request_mask_load`](Self::request_mask_load).
    #[allow(clippy::too_many_arguments)]
    pub fn request_load_masked(
        &mut self,
        url: &VisualUrl,
        mask_texture_id: TextureId,
        content_scale: f32,
        desired_size: ImageDimensions,
        fitting_mode: FittingMode,
        sampling_mode: SamplingMode,
        use_atlas: UseAtlas,
        crop_to_mask: bool,
        observer: Option<&ObserverHandle>,
        orientation_correction: bool,
        reload_policy: ReloadPolicy,
        premultiply: &mut MultiplyOnLoad,
    ) -> TextureId {
        self.request_load_internal(
            url,
            Some(mask_texture_id),
            content_scale,
            crop_to_mask,
            desired_size,
            fitting_mode,
            sampling_mode,
            use_atlas,
            false,
            StorageType::UploadToGpu,
            observer,
            orientation_correction,
            reload_policy,
            premultiply,
            None,
            None,
        )
    }

    /// Requests a mask image. Masks stay CPU-side, are never premultiplied
    /// and have no observers; dependents are notified through their own
    /// entries once the mask settles.
    pub fn request_mask_load(&mut self, mask_url: &VisualUrl) -> TextureId {
        let mut premultiply = MultiplyOnLoad::LoadWithoutMultiply;
        self.request_load_internal(
            mask_url,
            None,
            1.0,
            false,
            ImageDimensions::default(),
            FittingMode::default(),
            SamplingMode::NoFilter,
            UseAtlas::NoAtlas,
            false,
            StorageType::KeepPixelBuffer,
            None,
            true,
            ReloadPolicy::Cached,
            &mut premultiply,
            None,
            None,
        )
    }

    /// Requests one frame of an animated source. The frame index is part of
    /// the cache identity, so different frames of the same source coexist.
    #[allow(clippy::too_many_arguments)]
    pub fn request_animated_frame_load(
        &mut self,
        source: Arc<dyn AnimatedImageLoading>,
        frame_index: u32,
        mask_texture_id: Option<TextureId>,
        content_scale: f32,
        crop_to_mask: bool,
        observer: Option<&ObserverHandle>,
        premultiply: &mut MultiplyOnLoad,
    ) -> TextureId {
        let url = source.url().clone();
        self.request_load_internal(
            &url,
            mask_texture_id,
            content_scale,
            crop_to_mask,
            ImageDimensions::default(),
            FittingMode::default(),
            SamplingMode::default(),
            UseAtlas::NoAtlas,
            false,
            StorageType::UploadToGpu,
            observer,
            true,
            ReloadPolicy::Cached,
            premultiply,
            Some(source),
            Some(frame_index),
        )
    }

    /// One-stop load: resolves `texture:` URLs from the external registry,
    /// requests the mask first when `masking` has no id yet, then either
    /// blocks (synchronous) or falls through to the async request path.
    #[allow(clippy::too_many_arguments)]
    pub fn load_texture(
        &mut self,
        url: &VisualUrl,
        desired_size: ImageDimensions,
        fitting_mode: FittingMode,
        sampling_mode: SamplingMode,
        masking: &mut Option<MaskingData>,
        synchronous: bool,
        observer: Option<&ObserverHandle>,
        orientation_correction: bool,
        reload_policy: ReloadPolicy,
        premultiply: &mut MultiplyOnLoad,
    ) -> TextureLoadResult {
        if url.protocol() == UrlProtocol::Texture {
            let found = url.texture_id().and_then(|id| {
                self.external_textures
                    .iter()
                    .find(|e| e.texture_id == id)
                    .map(|e| (id, e.texture_set.clone()))
            });
            return match found {
                Some((id, set)) => TextureLoadResult {
                    texture_set: Some(set),
                    texture_id: Some(id),
                    loading: false,
                },
                None => {
                    warn!(%url, "unknown external texture");
                    TextureLoadResult::default()
                }
            };
        }

        let (mask_texture_id, content_scale, crop_to_mask) = match masking.as_mut() {
            Some(data) => {
                if data.mask_texture_id.is_none() {
                    data.mask_texture_id = Some(self.request_mask_load(&data.mask_url.clone()));
                }
                (data.mask_texture_id, data.content_scale, data.crop_to_mask)
            }
            None => (None, 1.0, false),
        };

        let texture_id = self.request_load_internal(
            url,
            mask_texture_id,
            content_scale,
            crop_to_mask,
            desired_size,
            fitting_mode,
            sampling_mode,
            UseAtlas::NoAtlas,
            synchronous,
            StorageType::UploadToGpu,
            observer,
            orientation_correction,
            reload_policy,
            premultiply,
            None,
            None,
        );

        let (texture_set, loading) = match self.cache.get(texture_id) {
            Some(entry) => (
                entry.texture_set.clone(),
                !matches!(entry.load_state, LoadState::Uploaded | LoadState::LoadFailed),
            ),
            None => (None, false),
        };
        TextureLoadResult {
            texture_set,
            texture_id: Some(texture_id),
            loading,
        }
    }

    /// Loads a decoded pixel buffer for the caller instead of uploading.
    /// These requests are never cached: every call decodes afresh. The
    /// synchronous variant returns the buffer directly; the asynchronous one
    /// returns `None` and notifies through the observer's `load_complete`.
    #[allow(clippy::too_many_arguments)]
    pub fn load_pixel_buffer(
        &mut self,
        url: &VisualUrl,
        desired_size: ImageDimensions,
        fitting_mode: FittingMode,
        sampling_mode: SamplingMode,
        synchronous: bool,
        observer: Option<&ObserverHandle>,
        orientation_correction: bool,
        premultiply: &mut MultiplyOnLoad,
    ) -> Option<PixelBuffer> {
        if synchronous {
            return match self.loader.load(
                url,
                desired_size,
                fitting_mode,
                sampling_mode,
                orientation_correction,
            ) {
                Ok(mut buffer) if !buffer.is_empty() => {
                    *premultiply = buffer.premultiply(*premultiply);
                    Some(buffer)
                }
                Ok(_) => None,
                Err(err) => {
                    warn!(%url, %err, "synchronous pixel buffer load failed");
                    None
                }
            };
        }
        self.request_load_internal(
            url,
            None,
            1.0,
            false,
            desired_size,
            fitting_mode,
            sampling_mode,
            UseAtlas::NoAtlas,
            false,
            StorageType::ReturnPixelBuffer,
            observer,
            orientation_correction,
            ReloadPolicy::Forced,
            premultiply,
            None,
            None,
        );
        None
    }

    // ------------------------------------------------------------------
    // Removal

    /// Drops one reference to `texture_id`. When the last reference goes,
    /// settled entries are erased immediately while in-flight ones are
    /// marked `Cancelled` and reclaimed when their worker result arrives.
    /// Passing the observer also detaches it and purges any queued load it
    /// was attached to.
    pub fn remove(&mut self, texture_id: TextureId, observer: Option<&ObserverHandle>) {
        if let Some(handle) = observer {
            self.load_queue.retain(|element| {
                !(element.texture_id == texture_id
                    && element
                        .observer
                        .as_ref()
                        .is_some_and(|weak| same_observer(weak, handle)))
            });
        }
        let Some(entry) = self.cache.get_mut(texture_id) else {
            return;
        };
        if let Some(handle) = observer {
            entry.observers.retain(|weak| !same_observer(weak, handle));
        }
        entry.reference_count = entry.reference_count.saturating_sub(1);
        if entry.reference_count > 0 {
            return;
        }
        if entry.load_state.is_in_flight() {
            debug!(%texture_id, state = ?entry.load_state, "deferring removal of in-flight load");
            entry.load_state = LoadState::Cancelled;
            entry.observers.clear();
        } else {
            self.cache.remove(texture_id);
        }
    }

    // ------------------------------------------------------------------
    // External textures

    /// Registers a host-owned texture set and returns the `texture:` URL that
    /// addresses it through [`load_texture`](Self::load_texture).
    pub fn add_external_texture(&mut self, texture_set: TextureSet) -> String {
        let texture_id = self.generate_texture_id();
        self.external_textures.push(ExternalTexture {
            texture_id,
            texture_set,
        });
        VisualUrl::for_texture(texture_id).url().to_owned()
    }

    pub fn remove_external_texture(&mut self, url: &VisualUrl) -> Option<TextureSet> {
        let id = url.texture_id()?;
        let index = self
            .external_textures
            .iter()
            .position(|e| e.texture_id == id)?;
        Some(self.external_textures.swap_remove(index).texture_set)
    }

    // ------------------------------------------------------------------
    // Queries

    pub fn get_texture_set(&self, texture_id: TextureId) -> Option<TextureSet> {
        self.cache
            .get(texture_id)
            .and_then(|e| e.texture_set.clone())
            .or_else(|| {
                self.external_textures
                    .iter()
                    .find(|e| e.texture_id == texture_id)
                    .map(|e| e.texture_set.clone())
            })
    }

    pub fn get_visual_url(&self, texture_id: TextureId) -> Option<VisualUrl> {
        if let Some(entry) = self.cache.get(texture_id) {
            return Some(entry.url.clone());
        }
        self.external_textures
            .iter()
            .find(|e| e.texture_id == texture_id)
            .map(|e| VisualUrl::for_texture(e.texture_id))
    }

    /// `NotStarted` doubles as "unknown id"; external textures report
    /// `Uploaded`.
    pub fn get_texture_state(&self, texture_id: TextureId) -> LoadState {
        if let Some(entry) = self.cache.get(texture_id) {
            return entry.load_state;
        }
        if self
            .external_textures
            .iter()
            .any(|e| e.texture_id == texture_id)
        {
            return LoadState::Uploaded;
        }
        LoadState::NotStarted
    }

    // ------------------------------------------------------------------
    // Completion pumping

    /// Drains finished worker results, running post-load handling and
    /// observer notification for each. Returns how many were processed.
    /// Hosts call this once per frame tick.
    pub fn update(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.async_load_complete(completion);
            processed += 1;
        }
        processed
    }

    /// Blocks up to `timeout` for at least one completion, then drains the
    /// rest like [`update`](Self::update).
    pub fn wait_and_update(&mut self, timeout: Duration) -> usize {
        match self.completion_rx.recv_timeout(timeout) {
            Ok(completion) => {
                self.async_load_complete(completion);
                1 + self.update()
            }
            Err(_) => 0,
        }
    }

    // ------------------------------------------------------------------
    // Internals

    fn generate_texture_id(&mut self) -> TextureId {
        let id = TextureId(self.next_texture_id);
        self.next_texture_id += 1;
        id
    }

    fn pool_for(&mut self, url: &VisualUrl) -> &mut LoaderPool {
        if url.is_local() {
            &mut self.local_pool
        } else {
            &mut self.remote_pool
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn request_load_internal(
        &mut self,
        url: &VisualUrl,
        mask_texture_id: Option<TextureId>,
        content_scale: f32,
        crop_to_mask: bool,
        desired_size: ImageDimensions,
        fitting_mode: FittingMode,
        sampling_mode: SamplingMode,
        use_atlas: UseAtlas,
        load_synchronously: bool,
        storage_type: StorageType,
        observer: Option<&ObserverHandle>,
        orientation_correction: bool,
        reload_policy: ReloadPolicy,
        premultiply: &mut MultiplyOnLoad,
        animated: Option<Arc<dyn AnimatedImageLoading>>,
        frame_index: Option<u32>,
    ) -> TextureId {
        let key = CacheKey {
            url,
            desired_size,
            fitting_mode,
            sampling_mode,
            storage_type,
            use_atlas,
            mask_texture_id,
            frame_index,
        };
        let hash = TextureCache::generate_hash(&key);

        let mut texture_id = None;
        // Buffer-return loads are intentionally uncached: each caller gets a
        // fresh decode it can own outright.
        if storage_type != StorageType::ReturnPixelBuffer {
            if let Some(id) = self.cache.find_cached(hash, &key, *premultiply) {
                texture_id = Some(id);
                let entry = self.cache.get_mut(id).unwrap();
                if reload_policy == ReloadPolicy::Cached {
                    entry.reference_count += 1;
                }
                if matches!(
                    entry.load_state,
                    LoadState::Uploaded | LoadState::LoadFinished | LoadState::MaskApplied
                ) {
                    *premultiply = if entry.pre_multiplied {
                        MultiplyOnLoad::MultiplyOnLoad
                    } else {
                        MultiplyOnLoad::LoadWithoutMultiply
                    };
                }
                debug!(%url, texture_id = %id, refs = entry.reference_count, "cache hit");
            }
        }

        let texture_id = texture_id.unwrap_or_else(|| {
            let id = self.generate_texture_id();
            let mut info = TextureInfo::new(
                id,
                &key,
                hash,
                content_scale,
                crop_to_mask,
                orientation_correction,
                *premultiply,
            );
            info.animated = animated;
            debug!(%url, texture_id = %id, ?storage_type, "new cache entry");
            self.cache.insert(info);
            id
        });

        // A forced reload restarts a settled entry; its old texture set
        // stays valid until the new upload replaces it.
        if reload_policy == ReloadPolicy::Forced {
            let entry = self.cache.get_mut(texture_id).unwrap();
            if entry.load_state == LoadState::Uploaded {
                entry.load_state = LoadState::NotStarted;
            }
        }

        if load_synchronously {
            self.load_synchronously(texture_id, premultiply);
            return texture_id;
        }

        match self.cache.get(texture_id).unwrap().load_state {
            LoadState::NotStarted | LoadState::LoadFailed => {
                self.load_or_queue(texture_id, observer);
            }
            LoadState::Cancelled => self.resurrect(texture_id, observer),
            LoadState::Loading | LoadState::WaitingForMask | LoadState::MaskApplying => {
                self.observe(texture_id, observer);
            }
            LoadState::Uploaded => {
                if observer.is_some() {
                    self.load_or_queue(texture_id, observer);
                }
            }
            LoadState::LoadFinished | LoadState::MaskApplied => {}
        }
        texture_id
    }

    /// Revives a `Cancelled` entry for a new requester. An entry with a
    /// stashed buffer was waiting on its mask with no worker job outstanding,
    /// so the mask dependency is re-resolved here; otherwise a worker result
    /// is still due and normal completion handling resumes.
    fn resurrect(&mut self, texture_id: TextureId, observer: Option<&ObserverHandle>) {
        self.observe(texture_id, observer);
        let Some(entry) = self.cache.get_mut(texture_id) else {
            return;
        };
        if entry.pixel_buffer.is_some() {
            entry.load_state = LoadState::LoadFinished;
            self.resolve_mask_dependency(texture_id);
        } else {
            entry.load_state = LoadState::Loading;
        }
    }

    fn observe(&mut self, texture_id: TextureId, observer: Option<&ObserverHandle>) {
        let Some(handle) = observer else { return };
        let Some(entry) = self.cache.get_mut(texture_id) else {
            return;
        };
        if !entry.observers.iter().any(|weak| same_observer(weak, handle)) {
            entry.observers.push(Rc::downgrade(handle));
        }
    }

    fn load_or_queue(&mut self, texture_id: TextureId, observer: Option<&ObserverHandle>) {
        if self.queue_load_flag {
            self.load_queue.push(LoadQueueElement {
                texture_id,
                observer: observer.map(Rc::downgrade),
            });
            return;
        }
        let Some((state, storage_type)) = self
            .cache
            .get(texture_id)
            .map(|e| (e.load_state, e.storage_type))
        else {
            return;
        };
        match state {
            LoadState::Uploaded => {
                if let Some(handle) = observer {
                    self.emit_late(texture_id, handle);
                }
            }
            LoadState::LoadFinished if storage_type == StorageType::ReturnPixelBuffer => {
                if let Some(handle) = observer {
                    self.emit_late(texture_id, handle);
                }
            }
            _ => self.load(texture_id, observer),
        }
    }

    fn load(&mut self, texture_id: TextureId, observer: Option<&ObserverHandle>) {
        self.observe(texture_id, observer);
        let Some(entry) = self.cache.get_mut(texture_id) else {
            return;
        };
        entry.load_state = LoadState::Loading;
        // Masked loads defer premultiplication until after compositing.
        let premultiply = if entry.mask_texture_id.is_some() {
            MultiplyOnLoad::LoadWithoutMultiply
        } else {
            entry.pre_multiply_on_load
        };
        let url = entry.url.clone();
        let desired_size = entry.desired_size;
        let fitting_mode = entry.fitting_mode;
        let sampling_mode = entry.sampling_mode;
        let orientation_correction = entry.orientation_correction;
        let animated = entry.animated.clone();
        let frame_index = entry.frame_index;

        if let Some(source) = animated {
            let frame = frame_index.unwrap_or(0);
            self.pool_for(&url)
                .load_frame(texture_id, source, frame, premultiply);
        } else {
            self.pool_for(&url).load(
                texture_id,
                url.clone(),
                desired_size,
                fitting_mode,
                sampling_mode,
                orientation_correction,
                premultiply,
            );
        }
    }

    fn async_load_complete(&mut self, completion: LoadCompletion) {
        let pool = match completion.pool {
            PoolKind::Local => &mut self.local_pool,
            PoolKind::Remote => &mut self.remote_pool,
        };
        let Some(texture_id) = pool.complete(completion.helper, completion.load_id) else {
            warn!(load_id = completion.load_id, "completion with no pending load");
            return;
        };
        let Some(entry) = self.cache.get(texture_id) else {
            return;
        };
        if entry.load_state == LoadState::Cancelled {
            debug!(%texture_id, "discarding result of cancelled load");
            self.cache.remove(texture_id);
            return;
        }
        self.post_load(texture_id, completion.buffer, completion.applied_mask);
    }

    fn post_load(
        &mut self,
        texture_id: TextureId,
        buffer: Option<PixelBuffer>,
        applied_mask: bool,
    ) {
        match buffer {
            Some(buffer) if !buffer.is_empty() => {
                let entry = self.cache.get_mut(texture_id).unwrap();
                if !applied_mask && entry.mask_texture_id.is_some() {
                    entry.pixel_buffer = Some(buffer);
                    entry.load_state = LoadState::LoadFinished;
                    self.resolve_mask_dependency(texture_id);
                } else {
                    if applied_mask {
                        entry.load_state = LoadState::MaskApplied;
                    }
                    self.finish_storage(texture_id, buffer);
                }
            }
            _ => {
                let entry = self.cache.get_mut(texture_id).unwrap();
                entry.load_state = LoadState::LoadFailed;
                let is_mask = entry.storage_type == StorageType::KeepPixelBuffer;
                if is_mask {
                    self.check_for_waiting_textures(texture_id);
                }
                self.notify_observers(texture_id, false);
            }
        }
    }

    /// Looks at the state of this entry's mask and either dispatches the
    /// composite, parks the entry as `WaitingForMask`, or fails the entry
    /// when the mask can never arrive.
    fn resolve_mask_dependency(&mut self, texture_id: TextureId) {
        let Some(entry) = self.cache.get(texture_id) else {
            return;
        };
        let Some(mask_id) = entry.mask_texture_id else {
            if let Some(buffer) = self
                .cache
                .get_mut(texture_id)
                .and_then(|e| e.pixel_buffer.take())
            {
                self.finish_storage(texture_id, buffer);
            }
            return;
        };
        let mask = self
            .cache
            .get(mask_id)
            .map(|m| (m.load_state, m.pixel_buffer.clone()));
        match mask {
            Some((LoadState::LoadFinished, Some(mask_buffer))) => {
                self.dispatch_apply_mask(texture_id, mask_buffer);
            }
            Some((LoadState::NotStarted | LoadState::Loading, _)) => {
                if let Some(entry) = self.cache.get_mut(texture_id) {
                    entry.load_state = LoadState::WaitingForMask;
                }
            }
            _ => {
                warn!(%texture_id, mask_id = %mask_id, "mask unavailable, failing dependent load");
                self.fail_masked_load(texture_id);
            }
        }
    }

    fn dispatch_apply_mask(&mut self, texture_id: TextureId, mask_buffer: PixelBuffer) {
        let Some(entry) = self.cache.get_mut(texture_id) else {
            return;
        };
        let Some(source) = entry.pixel_buffer.take() else {
            return;
        };
        entry.load_state = LoadState::MaskApplying;
        let content_scale = entry.content_scale;
        let crop_to_mask = entry.crop_to_mask;
        let premultiply = entry.pre_multiply_on_load;
        let url = entry.url.clone();
        self.pool_for(&url).apply_mask(
            texture_id,
            source,
            mask_buffer,
            content_scale,
            crop_to_mask,
            premultiply,
        );
    }

    /// A dependent whose mask failed fails outright; the stashed source
    /// buffer is discarded, never uploaded unmasked.
    fn fail_masked_load(&mut self, texture_id: TextureId) {
        let Some(entry) = self.cache.get_mut(texture_id) else {
            return;
        };
        entry.pixel_buffer = None;
        entry.load_state = LoadState::LoadFailed;
        self.notify_observers(texture_id, false);
    }

    fn finish_storage(&mut self, texture_id: TextureId, buffer: PixelBuffer) {
        let Some(storage_type) = self.cache.get(texture_id).map(|e| e.storage_type) else {
            return;
        };
        match storage_type {
            StorageType::UploadToGpu => {
                let texture = self.gpu.create_texture(&buffer);
                let entry = self.cache.get_mut(texture_id).unwrap();
                entry.pre_multiplied = buffer.pre_multiplied();
                entry.texture_set = Some(TextureSet::from_texture(texture));
                entry.load_state = LoadState::Uploaded;
                entry.pixel_buffer = None;
                debug!(%texture_id, "uploaded");
                self.notify_observers(texture_id, true);
            }
            StorageType::KeepPixelBuffer => {
                let entry = self.cache.get_mut(texture_id).unwrap();
                entry.pre_multiplied = buffer.pre_multiplied();
                entry.pixel_buffer = Some(buffer);
                entry.load_state = LoadState::LoadFinished;
                self.check_for_waiting_textures(texture_id);
                self.notify_observers(texture_id, true);
            }
            StorageType::ReturnPixelBuffer => {
                let entry = self.cache.get_mut(texture_id).unwrap();
                entry.pre_multiplied = buffer.pre_multiplied();
                entry.pixel_buffer = Some(buffer);
                entry.load_state = LoadState::LoadFinished;
                self.notify_observers(texture_id, true);
            }
        }
    }

    /// A mask has settled: dispatch every dependent parked on it, and
    /// reclaim dependents that were cancelled while waiting (they have a
    /// stashed buffer but no worker job to retire them).
    fn check_for_waiting_textures(&mut self, mask_id: TextureId) {
        let (mask_ready, mask_buffer) = match self.cache.get(mask_id) {
            Some(mask) => (
                mask.load_state == LoadState::LoadFinished,
                mask.pixel_buffer.clone(),
            ),
            None => (false, None),
        };
        let waiters: Vec<(TextureId, bool)> = self
            .cache
            .iter()
            .filter(|e| {
                e.mask_texture_id == Some(mask_id)
                    && (e.load_state == LoadState::WaitingForMask
                        || (e.load_state == LoadState::Cancelled && e.pixel_buffer.is_some()))
            })
            .map(|e| (e.texture_id, e.load_state == LoadState::Cancelled))
            .collect();
        for (texture_id, cancelled) in waiters {
            if cancelled {
                self.cache.remove(texture_id);
                continue;
            }
            match (mask_ready, mask_buffer.clone()) {
                (true, Some(buffer)) => self.dispatch_apply_mask(texture_id, buffer),
                _ => {
                    warn!(%texture_id, mask_id = %mask_id, "mask failed, failing dependent load");
                    self.fail_masked_load(texture_id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Notification

    fn notification_for(&self, texture_id: TextureId, success: bool) -> Option<Notification> {
        let entry = self.cache.get(texture_id)?;
        Some(match entry.storage_type {
            StorageType::ReturnPixelBuffer => Notification::Buffer(PixelBufferLoaded {
                success,
                buffer: entry.pixel_buffer.clone(),
                url: entry.url.clone(),
                pre_multiplied: entry.pre_multiplied,
            }),
            _ => Notification::Upload(TextureUploaded {
                success,
                texture_id,
                texture_set: entry.texture_set.clone(),
                use_atlas: UseAtlas::NoAtlas,
                atlas_rect: FULL_ATLAS_RECT,
                pre_multiplied: entry.pre_multiplied,
            }),
        })
    }

    /// Late notification for one observer of a settled entry. The load
    /// queue guard stays up while the callback runs, so a nested request
    /// for the same entry is deferred until the observer borrow is
    /// released instead of re-entering `emit_to` on a borrowed handle.
    fn emit_late(&mut self, texture_id: TextureId, handle: &ObserverHandle) {
        self.queue_load_flag = true;
        self.emit_to(texture_id, handle, true);
        self.queue_load_flag = false;
        self.process_load_queue();
    }

    fn emit_to(&mut self, texture_id: TextureId, handle: &ObserverHandle, success: bool) {
        let Some(notification) = self.notification_for(texture_id, success) else {
            return;
        };
        match notification {
            Notification::Upload(event) => handle.borrow_mut().upload_complete(self, &event),
            Notification::Buffer(event) => handle.borrow_mut().load_complete(self, &event),
        }
    }

    /// Drains the entry's observer list, detaching each observer before its
    /// callback runs so re-requests from inside the callback re-subscribe
    /// instead of looping. The cache entry is re-looked-up every iteration
    /// since callbacks may mutate the cache arbitrarily.
    fn notify_observers(&mut self, texture_id: TextureId, success: bool) {
        self.queue_load_flag = true;
        loop {
            let weak = {
                let Some(entry) = self.cache.get_mut(texture_id) else {
                    break;
                };
                if entry.observers.is_empty() {
                    break;
                }
                entry.observers.remove(0)
            };
            // A dead Weak is an observer destroyed mid-flight; skip it.
            let Some(handle) = weak.upgrade() else {
                continue;
            };
            self.emit_to(texture_id, &handle, success);
        }
        self.queue_load_flag = false;
        self.process_load_queue();

        // Buffer-return entries are one-shot: gone once everyone was told.
        let retire = self
            .cache
            .get(texture_id)
            .is_some_and(|e| {
                e.storage_type == StorageType::ReturnPixelBuffer && e.observers.is_empty()
            });
        if retire {
            self.remove(texture_id, None);
        }
    }

    /// Replays requests that arrived while observers were being notified.
    fn process_load_queue(&mut self) {
        if self.load_queue.is_empty() {
            return;
        }
        let queue = std::mem::take(&mut self.load_queue);
        for element in queue {
            let Some((state, storage_type)) = self
                .cache
                .get(element.texture_id)
                .map(|e| (e.load_state, e.storage_type))
            else {
                continue;
            };
            let handle = element.observer.as_ref().and_then(|weak| weak.upgrade());
            match state {
                LoadState::Uploaded => {
                    if let Some(handle) = handle {
                        self.emit_late(element.texture_id, &handle);
                    }
                }
                LoadState::LoadFinished if storage_type == StorageType::ReturnPixelBuffer => {
                    if let Some(handle) = handle {
                        self.emit_late(element.texture_id, &handle);
                    }
                }
                LoadState::Loading | LoadState::WaitingForMask | LoadState::MaskApplying => {
                    self.observe(element.texture_id, handle.as_ref());
                }
                _ => self.load(element.texture_id, handle.as_ref()),
            }
        }
    }

    // ------------------------------------------------------------------
    // Synchronous path

    /// Blocking load on the calling thread. Reuses a settled cache entry
    /// when one exists; otherwise decodes, applies a cached (or now
    /// synchronously loaded) mask, premultiplies, and uploads before
    /// returning. A failure leaves the entry `LoadFailed`.
    fn load_synchronously(&mut self, texture_id: TextureId, premultiply: &mut MultiplyOnLoad) {
        let Some(entry) = self.cache.get(texture_id) else {
            return;
        };
        if matches!(
            entry.load_state,
            LoadState::Uploaded | LoadState::LoadFinished
        ) {
            *premultiply = if entry.pre_multiplied {
                MultiplyOnLoad::MultiplyOnLoad
            } else {
                MultiplyOnLoad::LoadWithoutMultiply
            };
            return;
        }
        let url = entry.url.clone();
        let desired_size = entry.desired_size;
        let fitting_mode = entry.fitting_mode;
        let sampling_mode = entry.sampling_mode;
        let orientation_correction = entry.orientation_correction;
        let mask_texture_id = entry.mask_texture_id;
        let content_scale = entry.content_scale;
        let crop_to_mask = entry.crop_to_mask;

        match self.loader.load(
            &url,
            desired_size,
            fitting_mode,
            sampling_mode,
            orientation_correction,
        ) {
            Ok(mut buffer) if !buffer.is_empty() => {
                if let Some(mask_id) = mask_texture_id {
                    let Some(mask) = self.sync_mask_buffer(mask_id) else {
                        warn!(%texture_id, mask_id = %mask_id, "mask unavailable, synchronous load failed");
                        if let Some(entry) = self.cache.get_mut(texture_id) {
                            entry.load_state = LoadState::LoadFailed;
                        }
                        return;
                    };
                    buffer = buffer.apply_mask(&mask, content_scale, crop_to_mask);
                }
                *premultiply = buffer.premultiply(*premultiply);
                self.finish_storage(texture_id, buffer);
            }
            other => {
                if let Err(err) = other {
                    warn!(%url, %err, "synchronous load failed");
                }
                if let Some(entry) = self.cache.get_mut(texture_id) {
                    entry.load_state = LoadState::LoadFailed;
                }
            }
        }
    }

    /// Mask pixels for the synchronous path: the cached buffer when present,
    /// otherwise a blocking decode stashed back into the mask's entry.
    fn sync_mask_buffer(&mut self, mask_id: TextureId) -> Option<PixelBuffer> {
        let entry = self.cache.get(mask_id)?;
        if let Some(buffer) = entry.pixel_buffer.clone() {
            return Some(buffer);
        }
        let url = entry.url.clone();
        let orientation_correction = entry.orientation_correction;
        match self.loader.load(
            &url,
            ImageDimensions::default(),
            FittingMode::default(),
            SamplingMode::NoFilter,
            orientation_correction,
        ) {
            Ok(buffer) if !buffer.is_empty() => {
                let entry = self.cache.get_mut(mask_id)?;
                entry.pixel_buffer = Some(buffer.clone());
                entry.load_state = LoadState::LoadFinished;
                Some(buffer)
            }
            _ => None,
        }
    }

    /// Number of live cache entries; useful for hosts auditing lifetime
    /// bookkeeping.
    pub fn cached_entry_count(&self) -> usize {
        self.cache.len()
    }

    /// Reference count of a cached entry, zero for unknown ids.
    pub fn reference_count(&self, texture_id: TextureId) -> u32 {
        self.cache
            .get(texture_id)
            .map(|e| e.reference_count)
            .unwrap_or(0)
    }
}
