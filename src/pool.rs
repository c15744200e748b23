//! Round-robin pools of loader worker threads.
//!
//! Each pool owns up to `capacity` helpers; a helper is a detached worker
//! thread fed through an unbounded channel and is only spawned once a
//! request actually lands on it. Every helper keeps a FIFO of in-flight
//! loads so a completion can be matched back to the texture that requested
//! it even after cancellation churn.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error};

use crate::loader::{AnimatedImageLoading, ImageLoader};
use crate::pixel::PixelBuffer;
use crate::types::{FittingMode, ImageDimensions, MultiplyOnLoad, SamplingMode, TextureId};
use crate::url::VisualUrl;

/// Which pool a completion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolKind {
    Local,
    Remote,
}

impl PoolKind {
    fn label(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Work item sent to a helper thread.
pub(crate) enum LoadRequest {
    Load {
        load_id: u32,
        url: VisualUrl,
        desired_size: ImageDimensions,
        fitting_mode: FittingMode,
        sampling_mode: SamplingMode,
        orientation_correction: bool,
        premultiply: MultiplyOnLoad,
    },
    LoadFrame {
        load_id: u32,
        source: Arc<dyn AnimatedImageLoading>,
        frame_index: u32,
        premultiply: MultiplyOnLoad,
    },
    ApplyMask {
        load_id: u32,
        source: PixelBuffer,
        mask: PixelBuffer,
        content_scale: f32,
        crop_to_mask: bool,
        premultiply: MultiplyOnLoad,
    },
}

impl LoadRequest {
    fn load_id(&self) -> u32 {
        match self {
            Self::Load { load_id, .. }
            | Self::LoadFrame { load_id, .. }
            | Self::ApplyMask { load_id, .. } => *load_id,
        }
    }
}

/// Result handed back to the manager thread. `buffer` is `None` when the
/// load or mask application failed. `applied_mask` distinguishes mask
/// composite completions from plain decodes, since the entry's recorded
/// state may have been perturbed by cancel/re-request churn in between.
pub(crate) struct LoadCompletion {
    pub pool: PoolKind,
    pub helper: usize,
    pub load_id: u32,
    pub buffer: Option<PixelBuffer>,
    pub applied_mask: bool,
}

struct PendingLoad {
    load_id: u32,
    texture_id: TextureId,
}

struct AsyncLoadingHelper {
    tx: Sender<LoadRequest>,
    pending: VecDeque<PendingLoad>,
}

impl AsyncLoadingHelper {
    fn spawn(
        kind: PoolKind,
        index: usize,
        loader: Arc<dyn ImageLoader>,
        completion_tx: Sender<LoadCompletion>,
    ) -> Self {
        let (tx, rx) = unbounded::<LoadRequest>();
        let name = format!("{}-loader-{index}", kind.label());
        // Detached: the thread exits when the pool drops its sender.
        let _ = thread::Builder::new().name(name).spawn(move || {
            worker_loop(kind, index, loader, rx, completion_tx);
        });
        Self {
            tx,
            pending: VecDeque::new(),
        }
    }
}

fn worker_loop(
    kind: PoolKind,
    index: usize,
    loader: Arc<dyn ImageLoader>,
    rx: Receiver<LoadRequest>,
    completion_tx: Sender<LoadCompletion>,
) {
    for request in rx.iter() {
        let load_id = request.load_id();
        let applied_mask = matches!(request, LoadRequest::ApplyMask { .. });
        let buffer = run_request(request, loader.as_ref());
        if completion_tx
            .send(LoadCompletion {
                pool: kind,
                helper: index,
                load_id,
                buffer,
                applied_mask,
            })
            .is_err()
        {
            // Manager gone; nothing left to notify.
            return;
        }
    }
}

fn run_request(request: LoadRequest, loader: &dyn ImageLoader) -> Option<PixelBuffer> {
    match request {
        LoadRequest::Load {
            url,
            desired_size,
            fitting_mode,
            sampling_mode,
            orientation_correction,
            premultiply,
            ..
        } => {
            match loader.load(
                &url,
                desired_size,
                fitting_mode,
                sampling_mode,
                orientation_correction,
            ) {
                Ok(mut buffer) if !buffer.is_empty() => {
                    buffer.premultiply(premultiply);
                    Some(buffer)
                }
                Ok(_) => {
                    error!(%url, "decoded an empty image");
                    None
                }
                Err(err) => {
                    error!(%url, %err, "image load failed");
                    None
                }
            }
        }
        LoadRequest::LoadFrame {
            source,
            frame_index,
            premultiply,
            ..
        } => match source.load_frame(frame_index) {
            Ok(mut buffer) if !buffer.is_empty() => {
                buffer.premultiply(premultiply);
                Some(buffer)
            }
            Ok(_) => None,
            Err(err) => {
                error!(url = %source.url(), frame_index, %err, "frame load failed");
                None
            }
        },
        LoadRequest::ApplyMask {
            source,
            mask,
            content_scale,
            crop_to_mask,
            premultiply,
            ..
        } => {
            let mut masked = source.apply_mask(&mask, content_scale, crop_to_mask);
            masked.premultiply(premultiply);
            Some(masked)
        }
    }
}

/// A lazily populated set of helpers, filled round-robin up to `capacity`.
pub(crate) struct LoaderPool {
    kind: PoolKind,
    capacity: usize,
    helpers: Vec<AsyncLoadingHelper>,
    next: usize,
    loader: Arc<dyn ImageLoader>,
    completion_tx: Sender<LoadCompletion>,
    next_load_id: u32,
}

impl LoaderPool {
    pub fn new(
        kind: PoolKind,
        capacity: usize,
        loader: Arc<dyn ImageLoader>,
        completion_tx: Sender<LoadCompletion>,
    ) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            helpers: Vec::new(),
            next: 0,
            loader,
            completion_tx,
            next_load_id: 0,
        }
    }

    pub fn load(
        &mut self,
        texture_id: TextureId,
        url: VisualUrl,
        desired_size: ImageDimensions,
        fitting_mode: FittingMode,
        sampling_mode: SamplingMode,
        orientation_correction: bool,
        premultiply: MultiplyOnLoad,
    ) {
        let load_id = self.next_load_id();
        debug!(pool = self.kind.label(), %texture_id, load_id, %url, "dispatching load");
        self.dispatch(
            texture_id,
            LoadRequest::Load {
                load_id,
                url,
                desired_size,
                fitting_mode,
                sampling_mode,
                orientation_correction,
                premultiply,
            },
        );
    }

    pub fn load_frame(
        &mut self,
        texture_id: TextureId,
        source: Arc<dyn AnimatedImageLoading>,
        frame_index: u32,
        premultiply: MultiplyOnLoad,
    ) {
        let load_id = self.next_load_id();
        self.dispatch(
            texture_id,
            LoadRequest::LoadFrame {
                load_id,
                source,
                frame_index,
                premultiply,
            },
        );
    }

    pub fn apply_mask(
        &mut self,
        texture_id: TextureId,
        source: PixelBuffer,
        mask: PixelBuffer,
        content_scale: f32,
        crop_to_mask: bool,
        premultiply: MultiplyOnLoad,
    ) {
        let load_id = self.next_load_id();
        self.dispatch(
            texture_id,
            LoadRequest::ApplyMask {
                load_id,
                source,
                mask,
                content_scale,
                crop_to_mask,
                premultiply,
            },
        );
    }

    /// Matches a completion back to the texture it was loading. Helpers
    /// process strictly in order, so the completion always corresponds to
    /// the front of that helper's FIFO.
    pub fn complete(&mut self, helper: usize, load_id: u32) -> Option<TextureId> {
        let helper = self.helpers.get_mut(helper)?;
        match helper.pending.front() {
            Some(front) if front.load_id == load_id => {
                helper.pending.pop_front().map(|p| p.texture_id)
            }
            _ => None,
        }
    }

    fn next_load_id(&mut self) -> u32 {
        let id = self.next_load_id;
        self.next_load_id = self.next_load_id.wrapping_add(1);
        id
    }

    fn dispatch(&mut self, texture_id: TextureId, request: LoadRequest) {
        let load_id = request.load_id();
        let index = self.next;
        self.next = (self.next + 1) % self.capacity;
        while self.helpers.len() <= index {
            self.helpers.push(AsyncLoadingHelper::spawn(
                self.kind,
                self.helpers.len(),
                Arc::clone(&self.loader),
                self.completion_tx.clone(),
            ));
        }
        let helper = &mut self.helpers[index];
        helper.pending.push_back(PendingLoad {
            load_id,
            texture_id,
        });
        // Send can only fail if the worker died; the completion channel
        // going unanswered surfaces that as a stuck load rather than a
        // panic here.
        let _ = helper.tx.send(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use crate::pixel::PixelFormat;
    use std::time::Duration;

    struct SolidLoader;

    impl ImageLoader for SolidLoader {
        fn load(
            &self,
            url: &VisualUrl,
            _desired_size: ImageDimensions,
            _fitting_mode: FittingMode,
            _sampling_mode: SamplingMode,
            _orientation_correction: bool,
        ) -> Result<PixelBuffer, LoadError> {
            if url.url().ends_with("missing.png") {
                return Err(LoadError::UnsupportedUrl(url.url().to_owned()));
            }
            Ok(PixelBuffer::new(
                2,
                2,
                PixelFormat::Rgba8888,
                vec![128; 16],
            ))
        }
    }

    fn pool_with_rx(capacity: usize) -> (LoaderPool, Receiver<LoadCompletion>) {
        let (tx, rx) = unbounded();
        (
            LoaderPool::new(PoolKind::Local, capacity, Arc::new(SolidLoader), tx),
            rx,
        )
    }

    #[test]
    fn completes_a_load_with_premultiplied_buffer() {
        let (mut pool, rx) = pool_with_rx(2);
        pool.load(
            TextureId(1),
            VisualUrl::new("a.png"),
            ImageDimensions::default(),
            FittingMode::ScaleToFill,
            SamplingMode::Box,
            true,
            MultiplyOnLoad::MultiplyOnLoad,
        );
        let done = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.complete(done.helper, done.load_id), Some(TextureId(1)));
        let buffer = done.buffer.unwrap();
        assert!(buffer.pre_multiplied());
        assert_eq!(buffer.data()[0], 64);
    }

    #[test]
    fn failed_load_reports_none_buffer() {
        let (mut pool, rx) = pool_with_rx(1);
        pool.load(
            TextureId(2),
            VisualUrl::new("missing.png"),
            ImageDimensions::default(),
            FittingMode::ScaleToFill,
            SamplingMode::Box,
            true,
            MultiplyOnLoad::LoadWithoutMultiply,
        );
        let done = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(done.buffer.is_none());
        assert_eq!(pool.complete(done.helper, done.load_id), Some(TextureId(2)));
    }

    #[test]
    fn round_robin_spreads_loads_across_helpers() {
        let (mut pool, rx) = pool_with_rx(2);
        for i in 0..4 {
            pool.load(
                TextureId(i),
                VisualUrl::new("a.png"),
                ImageDimensions::default(),
                FittingMode::ScaleToFill,
                SamplingMode::Box,
                false,
                MultiplyOnLoad::LoadWithoutMultiply,
            );
        }
        let mut helpers_seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let done = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            helpers_seen.insert(done.helper);
            assert!(pool.complete(done.helper, done.load_id).is_some());
        }
        assert_eq!(helpers_seen.len(), 2);
    }

    #[test]
    fn apply_mask_runs_on_worker() {
        let (mut pool, rx) = pool_with_rx(1);
        let source = PixelBuffer::new(1, 1, PixelFormat::Rgba8888, vec![255, 255, 255, 255]);
        let mask = PixelBuffer::new(1, 1, PixelFormat::L8, vec![0]);
        pool.apply_mask(
            TextureId(9),
            source,
            mask,
            1.0,
            true,
            MultiplyOnLoad::LoadWithoutMultiply,
        );
        let done = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.complete(done.helper, done.load_id), Some(TextureId(9)));
        assert_eq!(done.buffer.unwrap().data()[3], 0);
    }
}
