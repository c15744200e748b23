//! Shared stubs for the integration suites: an in-memory image loader, a
//! recording GPU factory and a recording observer.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use visual_textures::{
    AnimatedImageLoading, FittingMode, GpuFactory, ImageDimensions, ImageLoader, LoadError,
    PixelBuffer, PixelBufferLoaded, PixelFormat, SamplingMode, Texture, TextureManager,
    TextureManagerConfig, TextureUploadObserver, TextureUploaded, VisualUrl,
};

struct StubImage {
    buffer: PixelBuffer,
    delay: Duration,
}

/// Serves canned pixel buffers by URL; unknown URLs fail the load. A per-URL
/// delay makes completion ordering deterministic for in-flight scenarios.
#[derive(Default)]
pub struct StubLoader {
    entries: Mutex<HashMap<String, StubImage>>,
}

impl StubLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, url: &str, buffer: PixelBuffer) {
        self.insert_delayed(url, buffer, Duration::ZERO);
    }

    pub fn insert_delayed(&self, url: &str, buffer: PixelBuffer, delay: Duration) {
        self.entries
            .lock()
            .unwrap()
            .insert(url.to_owned(), StubImage { buffer, delay });
    }
}

impl ImageLoader for StubLoader {
    fn load(
        &self,
        url: &VisualUrl,
        _desired_size: ImageDimensions,
        _fitting_mode: FittingMode,
        _sampling_mode: SamplingMode,
        _orientation_correction: bool,
    ) -> Result<PixelBuffer, LoadError> {
        let (buffer, delay) = {
            let entries = self.entries.lock().unwrap();
            match entries.get(url.url()) {
                Some(image) => (image.buffer.clone(), image.delay),
                None => return Err(LoadError::UnsupportedUrl(url.url().to_owned())),
            }
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(buffer)
    }
}

/// Canned multi-frame source.
pub struct StubAnimated {
    url: VisualUrl,
    frames: Vec<PixelBuffer>,
}

impl StubAnimated {
    pub fn new(url: &str, frames: Vec<PixelBuffer>) -> Arc<Self> {
        Arc::new(Self {
            url: VisualUrl::new(url),
            frames,
        })
    }
}

impl AnimatedImageLoading for StubAnimated {
    fn url(&self) -> &VisualUrl {
        &self.url
    }

    fn frame_count(&self) -> u32 {
        self.frames.len() as u32
    }

    fn load_frame(&self, frame_index: u32) -> Result<PixelBuffer, LoadError> {
        self.frames
            .get(frame_index as usize)
            .cloned()
            .ok_or(LoadError::MissingFrame { index: frame_index })
    }
}

/// Records every upload and hands out sequential texture ids.
#[derive(Default)]
pub struct RecordingGpu {
    next_id: AtomicU64,
    uploads: Mutex<Vec<PixelBuffer>>,
}

impl RecordingGpu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn last_upload(&self) -> Option<PixelBuffer> {
        self.uploads.lock().unwrap().last().cloned()
    }
}

impl GpuFactory for RecordingGpu {
    fn create_texture(&self, buffer: &PixelBuffer) -> Texture {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.uploads.lock().unwrap().push(buffer.clone());
        Texture {
            id,
            width: buffer.width(),
            height: buffer.height(),
        }
    }
}

/// Collects every notification it receives.
#[derive(Default)]
pub struct RecordingObserver {
    pub uploads: Vec<TextureUploaded>,
    pub buffers: Vec<PixelBufferLoaded>,
}

impl RecordingObserver {
    pub fn new_handle() -> Rc<RefCell<RecordingObserver>> {
        Rc::new(RefCell::new(Self::default()))
    }
}

impl TextureUploadObserver for RecordingObserver {
    fn upload_complete(&mut self, _manager: &mut TextureManager, event: &TextureUploaded) {
        self.uploads.push(event.clone());
    }

    fn load_complete(&mut self, _manager: &mut TextureManager, event: &PixelBufferLoaded) {
        self.buffers.push(event.clone());
    }
}

pub fn manager(loader: &Arc<StubLoader>, gpu: &Arc<RecordingGpu>) -> TextureManager {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    TextureManager::new(TextureManagerConfig::default(), loader.clone(), gpu.clone())
}

pub fn rgba(width: u32, height: u32, px: [u8; 4]) -> PixelBuffer {
    let data = px
        .iter()
        .copied()
        .cycle()
        .take(width as usize * height as usize * 4)
        .collect();
    PixelBuffer::new(width, height, PixelFormat::Rgba8888, data)
}

pub fn rgb(width: u32, height: u32, px: [u8; 3]) -> PixelBuffer {
    let data = px
        .iter()
        .copied()
        .cycle()
        .take(width as usize * height as usize * 3)
        .collect();
    PixelBuffer::new(width, height, PixelFormat::Rgb888, data)
}

/// Pumps the manager until `expected` worker completions have been handled.
pub fn pump(manager: &mut TextureManager, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut processed = 0;
    while processed < expected && Instant::now() < deadline {
        processed += manager.wait_and_update(Duration::from_millis(100));
    }
    assert!(
        processed >= expected,
        "timed out waiting for {expected} completions, saw {processed}"
    );
}
