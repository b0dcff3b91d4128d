//! Test doubles shared by the unit and scenario tests

use crate::{
    CaptureError, Device, ProgressEvent, ProgressSink, RasterFormat, RasterSource, RenderEngine,
    RenderSession, RenderedPage, ViewportProfile,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use url::Url;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];

/// `len` bytes that sniff as PNG.
pub fn fake_png(len: usize) -> Vec<u8> {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.resize(len.max(PNG_MAGIC.len()), 0);
    bytes
}

/// `len` bytes that sniff as JPEG.
pub fn fake_jpeg(len: usize) -> Vec<u8> {
    let mut bytes = JPEG_MAGIC.to_vec();
    bytes.resize(len.max(JPEG_MAGIC.len()), 0);
    bytes
}

type JpegSize = Arc<dyn Fn(u8) -> usize + Send + Sync>;

#[derive(Default)]
struct Counters {
    open_sessions: AtomicUsize,
    open_pages: AtomicUsize,
    sessions_started: AtomicUsize,
}

#[derive(Clone)]
struct Failure {
    url: Option<String>,
    device: Option<Device>,
    err: CaptureError,
}

impl Failure {
    fn matches(&self, url: &Url, device: Device) -> bool {
        self.url.as_deref().map_or(true, |u| url.as_str().contains(u))
            && self.device.map_or(true, |d| d == device)
    }
}

/// Engine that "renders" byte buffers of configurable size
///
/// Clones share their counters, so a test can keep one handle while the code
/// under test owns another.
#[derive(Clone)]
pub struct FakeEngine {
    png_size: usize,
    jpeg_size: JpegSize,
    failures: Vec<Failure>,
    fail_launch: bool,
    gate: Option<Arc<Semaphore>>,
    counters: Arc<Counters>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            png_size: 1024,
            jpeg_size: Arc::new(|_| 512),
            failures: Vec::new(),
            fail_launch: false,
            gate: None,
            counters: Arc::default(),
        }
    }

    pub fn with_png_size(mut self, size: usize) -> Self {
        self.png_size = size;
        self
    }

    pub fn with_jpeg_size(self, size: usize) -> Self {
        self.with_jpeg_sizes(move |_| size)
    }

    pub fn with_jpeg_sizes(mut self, size: impl Fn(u8) -> usize + Send + Sync + 'static) -> Self {
        self.jpeg_size = Arc::new(size);
        self
    }

    /// Make navigation for `device` fail with `err`.
    pub fn failing_on(mut self, device: Device, err: CaptureError) -> Self {
        self.failures.push(Failure {
            url: None,
            device: Some(device),
            err,
        });
        self
    }

    /// Make navigation to any URL containing `url` fail with `err`.
    pub fn failing_for(mut self, url: &str, err: CaptureError) -> Self {
        self.failures.push(Failure {
            url: Some(url.to_string()),
            device: None,
            err,
        });
        self
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    /// Every page load waits for one permit from `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn open_sessions(&self) -> usize {
        self.counters.open_sessions.load(Ordering::SeqCst)
    }

    pub fn open_pages(&self) -> usize {
        self.counters.open_pages.load(Ordering::SeqCst)
    }

    pub fn sessions_started(&self) -> usize {
        self.counters.sessions_started.load(Ordering::SeqCst)
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RenderEngine for FakeEngine {
    async fn start_session(&self) -> Result<Box<dyn RenderSession>, CaptureError> {
        if self.fail_launch {
            return Err(CaptureError::ResourceExhaustion(
                "chrome exited during startup".to_string(),
            ));
        }
        self.counters.sessions_started.fetch_add(1, Ordering::SeqCst);
        self.counters.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            engine: self.clone(),
        }))
    }
}

struct FakeSession {
    engine: FakeEngine,
}

#[async_trait]
impl RenderSession for FakeSession {
    async fn open_page(
        &mut self,
        url: &Url,
        profile: &ViewportProfile,
    ) -> Result<Box<dyn RenderedPage>, CaptureError> {
        if let Some(gate) = &self.engine.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if let Some(failure) = self
            .engine
            .failures
            .iter()
            .find(|f| f.matches(url, profile.device))
        {
            return Err(failure.err.clone());
        }

        self.engine.counters.open_pages.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            png_size: self.engine.png_size,
            jpeg_size: self.engine.jpeg_size.clone(),
            counters: self.engine.counters.clone(),
        }))
    }

    async fn close(self: Box<Self>) {
        self.engine
            .counters
            .open_sessions
            .fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakePage {
    png_size: usize,
    jpeg_size: JpegSize,
    counters: Arc<Counters>,
}

#[async_trait]
impl RasterSource for FakePage {
    async fn render(&mut self, format: RasterFormat) -> Result<Vec<u8>, CaptureError> {
        Ok(match format {
            RasterFormat::Png => fake_png(self.png_size),
            RasterFormat::Jpeg { quality } => fake_jpeg((self.jpeg_size)(quality)),
        })
    }
}

#[async_trait]
impl RenderedPage for FakePage {
    fn raster(&mut self) -> &mut dyn RasterSource {
        self
    }

    async fn close(self: Box<Self>) {
        self.counters.open_pages.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sink that keeps every event it is given
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn emit(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
