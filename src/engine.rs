//! Rendering-engine seam
//!
//! A [`RenderEngine`] starts one [`RenderSession`] per job. The session opens an
//! isolated [`RenderedPage`] per viewport; the page has already navigated and
//! settled by the time it is handed back, and re-renders itself on demand.

use crate::{CaptureError, NetworkIdleSettings, RasterSource, ViewportProfile};
use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;
use url::Url;

#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Start a browsing-engine session owned by a single job.
    ///
    /// Fails with `ResourceExhaustion` when the engine cannot be started.
    async fn start_session(&self) -> Result<Box<dyn RenderSession>, CaptureError>;
}

/// A running engine instance; not safe for concurrent captures
#[async_trait]
pub trait RenderSession: Send {
    /// Open an isolated context with the profile applied, navigate to `url`,
    /// and wait for network quiescence.
    ///
    /// On error nothing opened by this call is left behind.
    async fn open_page(
        &mut self,
        url: &Url,
        profile: &ViewportProfile,
    ) -> Result<Box<dyn RenderedPage>, CaptureError>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait RenderedPage: RasterSource {
    fn raster(&mut self) -> &mut dyn RasterSource;

    /// Tear down the page and its browsing context.
    async fn close(self: Box<Self>);
}

/// A request lifecycle notification from the page's network domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Started(String),
    /// Finished or failed; either way the connection is no longer in flight.
    Finished(String),
}

/// Tracks in-flight requests to decide when a page has settled
///
/// The page counts as settled once no more than `max_inflight` requests have
/// been outstanding for a full `quiet_window`. The window only starts running
/// after [`begin`](Self::begin); requests observed earlier are still counted.
#[derive(Debug)]
pub struct NetworkIdle {
    inflight: HashSet<String>,
    // Finishes seen before their start, from streams merged out of order.
    orphaned: HashSet<String>,
    max_inflight: usize,
    quiet_window: Duration,
    armed: bool,
    quiet_since: Option<Instant>,
}

impl NetworkIdle {
    pub fn new(settings: &NetworkIdleSettings) -> Self {
        Self {
            inflight: HashSet::new(),
            orphaned: HashSet::new(),
            max_inflight: settings.max_inflight,
            quiet_window: settings.quiet_window,
            armed: false,
            quiet_since: None,
        }
    }

    /// Start measuring quiet time from `now`.
    pub fn begin(&mut self, now: Instant) {
        self.armed = true;
        self.refresh(now);
    }

    pub fn observe(&mut self, event: NetworkEvent, now: Instant) {
        match event {
            NetworkEvent::Started(id) => self.request_started(id, now),
            NetworkEvent::Finished(id) => self.request_finished(&id, now),
        }
    }

    pub fn request_started(&mut self, request_id: impl Into<String>, now: Instant) {
        let request_id = request_id.into();
        if !self.orphaned.remove(&request_id) {
            self.inflight.insert(request_id);
        }
        self.refresh(now);
    }

    pub fn request_finished(&mut self, request_id: &str, now: Instant) {
        if !self.inflight.remove(request_id) {
            self.orphaned.insert(request_id.to_string());
        }
        self.refresh(now);
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// When the page will count as settled if nothing else happens.
    pub fn settles_at(&self) -> Option<Instant> {
        self.quiet_since.map(|since| since + self.quiet_window)
    }

    pub fn is_settled(&self, now: Instant) -> bool {
        self.settles_at().is_some_and(|at| now >= at)
    }

    fn refresh(&mut self, now: Instant) {
        if self.inflight.len() > self.max_inflight {
            self.quiet_since = None;
        } else if self.armed && self.quiet_since.is_none() {
            self.quiet_since = Some(now);
        }
    }
}

/// Consume `events` until the network has been quiet for a full window.
///
/// Events already buffered when this is called (those raised while the
/// navigation itself was being awaited) are applied before the window starts.
/// Never returns while more than `max_inflight` requests stay open, so callers
/// bound it with a timeout.
pub async fn wait_for_network_idle<S>(events: S, settings: &NetworkIdleSettings) -> NetworkIdle
where
    S: Stream<Item = NetworkEvent> + Unpin,
{
    let mut events = events.fuse();
    let mut idle = NetworkIdle::new(settings);

    let mut replayed = 0usize;
    while let Some(Some(event)) = events.next().now_or_never() {
        idle.observe(event, Instant::now());
        replayed += 1;
    }
    idle.begin(Instant::now());
    debug!(
        "Replayed {} buffered network events, {} requests in flight",
        replayed,
        idle.inflight()
    );

    while !idle.is_settled(Instant::now()) {
        let wake = idle
            .settles_at()
            .unwrap_or_else(|| Instant::now() + settings.quiet_window);

        tokio::select! {
            Some(event) = events.next() => idle.observe(event, Instant::now()),
            _ = sleep_until(wake) => {}
        }
    }

    idle
}
