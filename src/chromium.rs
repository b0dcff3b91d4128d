//! Chrome-backed rendering engine
//!
//! One headless Chrome process is launched per job session. Every viewport
//! capture gets its own browser context, so cookies and cache never leak from
//! the desktop capture into the mobile one.

use crate::{
    create_browser_config, wait_for_network_idle, CaptureError, Config, NetworkEvent,
    NetworkIdleSettings, RasterFormat, RasterSource, RenderEngine, RenderSession, RenderedPage,
    ViewportProfile,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTouchEmulationEnabledParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, NavigateParams};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::{stream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

/// How long Chrome gets to honour a close request, and then to exit
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Launches a fresh headless Chrome for every session
pub struct ChromiumEngine {
    config: Config,
}

impl ChromiumEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    async fn start_session(&self) -> Result<Box<dyn RenderSession>, CaptureError> {
        let session_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());
        let scratch_dirs = vec![
            PathBuf::from(format!("/tmp/sitesnap-profile-{session_id}")),
            PathBuf::from(format!("/tmp/sitesnap-temp-{session_id}")),
        ];
        for dir in &scratch_dirs {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                CaptureError::ResourceExhaustion(format!(
                    "Failed to create {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let browser_config = create_browser_config(&self.config, &session_id)?;
        let (browser, mut handler) = match Browser::launch(browser_config).await {
            Ok(launched) => launched,
            Err(e) => {
                remove_dirs(&scratch_dirs).await;
                return Err(CaptureError::ResourceExhaustion(e.to_string()));
            }
        };

        // The handler drives the DevTools connection and must be polled for the
        // browser to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Handler error: {}", e);
                    break;
                }
            }
            debug!("Handler stream ended");
        });

        info!("Browser session {} started", session_id);

        Ok(Box::new(ChromiumSession {
            id: session_id,
            browser: Arc::new(Mutex::new(browser)),
            handler: handler_task,
            navigation_timeout: self.config.navigation_timeout,
            network_idle: self.config.network_idle.clone(),
            scratch_dirs,
        }))
    }
}

pub struct ChromiumSession {
    id: String,
    browser: Arc<Mutex<Browser>>,
    handler: tokio::task::JoinHandle<()>,
    navigation_timeout: Duration,
    network_idle: NetworkIdleSettings,
    scratch_dirs: Vec<PathBuf>,
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn open_page(
        &mut self,
        url: &Url,
        profile: &ViewportProfile,
    ) -> Result<Box<dyn RenderedPage>, CaptureError> {
        let (context_id, page) = {
            let browser = self.browser.lock().await;
            let context_id = browser
                .execute(CreateBrowserContextParams::default())
                .await
                .map_err(navigation_error)?
                .result
                .browser_context_id;

            let target = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(CaptureError::NavigationFailed)?;

            match browser.new_page(target).await {
                Ok(page) => (context_id, page),
                Err(e) => {
                    dispose_context(&browser, context_id).await;
                    return Err(navigation_error(e));
                }
            }
        };

        let page = ChromiumPage {
            page,
            context_id,
            browser: self.browser.clone(),
        };

        let prepared = timeout(
            self.navigation_timeout,
            page.load(url, profile, &self.network_idle),
        )
        .await;

        match prepared {
            Ok(Ok(())) => Ok(Box::new(page)),
            Ok(Err(e)) => {
                page.teardown().await;
                Err(e)
            }
            Err(_) => {
                page.teardown().await;
                Err(CaptureError::NavigationTimeout(self.navigation_timeout))
            }
        }
    }

    async fn close(self: Box<Self>) {
        {
            let mut browser = self.browser.lock().await;
            shut_down(&mut *browser, &self.id, EXIT_GRACE).await;
        }
        self.handler.abort();
        remove_dirs(&self.scratch_dirs).await;
        info!("Browser session {} closed", self.id);
    }
}

pub struct ChromiumPage {
    page: Page,
    context_id: BrowserContextId,
    browser: Arc<Mutex<Browser>>,
}

impl ChromiumPage {
    async fn load(
        &self,
        url: &Url,
        profile: &ViewportProfile,
        settings: &NetworkIdleSettings,
    ) -> Result<(), CaptureError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(profile.width)
            .height(profile.height)
            .device_scale_factor(profile.device_scale_factor)
            .mobile(profile.mobile)
            .build()
            .map_err(CaptureError::NavigationFailed)?;
        self.page.execute(metrics).await.map_err(navigation_error)?;

        if profile.mobile {
            self.page
                .execute(SetTouchEmulationEnabledParams::new(true))
                .await
                .map_err(navigation_error)?;
        }

        if let Some(user_agent) = profile.user_agent {
            self.page
                .execute(SetUserAgentOverrideParams::new(user_agent))
                .await
                .map_err(navigation_error)?;
        }

        self.page
            .execute(EnableParams::default())
            .await
            .map_err(navigation_error)?;
        let started = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(navigation_error)?;
        let finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(navigation_error)?;
        let failed = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(navigation_error)?;

        debug!("Navigating to {} as {}", url, profile.device);
        let navigation = self
            .page
            .execute(NavigateParams::new(url.as_str()))
            .await
            .map_err(navigation_error)?;
        if let Some(error_text) = &navigation.result.error_text {
            return Err(CaptureError::NavigationFailed(format!("{url}: {error_text}")));
        }

        self.page
            .wait_for_navigation()
            .await
            .map_err(navigation_error)?;

        let requests = stream::select(
            started.map(|e| NetworkEvent::Started(e.request_id.inner().clone())),
            stream::select(
                finished.map(|e| NetworkEvent::Finished(e.request_id.inner().clone())),
                failed.map(|e| NetworkEvent::Finished(e.request_id.inner().clone())),
            ),
        );
        let idle = wait_for_network_idle(requests, settings).await;

        debug!("{} settled with {} requests in flight", url, idle.inflight());
        Ok(())
    }

    async fn teardown(self) {
        if let Err(e) = self.page.close().await {
            warn!("Failed to close page: {}", e);
        }
        let browser = self.browser.lock().await;
        dispose_context(&browser, self.context_id).await;
    }
}

#[async_trait]
impl RasterSource for ChromiumPage {
    async fn render(&mut self, format: RasterFormat) -> Result<Vec<u8>, CaptureError> {
        let params = match format {
            RasterFormat::Png => ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Png)
                .full_page(true)
                .build(),
            RasterFormat::Jpeg { quality } => ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Jpeg)
                .quality(quality as i64)
                .full_page(true)
                .build(),
        };

        self.page
            .screenshot(params)
            .await
            .map_err(|e| CaptureError::EncodingFailed(e.to_string()))
    }
}

#[async_trait]
impl RenderedPage for ChromiumPage {
    fn raster(&mut self) -> &mut dyn RasterSource {
        self
    }

    async fn close(self: Box<Self>) {
        (*self).teardown().await;
    }
}

/// The process-control surface of a launched browser
#[async_trait]
trait ChildBrowser: Send {
    async fn request_close(&mut self) -> Result<(), String>;
    async fn force_kill(&mut self);
    async fn wait_exit(&mut self) -> Result<(), String>;
}

#[async_trait]
impl ChildBrowser for Browser {
    async fn request_close(&mut self) -> Result<(), String> {
        self.close().await.map(|_| ()).map_err(|e| e.to_string())
    }

    async fn force_kill(&mut self) {
        if let Some(Err(e)) = self.kill().await {
            warn!("Failed to kill Chrome: {}", e);
        }
    }

    async fn wait_exit(&mut self) -> Result<(), String> {
        self.wait().await.map(|_| ()).map_err(|e| e.to_string())
    }
}

/// Ask the browser to exit, killing it when it refuses or lingers.
///
/// Returns within roughly two `grace` periods whatever state Chrome is in.
async fn shut_down(browser: &mut dyn ChildBrowser, session: &str, grace: Duration) {
    match timeout(grace, browser.request_close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("Failed to close browser session {}: {}, killing", session, e);
            browser.force_kill().await;
        }
        Err(_) => {
            warn!("Browser session {} ignored close, killing", session);
            browser.force_kill().await;
        }
    }

    match timeout(grace, browser.wait_exit()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Waiting on browser session {} failed: {}", session, e),
        Err(_) => {
            warn!("Browser session {} did not exit within {:?}, killing", session, grace);
            browser.force_kill().await;
        }
    }
}

fn navigation_error(err: CdpError) -> CaptureError {
    CaptureError::NavigationFailed(err.to_string())
}

async fn dispose_context(browser: &Browser, context_id: BrowserContextId) {
    if let Err(e) = browser
        .execute(DisposeBrowserContextParams::new(context_id))
        .await
    {
        warn!("Failed to dispose browser context: {}", e);
    }
}

async fn remove_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            debug!("Could not remove {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A child that only exits once killed, unless it accepts the close
    #[derive(Default)]
    struct StubbornChild {
        close_fails: bool,
        ignores_close: bool,
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChildBrowser for StubbornChild {
        async fn request_close(&mut self) -> Result<(), String> {
            if self.close_fails {
                return Err("handler gone".to_string());
            }
            if self.ignores_close {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn force_kill(&mut self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }

        async fn wait_exit(&mut self) -> Result<(), String> {
            if self.kills.load(Ordering::SeqCst) == 0 && (self.close_fails || self.ignores_close) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    const GRACE: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_failed_close_kills_browser() {
        let kills = Arc::new(AtomicUsize::new(0));
        let mut child = StubbornChild {
            close_fails: true,
            kills: kills.clone(),
            ..Default::default()
        };

        timeout(Duration::from_secs(1), shut_down(&mut child, "s1", GRACE))
            .await
            .unwrap();

        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unresponsive_browser_is_killed() {
        let kills = Arc::new(AtomicUsize::new(0));
        let mut child = StubbornChild {
            ignores_close: true,
            kills: kills.clone(),
            ..Default::default()
        };

        timeout(Duration::from_secs(1), shut_down(&mut child, "s2", GRACE))
            .await
            .unwrap();

        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clean_close_does_not_kill() {
        let kills = Arc::new(AtomicUsize::new(0));
        let mut child = StubbornChild {
            kills: kills.clone(),
            ..Default::default()
        };

        shut_down(&mut child, "s3", GRACE).await;

        assert_eq!(kills.load(Ordering::SeqCst), 0);
    }
}
