//! Per-job capture pipeline
//!
//! A controller drives one job from start to its terminal event: one engine
//! session, desktop then mobile, each viewport encoded under the byte budget
//! and persisted before the next begins.

use crate::{
    capture_viewport, validate_url, Artifact, ArtifactStore, CaptureError, CaptureResult, Config,
    Device, Job, Metrics, ProgressEvent, RenderEngine, RenderSession, SizeConstrainedEncoder,
    ViewportProfile,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use url::Url;

/// Receives a job's progress events in order
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, event: ProgressEvent);
}

pub struct CaptureController {
    engine: Arc<dyn RenderEngine>,
    encoder: SizeConstrainedEncoder,
    store: ArtifactStore,
    cleanup_on_failure: bool,
    metrics: Metrics,
}

impl CaptureController {
    pub fn new(
        engine: Arc<dyn RenderEngine>,
        config: &Config,
        store: ArtifactStore,
        metrics: Metrics,
    ) -> Self {
        Self {
            engine,
            encoder: SizeConstrainedEncoder::new(config.encoder.clone()),
            store,
            cleanup_on_failure: config.cleanup_on_failure,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run `job` to completion, emitting every progress event to `sink`.
    ///
    /// Exactly one terminal event is emitted, and it is always the last one.
    /// The engine session is closed before it goes out.
    pub async fn run(
        &self,
        job: &Job,
        sink: &dyn ProgressSink,
    ) -> Result<CaptureResult, CaptureError> {
        let started = Instant::now();
        info!("Job {} started for {}", job.id, job.url);

        let mut persisted = Vec::new();
        let outcome = match validate_url(&job.url) {
            Ok(url) => {
                sink.emit(ProgressEvent::starting()).await;
                self.capture_all(job, &url, sink, &mut persisted).await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(result) => {
                self.metrics.record_finished(started.elapsed(), true);
                info!(
                    "Job {} completed in {:?}: desktop {} bytes, mobile {} bytes",
                    job.id,
                    started.elapsed(),
                    result.desktop.size,
                    result.mobile.size
                );
                sink.emit(ProgressEvent::completed(result.clone())).await;
                Ok(result)
            }
            Err(err) => {
                if self.cleanup_on_failure {
                    self.discard(&persisted).await;
                }
                self.metrics.record_finished(started.elapsed(), false);
                if err.is_capture_failure() {
                    error!("Job {} failed: {}", job.id, err);
                } else {
                    warn!("Job {} rejected: {}", job.id, err);
                }
                sink.emit(ProgressEvent::failed(&err)).await;
                Err(err)
            }
        }
    }

    async fn capture_all(
        &self,
        job: &Job,
        url: &Url,
        sink: &dyn ProgressSink,
        persisted: &mut Vec<Artifact>,
    ) -> Result<CaptureResult, CaptureError> {
        let mut session = self.engine.start_session().await?;
        let captured = self
            .capture_viewports(session.as_mut(), job, url, sink, persisted)
            .await;
        session.close().await;
        captured?;

        match persisted.as_slice() {
            [desktop, mobile] => Ok(CaptureResult {
                url: job.url.clone(),
                desktop: desktop.summary(),
                mobile: mobile.summary(),
            }),
            other => Err(CaptureError::EncodingFailed(format!(
                "expected 2 artifacts, have {}",
                other.len()
            ))),
        }
    }

    async fn capture_viewports(
        &self,
        session: &mut dyn RenderSession,
        job: &Job,
        url: &Url,
        sink: &dyn ProgressSink,
        persisted: &mut Vec<Artifact>,
    ) -> Result<(), CaptureError> {
        for profile in ViewportProfile::ALL.iter() {
            let event = match profile.device {
                Device::Desktop => ProgressEvent::capturing_desktop(),
                Device::Mobile => ProgressEvent::capturing_mobile(),
            };
            sink.emit(event).await;

            let encoded = capture_viewport(session, url, profile, &self.encoder).await?;
            self.metrics
                .record_encoding(encoded.attempts, encoded.format.is_lossless());

            let base_name = self.store.base_name(&job.id, job.created_at, profile.device);
            let artifact = self.store.persist(&base_name, profile, &encoded).await?;
            info!(
                "Saved {} artifact {} ({} bytes)",
                profile.device, artifact.filename, artifact.size_bytes
            );
            persisted.push(artifact);
        }
        Ok(())
    }

    async fn discard(&self, artifacts: &[Artifact]) {
        for artifact in artifacts {
            if let Err(e) = self.store.remove(artifact).await {
                warn!("Failed to remove {}: {}", artifact.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, RecordingSink};
    use crate::{ArtifactFormat, ArtifactNaming, EventStatus, JobId};

    fn controller(engine: &FakeEngine, dir: &std::path::Path, config: Config) -> CaptureController {
        CaptureController::new(
            Arc::new(engine.clone()),
            &config,
            ArtifactStore::new(dir, "/screenshots", ArtifactNaming::Timestamped),
            Metrics::new(),
        )
    }

    #[tokio::test]
    async fn test_successful_job_emits_full_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let controller = controller(&engine, dir.path(), Config::default());
        let sink = RecordingSink::default();
        let job = Job::new(JobId::new(), "https://example.com");

        let result = controller.run(&job, &sink).await.unwrap();

        let statuses: Vec<_> = sink.events().iter().map(|e| (e.status, e.progress)).collect();
        assert_eq!(
            statuses,
            vec![
                (EventStatus::Starting, 10),
                (EventStatus::CapturingDesktop, 30),
                (EventStatus::CapturingMobile, 60),
                (EventStatus::Completed, 100),
            ]
        );
        assert_eq!(result.url, "https://example.com");
        assert_eq!(result.desktop.format, ArtifactFormat::Png);
        assert!(result.desktop.filename.ends_with("_desktop.png"));
        assert!(result.mobile.filename.ends_with("_mobile.png"));
        assert_eq!(result.desktop.resolution, "3840 x 2160");
        assert_eq!(result.mobile.resolution, "1290 x 2796");
        assert_eq!(engine.open_sessions(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_mobile_failure_removes_desktop_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new().failing_on(
            Device::Mobile,
            CaptureError::NavigationTimeout(std::time::Duration::from_secs(30)),
        );
        let controller = controller(&engine, dir.path(), Config::default());
        let sink = RecordingSink::default();
        let job = Job::new(JobId::new(), "https://example.com");

        let err = controller.run(&job, &sink).await.unwrap_err();

        assert_eq!(err.kind(), "navigation_timeout");
        let events = sink.events();
        let last = events.last().unwrap();
        assert_eq!(last.status, EventStatus::Error);
        assert_eq!(last.progress, 0);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(engine.open_sessions(), 0);
        assert_eq!(engine.open_pages(), 0);
    }

    #[tokio::test]
    async fn test_failed_artifacts_kept_without_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new().failing_on(
            Device::Mobile,
            CaptureError::NavigationFailed("net::ERR_CONNECTION_RESET".to_string()),
        );
        let config = Config {
            cleanup_on_failure: false,
            ..Default::default()
        };
        let controller = controller(&engine, dir.path(), config);
        let job = Job::new(JobId::new(), "https://example.com");

        controller
            .run(&job, &RecordingSink::default())
            .await
            .unwrap_err();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new().failing_launch();
        let controller = controller(&engine, dir.path(), Config::default());
        let sink = RecordingSink::default();
        let job = Job::new(JobId::new(), "https://example.com");

        let err = controller.run(&job, &sink).await.unwrap_err();

        assert_eq!(err.kind(), "resource_exhaustion");
        let statuses: Vec<_> = sink.events().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![EventStatus::Starting, EventStatus::Error]);
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_starting() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let controller = controller(&engine, dir.path(), Config::default());
        let sink = RecordingSink::default();
        let job = Job::new(JobId::new(), "javascript:alert(1)");

        let err = controller.run(&job, &sink).await.unwrap_err();

        assert!(matches!(err, CaptureError::Validation(_)));
        let statuses: Vec<_> = sink.events().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![EventStatus::Error]);
        assert_eq!(engine.sessions_started(), 0);
    }

    #[tokio::test]
    async fn test_oversized_render_falls_back_to_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new()
            .with_png_size(8_000)
            .with_jpeg_sizes(|quality| if quality >= 80 { 6_000 } else { 3_000 });
        let mut config = Config::default();
        config.encoder.max_artifact_size = 5_000;
        let controller = controller(&engine, dir.path(), config);
        let job = Job::new(JobId::new(), "https://example.com");

        let result = controller
            .run(&job, &RecordingSink::default())
            .await
            .unwrap();

        assert_eq!(result.desktop.format, ArtifactFormat::Jpeg);
        assert_eq!(result.desktop.quality, Some(70));
        assert_eq!(result.desktop.size, 3_000);
        assert!(result.desktop.filename.ends_with(".jpg"));
        assert!(result.desktop.within_budget);
    }
}
