//! Job registry and per-job progress channels
//!
//! Every submitted job owns a bounded channel with a single consumer. Events
//! produced while nobody is subscribed update the job's snapshot but are not
//! queued; a job that reaches its terminal event without ever being observed
//! is retired on the spot. An observed job is retired once its subscriber has
//! seen the terminal event, or as soon as the subscriber goes away.

use crate::{
    validate_url, CaptureController, CaptureError, Job, JobId, JobSnapshot, ProgressEvent,
    ProgressSink,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct JobEntry {
    job: Job,
    sender: mpsc::Sender<ProgressEvent>,
    receiver: Option<mpsc::Receiver<ProgressEvent>>,
    subscribed: bool,
}

struct RegistryInner {
    jobs: DashMap<JobId, JobEntry>,
    controller: CaptureController,
    progress_buffer: usize,
}

/// Shared handle to the set of live jobs
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    pub fn new(controller: CaptureController, progress_buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                jobs: DashMap::new(),
                controller,
                progress_buffer: progress_buffer.max(1),
            }),
        }
    }

    /// Register a job for `url` and start running it in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, url: &str) -> Result<JobId, CaptureError> {
        let (id, _) = self.start(url, false)?;
        Ok(id)
    }

    /// Like [`submit`](Self::submit), with the subscriber attached before the
    /// job starts, so not a single event is missed.
    pub fn submit_and_subscribe(&self, url: &str) -> Result<ProgressStream, CaptureError> {
        let (id, receiver) = self.start(url, true)?;
        let receiver =
            receiver.ok_or_else(|| CaptureError::AlreadySubscribed(id.to_string()))?;
        Ok(self.stream(id, receiver))
    }

    fn start(
        &self,
        url: &str,
        subscribed: bool,
    ) -> Result<(JobId, Option<mpsc::Receiver<ProgressEvent>>), CaptureError> {
        validate_url(url)?;

        let id = loop {
            let candidate = JobId::new();
            if !self.inner.jobs.contains_key(&candidate) {
                break candidate;
            }
        };

        let job = Job::new(id.clone(), url);
        let (sender, receiver) = mpsc::channel(self.inner.progress_buffer);
        let (kept, handed_out) = if subscribed {
            (None, Some(receiver))
        } else {
            (Some(receiver), None)
        };
        self.inner.jobs.insert(
            id.clone(),
            JobEntry {
                job: job.clone(),
                sender,
                receiver: kept,
                subscribed,
            },
        );
        self.inner.controller.metrics().record_submitted();
        info!("Job {} submitted for {}", id, url);

        let reporter = ProgressReporter {
            registry: self.clone(),
            job_id: id.clone(),
        };
        tokio::spawn(async move {
            let _ = reporter
                .registry
                .inner
                .controller
                .run(&job, &reporter)
                .await;
        });

        Ok((id, handed_out))
    }

    /// Attach the one and only consumer of a job's progress events.
    pub fn subscribe(&self, id: &JobId) -> Result<ProgressStream, CaptureError> {
        let mut entry = self
            .inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| CaptureError::JobNotFound(id.to_string()))?;

        // Finished but not yet retired: its terminal event has already gone.
        if entry.job.status.is_terminal() {
            return Err(CaptureError::JobNotFound(id.to_string()));
        }
        if entry.subscribed {
            return Err(CaptureError::AlreadySubscribed(id.to_string()));
        }
        let receiver = entry
            .receiver
            .take()
            .ok_or_else(|| CaptureError::AlreadySubscribed(id.to_string()))?;
        entry.subscribed = true;
        drop(entry);
        debug!("Subscriber attached to job {}", id);

        Ok(self.stream(id.clone(), receiver))
    }

    fn stream(&self, job_id: JobId, receiver: mpsc::Receiver<ProgressEvent>) -> ProgressStream {
        ProgressStream {
            receiver,
            registry: self.clone(),
            job_id,
            done: false,
        }
    }

    pub fn snapshot(&self, id: &JobId) -> Result<JobSnapshot, CaptureError> {
        self.inner
            .jobs
            .get(id)
            .map(|entry| entry.job.snapshot())
            .ok_or_else(|| CaptureError::JobNotFound(id.to_string()))
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.jobs.len()
    }

    fn retire(&self, id: &JobId) {
        if self.inner.jobs.remove(id).is_some() {
            debug!("Job {} retired", id);
        }
    }
}

/// The controller's view of its own job entry
pub struct ProgressReporter {
    registry: JobRegistry,
    job_id: JobId,
}

#[async_trait]
impl ProgressSink for ProgressReporter {
    async fn emit(&self, event: ProgressEvent) {
        let sender = {
            let Some(mut entry) = self.registry.inner.jobs.get_mut(&self.job_id) else {
                debug!("Job {} already retired, dropping {:?}", self.job_id, event.status);
                return;
            };

            if !entry.job.apply(&event) {
                warn!(
                    "Job {} rejected out-of-order event {:?}",
                    self.job_id, event.status
                );
                return;
            }

            if !entry.subscribed {
                drop(entry);
                if event.is_terminal() {
                    self.registry.retire(&self.job_id);
                }
                return;
            }

            entry.sender.clone()
        };

        // The map guard is released before a full channel can park this task.
        if sender.send(event).await.is_err() {
            debug!("Subscriber of job {} went away", self.job_id);
        }
    }
}

/// A job's progress events, ending after the terminal one
pub struct ProgressStream {
    receiver: mpsc::Receiver<ProgressEvent>,
    registry: JobRegistry,
    job_id: JobId,
    done: bool,
}

impl ProgressStream {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.done = true;
                    self.registry.retire(&self.job_id);
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ProgressStream {
    fn drop(&mut self) {
        if !self.done {
            self.registry.retire(&self.job_id);
        }
    }
}
