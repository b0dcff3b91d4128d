//! Jobs and the progress events they emit

use crate::{ArtifactSummary, CaptureError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, process-unique job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, enough to tell concurrent jobs' files apart.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    CapturingDesktop,
    CapturingMobile,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Status carried on the wire by a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventStatus {
    Starting,
    CapturingDesktop,
    CapturingMobile,
    Completed,
    Error,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Error)
    }

    fn job_status(&self) -> JobStatus {
        match self {
            EventStatus::Starting => JobStatus::Pending,
            EventStatus::CapturingDesktop => JobStatus::CapturingDesktop,
            EventStatus::CapturingMobile => JobStatus::CapturingMobile,
            EventStatus::Completed => JobStatus::Completed,
            EventStatus::Error => JobStatus::Failed,
        }
    }
}

/// Aggregated outcome of a completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub url: String,
    pub desktop: ArtifactSummary,
    pub mobile: ArtifactSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&CaptureError> for ErrorInfo {
    fn from(err: &CaptureError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Immutable status update pushed to a job's subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: EventStatus,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CaptureResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ProgressEvent {
    fn step(status: EventStatus, progress: u8, message: &str) -> Self {
        Self {
            status,
            progress,
            message: message.to_string(),
            result: None,
            error: None,
        }
    }

    pub fn starting() -> Self {
        Self::step(EventStatus::Starting, 10, "Launching browser...")
    }

    pub fn capturing_desktop() -> Self {
        Self::step(EventStatus::CapturingDesktop, 30, "Capturing desktop view...")
    }

    pub fn capturing_mobile() -> Self {
        Self::step(EventStatus::CapturingMobile, 60, "Capturing mobile view...")
    }

    pub fn completed(result: CaptureResult) -> Self {
        Self {
            result: Some(result),
            ..Self::step(EventStatus::Completed, 100, "Done!")
        }
    }

    /// Terminal failure; progress resets to 0.
    pub fn failed(err: &CaptureError) -> Self {
        Self {
            status: EventStatus::Error,
            progress: 0,
            message: format!("An error occurred: {err}"),
            result: None,
            error: Some(ErrorInfo::from(err)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One end-to-end capture request
///
/// Mutated only by the controller running it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub result: Option<CaptureResult>,
    pub error: Option<ErrorInfo>,
}

impl Job {
    pub fn new(id: JobId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            created_at: Utc::now(),
            status: JobStatus::Pending,
            progress: 0,
            message: "Queued".to_string(),
            result: None,
            error: None,
        }
    }

    /// Fold an event into the job.
    ///
    /// Returns false, leaving the job untouched, for anything after a terminal
    /// event or for a non-terminal event that would move progress backwards.
    pub fn apply(&mut self, event: &ProgressEvent) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if !event.is_terminal() && event.progress < self.progress {
            return false;
        }

        self.status = event.status.job_status();
        self.progress = event.progress;
        self.message = event.message.clone();
        if event.is_terminal() {
            self.result = event.result.clone();
            self.error = event.error.clone();
        }
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id.clone(),
            url: self.url.clone(),
            created_at: self.created_at,
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
        }
    }
}

/// Read-only view of a job served to status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
}
