use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Invalid URL: {0}")]
    Validation(String),

    #[error("Page did not settle within {0:?}")]
    NavigationTimeout(Duration),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Browser session could not be started: {0}")]
    ResourceExhaustion(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} already has a subscriber")]
    AlreadySubscribed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CaptureError {
    /// Stable tag carried by terminal error events.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Validation(_) => "validation_error",
            CaptureError::NavigationTimeout(_) => "navigation_timeout",
            CaptureError::NavigationFailed(_) => "navigation_failed",
            CaptureError::EncodingFailed(_) => "encoding_failed",
            CaptureError::ResourceExhaustion(_) => "resource_exhaustion",
            CaptureError::JobNotFound(_) => "job_not_found",
            CaptureError::AlreadySubscribed(_) => "already_subscribed",
            CaptureError::Configuration(_) => "configuration_error",
            CaptureError::Io(_) => "io_error",
            CaptureError::Serialization(_) => "serialization_error",
        }
    }

    /// Errors raised inside a running job, as opposed to ones rejected up front.
    pub fn is_capture_failure(&self) -> bool {
        matches!(
            self,
            CaptureError::NavigationTimeout(_)
                | CaptureError::NavigationFailed(_)
                | CaptureError::EncodingFailed(_)
                | CaptureError::ResourceExhaustion(_)
        )
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}
