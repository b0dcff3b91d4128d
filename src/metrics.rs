use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::time::Duration;

/// Handles to the service's Prometheus series
///
/// Without an installed recorder every handle is a no-op, which is what the
/// standalone CLI and the tests run with.
#[derive(Clone)]
pub struct Metrics {
    pub jobs_submitted: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub active_jobs: Gauge,
    pub capture_duration: Histogram,
    pub lossy_fallbacks: Counter,
    pub encode_attempts: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_submitted: register_counter!("sitesnap_jobs_submitted_total"),
            jobs_completed: register_counter!("sitesnap_jobs_completed_total"),
            jobs_failed: register_counter!("sitesnap_jobs_failed_total"),
            active_jobs: register_gauge!("sitesnap_active_jobs"),
            capture_duration: register_histogram!("sitesnap_capture_duration_seconds"),
            lossy_fallbacks: register_counter!("sitesnap_lossy_fallbacks_total"),
            encode_attempts: register_counter!("sitesnap_encode_attempts_total"),
        }
    }

    pub fn record_submitted(&self) {
        self.jobs_submitted.increment(1);
        self.active_jobs.increment(1.0);
    }

    pub fn record_finished(&self, duration: Duration, success: bool) {
        if success {
            self.jobs_completed.increment(1);
        } else {
            self.jobs_failed.increment(1);
        }
        self.active_jobs.decrement(1.0);
        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn record_encoding(&self, attempts: usize, lossless: bool) {
        if !lossless {
            self.lossy_fallbacks.increment(1);
        }
        self.encode_attempts.increment(attempts as u64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
