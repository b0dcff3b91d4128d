//! # SiteSnap
//!
//! Full-page screenshots of a web page in a desktop and a mobile profile, each
//! kept under a 5 MiB byte budget, with live per-job progress.
//!
//! A capture runs as a background job. The job drives one headless Chrome
//! session through both viewports in turn, encodes every render losslessly when
//! it fits and otherwise walks a JPEG quality ladder down until it does, and
//! reports each step through a single-consumer progress stream.
//!
//! ## Pipeline
//!
//! | Stage | Type | Notes |
//! |-------|------|-------|
//! | Submission | [`JobRegistry`] | validates the URL, allocates the job id and channel |
//! | Orchestration | [`CaptureController`] | desktop then mobile, one engine session |
//! | Viewport capture | [`capture_viewport`] | isolated context, network quiescence, full-page render |
//! | Encoding | [`SizeConstrainedEncoder`] | PNG, then JPEG 90/80/70/60/50 |
//! | Persistence | [`ArtifactStore`] | staged write, rename, then delete the superseded file |
//!
//! ## Progress
//!
//! | Status | Progress |
//! |--------|----------|
//! | `starting` | 10 |
//! | `capturing-desktop` | 30 |
//! | `capturing-mobile` | 60 |
//! | `completed` | 100 |
//! | `error` | 0 |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use sitesnap::{
//!     ArtifactNaming, ArtifactStore, CaptureController, ChromiumEngine, Config, JobRegistry,
//!     Metrics,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let controller = CaptureController::new(
//!         Arc::new(ChromiumEngine::new(config.clone())),
//!         &config,
//!         ArtifactStore::new("screenshots", "/screenshots", ArtifactNaming::Timestamped),
//!         Metrics::new(),
//!     );
//!     let registry = JobRegistry::new(controller, config.progress_buffer);
//!
//!     let mut progress = registry.submit_and_subscribe("https://example.com")?;
//!     while let Some(event) = progress.next().await {
//!         println!("{:>3}% {}", event.progress, event.message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! sitesnap https://example.com
//! sitesnap serve --port 3000
//! ```

/// Configuration, encoder settings and the fixed viewport profiles
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Size-constrained encoding with a lossy quality ladder
pub mod encoder;

/// Artifact persistence
pub mod artifact;

/// Rendering-engine abstraction and network quiescence tracking
pub mod engine;

/// Headless Chrome implementation of the rendering engine
pub mod chromium;

/// Single-viewport capture
pub mod capture;

/// Per-job capture sequencing
pub mod controller;

/// Jobs, progress events and results
pub mod job;

/// Live jobs and their progress streams
pub mod registry;

/// HTTP API
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod testing;


pub use artifact::*;
pub use capture::*;
pub use chromium::*;
pub use cli::*;
pub use config::*;
pub use controller::*;
pub use encoder::*;
pub use engine::*;
pub use error::*;
pub use job::*;
pub use crate::metrics::*;
pub use registry::*;
pub use server::*;
pub use utils::*;
