//! Configuration management with serde serialization/deserialization
//!
//! This module provides the service configuration, the encoder and network-idle
//! tuning knobs, the two fixed viewport profiles, and the Chrome launch settings.

use crate::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 5 MiB, the per-artifact byte budget.
pub const MAX_ARTIFACT_SIZE: u64 = 5 * 1024 * 1024;

pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

/// Main configuration structure for the capture service
///
/// # Examples
///
/// ```rust
/// use sitesnap::Config;
/// use std::time::Duration;
///
/// let config = Config {
///     navigation_timeout: Duration::from_secs(10),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Directory artifacts are written to in server mode (default: `screenshots`)
    pub artifacts_dir: PathBuf,

    /// URL path the artifacts directory is served under (default: `/screenshots`)
    pub artifacts_url_prefix: String,

    /// Hard bound on navigation plus network settling (default: 30 seconds)
    ///
    /// Expiry is a failure of the capture, never a partial success.
    pub navigation_timeout: Duration,

    /// When a page counts as settled
    pub network_idle: NetworkIdleSettings,

    /// Byte budget and quality ladder
    pub encoder: EncoderSettings,

    /// Capacity of each job's progress channel (default: 16)
    pub progress_buffer: usize,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Delete already-written artifacts of a job that ends in failure (default: true)
    pub cleanup_on_failure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from("screenshots"),
            artifacts_url_prefix: "/screenshots".to_string(),
            navigation_timeout: Duration::from_secs(30),
            network_idle: NetworkIdleSettings::default(),
            encoder: EncoderSettings::default(),
            progress_buffer: 16,
            chrome_path: None,
            cleanup_on_failure: true,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.navigation_timeout.is_zero() {
            return Err(CaptureError::Configuration(
                "Navigation timeout must be greater than 0".to_string(),
            ));
        }

        if self.progress_buffer == 0 {
            return Err(CaptureError::Configuration(
                "Progress buffer must be greater than 0".to_string(),
            ));
        }

        if !self.artifacts_url_prefix.starts_with('/') || self.artifacts_url_prefix.len() < 2 {
            return Err(CaptureError::Configuration(format!(
                "Artifacts URL prefix '{}' must be an absolute path below /",
                self.artifacts_url_prefix
            )));
        }

        if self.network_idle.quiet_window.is_zero() {
            return Err(CaptureError::Configuration(
                "Network quiet window must be greater than 0".to_string(),
            ));
        }

        self.encoder.validate()
    }
}

/// Network quiescence criteria, equivalent to "at most N connections for a window"
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkIdleSettings {
    /// In-flight requests tolerated while still counting as idle (default: 2)
    pub max_inflight: usize,

    /// How long the page must stay under `max_inflight` (default: 500ms)
    pub quiet_window: Duration,
}

impl Default for NetworkIdleSettings {
    fn default() -> Self {
        Self {
            max_inflight: 2,
            quiet_window: Duration::from_millis(500),
        }
    }
}

/// What the encoder does when even the quality floor exceeds the budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OversizePolicy {
    /// Return the floor-quality artifact, flagged as over budget
    BestEffort,
    /// Fail the capture with `EncodingFailed`
    Reject,
}

/// Size budget and lossy quality ladder
///
/// The ladder runs `initial_quality`, `initial_quality - quality_step`, ... down
/// to `quality_floor`, stopping at the first rendering that fits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub max_artifact_size: u64,
    pub initial_quality: u8,
    pub quality_floor: u8,
    pub quality_step: u8,
    pub oversize_policy: OversizePolicy,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            max_artifact_size: MAX_ARTIFACT_SIZE,
            initial_quality: 90,
            quality_floor: 50,
            quality_step: 10,
            oversize_policy: OversizePolicy::BestEffort,
        }
    }
}

impl EncoderSettings {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.max_artifact_size == 0 {
            return Err(CaptureError::Configuration(
                "Artifact size budget must be greater than 0".to_string(),
            ));
        }

        if !(1..=100).contains(&self.initial_quality) || !(1..=100).contains(&self.quality_floor) {
            return Err(CaptureError::Configuration(
                "Qualities must be within 1..=100".to_string(),
            ));
        }

        if self.quality_floor > self.initial_quality {
            return Err(CaptureError::Configuration(format!(
                "Quality floor {} is above initial quality {}",
                self.quality_floor, self.initial_quality
            )));
        }

        if self.quality_step == 0 {
            return Err(CaptureError::Configuration(
                "Quality step must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Every quality level the ladder may try, in order.
    pub fn ladder(&self) -> Vec<u8> {
        let mut levels = vec![self.initial_quality];
        let mut quality = self.initial_quality;
        while quality > self.quality_floor {
            quality = quality
                .saturating_sub(self.quality_step)
                .max(self.quality_floor);
            levels.push(quality);
        }
        levels
    }
}

/// Which of the two fixed device profiles a capture uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Desktop,
    Mobile,
}

impl Device {
    /// Suffix used in artifact file names.
    pub fn suffix(&self) -> &'static str {
        match self {
            Device::Desktop => "desktop",
            Device::Mobile => "mobile",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Immutable device-emulation settings for one capture
///
/// Only the two predefined profiles exist; they are never built at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportProfile {
    pub device: Device,
    /// Logical width in CSS pixels
    pub width: u32,
    /// Logical height in CSS pixels
    pub height: u32,
    pub device_scale_factor: f64,
    /// Enables mobile rendering behaviour and touch events
    pub mobile: bool,
    pub user_agent: Option<&'static str>,
}

impl ViewportProfile {
    pub const DESKTOP: ViewportProfile = ViewportProfile {
        device: Device::Desktop,
        width: 1920,
        height: 1080,
        device_scale_factor: 2.0,
        mobile: false,
        user_agent: None,
    };

    pub const MOBILE: ViewportProfile = ViewportProfile {
        device: Device::Mobile,
        width: 430,
        height: 932,
        device_scale_factor: 3.0,
        mobile: true,
        user_agent: Some(MOBILE_USER_AGENT),
    };

    /// Capture order within a job.
    pub const ALL: [ViewportProfile; 2] = [Self::DESKTOP, Self::MOBILE];

    /// Resolution in device pixels (logical size times scale factor).
    pub fn device_pixels(&self) -> (u32, u32) {
        (
            (self.width as f64 * self.device_scale_factor).round() as u32,
            (self.height as f64 * self.device_scale_factor).round() as u32,
        )
    }
}

/// Generate Chrome command-line arguments for a capture session
///
/// Each session gets its own user-data and temp directories so concurrent jobs
/// never share browser state.
pub fn chrome_args(session_id: &str) -> Vec<String> {
    let (width, height) = (
        ViewportProfile::DESKTOP.width,
        ViewportProfile::DESKTOP.height,
    );

    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        format!("--window-size={width},{height}"),
        format!("--user-data-dir=/tmp/sitesnap-profile-{session_id}"),
        format!("--temp-dir=/tmp/sitesnap-temp-{session_id}"),
    ]
}

pub fn create_browser_config(
    config: &Config,
    session_id: &str,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;
    use chromiumoxide::handler::viewport::Viewport;

    let mut builder = BrowserConfig::builder()
        .window_size(ViewportProfile::DESKTOP.width, ViewportProfile::DESKTOP.height)
        .viewport(None::<Viewport>)
        .args(chrome_args(session_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::ResourceExhaustion)
}
