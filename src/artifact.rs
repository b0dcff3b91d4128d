//! Artifact persistence
//!
//! Each viewport of a job ends up as exactly one file. Files are committed in
//! two phases: the new bytes are staged and verified on disk, renamed into
//! place, and only then is any superseded file for the same base name removed.

use crate::{
    verify_encoding, ArtifactFormat, CaptureError, Device, EncodedImage, JobId, ViewportProfile,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Pixel resolution of an artifact, rendered as `"<width> x <height>"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<&ViewportProfile> for Resolution {
    fn from(profile: &ViewportProfile) -> Self {
        let (width, height) = profile.device_pixels();
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {}", self.width, self.height)
    }
}

/// A persisted, size-bounded capture of one viewport
#[derive(Debug, Clone)]
pub struct Artifact {
    pub device: Device,
    pub path: PathBuf,
    pub filename: String,
    /// Path the artifact is served under, e.g. `/screenshots/<filename>`
    pub url_path: String,
    pub size_bytes: u64,
    pub format: ArtifactFormat,
    pub quality: Option<u8>,
    pub resolution: Resolution,
    pub within_budget: bool,
}

impl Artifact {
    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            url: self.url_path.clone(),
            filename: self.filename.clone(),
            size: self.size_bytes,
            format: self.format,
            resolution: self.resolution.to_string(),
            quality: self.quality,
            within_budget: self.within_budget,
        }
    }
}

/// Wire form of an artifact inside a completed result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub url: String,
    pub filename: String,
    pub size: u64,
    pub format: ArtifactFormat,
    pub resolution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    pub within_budget: bool,
}

/// How artifact files are named
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactNaming {
    /// `<created_ms>_<job id prefix>_<viewport>`, unique per job
    Timestamped,
    /// `screenshot_<viewport>`, overwritten on every run
    Fixed,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    url_prefix: String,
    naming: ArtifactNaming,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, url_prefix: impl Into<String>, naming: ArtifactNaming) -> Self {
        Self {
            dir: dir.into(),
            url_prefix: url_prefix.into(),
            naming,
        }
    }

    pub fn base_name(&self, job_id: &JobId, created_at: DateTime<Utc>, device: Device) -> String {
        match self.naming {
            ArtifactNaming::Timestamped => format!(
                "{}_{}_{}",
                created_at.timestamp_millis(),
                job_id.short(),
                device.suffix()
            ),
            ArtifactNaming::Fixed => format!("screenshot_{}", device.suffix()),
        }
    }

    pub async fn persist(
        &self,
        base_name: &str,
        profile: &ViewportProfile,
        encoded: &EncodedImage,
    ) -> Result<Artifact, CaptureError> {
        verify_encoding(&encoded.bytes, encoded.format)?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| write_error(&self.dir, e))?;

        let filename = format!("{}.{}", base_name, encoded.format.extension());
        let path = self.dir.join(&filename);
        let staging = self.dir.join(format!(".{filename}.partial"));

        fs::write(&staging, &encoded.bytes)
            .await
            .map_err(|e| write_error(&staging, e))?;

        let written = match fs::metadata(&staging).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                discard(&staging).await;
                return Err(write_error(&staging, e));
            }
        };
        if written != encoded.size() {
            discard(&staging).await;
            return Err(CaptureError::EncodingFailed(format!(
                "{} holds {} bytes, expected {}",
                staging.display(),
                written,
                encoded.size()
            )));
        }

        if let Err(e) = fs::rename(&staging, &path).await {
            discard(&staging).await;
            return Err(write_error(&path, e));
        }

        for superseded in [ArtifactFormat::Png, ArtifactFormat::Jpeg] {
            if superseded == encoded.format {
                continue;
            }
            let stale = self.dir.join(format!("{}.{}", base_name, superseded.extension()));
            if fs::try_exists(&stale).await.unwrap_or(false) {
                debug!("Removing superseded artifact {}", stale.display());
                discard(&stale).await;
            }
        }

        Ok(Artifact {
            device: profile.device,
            path,
            url_path: format!("{}/{}", self.url_prefix.trim_end_matches('/'), filename),
            filename,
            size_bytes: written,
            format: encoded.format,
            quality: encoded.quality,
            resolution: Resolution::from(profile),
            within_budget: encoded.within_budget,
        })
    }

    pub async fn remove(&self, artifact: &Artifact) -> Result<(), CaptureError> {
        fs::remove_file(&artifact.path).await?;
        Ok(())
    }
}

fn write_error(path: &Path, err: std::io::Error) -> CaptureError {
    CaptureError::EncodingFailed(format!("{}: {}", path.display(), err))
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_jpeg, fake_png};
    use chrono::TimeZone;

    fn encoded(bytes: Vec<u8>, format: ArtifactFormat, quality: Option<u8>) -> EncodedImage {
        EncodedImage {
            bytes,
            format,
            quality,
            attempts: 1,
            within_budget: true,
        }
    }

    #[test]
    fn test_resolution_display() {
        assert_eq!(Resolution::from(&ViewportProfile::DESKTOP).to_string(), "3840 x 2160");
        assert_eq!(Resolution::from(&ViewportProfile::MOBILE).to_string(), "1290 x 2796");
    }

    #[test]
    fn test_base_names() {
        let id = JobId::from("0123456789abcdef".to_string());
        let created = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        let timestamped = ArtifactStore::new("out", "/screenshots", ArtifactNaming::Timestamped);
        assert_eq!(
            timestamped.base_name(&id, created, Device::Desktop),
            "1700000000123_01234567_desktop"
        );

        let fixed = ArtifactStore::new(".", "", ArtifactNaming::Fixed);
        assert_eq!(fixed.base_name(&id, created, Device::Mobile), "screenshot_mobile");
    }

    #[tokio::test]
    async fn test_persist_writes_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "/screenshots/", ArtifactNaming::Fixed);

        let artifact = store
            .persist(
                "screenshot_desktop",
                &ViewportProfile::DESKTOP,
                &encoded(fake_png(256), ArtifactFormat::Png, None),
            )
            .await
            .unwrap();

        assert_eq!(artifact.filename, "screenshot_desktop.png");
        assert_eq!(artifact.url_path, "/screenshots/screenshot_desktop.png");
        assert_eq!(artifact.size_bytes, 256);
        assert_eq!(std::fs::read(&artifact.path).unwrap().len(), 256);

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "staging file must not survive the commit");
    }

    #[tokio::test]
    async fn test_persist_replaces_superseded_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "/screenshots", ArtifactNaming::Fixed);
        std::fs::write(dir.path().join("screenshot_mobile.png"), fake_png(64)).unwrap();

        let artifact = store
            .persist(
                "screenshot_mobile",
                &ViewportProfile::MOBILE,
                &encoded(fake_jpeg(128), ArtifactFormat::Jpeg, Some(80)),
            )
            .await
            .unwrap();

        assert_eq!(artifact.filename, "screenshot_mobile.jpg");
        assert_eq!(artifact.quality, Some(80));
        assert!(artifact.path.exists());
        assert!(!dir.path().join("screenshot_mobile.png").exists());
    }

    #[tokio::test]
    async fn test_persist_rejects_corrupt_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "/screenshots", ArtifactNaming::Fixed);

        let err = store
            .persist(
                "screenshot_desktop",
                &ViewportProfile::DESKTOP,
                &encoded(vec![0u8; 32], ArtifactFormat::Png, None),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::EncodingFailed(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_summary_serialization() {
        let artifact = Artifact {
            device: Device::Desktop,
            path: PathBuf::from("screenshots/a.png"),
            filename: "a.png".to_string(),
            url_path: "/screenshots/a.png".to_string(),
            size_bytes: 42,
            format: ArtifactFormat::Png,
            quality: None,
            resolution: Resolution::from(&ViewportProfile::DESKTOP),
            within_budget: true,
        };

        let json = serde_json::to_value(artifact.summary()).unwrap();
        assert_eq!(json["url"], "/screenshots/a.png");
        assert_eq!(json["format"], "png");
        assert_eq!(json["resolution"], "3840 x 2160");
        assert!(json.get("quality").is_none());
    }
}
