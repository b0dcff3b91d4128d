//! Size-constrained encoding of full-page renders
//!
//! The encoder asks a [`RasterSource`] for a lossless PNG first and only falls
//! back to JPEG, walking the quality ladder downwards, when the PNG is over the
//! byte budget. Every rendering is checked before it is accepted so a truncated
//! or mislabelled buffer never reaches the caller.

use crate::{CaptureError, EncoderSettings, OversizePolicy};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, ImageOutputFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::{debug, warn};

/// Format and quality requested from a [`RasterSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Png,
    Jpeg { quality: u8 },
}

/// Format tag of a final artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// PNG, lossless
    Png,
    /// JPEG, lossy
    Jpeg,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Png => "png",
            ArtifactFormat::Jpeg => "jpg",
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, ArtifactFormat::Png)
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            ArtifactFormat::Png => ImageFormat::Png,
            ArtifactFormat::Jpeg => ImageFormat::Jpeg,
        }
    }
}

impl From<RasterFormat> for ArtifactFormat {
    fn from(format: RasterFormat) -> Self {
        match format {
            RasterFormat::Png => ArtifactFormat::Png,
            RasterFormat::Jpeg { .. } => ArtifactFormat::Jpeg,
        }
    }
}

/// Anything that can produce an encoded rendering of one page state on demand
///
/// A live browser page re-captures itself for every call; [`ImageRaster`]
/// transcodes an already-decoded image.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RasterSource: Send {
    async fn render(&mut self, format: RasterFormat) -> Result<Vec<u8>, CaptureError>;
}

/// Accepted output of the encoder
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: ArtifactFormat,
    /// JPEG quality actually used; `None` for PNG
    pub quality: Option<u8>,
    /// Renderings requested from the source, including the initial PNG
    pub attempts: usize,
    /// False only for a best-effort artifact still over budget at the floor
    pub within_budget: bool,
}

impl EncodedImage {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Encoder enforcing `EncoderSettings::max_artifact_size`
#[derive(Debug, Clone)]
pub struct SizeConstrainedEncoder {
    settings: EncoderSettings,
}

impl SizeConstrainedEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub async fn encode(
        &self,
        source: &mut (dyn RasterSource + '_),
    ) -> Result<EncodedImage, CaptureError> {
        let budget = self.settings.max_artifact_size;

        let png = render_verified(source, RasterFormat::Png).await?;
        let mut attempts = 1;
        if png.len() as u64 <= budget {
            debug!("Lossless rendering fits: {} bytes", png.len());
            return Ok(EncodedImage {
                bytes: png,
                format: ArtifactFormat::Png,
                quality: None,
                attempts,
                within_budget: true,
            });
        }

        debug!(
            "Lossless rendering is {} bytes, over the {} byte budget; falling back to JPEG",
            png.len(),
            budget
        );
        drop(png);

        let mut best: Option<(Vec<u8>, u8)> = None;
        for quality in self.settings.ladder() {
            let jpeg = render_verified(source, RasterFormat::Jpeg { quality }).await?;
            attempts += 1;
            let fits = jpeg.len() as u64 <= budget;
            debug!("JPEG quality {}: {} bytes", quality, jpeg.len());
            best = Some((jpeg, quality));
            if fits {
                break;
            }
        }

        let (bytes, quality) = best.ok_or_else(|| {
            CaptureError::EncodingFailed("quality ladder is empty".to_string())
        })?;

        let within_budget = bytes.len() as u64 <= budget;
        if !within_budget {
            match self.settings.oversize_policy {
                OversizePolicy::BestEffort => {
                    warn!(
                        "Artifact still {} bytes at quality floor {}, over the {} byte budget",
                        bytes.len(),
                        quality,
                        budget
                    );
                }
                OversizePolicy::Reject => {
                    return Err(CaptureError::EncodingFailed(format!(
                        "{} bytes at quality {} exceeds the {} byte budget",
                        bytes.len(),
                        quality,
                        budget
                    )));
                }
            }
        }

        Ok(EncodedImage {
            bytes,
            format: ArtifactFormat::Jpeg,
            quality: Some(quality),
            attempts,
            within_budget,
        })
    }
}

async fn render_verified(
    source: &mut (dyn RasterSource + '_),
    format: RasterFormat,
) -> Result<Vec<u8>, CaptureError> {
    let bytes = source.render(format).await.map_err(|e| match e {
        CaptureError::EncodingFailed(_) => e,
        other => CaptureError::EncodingFailed(other.to_string()),
    })?;
    verify_encoding(&bytes, format.into())?;
    Ok(bytes)
}

/// Reject empty buffers and buffers whose signature does not match `expected`.
pub fn verify_encoding(bytes: &[u8], expected: ArtifactFormat) -> Result<(), CaptureError> {
    if bytes.is_empty() {
        return Err(CaptureError::EncodingFailed(
            "renderer returned an empty image".to_string(),
        ));
    }

    match image::guess_format(bytes) {
        Ok(found) if found == expected.image_format() => Ok(()),
        Ok(found) => Err(CaptureError::EncodingFailed(format!(
            "expected {:?} data, got {:?}",
            expected, found
        ))),
        Err(e) => Err(CaptureError::EncodingFailed(e.to_string())),
    }
}

/// Raster source backed by an in-memory image, re-encoding it per request
pub struct ImageRaster {
    image: DynamicImage,
}

impl ImageRaster {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CaptureError> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| CaptureError::EncodingFailed(e.to_string()))?;
        Ok(Self::new(image))
    }
}

#[async_trait]
impl RasterSource for ImageRaster {
    async fn render(&mut self, format: RasterFormat) -> Result<Vec<u8>, CaptureError> {
        let mut data = Vec::new();
        let result = match format {
            RasterFormat::Png => self
                .image
                .write_to(&mut Cursor::new(&mut data), ImageOutputFormat::Png),
            RasterFormat::Jpeg { quality } => {
                // JPEG has no alpha channel
                let rgb = DynamicImage::ImageRgb8(self.image.to_rgb8());
                rgb.write_to(&mut Cursor::new(&mut data), ImageOutputFormat::Jpeg(quality))
            }
        };
        result.map_err(|e| CaptureError::EncodingFailed(e.to_string()))?;
        Ok(data)
    }
}
