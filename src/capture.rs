use crate::{CaptureError, EncodedImage, RenderSession, SizeConstrainedEncoder, ViewportProfile};
use tracing::debug;
use url::Url;

/// Capture one viewport of `url` as a size-bounded image.
///
/// The page is closed whether or not encoding succeeds.
pub async fn capture_viewport(
    session: &mut dyn RenderSession,
    url: &Url,
    profile: &ViewportProfile,
    encoder: &SizeConstrainedEncoder,
) -> Result<EncodedImage, CaptureError> {
    let mut page = session.open_page(url, profile).await?;
    let encoded = encoder.encode(page.raster()).await;
    page.close().await;

    let encoded = encoded?;
    debug!(
        "{} capture of {}: {} bytes as {:?} after {} attempts",
        profile.device,
        url,
        encoded.size(),
        encoded.format,
        encoded.attempts
    );
    Ok(encoded)
}
