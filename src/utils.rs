use crate::CaptureError;
use std::time::Duration;
use url::Url;

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Parse `url`, accepting only absolute http(s) URLs with a host.
pub fn validate_url(url: &str) -> Result<Url, CaptureError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(CaptureError::Validation("URL is required".to_string()));
    }

    let parsed =
        Url::parse(trimmed).map_err(|e| CaptureError::Validation(format!("{trimmed}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some_and(|h| !h.is_empty()) => Ok(parsed),
        "http" | "https" => Err(CaptureError::Validation(format!("{trimmed}: missing host"))),
        scheme => Err(CaptureError::Validation(format!(
            "{trimmed}: unsupported scheme '{scheme}'"
        ))),
    }
}
