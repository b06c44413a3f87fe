//! # Validation Module
//!
//! Parse-boundary rules for playlist items.
//!
//! ## Where Validation Happens
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: serde                                                        │
//! │  └── Shape only: every field optional, ids may be numbers              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── id / type / url present                                           │
//! │  ├── type ∈ {photo, image, video}                                      │
//! │  ├── photo duration defaulted, video duration dropped                  │
//! │  └── declared size / checksum well-formed                              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Media cache                                                  │
//! │  └── Downloaded bytes checked against declared size / checksum        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::{MediaItem, MediaKind, RawMediaItem};
use crate::DEFAULT_PHOTO_DURATION_SECS;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Item Validation
// =============================================================================

/// Turns a raw item into a [`MediaItem`] or explains why it was rejected.
///
/// ## Rules
/// - `id`, `type` and `url` are required and non-blank
/// - `type` is photo, image (alias of photo) or video
/// - `url` is http(s)
/// - photos without a positive duration get the default; videos never carry one
/// - `size`, if declared, is positive; `checksum`, if declared, is 64 hex chars
pub fn validate_item(raw: RawMediaItem) -> ValidationResult<MediaItem> {
    let id = required("id", raw.id)?;

    let kind_raw = required("type", raw.kind)?;
    let kind: MediaKind = kind_raw.parse().map_err(|_| ValidationError::NotAllowed {
        field: "type".to_string(),
        allowed: vec!["photo".into(), "image".into(), "video".into()],
    })?;

    let source_url = required("url", raw.url)?;
    validate_url(&source_url)?;

    let duration_seconds = match kind {
        MediaKind::Photo => Some(photo_duration(raw.duration)),
        MediaKind::Video => None,
    };

    if raw.size == Some(0) {
        return Err(ValidationError::MustBePositive {
            field: "size".to_string(),
        });
    }

    let checksum = raw.checksum.map(|c| validate_checksum(&c)).transpose()?;

    Ok(MediaItem {
        id,
        kind,
        source_url,
        duration_seconds,
        order: raw.order.unwrap_or(0),
        size_bytes: raw.size,
        checksum,
    })
}

/// Validates a media source URL.
pub fn validate_url(url: &str) -> ValidationResult<()> {
    let lower = url.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(ValidationError::InvalidFormat {
            field: "url".to_string(),
            reason: "must be an http(s) URL".to_string(),
        });
    }
    Ok(())
}

/// Validates and lowercases a SHA-256 hex digest.
pub fn validate_checksum(checksum: &str) -> ValidationResult<String> {
    let checksum = checksum.trim();
    if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidFormat {
            field: "checksum".to_string(),
            reason: "expected 64 hex characters (sha256)".to_string(),
        });
    }
    Ok(checksum.to_ascii_lowercase())
}

fn required(field: &str, value: Option<String>) -> ValidationResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ValidationError::Required {
            field: field.to_string(),
        })
}

fn photo_duration(duration: Option<f64>) -> u32 {
    match duration {
        Some(d) if d.is_finite() && d > 0.0 => d.ceil().min(u32::MAX as f64) as u32,
        _ => DEFAULT_PHOTO_DURATION_SECS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, kind: &str, url: &str) -> RawMediaItem {
        RawMediaItem {
            id: Some(id.into()),
            kind: Some(kind.into()),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_photo_gets_default_duration() {
        let item = validate_item(raw("a", "photo", "https://cdn/a.jpg")).unwrap();
        assert_eq!(item.duration_seconds, Some(DEFAULT_PHOTO_DURATION_SECS));
    }

    #[test]
    fn test_image_is_photo_alias() {
        let mut r = raw("a", "Image", "https://cdn/a.jpg");
        r.duration = Some(7.2);
        let item = validate_item(r).unwrap();
        assert_eq!(item.kind, MediaKind::Photo);
        assert_eq!(item.duration_seconds, Some(8));
    }

    #[test]
    fn test_video_ignores_duration() {
        let mut r = raw("v", "video", "https://cdn/v.mp4");
        r.duration = Some(30.0);
        let item = validate_item(r).unwrap();
        assert_eq!(item.duration_seconds, None);
    }

    #[test]
    fn test_missing_url_rejected() {
        let mut r = raw("a", "photo", "");
        r.url = None;
        assert!(matches!(
            validate_item(r),
            Err(ValidationError::Required { field }) if field == "url"
        ));
    }

    #[test]
    fn test_unsupported_kind_rejected() {
        assert!(matches!(
            validate_item(raw("a", "audio", "https://cdn/a.mp3")),
            Err(ValidationError::NotAllowed { .. })
        ));
    }

    #[test]
    fn test_non_http_url_rejected() {
        assert!(validate_item(raw("a", "photo", "file:///etc/passwd")).is_err());
    }

    #[test]
    fn test_checksum_rules() {
        assert!(validate_checksum("abc").is_err());
        let upper = "A".repeat(64);
        assert_eq!(validate_checksum(&upper).unwrap(), "a".repeat(64));

        let mut r = raw("a", "photo", "https://cdn/a.jpg");
        r.size = Some(0);
        assert!(matches!(
            validate_item(r),
            Err(ValidationError::MustBePositive { .. })
        ));
    }
}
