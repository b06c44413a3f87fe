//! # Heartbeat Classification
//!
//! Pure interpretation of a heartbeat response. The monitor in kiosk-agent
//! does the I/O and acts on the verdict.
//!
//! ## Decision Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Body is the four-null deletion signature  ──► Deleted (any status) │
//! │  2. Status 404 / 410                          ──► Deleted              │
//! │  3. Status 401 / 403                          ──► AuthRejected         │
//! │  4. 2xx with JSON body                        ──► Alive                │
//! │  5. 2xx with unparseable body                 ──► Malformed            │
//! │  6. Anything else (5xx, HTML pages, ...)      ──► Transient            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The body check runs first because the backend returns the signature
//! with a 200 status.

use serde_json::Value;

/// Fields that must all be present and explicitly `null`.
pub const DELETION_SIGNATURE_FIELDS: [&str; 4] = ["message", "innerException", "errors", "stackTrace"];

/// Why the device is considered deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    Signature,
    Status(u16),
}

impl std::fmt::Display for DeletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletionReason::Signature => write!(f, "deletion signature"),
            DeletionReason::Status(code) => write!(f, "HTTP {}", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Deleted(DeletionReason),
    /// `message_count` is `None` when the body did not carry one.
    Alive { message_count: Option<u64> },
    AuthRejected(u16),
    /// 2xx whose body could not be interpreted. Raw text kept for logs.
    Malformed { raw: String },
    Transient { status: u16 },
}

/// Returns true iff `body` is an object with every signature field present and null.
///
/// Absent fields do not count; neither does `"message": ""`.
pub fn is_deletion_signature(body: &Value) -> bool {
    match body.as_object() {
        Some(obj) => DELETION_SIGNATURE_FIELDS
            .iter()
            .all(|field| matches!(obj.get(*field), Some(Value::Null))),
        None => false,
    }
}

/// Classifies one heartbeat response.
pub fn classify_heartbeat(status: u16, body: &str) -> HeartbeatVerdict {
    let parsed: Option<Value> = serde_json::from_str(body).ok();

    if parsed.as_ref().is_some_and(is_deletion_signature) {
        return HeartbeatVerdict::Deleted(DeletionReason::Signature);
    }

    match status {
        404 | 410 => HeartbeatVerdict::Deleted(DeletionReason::Status(status)),
        401 | 403 => HeartbeatVerdict::AuthRejected(status),
        200..=299 => match parsed {
            Some(value) => match value.get("messageCount") {
                None | Some(Value::Null) => HeartbeatVerdict::Alive { message_count: None },
                Some(count) => match count.as_u64() {
                    Some(n) => HeartbeatVerdict::Alive {
                        message_count: Some(n),
                    },
                    None => HeartbeatVerdict::Malformed {
                        raw: body.to_string(),
                    },
                },
            },
            None => HeartbeatVerdict::Malformed {
                raw: body.to_string(),
            },
        },
        _ => HeartbeatVerdict::Transient { status },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNATURE: &str =
        r#"{"message":null,"innerException":null,"errors":null,"stackTrace":null}"#;

    #[test]
    fn test_signature_with_200_is_deletion() {
        assert_eq!(
            classify_heartbeat(200, SIGNATURE),
            HeartbeatVerdict::Deleted(DeletionReason::Signature)
        );
    }

    #[test]
    fn test_signature_wins_over_any_status() {
        assert_eq!(
            classify_heartbeat(500, SIGNATURE),
            HeartbeatVerdict::Deleted(DeletionReason::Signature)
        );
    }

    #[test]
    fn test_absent_field_is_not_signature() {
        let body = r#"{"message":null,"innerException":null,"errors":null}"#;
        assert!(!is_deletion_signature(&serde_json::from_str(body).unwrap()));
        assert!(matches!(
            classify_heartbeat(200, body),
            HeartbeatVerdict::Alive { message_count: None }
        ));
    }

    #[test]
    fn test_non_null_field_is_not_signature() {
        let body = r#"{"message":"oops","innerException":null,"errors":null,"stackTrace":null}"#;
        assert!(!is_deletion_signature(&serde_json::from_str(body).unwrap()));
    }

    #[test]
    fn test_status_deletion() {
        assert_eq!(
            classify_heartbeat(404, ""),
            HeartbeatVerdict::Deleted(DeletionReason::Status(404))
        );
        assert_eq!(
            classify_heartbeat(410, "<html>gone</html>"),
            HeartbeatVerdict::Deleted(DeletionReason::Status(410))
        );
    }

    #[test]
    fn test_maintenance_is_transient() {
        assert_eq!(
            classify_heartbeat(503, r#"{"error":"maintenance"}"#),
            HeartbeatVerdict::Transient { status: 503 }
        );
        assert_eq!(
            classify_heartbeat(502, "<html>Bad Gateway</html>"),
            HeartbeatVerdict::Transient { status: 502 }
        );
    }

    #[test]
    fn test_auth_rejected() {
        assert_eq!(classify_heartbeat(401, ""), HeartbeatVerdict::AuthRejected(401));
        assert_eq!(classify_heartbeat(403, "{}"), HeartbeatVerdict::AuthRejected(403));
    }

    #[test]
    fn test_alive_with_count() {
        assert_eq!(
            classify_heartbeat(200, r#"{"messageCount":3,"status":"active"}"#),
            HeartbeatVerdict::Alive {
                message_count: Some(3)
            }
        );
    }

    #[test]
    fn test_malformed_keeps_raw() {
        match classify_heartbeat(200, "not json") {
            HeartbeatVerdict::Malformed { raw } => assert_eq!(raw, "not json"),
            other => panic!("unexpected verdict: {:?}", other),
        }
        assert!(matches!(
            classify_heartbeat(200, r#"{"messageCount":"three"}"#),
            HeartbeatVerdict::Malformed { .. }
        ));
    }
}
