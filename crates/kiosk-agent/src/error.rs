//! # Agent Error Types
//!
//! Error types for everything the agent does over the network or on disk.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Agent Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Network      │  │     Backend             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Network        │  │  Auth (401/403)         │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  NotFound (404/410)     │ │
//! │  │  ConfigLoad     │  │  WebSocket      │  │  HttpStatus             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Payload      │  │     Cache       │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Parse { raw }  │  │  CacheFull      │  │  NotActivated           │ │
//! │  │  Validation     │  │  Storage        │  │  Cancelled              │ │
//! │  │  Core           │  │                 │  │  NotRegistered          │ │
//! │  │                 │  │                 │  │  ShuttingDown, Channel  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here is fatal to the process. Loops log, wait for their next
//! interval and try again.

use thiserror::Error;

use kiosk_core::CoreError;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// DNS failure, refused connection, reset. Retried next cycle.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // =========================================================================
    // Backend Responses
    // =========================================================================
    /// 401/403. Credentials are kept; an operator may need to step in.
    #[error("Authentication rejected (HTTP {0})")]
    Auth(u16),

    #[error("Not found (HTTP {0})")]
    NotFound(u16),

    /// Any other non-2xx status.
    #[error("Unexpected HTTP status {status}")]
    HttpStatus { status: u16, body: String },

    // =========================================================================
    // Payload Errors
    // =========================================================================
    /// Malformed JSON. The raw payload is kept for diagnostics.
    #[error("Failed to parse response: {reason}")]
    Parse { reason: String, raw: String },

    /// A well-formed response that breaks the contract (missing ids,
    /// truncated or corrupt media).
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    // =========================================================================
    // Cache / Storage Errors
    // =========================================================================
    #[error("Cache full: need {needed} bytes, cap is {cap} bytes")]
    CacheFull { needed: u64, cap: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Device is not activated")]
    NotActivated,

    #[error("No claim in progress")]
    NotRegistered,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Agent is shutting down")]
    ShuttingDown,

    #[error("Channel error: {0}")]
    Channel(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AgentError::Timeout
        } else if err.is_decode() {
            AgentError::Parse {
                reason: err.to_string(),
                raw: String::new(),
            }
        } else if err.is_builder() {
            AgentError::InvalidUrl(err.to_string())
        } else {
            AgentError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Parse {
            reason: err.to_string(),
            raw: String::new(),
        }
    }
}

impl From<url::ParseError> for AgentError {
    fn from(err: url::ParseError) -> Self {
        AgentError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Storage(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Io(io) => AgentError::Network(io.to_string()),
            other => AgentError::WebSocket(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for AgentError {
    fn from(err: tokio::task::JoinError) -> Self {
        AgentError::Channel(err.to_string())
    }
}

impl AgentError {
    /// Builds a parse error that keeps the offending payload.
    pub fn parse(reason: impl std::fmt::Display, raw: impl Into<String>) -> Self {
        AgentError::Parse {
            reason: reason.to_string(),
            raw: raw.into(),
        }
    }

    /// Maps a non-2xx status onto the taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            401 | 403 => AgentError::Auth(status),
            404 | 410 => AgentError::NotFound(status),
            _ => AgentError::HttpStatus {
                status,
                body: body.into(),
            },
        }
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl AgentError {
    /// Returns true if the owning loop should simply try again later.
    ///
    /// ## Retryable Errors
    /// - Network failures and timeouts
    /// - 5xx and other unexpected statuses
    /// - Malformed payloads (the next response may be fine)
    /// - Media that failed validation (re-download)
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Network(_)
            | AgentError::Timeout
            | AgentError::WebSocket(_)
            | AgentError::Parse { .. }
            | AgentError::Validation(_)
            | AgentError::Storage(_) => true,
            AgentError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            AgentError::InvalidConfig(_) | AgentError::InvalidUrl(_) | AgentError::ConfigLoadFailed(_)
        )
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, AgentError::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AgentError::Network("refused".into()).is_retryable());
        assert!(AgentError::Timeout.is_retryable());
        assert!(AgentError::from_status(503, "").is_retryable());
        assert!(AgentError::Validation("short".into()).is_retryable());

        assert!(!AgentError::from_status(401, "").is_retryable());
        assert!(!AgentError::CacheFull { needed: 10, cap: 5 }.is_retryable());
        assert!(!AgentError::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(AgentError::from_status(403, ""), AgentError::Auth(403)));
        assert!(matches!(AgentError::from_status(410, ""), AgentError::NotFound(410)));
        assert!(AgentError::from_status(401, "").is_auth_error());
        assert!(AgentError::InvalidUrl("x".into()).is_config_error());
    }

    #[test]
    fn test_parse_keeps_raw() {
        match AgentError::parse("expected value", "<html>") {
            AgentError::Parse { raw, .. } => assert_eq!(raw, "<html>"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
