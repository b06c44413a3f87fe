//! # Error Types
//!
//! Domain-specific error types for kiosk-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  kiosk-core errors (this file)                                         │
//! │  ├── CoreError        - Playlist / notification rule violations        │
//! │  └── ValidationError  - Malformed items rejected at the parse boundary │
//! │                                                                         │
//! │  kiosk-agent errors (separate crate)                                   │
//! │  └── AgentError       - Network, auth, cache and storage failures      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → AgentError → logs / events        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No playlist item carries the requested id.
    #[error("Playlist item not found: {0}")]
    ItemNotFound(String),

    /// An update notification did not carry what its action needs.
    ///
    /// ## When This Occurs
    /// - `add` / `update` without an `item` object
    /// - `remove` without an `itemId`
    #[error("Notification '{action}' is missing {field}")]
    IncompleteNotification { action: String, field: String },

    /// The notification action is not one of refresh/add/remove/update.
    #[error("Unsupported notification action: {0}")]
    UnsupportedAction(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Parse-boundary validation errors.
///
/// A media item that fails any of these checks is never stored in a
/// [`Playlist`](crate::Playlist).
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Invalid format (e.g., non-http url, bad checksum).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Duplicate value (e.g., two items with the same id).
    #[error("{field} '{value}' already exists")]
    Duplicate { field: String, value: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
