//! # kiosk-core: Pure Domain Logic for the Kiosk Agent
//!
//! Everything here is deterministic and free of I/O. The agent crate feeds
//! it bytes from the network and the disk; this crate decides what they mean.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Kiosk Agent Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    apps/kiosk-daemon (kioskd)                   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    kiosk-agent                                  │   │
//! │  │  registration • heartbeat • media cache • content sync          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ kiosk-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ playlist  │  │ heartbeat │  │ validation│  │   │
//! │  │   │Credentials│  │  merge &  │  │  verdict  │  │  item     │  │   │
//! │  │   │ MediaItem │  │   sort    │  │           │  │  rules    │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO FILESYSTEM                           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Credentials, branch info, media items, notifications
//! - [`playlist`] - Ordered playlist with refresh/add/remove/update
//! - [`heartbeat`] - Deletion signature and response classification
//! - [`validation`] - Parse-boundary rules for media items
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use kiosk_core::heartbeat::{classify_heartbeat, HeartbeatVerdict};
//!
//! let verdict = classify_heartbeat(200, r#"{"messageCount":3}"#);
//! assert_eq!(verdict, HeartbeatVerdict::Alive { message_count: Some(3) });
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod heartbeat;
pub mod playlist;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use heartbeat::{classify_heartbeat, is_deletion_signature, DeletionReason, HeartbeatVerdict};
pub use playlist::{ParsedPlaylist, Playlist, RejectedItem, UpsertOutcome};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Display time for a photo that arrives without a usable duration.
pub const DEFAULT_PHOTO_DURATION_SECS: u32 = 10;

/// Download attempts per item before it is skipped.
pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;
