//! # kiosk-agent: Device Lifecycle and Content Pipeline
//!
//! Everything the kiosk does over the network or on disk: registering via a
//! QR claim, staying alive through heartbeats, and keeping a bounded media
//! cache in step with the backend playlist.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Kiosk Agent Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   KioskAgent (Orchestrator)                      │  │
//! │  │  Spawns the loops, exposes AgentHandle                           │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │     ┌───────────────┬─────────┴───────┬──────────────────┐             │
//! │     ▼               ▼                 ▼                  ▼              │
//! │  ┌──────────┐  ┌──────────┐  ┌────────────────┐  ┌──────────────┐      │
//! │  │Registra- │  │Heartbeat │  │ Content        │  │ Notification │      │
//! │  │tion      │  │Monitor   │  │ Synchronizer   │  │ Feed         │      │
//! │  │Machine   │  │          │  │                │  │ (WebSocket)  │      │
//! │  └────┬─────┘  └────┬─────┘  └───┬────────┬───┘  └──────┬───────┘      │
//! │       │             │            │        │             │ mpsc          │
//! │       ▼             ▼            ▼        ▼             │               │
//! │  ┌────────────────────────┐  ┌──────────────┐           │               │
//! │  │   CredentialStore      │  │  MediaCache  │ ◄─────────┘               │
//! │  │ registration.json      │  │  LRU on disk │                           │
//! │  │ branchInfo.json        │  └──────────────┘                           │
//! │  └────────────────────────┘                                             │
//! │                                                                         │
//! │  EVENTS (broadcast, for QR screen / player / overlay):                 │
//! │  ClaimIssued • Activated • DeviceDeleted • MessageCountChanged         │
//! │  PlaylistChanged • ItemReady • ItemSkipped                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - `KioskAgent` orchestrator and `AgentHandle`
//! - [`api`] - HTTP client for the backend and media downloads
//! - [`cache`] - Bounded LRU media cache
//! - [`config`] - Configuration (file + environment)
//! - [`error`] - Agent error taxonomy
//! - [`events`] - Broadcast event bus
//! - [`heartbeat`] - Liveness and remote deletion detection
//! - [`notify`] - WebSocket notification feed
//! - [`protocol`] - Wire DTOs and endpoint constants
//! - [`registration`] - QR claim state machine
//! - [`shutdown`] - Cooperative stop signal
//! - [`store`] - Durable credential and branch documents
//! - [`synchronizer`] - Playlist ownership and download scheduling

pub mod agent;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod notify;
pub mod protocol;
pub mod registration;
pub mod shutdown;
pub mod store;
pub mod synchronizer;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentHandle, AgentStatus, KioskAgent};
pub use api::BackendClient;
pub use cache::{cache_key, CacheEntry, CacheUsage, MediaCache};
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use events::{AgentEvent, EventBus};
pub use heartbeat::{CheckOutcome, HeartbeatMonitor};
pub use notify::{FeedConfig, NotificationFeed};
pub use registration::{ClaimTicket, RegistrationCanceller, RegistrationMachine, RegistrationState};
pub use shutdown::{stop_channel, StopSender, StopSignal};
pub use store::CredentialStore;
pub use synchronizer::{ContentSynchronizer, DownloadState, DownloadTask, PlayableItem};
