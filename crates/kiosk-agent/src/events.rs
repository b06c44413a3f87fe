//! # Agent Events
//!
//! Broadcast notifications for the collaborators this crate does not own
//! (QR screen, player, status overlay) and for the agent's own loops.
//!
//! ```text
//! RegistrationMachine ──┐
//! HeartbeatMonitor ─────┼──► EventBus (broadcast) ──► subscribers
//! ContentSynchronizer ──┘
//! ```
//!
//! Slow subscribers may lag and miss events; every event describes a
//! state that can also be read back through `AgentHandle::status()`.

use std::path::PathBuf;

use tokio::sync::broadcast;
use tracing::trace;

use crate::registration::{ClaimTicket, RegistrationState};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A claim code is ready to be shown.
    ClaimIssued(ClaimTicket),

    RegistrationStateChanged(RegistrationState),

    Activated { assigned_guid: String },

    /// Credentials and branch info were wiped after a deletion signal.
    DeviceDeleted { reason: String },

    MessageCountChanged { previous: u64, current: u64 },

    PlaylistChanged {
        playlist_id: Option<String>,
        version: Option<String>,
        item_count: usize,
    },

    ItemReady { item_id: String, path: PathBuf },

    /// Download gave up after the retry cap, or the cache had no room.
    ItemSkipped { item_id: String, reason: String },
}

/// Cloneable sender side of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    /// Publishes an event. Having no subscribers is fine.
    pub fn emit(&self, event: AgentEvent) {
        trace!(?event, "Emitting agent event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}
