//! # Heartbeat Monitor
//!
//! Periodic liveness check. The only component allowed to delete the
//! device's credentials.
//!
//! ## Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  start ──► check() ──► wait interval ──► check() ──► ...  until stop    │
//! │                                                                         │
//! │  check():                                                               │
//! │    no api key            → Skipped (silently)                           │
//! │    GET heartbeat (bounded timeout)                                      │
//! │    classify_heartbeat(status, body):                                    │
//! │      Deleted      → store.delete(), count = 0, DeviceDeleted event      │
//! │      Alive(n)     → if n changed: count = n, MessageCountChanged event  │
//! │      AuthRejected → log, keep credentials                               │
//! │      Malformed    → log with raw body                                   │
//! │      Transient    → log                                                 │
//! │    network error  → log                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every iteration is isolated: no outcome stops the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use kiosk_core::{classify_heartbeat, DeletionReason, HeartbeatState, HeartbeatVerdict};

use crate::api::BackendClient;
use crate::error::AgentResult;
use crate::events::{AgentEvent, EventBus};
use crate::shutdown::{stopped, StopSignal};
use crate::store::CredentialStore;

/// What one check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Not activated yet.
    Skipped,
    Alive { message_count: u64, changed: bool },
    Deleted(DeletionReason),
    AuthRejected(u16),
    Malformed,
    Transient(u16),
}

pub struct HeartbeatMonitor {
    client: BackendClient,
    store: CredentialStore,
    events: EventBus,
    interval: Duration,
    timeout: Duration,
    state: Arc<RwLock<HeartbeatState>>,
}

impl HeartbeatMonitor {
    pub fn new(
        client: BackendClient,
        store: CredentialStore,
        events: EventBus,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        HeartbeatMonitor {
            client,
            store,
            events,
            interval,
            timeout,
            state: Arc::new(RwLock::new(HeartbeatState::default())),
        }
    }

    pub async fn message_count(&self) -> u64 {
        self.state.read().await.message_count
    }

    pub async fn state(&self) -> HeartbeatState {
        self.state.read().await.clone()
    }

    /// Shared view of the state for status reporting.
    pub fn state_handle(&self) -> Arc<RwLock<HeartbeatState>> {
        self.state.clone()
    }

    /// One liveness check.
    ///
    /// `Err` only for network failures.
    pub async fn check(&self) -> AgentResult<CheckOutcome> {
        let api_key = match self.store.get().and_then(|c| c.api_key().map(str::to_string)) {
            Some(key) => key,
            None => return Ok(CheckOutcome::Skipped),
        };

        let result = self.client.heartbeat(&api_key, self.timeout).await;
        self.state.write().await.last_checked_at = Some(Utc::now());
        let resp = result?;

        match classify_heartbeat(resp.status, &resp.body) {
            HeartbeatVerdict::Deleted(reason) => {
                warn!(reason = %reason, status = resp.status, "Device deleted on backend");
                // The in-memory credentials are gone even if a file survives
                if let Err(e) = self.store.delete().await {
                    error!(error = %e, "Failed to remove credential files");
                }
                self.state.write().await.reset();
                self.events.emit(AgentEvent::DeviceDeleted {
                    reason: reason.to_string(),
                });
                Ok(CheckOutcome::Deleted(reason))
            }

            HeartbeatVerdict::Alive { message_count } => {
                let mut state = self.state.write().await;
                let previous = state.message_count;
                let changed = match message_count {
                    Some(n) => state.record_count(n),
                    None => false,
                };
                let current = state.message_count;
                drop(state);

                if changed {
                    info!(previous, current, "Message count changed");
                    self.events
                        .emit(AgentEvent::MessageCountChanged { previous, current });
                } else {
                    debug!(message_count = current, "Heartbeat ok");
                }
                Ok(CheckOutcome::Alive {
                    message_count: current,
                    changed,
                })
            }

            HeartbeatVerdict::AuthRejected(status) => {
                error!(status, "Heartbeat rejected the API key; credentials kept");
                Ok(CheckOutcome::AuthRejected(status))
            }

            HeartbeatVerdict::Malformed { raw } => {
                warn!(status = resp.status, raw = %raw, "Unparseable heartbeat response");
                Ok(CheckOutcome::Malformed)
            }

            HeartbeatVerdict::Transient { status } => {
                warn!(status, body = %resp.body, "Heartbeat failed, retrying next interval");
                Ok(CheckOutcome::Transient(status))
            }
        }
    }

    /// Runs until `stop`: check immediately, then every interval.
    pub async fn run(self: Arc<Self>, mut stop: StopSignal) {
        info!(interval = ?self.interval, "Heartbeat monitor starting");
        self.state.write().await.reset();

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stopped(&mut stop) => break,
            }

            tokio::select! {
                result = self.check() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Heartbeat check failed");
                    }
                }
                _ = stopped(&mut stop) => break,
            }
        }

        info!("Heartbeat monitor stopped");
    }
}
