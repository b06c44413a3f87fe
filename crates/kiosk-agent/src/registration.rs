//! # Registration State Machine
//!
//! Drives the device from "nothing on disk" to "API key issued".
//!
//! ## States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Unregistered ──request_claim()──► QrIssued ──poll──► Claimed          │
//! │                                        │                 │              │
//! │                                        └──────poll───────┴──► Activated │
//! │                                                                         │
//! │  cancel() from any non-terminal state ──► Cancelled                     │
//! │                                                                         │
//! │  Every successful poll re-persists credentials, key or no key.          │
//! │  Non-2xx polls change nothing. There is no timeout: a human has to      │
//! │  walk up and scan the code.                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Resume
//! On launch [`RegistrationMachine::resume`] reads the stored credentials.
//! QrIssued/Claimed go straight back to polling with the stored id and
//! token; the claim request is not repeated.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use kiosk_core::{BranchInfo, DeviceCredentials, DeviceStatus};

use crate::api::BackendClient;
use crate::error::{AgentError, AgentResult};
use crate::events::{AgentEvent, EventBus};
use crate::shutdown::{stopped, StopSignal};
use crate::store::CredentialStore;

// =============================================================================
// Registration State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    QrIssued,
    Claimed,
    Activated,
    Cancelled,
}

impl RegistrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistrationState::Activated)
    }
}

impl From<DeviceStatus> for RegistrationState {
    fn from(status: DeviceStatus) -> Self {
        match status {
            DeviceStatus::QrIssued => RegistrationState::QrIssued,
            DeviceStatus::Claimed => RegistrationState::Claimed,
            DeviceStatus::Activated => RegistrationState::Activated,
        }
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "unregistered"),
            RegistrationState::QrIssued => write!(f, "qr_issued"),
            RegistrationState::Claimed => write!(f, "claimed"),
            RegistrationState::Activated => write!(f, "activated"),
            RegistrationState::Cancelled => write!(f, "cancelled"),
        }
    }
}

// =============================================================================
// Claim Ticket
// =============================================================================

/// What the QR screen needs to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTicket {
    pub assigned_guid: String,

    /// Base64 PNG exactly as the backend sent it.
    pub qr_code_image: Option<String>,

    pub claim_url: Option<String>,

    /// Last path segment of `claim_url`, for typing in by hand.
    pub activation_code: Option<String>,
}

impl ClaimTicket {
    pub fn new(assigned_guid: String, qr_code_image: Option<String>, claim_url: Option<String>) -> Self {
        let activation_code = claim_url.as_deref().and_then(activation_code_from_url);
        ClaimTicket {
            assigned_guid,
            qr_code_image,
            claim_url,
            activation_code,
        }
    }

    /// The image payload without any `data:image/png;base64,` prefix.
    pub fn qr_png_base64(&self) -> Option<&str> {
        self.qr_code_image
            .as_deref()
            .map(|img| match img.split_once(',') {
                Some((prefix, data)) if prefix.starts_with("data:") => data,
                _ => img,
            })
    }
}

fn activation_code_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

// =============================================================================
// Canceller
// =============================================================================

/// Stops a running [`RegistrationMachine::run_until_activated`].
///
/// Persisted partial state stays on disk and is resumed on next launch.
/// Cancelling while no run is in progress has no lasting effect: the next
/// run starts uncancelled.
#[derive(Debug, Clone)]
pub struct RegistrationCanceller {
    tx: Arc<watch::Sender<bool>>,
}

impl RegistrationCanceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

// =============================================================================
// Registration Machine
// =============================================================================

pub struct RegistrationMachine {
    client: BackendClient,
    store: CredentialStore,
    events: EventBus,
    device_type: u32,
    poll_interval: Duration,
    state: Arc<RwLock<RegistrationState>>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl RegistrationMachine {
    pub fn new(
        client: BackendClient,
        store: CredentialStore,
        events: EventBus,
        device_type: u32,
        poll_interval: Duration,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        RegistrationMachine {
            client,
            store,
            events,
            device_type,
            poll_interval,
            state: Arc::new(RwLock::new(RegistrationState::Unregistered)),
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    pub async fn state(&self) -> RegistrationState {
        *self.state.read().await
    }

    /// Shared view of the state for status reporting.
    pub fn state_handle(&self) -> Arc<RwLock<RegistrationState>> {
        self.state.clone()
    }

    pub fn canceller(&self) -> RegistrationCanceller {
        RegistrationCanceller {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Re-enters the state implied by the stored credentials.
    pub async fn resume(&self) -> RegistrationState {
        let state = match self.store.get() {
            Some(creds) => RegistrationState::from(creds.device_status),
            None => RegistrationState::Unregistered,
        };
        self.transition(state).await;
        state
    }

    /// Issues a claim request and persists the fresh identity as QrIssued.
    ///
    /// On failure nothing is persisted and the state stays Unregistered.
    pub async fn request_claim(&self) -> AgentResult<ClaimTicket> {
        let resp = self.client.request_claim(self.device_type).await?;

        let assigned_guid = resp
            .assigned_guid
            .filter(|g| !g.trim().is_empty())
            .ok_or_else(|| AgentError::Validation("claim response has no assignedGuid".into()))?;
        let access_token = resp
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AgentError::Validation("claim response has no accessToken".into()))?;

        self.store
            .set(DeviceCredentials::issued(assigned_guid.clone(), access_token))
            .await?;

        let ticket = ClaimTicket::new(assigned_guid, resp.qr_code_image, resp.url);
        info!(
            assigned_guid = %ticket.assigned_guid,
            activation_code = ?ticket.activation_code,
            has_qr_image = ticket.qr_code_image.is_some(),
            "Claim code issued"
        );

        self.transition(RegistrationState::QrIssued).await;
        self.events.emit(AgentEvent::ClaimIssued(ticket.clone()));
        Ok(ticket)
    }

    /// One status poll.
    ///
    /// Re-persists on every 2xx. Fetches branch info once on activation;
    /// a failed branch fetch does not block activation.
    pub async fn poll_status(&self) -> AgentResult<RegistrationState> {
        let mut creds = self.store.get().ok_or(AgentError::NotRegistered)?;
        if creds.is_activated() {
            self.transition(RegistrationState::Activated).await;
            return Ok(RegistrationState::Activated);
        }

        let resp = self
            .client
            .device_status(&creds.assigned_guid, &creds.access_token)
            .await?;

        creds.observe(
            resp.device_status.as_deref().unwrap_or_default(),
            resp.api_key,
            resp.branch_id,
            resp.branch,
        );
        self.store.set(creds.clone()).await?;

        let state = RegistrationState::from(creds.device_status);
        debug!(status = %state, branch_id = ?creds.branch_id, "Device status polled");
        self.transition(state).await;

        if state == RegistrationState::Activated {
            info!(assigned_guid = %creds.assigned_guid, "Device activated");
            self.events.emit(AgentEvent::Activated {
                assigned_guid: creds.assigned_guid.clone(),
            });
            if let Err(e) = self.ensure_branch_info().await {
                warn!(error = %e, "Branch fetch failed, will retry later");
            }
        }

        Ok(state)
    }

    /// Fetches and stores branch info if activated and not yet stored.
    pub async fn ensure_branch_info(&self) -> AgentResult<Option<BranchInfo>> {
        if let Some(existing) = self.store.branch().await {
            return Ok(Some(existing));
        }
        let creds = match self.store.get() {
            Some(c) if c.is_activated() => c,
            _ => return Ok(None),
        };
        let api_key = creds.api_key().ok_or(AgentError::NotActivated)?;

        let info = self.client.branch_info(api_key).await?;
        self.store.set_branch(info.clone()).await?;
        Ok(Some(info))
    }

    /// Claims (if needed) and polls until activated, cancelled or stopped.
    ///
    /// Claim request failures are retried every poll interval. In-flight
    /// requests are abandoned as soon as stop or cancel fires.
    pub async fn run_until_activated(&self, mut stop: StopSignal) -> AgentResult<DeviceCredentials> {
        // A cancel only applies to the run it was issued during
        self.cancel_tx.send_replace(false);
        let mut cancel = self.cancel_tx.subscribe();

        let mut state = self.resume().await;
        info!(state = %state, "Registration starting");

        let mut interval =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop.borrow() {
                return self.stopped_early();
            }
            if *cancel.borrow() {
                return self.cancelled().await;
            }

            match state {
                RegistrationState::Activated => {
                    tokio::select! {
                        result = self.ensure_branch_info() => {
                            if let Err(e) = result {
                                warn!(error = %e, "Branch fetch failed, will retry later");
                            }
                        }
                        _ = stopped(&mut stop) => return self.stopped_early(),
                    }
                    return self.store.get().ok_or(AgentError::NotRegistered);
                }
                RegistrationState::Unregistered | RegistrationState::Cancelled => {
                    let claimed = tokio::select! {
                        result = self.request_claim() => result,
                        _ = stopped(&mut stop) => return self.stopped_early(),
                        _ = cancel_requested(&mut cancel) => return self.cancelled().await,
                    };
                    match claimed {
                        Ok(_) => {
                            state = RegistrationState::QrIssued;
                            interval.reset();
                            continue;
                        }
                        Err(e) => warn!(error = %e, "Claim request failed, retrying"),
                    }
                }
                RegistrationState::QrIssued | RegistrationState::Claimed => {}
            }

            tokio::select! {
                _ = interval.tick() => {}
                _ = stopped(&mut stop) => return self.stopped_early(),
                _ = cancel_requested(&mut cancel) => return self.cancelled().await,
            }

            if matches!(state, RegistrationState::QrIssued | RegistrationState::Claimed) {
                let polled = tokio::select! {
                    result = self.poll_status() => result,
                    _ = stopped(&mut stop) => return self.stopped_early(),
                    _ = cancel_requested(&mut cancel) => return self.cancelled().await,
                };
                match polled {
                    Ok(next) => state = next,
                    Err(AgentError::NotRegistered) => state = RegistrationState::Unregistered,
                    Err(e) => warn!(error = %e, "Status poll failed"),
                }
            }
        }
    }

    fn stopped_early(&self) -> AgentResult<DeviceCredentials> {
        info!("Registration stopped");
        Err(AgentError::ShuttingDown)
    }

    async fn cancelled(&self) -> AgentResult<DeviceCredentials> {
        info!("Registration cancelled");
        self.transition(RegistrationState::Cancelled).await;
        Err(AgentError::Cancelled)
    }

    async fn transition(&self, next: RegistrationState) {
        let mut state = self.state.write().await;
        if *state != next {
            debug!(from = %*state, to = %next, "Registration state changed");
            *state = next;
            self.events.emit(AgentEvent::RegistrationStateChanged(next));
        }
    }
}

/// Resolves once cancel is requested. Never resolves if the sender is gone.
async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
