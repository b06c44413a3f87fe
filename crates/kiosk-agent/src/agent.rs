//! # Kiosk Agent
//!
//! Orchestrator: builds every component from one `AgentConfig` and runs the
//! four background activities until shutdown.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        KioskAgent::start(config)                        │
//! │                                                                         │
//! │  CredentialStore::open + load          MediaCache::open (recovery)      │
//! │                                                                         │
//! │  ┌──────────────────┐ ┌──────────────────┐ ┌────────────────────────┐  │
//! │  │ registration     │ │ heartbeat        │ │ content sync           │  │
//! │  │ loop             │ │ loop             │ │ loop + download pool   │  │
//! │  │                  │ │                  │ │                        │  │
//! │  │ run_until_       │ │ check() every    │ │ snapshot, fetch,       │  │
//! │  │ activated, then  │ │ interval; only   │ │ notifications,         │  │
//! │  │ wait for creds   │ │ writer allowed   │ │ pause on deletion      │  │
//! │  │ to disappear     │ │ to delete creds  │ │                        │  │
//! │  └────────┬─────────┘ └────────┬─────────┘ └───────────▲────────────┘  │
//! │           │                    │                       │ mpsc           │
//! │           └──── store.subscribe() (watch) ─────────────┤                │
//! │                                              ┌─────────┴────────────┐  │
//! │                                              │ notification feed    │  │
//! │                                              │ (when notify_url)    │  │
//! │                                              └──────────────────────┘  │
//! │                                                                         │
//! │  AgentHandle: status(), subscribe(), updates_sender(), shutdown()       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Deletion flow: the heartbeat wipes the store, the watch fires, the
//! synchronizer pauses and the registration loop starts a fresh claim.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kiosk_core::UpdateNotification;

use crate::api::BackendClient;
use crate::cache::{CacheUsage, MediaCache};
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::events::{AgentEvent, EventBus};
use crate::heartbeat::HeartbeatMonitor;
use crate::notify::{FeedConfig, NotificationFeed};
use crate::registration::{RegistrationCanceller, RegistrationMachine, RegistrationState};
use crate::shutdown::{stop_channel, stopped, StopSender, StopSignal};
use crate::store::CredentialStore;
use crate::synchronizer::{ContentSynchronizer, PlayableItem};

const UPDATE_CHANNEL_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Agent Status
// =============================================================================

/// Point-in-time view of the whole agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStatus {
    pub registration: RegistrationState,
    pub assigned_guid: Option<String>,
    pub message_count: u64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub playlist_id: Option<String>,
    pub playlist_version: Option<String>,
    pub item_count: usize,
    pub ready_count: usize,
    pub skipped_count: usize,
    pub pending_downloads: usize,
    pub cache: CacheUsage,
    /// True while the device has no activated credentials.
    pub sync_paused: bool,
}

// =============================================================================
// Kiosk Agent
// =============================================================================

pub struct KioskAgent;

impl KioskAgent {
    /// Builds all components and spawns the background loops.
    pub async fn start(config: AgentConfig) -> AgentResult<AgentHandle> {
        config.validate()?;

        let state_dir = config.state_dir();
        let cache_dir = config.cache_dir();
        info!(
            base_url = %config.backend.base_url,
            state_dir = %state_dir.display(),
            cache_dir = %cache_dir.display(),
            "Starting kiosk agent"
        );

        let client = BackendClient::new(&config)?;
        let events = EventBus::new();

        let store = CredentialStore::open(&state_dir).await?;
        match store.load().await? {
            Some(creds) => info!(status = %creds.device_status, "Stored credentials found"),
            None => info!("No stored credentials, device will register"),
        }

        let cache = Arc::new(MediaCache::open(&cache_dir, config.cache.max_bytes, client.clone()).await?);

        let registration = Arc::new(RegistrationMachine::new(
            client.clone(),
            store.clone(),
            events.clone(),
            config.device.device_type,
            config.registration_poll_interval(),
        ));

        let heartbeat = Arc::new(HeartbeatMonitor::new(
            client.clone(),
            store.clone(),
            events.clone(),
            config.heartbeat_interval(),
            Duration::from_secs(config.heartbeat.timeout_secs),
        ));

        let synchronizer = ContentSynchronizer::new(
            client.clone(),
            store.clone(),
            cache.clone(),
            events.clone(),
            config.sync.clone(),
        );

        let (stop_tx, stop_rx) = stop_channel();
        let (updates_tx, updates_rx) = mpsc::channel::<UpdateNotification>(UPDATE_CHANNEL_CAPACITY);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(registration_loop(
            registration.clone(),
            store.clone(),
            stop_rx.clone(),
        )));
        tasks.push(tokio::spawn(heartbeat.clone().run(stop_rx.clone())));
        tasks.push(tokio::spawn(synchronizer.clone().run(stop_rx.clone(), updates_rx)));

        match config.backend.notify_url.clone() {
            Some(url) => {
                let mut feed_config = FeedConfig::new(url);
                feed_config.max_backoff = Duration::from_secs(config.sync.max_backoff_secs.max(1));
                let feed = NotificationFeed::new(feed_config, store.clone(), updates_tx.clone());
                tasks.push(tokio::spawn(feed.run(stop_rx.clone())));
            }
            None => debug!("No notify_url configured, notification feed disabled"),
        }

        info!("Kiosk agent started");

        Ok(AgentHandle {
            stop: Arc::new(stop_tx),
            tasks: Arc::new(Mutex::new(tasks)),
            events,
            store,
            cache,
            synchronizer,
            heartbeat,
            registration_state: registration.state_handle(),
            canceller: registration.canceller(),
            updates_tx,
        })
    }
}

/// Registers, then waits for the credentials to be wiped and registers again.
async fn registration_loop(
    machine: Arc<RegistrationMachine>,
    store: CredentialStore,
    mut stop: StopSignal,
) {
    let mut creds_rx = store.subscribe();

    loop {
        match machine.run_until_activated(stop.clone()).await {
            Ok(creds) => info!(assigned_guid = %creds.assigned_guid, "Device is activated"),
            Err(AgentError::ShuttingDown) => break,
            Err(AgentError::Cancelled) => {
                info!("Registration cancelled, loop exiting");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Registration ended unexpectedly, restarting");
                continue;
            }
        }

        let cleared = async {
            creds_rx
                .wait_for(|c| !c.as_ref().is_some_and(|c| c.is_activated()))
                .await
                .is_ok()
        };
        tokio::select! {
            ok = cleared => {
                if !ok {
                    break;
                }
                info!("Credentials cleared, restarting registration");
            }
            _ = stopped(&mut stop) => break,
        }
    }

    debug!("Registration loop stopped");
}

// =============================================================================
// Agent Handle
// =============================================================================

/// Handle for querying and controlling a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    stop: Arc<StopSender>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    events: EventBus,
    store: CredentialStore,
    cache: Arc<MediaCache>,
    synchronizer: ContentSynchronizer,
    heartbeat: Arc<HeartbeatMonitor>,
    registration_state: Arc<RwLock<RegistrationState>>,
    canceller: RegistrationCanceller,
    updates_tx: mpsc::Sender<UpdateNotification>,
}

impl AgentHandle {
    pub async fn status(&self) -> AgentStatus {
        let registration = *self.registration_state.read().await;
        let heartbeat = self.heartbeat.state().await;
        let playlist = self.synchronizer.playlist().await;
        let ready_count = self.synchronizer.playable_items().await.len();

        AgentStatus {
            registration,
            assigned_guid: self.store.get().map(|c| c.assigned_guid),
            message_count: heartbeat.message_count,
            last_heartbeat_at: heartbeat.last_checked_at,
            playlist_id: playlist.playlist_id.clone(),
            playlist_version: playlist.version.clone(),
            item_count: playlist.len(),
            ready_count,
            skipped_count: self.synchronizer.skipped_items().len(),
            pending_downloads: self.synchronizer.pending_downloads(),
            cache: self.cache.usage().await,
            sync_paused: self.synchronizer.is_paused(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Channel for an external real-time transport to deliver notifications.
    pub fn updates_sender(&self) -> mpsc::Sender<UpdateNotification> {
        self.updates_tx.clone()
    }

    pub async fn playable_items(&self) -> Vec<PlayableItem> {
        self.synchronizer.playable_items().await
    }

    pub fn state_dir(&self) -> PathBuf {
        self.store.dir().to_path_buf()
    }

    /// Stops a claim flow in progress. Heartbeat and content sync keep
    /// running, and a registration restarted after deletion is unaffected.
    pub fn cancel_registration(&self) {
        self.canceller.cancel();
    }

    /// Signals every loop to stop and waits briefly for them to exit.
    pub async fn shutdown(&self) {
        if self.stop.is_stopped() {
            return;
        }
        info!("Shutting down kiosk agent");
        self.stop.stop();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Agent task failed"),
                Err(_) => warn!("Agent task did not stop in time"),
            }
        }
        info!("Kiosk agent stopped");
    }
}
