//! # Content Synchronizer
//!
//! Owns the active playlist and keeps the media cache stocked for it.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ContentSynchronizer                                │
//! │                                                                         │
//! │  startup ──► load_snapshot() (last-known-good from playlist.json)       │
//! │          └─► load_full_playlist() once activated                        │
//! │                                                                         │
//! │  notification ──► apply_update()                                        │
//! │     refresh → load_full_playlist()                                      │
//! │     add     → upsert, re-sort, schedule download                        │
//! │     remove  → drop item (cache entry left for LRU)                      │
//! │     update  → patch fields, re-schedule if url changed                  │
//! │                                                                         │
//! │  credentials deleted ──► pause()   (no new downloads)                   │
//! │  activated again     ──► resume() + load_full_playlist()                │
//! │                                                                         │
//! │  DOWNLOAD POOL                                                         │
//! │  ─────────────                                                         │
//! │  schedule(item) ──► tokio task ──► Semaphore(N) ──► cache.ensure(item)  │
//! │     up to max_attempts with exponential backoff, then Failed (skipped)  │
//! │     CacheFull skips immediately                                         │
//! │     results for an item whose url changed meanwhile are dropped         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed fetch never replaces the playlist: the previous one keeps
//! playing until a fetch succeeds.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use kiosk_core::{
    CoreError, MediaItem, Playlist, PlaylistUpdate, UpdateNotification, UpsertOutcome,
};

use crate::api::BackendClient;
use crate::cache::MediaCache;
use crate::config::SyncSettings;
use crate::error::{AgentError, AgentResult};
use crate::events::{AgentEvent, EventBus};
use crate::shutdown::{stopped, StopSignal};
use crate::store::{write_json_atomic, CredentialStore};

pub const SNAPSHOT_FILE: &str = "playlist.json";

/// How long `run` waits for in-flight downloads to let go after stop.
const DOWNLOAD_DRAIN_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Download Tasks
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Pending,
    InFlight,
    Succeeded,
    /// Retries exhausted or no cache room. Excluded from playback.
    Failed,
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadState::Pending => write!(f, "pending"),
            DownloadState::InFlight => write!(f, "in_flight"),
            DownloadState::Succeeded => write!(f, "succeeded"),
            DownloadState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub item: MediaItem,
    pub attempts: u32,
    pub state: DownloadState,
    pub local_path: Option<PathBuf>,
    pub last_error: Option<String>,
    /// A worker exists for this task (running or waiting for a permit).
    queued: bool,
}

impl DownloadTask {
    fn new(item: MediaItem) -> Self {
        DownloadTask {
            item,
            attempts: 0,
            state: DownloadState::Pending,
            local_path: None,
            last_error: None,
            queued: false,
        }
    }
}

/// An item that can be shown right now.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableItem {
    pub item: MediaItem,
    pub path: PathBuf,
}

// =============================================================================
// Content Synchronizer
// =============================================================================

#[derive(Clone)]
pub struct ContentSynchronizer {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    client: BackendClient,
    store: CredentialStore,
    cache: Arc<MediaCache>,
    events: EventBus,
    settings: SyncSettings,
    snapshot_path: PathBuf,
    playlist: RwLock<Playlist>,
    tasks: Mutex<HashMap<String, DownloadTask>>,
    permits: Semaphore,
    paused: AtomicBool,
    needs_refresh: AtomicBool,
    /// Set once on shutdown; every download worker watches it.
    halt: watch::Sender<bool>,
}

impl ContentSynchronizer {
    pub fn new(
        client: BackendClient,
        store: CredentialStore,
        cache: Arc<MediaCache>,
        events: EventBus,
        settings: SyncSettings,
    ) -> Self {
        let snapshot_path = store.dir().join(SNAPSHOT_FILE);
        let permits = Semaphore::new(settings.max_concurrent_downloads.max(1));
        let (halt, _) = watch::channel(false);

        ContentSynchronizer {
            inner: Arc::new(SyncInner {
                client,
                store,
                cache,
                events,
                settings,
                snapshot_path,
                playlist: RwLock::new(Playlist::empty()),
                tasks: Mutex::new(HashMap::new()),
                permits,
                paused: AtomicBool::new(false),
                needs_refresh: AtomicBool::new(false),
                halt,
            }),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn playlist(&self) -> Playlist {
        self.inner.playlist.read().await.clone()
    }

    /// Items in playback order that are downloaded and not skipped.
    pub async fn playable_items(&self) -> Vec<PlayableItem> {
        let playlist = self.inner.playlist.read().await;
        let tasks = self.tasks();

        playlist
            .items()
            .iter()
            .filter_map(|item| {
                let task = tasks.get(&item.id)?;
                match (&task.state, &task.local_path) {
                    (DownloadState::Succeeded, Some(path))
                        if task.item.source_url == item.source_url =>
                    {
                        Some(PlayableItem {
                            item: item.clone(),
                            path: path.clone(),
                        })
                    }
                    _ => None,
                }
            })
            .collect()
    }

    pub fn download_state(&self, item_id: &str) -> Option<DownloadTask> {
        self.tasks().get(item_id).cloned()
    }

    /// Ids of items whose downloads were given up on.
    pub fn skipped_items(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks()
            .values()
            .filter(|t| t.state == DownloadState::Failed)
            .map(|t| t.item.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Tasks still waiting or downloading.
    pub fn pending_downloads(&self) -> usize {
        self.tasks()
            .values()
            .filter(|t| matches!(t.state, DownloadState::Pending | DownloadState::InFlight))
            .count()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Playlist Loading
    // =========================================================================

    /// Restores the last-known-good playlist from disk. Returns false if none.
    pub async fn load_snapshot(&self) -> AgentResult<bool> {
        let raw = match tokio::fs::read_to_string(&self.inner.snapshot_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let parsed = match Playlist::parse(&raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Ignoring corrupt playlist snapshot");
                return Ok(false);
            }
        };

        info!(
            playlist_id = ?parsed.playlist.playlist_id,
            items = parsed.playlist.len(),
            "Restored playlist snapshot"
        );
        self.install(parsed.playlist, false).await;
        Ok(true)
    }

    /// Fetches the playlist and replaces the current one wholesale.
    ///
    /// On any failure the current playlist stays active.
    pub async fn load_full_playlist(&self) -> AgentResult<()> {
        let result = self.fetch_and_install().await;
        self.inner
            .needs_refresh
            .store(result.is_err(), Ordering::SeqCst);
        if let Err(ref e) = result {
            if e.is_auth_error() {
                error!(error = %e, "Playlist endpoint rejected the API key");
            }
        }
        result
    }

    async fn fetch_and_install(&self) -> AgentResult<()> {
        let creds = self.inner.store.get().ok_or(AgentError::NotActivated)?;
        let api_key = creds.api_key().ok_or(AgentError::NotActivated)?;

        let raw = self.inner.client.fetch_playlist(api_key).await?;
        let parsed = Playlist::parse(&raw).map_err(|e| AgentError::parse(e, raw.clone()))?;

        for rejected in &parsed.rejected {
            warn!(item_id = ?rejected.id, reason = %rejected.reason, "Rejected playlist item");
        }
        info!(
            playlist_id = ?parsed.playlist.playlist_id,
            version = ?parsed.playlist.version,
            items = parsed.playlist.len(),
            rejected = parsed.rejected.len(),
            "Playlist loaded"
        );

        self.install(parsed.playlist, true).await;
        Ok(())
    }

    /// Swaps in `fresh`, drops tasks for vanished items, schedules the rest.
    async fn install(&self, fresh: Playlist, persist: bool) {
        {
            let mut playlist = self.inner.playlist.write().await;
            playlist.replace(fresh);
        }

        let items = self.inner.playlist.read().await.items().to_vec();
        {
            let mut tasks = self.tasks();
            tasks.retain(|id, task| {
                items
                    .iter()
                    .any(|i| &i.id == id && i.source_url == task.item.source_url)
            });
            // A refresh gives skipped items another chance
            tasks.retain(|_, task| task.state != DownloadState::Failed);
        }

        self.after_mutation(persist).await;
        for item in items {
            self.schedule(item);
        }
    }

    // =========================================================================
    // Incremental Updates
    // =========================================================================

    /// Parses and applies one notification.
    pub async fn apply_update(&self, notification: UpdateNotification) -> AgentResult<()> {
        let update = notification.into_update()?;
        self.apply(update).await
    }

    /// Applies an already-validated update.
    pub async fn apply(&self, update: PlaylistUpdate) -> AgentResult<()> {
        debug!(action = %update.action(), "Applying playlist update");

        match update {
            PlaylistUpdate::Refresh => self.load_full_playlist().await,

            PlaylistUpdate::Add(item) => {
                let outcome = self.inner.playlist.write().await.upsert(item.clone());
                self.after_mutation(true).await;

                match outcome {
                    UpsertOutcome::Added => {
                        info!(item_id = %item.id, "Playlist item added");
                        self.schedule(item);
                    }
                    UpsertOutcome::Updated { source_changed } => {
                        info!(item_id = %item.id, source_changed, "Existing item re-added, treated as update");
                        self.reschedule(item, source_changed);
                    }
                }
                Ok(())
            }

            PlaylistUpdate::Remove(id) => {
                let removed = self.inner.playlist.write().await.remove(&id);
                match removed {
                    Some(_) => {
                        self.tasks().remove(&id);
                        self.after_mutation(true).await;
                        info!(item_id = %id, "Playlist item removed");
                    }
                    None => debug!(item_id = %id, "Remove for unknown item ignored"),
                }
                Ok(())
            }

            PlaylistUpdate::Update(patch) => {
                let result = self.inner.playlist.write().await.apply_patch(&patch);
                match result {
                    Ok((item, source_changed)) => {
                        self.after_mutation(true).await;
                        info!(item_id = %item.id, source_changed, "Playlist item updated");
                        self.reschedule(item, source_changed);
                        Ok(())
                    }
                    Err(CoreError::ItemNotFound(id)) => {
                        warn!(item_id = %id, "Update for unknown item ignored");
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Persists, re-pins and announces the current playlist.
    async fn after_mutation(&self, persist: bool) {
        let playlist = self.inner.playlist.read().await.clone();

        if persist {
            if let Err(e) = write_json_atomic(&self.inner.snapshot_path, &playlist).await {
                error!(error = %e, "Failed to persist playlist snapshot");
            }
        }

        self.inner.cache.set_referenced(playlist.referenced_urls()).await;
        self.inner.events.emit(AgentEvent::PlaylistChanged {
            playlist_id: playlist.playlist_id.clone(),
            version: playlist.version.clone(),
            item_count: playlist.len(),
        });
    }

    // =========================================================================
    // Pause / Resume
    // =========================================================================

    /// Stops scheduling new downloads. In-flight ones finish.
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!("Content sync paused");
        }
    }

    /// Re-queues anything left pending while paused.
    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("Content sync resumed");
        }
        let idle: Vec<MediaItem> = self
            .tasks()
            .values()
            .filter(|t| t.state == DownloadState::Pending && !t.queued)
            .map(|t| t.item.clone())
            .collect();
        for item in idle {
            self.spawn_download(item);
        }
    }

    // =========================================================================
    // Download Scheduling
    // =========================================================================

    /// Schedules `item` unless a task for the same url is already live or done.
    fn schedule(&self, item: MediaItem) {
        {
            let mut tasks = self.tasks();
            if let Some(task) = tasks.get_mut(&item.id) {
                if task.item.source_url == item.source_url && task.state != DownloadState::Failed {
                    task.item = item;
                    return;
                }
            }
            tasks.insert(item.id.clone(), DownloadTask::new(item.clone()));
        }
        self.spawn_download(item);
    }

    fn reschedule(&self, item: MediaItem, source_changed: bool) {
        if source_changed {
            self.tasks().remove(&item.id);
        }
        self.schedule(item);
    }

    fn spawn_download(&self, item: MediaItem) {
        if *self.inner.halt.borrow() {
            return;
        }
        if self.is_paused() {
            debug!(item_id = %item.id, "Paused, download left pending");
            return;
        }
        if let Some(task) = self.tasks().get_mut(&item.id) {
            if task.queued {
                return;
            }
            task.queued = true;
        }

        let this = self.clone();
        tokio::spawn(async move { this.download_worker(item).await });
    }

    async fn download_worker(self, item: MediaItem) {
        let max_attempts = self.inner.settings.max_attempts.max(1);
        let mut backoff = retry_backoff(&self.inner.settings);
        let mut halt = self.inner.halt.subscribe();

        loop {
            let permit = tokio::select! {
                permit = self.inner.permits.acquire() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = stopped(&mut halt) => return self.abandon(&item),
            };

            if self.is_paused() {
                self.update_task(&item, |t| {
                    t.state = DownloadState::Pending;
                    t.queued = false;
                });
                return;
            }
            if !self.is_current(&item).await {
                debug!(item_id = %item.id, "Item changed before download, dropping task");
                return;
            }

            let attempt = self
                .update_task(&item, |t| {
                    t.state = DownloadState::InFlight;
                    t.attempts += 1;
                })
                .map(|t| t.attempts)
                .unwrap_or(max_attempts);

            let result = tokio::select! {
                result = self.inner.cache.ensure(&item) => result,
                _ = stopped(&mut halt) => {
                    debug!(item_id = %item.id, "Download abandoned on shutdown");
                    return self.abandon(&item);
                }
            };
            drop(permit);

            if !self.is_current(&item).await {
                debug!(item_id = %item.id, "Item changed during download, result dropped");
                return;
            }

            match result {
                Ok(entry) => {
                    self.update_task(&item, |t| {
                        t.state = DownloadState::Succeeded;
                        t.local_path = Some(entry.local_path.clone());
                        t.last_error = None;
                        t.queued = false;
                    });
                    debug!(item_id = %item.id, attempt, "Media ready");
                    self.inner.events.emit(AgentEvent::ItemReady {
                        item_id: item.id.clone(),
                        path: entry.local_path,
                    });
                    return;
                }
                Err(e) => {
                    let give_up = !e.is_retryable() || attempt >= max_attempts;
                    let message = e.to_string();
                    self.update_task(&item, |t| t.last_error = Some(message.clone()));

                    if give_up {
                        warn!(item_id = %item.id, attempt, error = %message, "Skipping item");
                        self.update_task(&item, |t| {
                            t.state = DownloadState::Failed;
                            t.queued = false;
                        });
                        self.inner.events.emit(AgentEvent::ItemSkipped {
                            item_id: item.id.clone(),
                            reason: message,
                        });
                        return;
                    }

                    let wait = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_secs(self.inner.settings.max_backoff_secs));
                    warn!(item_id = %item.id, attempt, error = %message, retry_in = ?wait, "Download failed");
                    self.update_task(&item, |t| t.state = DownloadState::Pending);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = stopped(&mut halt) => return self.abandon(&item),
                    }
                }
            }
        }
    }

    /// Leaves the task pending so a later run can pick it up.
    fn abandon(&self, item: &MediaItem) {
        self.update_task(item, |t| {
            t.state = DownloadState::Pending;
            t.queued = false;
        });
    }

    /// True if `item`'s id still maps to the same url in the playlist and task table.
    async fn is_current(&self, item: &MediaItem) -> bool {
        let in_playlist = self
            .inner
            .playlist
            .read()
            .await
            .get(&item.id)
            .is_some_and(|i| i.source_url == item.source_url);
        let in_tasks = self
            .tasks()
            .get(&item.id)
            .is_some_and(|t| t.item.source_url == item.source_url);
        in_playlist && in_tasks
    }

    fn update_task<F>(&self, item: &MediaItem, f: F) -> Option<DownloadTask>
    where
        F: FnOnce(&mut DownloadTask),
    {
        let mut tasks = self.tasks();
        let task = tasks.get_mut(&item.id)?;
        if task.item.source_url != item.source_url {
            return None;
        }
        f(task);
        Some(task.clone())
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, DownloadTask>> {
        match self.inner.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stops every download worker and waits briefly for in-flight ones.
    ///
    /// Final: no download is started afterwards.
    pub async fn halt_downloads(&self) {
        self.pause();
        self.inner.halt.send_replace(true);

        let pool = self.inner.settings.max_concurrent_downloads.max(1) as u32;
        match tokio::time::timeout(DOWNLOAD_DRAIN_GRACE, self.inner.permits.acquire_many(pool)).await {
            Ok(Ok(_all)) => debug!("Download workers drained"),
            Ok(Err(_)) => {}
            Err(_) => warn!("Download workers did not stop in time"),
        }
    }

    // =========================================================================
    // Main Loop
    // =========================================================================

    /// Runs until `stop`, applying notifications and following credential changes.
    pub async fn run(self, mut stop: StopSignal, mut updates: mpsc::Receiver<UpdateNotification>) {
        info!("Content synchronizer starting");

        if let Err(e) = self.load_snapshot().await {
            warn!(error = %e, "Failed to restore playlist snapshot");
        }

        let mut creds_rx = self.inner.store.subscribe();
        let activated = creds_rx.borrow_and_update().as_ref().is_some_and(|c| c.is_activated());
        if activated {
            self.resume();
            tokio::select! {
                result = self.load_full_playlist() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Initial playlist fetch failed, keeping snapshot");
                    }
                }
                _ = stopped(&mut stop) => {
                    self.halt_downloads().await;
                    info!("Content synchronizer stopped");
                    return;
                }
            }
        } else {
            self.pause();
        }

        let retry_every = Duration::from_secs(self.inner.settings.max_backoff_secs.max(1));
        let mut retry = tokio::time::interval_at(tokio::time::Instant::now() + retry_every, retry_every);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(notification) = updates.recv() => {
                    if self.is_paused() {
                        debug!("Paused, ignoring playlist notification");
                        continue;
                    }
                    tokio::select! {
                        result = self.apply_update(notification) => {
                            if let Err(e) = result {
                                warn!(error = %e, "Failed to apply playlist notification");
                            }
                        }
                        _ = stopped(&mut stop) => break,
                    }
                }

                changed = creds_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let activated = creds_rx.borrow_and_update().as_ref().is_some_and(|c| c.is_activated());
                    match (activated, self.is_paused()) {
                        (true, true) => {
                            self.resume();
                            tokio::select! {
                                result = self.load_full_playlist() => {
                                    if let Err(e) = result {
                                        warn!(error = %e, "Playlist fetch after activation failed");
                                    }
                                }
                                _ = stopped(&mut stop) => break,
                            }
                        }
                        (false, false) => self.pause(),
                        _ => {}
                    }
                }

                _ = retry.tick() => {
                    if !self.is_paused() && self.inner.needs_refresh.load(Ordering::SeqCst) {
                        tokio::select! {
                            result = self.load_full_playlist() => {
                                if let Err(e) = result {
                                    debug!(error = %e, "Playlist retry failed");
                                }
                            }
                            _ = stopped(&mut stop) => break,
                        }
                    }
                }

                _ = stopped(&mut stop) => {
                    break;
                }
            }
        }

        self.halt_downloads().await;
        info!("Content synchronizer stopped");
    }
}

fn retry_backoff(settings: &SyncSettings) -> ExponentialBackoff {
    let initial = Duration::from_millis(settings.initial_backoff_ms);
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        max_interval: Duration::from_secs(settings.max_backoff_secs),
        multiplier: 2.0,
        randomization_factor: 0.1,
        max_elapsed_time: None,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(initial_backoff_ms: u64, max_backoff_secs: u64) -> SyncSettings {
        SyncSettings {
            initial_backoff_ms,
            max_backoff_secs,
            ..SyncSettings::default()
        }
    }

    #[test]
    fn test_first_retry_wait_uses_configured_interval() {
        let mut backoff = retry_backoff(&settings(10, 60));

        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(9) && first <= Duration::from_millis(11));

        let second = backoff.next_backoff().unwrap();
        assert!(second >= Duration::from_millis(18) && second <= Duration::from_millis(22));
    }

    #[test]
    fn test_retry_wait_capped() {
        let mut backoff = retry_backoff(&settings(2000, 5));
        for _ in 0..10 {
            let wait = backoff.next_backoff().unwrap();
            assert!(wait <= Duration::from_millis(5500));
        }
    }

    #[test]
    fn test_download_state_display() {
        assert_eq!(DownloadState::InFlight.to_string(), "in_flight");
        assert_eq!(DownloadState::Failed.to_string(), "failed");
    }
}
