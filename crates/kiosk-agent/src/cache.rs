//! # Media Cache Manager
//!
//! Bounded on-disk store of downloaded media.
//!
//! ## Layout & Invariants
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Media Cache                                    │
//! │                                                                         │
//! │  <cache_dir>/                                                           │
//! │    3f7a...c2.jpg          ← key = sha256(source url) + extension        │
//! │    91bd...04.mp4                                                        │
//! │    91bd...04.<uuid>.part  ← in-flight download, never served            │
//! │                                                                         │
//! │  • Σ size_bytes(entries) ≤ max_bytes, checked under the index lock      │
//! │  • keys referenced by the active playlist are pinned, never evicted     │
//! │  • a file only becomes an entry by rename, after validation             │
//! │  • downloads for distinct keys run in parallel (per-key locks)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ensure(item)
//! ```text
//! existing entry ──valid?──► yes: touch, return
//!                    │
//!                    no: delete file + entry
//!                    ▼
//! download → .part → validate (size, checksum) → admit (evict LRU) → rename
//! ```

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kiosk_core::MediaItem;

use crate::api::BackendClient;
use crate::error::{AgentError, AgentResult};
use crate::store::remove_if_exists;

const PART_SUFFIX: &str = ".part";

// =============================================================================
// Cache Entry
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub last_accessed_at: DateTime<Utc>,
    /// False only transiently while an entry is being torn down.
    pub valid: bool,
    /// Known when we downloaded it this run; computed lazily otherwise.
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUsage {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub entries: usize,
    pub pinned: usize,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    pinned: HashSet<String>,
    /// Access sequence numbers; break ties between equal timestamps.
    access_seq: HashMap<String, u64>,
    clock: u64,
}

impl CacheIndex {
    fn used_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.access_seq.insert(key.to_string(), self.clock);
        if let Some(e) = self.entries.get_mut(key) {
            e.last_accessed_at = Utc::now();
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.access_seq.remove(key);
        self.entries.remove(key)
    }

    /// Least recently used unpinned key, excluding `except`.
    fn eviction_candidate(&self, except: &str) -> Option<String> {
        self.entries
            .values()
            .filter(|e| e.key != except && !self.pinned.contains(&e.key))
            .min_by_key(|e| {
                let seq = self.access_seq.get(&e.key).copied().unwrap_or(0);
                (e.last_accessed_at, seq)
            })
            .map(|e| e.key.clone())
    }
}

// =============================================================================
// Cache Keys
// =============================================================================

/// Cache key for a source URL: hex SHA-256 plus the URL's file extension.
pub fn cache_key(source_url: &str) -> String {
    let digest = hex::encode(Sha256::digest(source_url.as_bytes()));
    match extension_of(source_url) {
        Some(ext) => format!("{}.{}", digest, ext),
        None => digest,
    }
}

fn extension_of(source_url: &str) -> Option<String> {
    let path = url::Url::parse(source_url).ok()?.path().to_string();
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    let valid = !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

// =============================================================================
// Media Cache
// =============================================================================

pub struct MediaCache {
    dir: PathBuf,
    max_bytes: u64,
    client: BackendClient,
    index: Mutex<CacheIndex>,
    key_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MediaCache {
    /// Opens the cache directory, dropping stale `.part` files and
    /// indexing what remains (mtime as last access).
    pub async fn open(dir: impl Into<PathBuf>, max_bytes: u64, client: BackendClient) -> AgentResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = CacheIndex::default();
        let mut removed_parts = 0usize;
        let mut read_dir = tokio::fs::read_dir(&dir).await?;

        while let Some(dirent) = read_dir.next_entry().await? {
            let name = dirent.file_name().to_string_lossy().into_owned();
            let path = dirent.path();

            if name.ends_with(PART_SUFFIX) {
                remove_if_exists(&path).await?;
                removed_parts += 1;
                continue;
            }
            if name.starts_with('.') {
                continue;
            }

            let meta = dirent.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let last_accessed_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            index.entries.insert(
                name.clone(),
                CacheEntry {
                    key: name,
                    local_path: path,
                    size_bytes: meta.len(),
                    last_accessed_at,
                    valid: true,
                    sha256: None,
                },
            );
        }

        let cache = MediaCache {
            dir,
            max_bytes,
            client,
            index: Mutex::new(index),
            key_locks: std::sync::Mutex::new(HashMap::new()),
        };

        // The cap may have shrunk since last run
        {
            let mut index = cache.index.lock().await;
            cache.evict_until_fits(&mut index, 0, "").await;
        }

        let usage = cache.usage().await;
        info!(
            dir = %cache.dir.display(),
            entries = usage.entries,
            used_bytes = usage.used_bytes,
            max_bytes = cache.max_bytes,
            removed_parts,
            "Media cache opened"
        );
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn usage(&self) -> CacheUsage {
        let index = self.index.lock().await;
        CacheUsage {
            used_bytes: index.used_bytes(),
            max_bytes: self.max_bytes,
            entries: index.entries.len(),
            pinned: index.pinned.len(),
        }
    }

    pub async fn entry(&self, source_url: &str) -> Option<CacheEntry> {
        let key = cache_key(source_url);
        self.index.lock().await.entries.get(&key).cloned()
    }

    /// Replaces the pinned set with the keys of `urls`.
    pub async fn set_referenced<I>(&self, urls: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let pinned: HashSet<String> = urls.into_iter().map(|u| cache_key(u.as_ref())).collect();
        debug!(pinned = pinned.len(), "Updated referenced cache keys");
        self.index.lock().await.pinned = pinned;
    }

    /// Returns a valid entry for `item`, downloading it if needed.
    pub async fn ensure(&self, item: &MediaItem) -> AgentResult<CacheEntry> {
        let key = cache_key(&item.source_url);
        let key_lock = self.key_lock(&key);
        let result = {
            let _guard = key_lock.lock().await;
            self.ensure_locked(item, &key).await
        };
        drop(key_lock);
        self.release_key_lock(&key);
        result
    }

    /// Body of [`ensure`](Self::ensure); caller holds the key lock.
    async fn ensure_locked(&self, item: &MediaItem, key: &str) -> AgentResult<CacheEntry> {
        let existing = self.index.lock().await.entries.get(key).cloned();
        if let Some(entry) = existing {
            match self.validate_existing(&entry, item).await {
                Ok(()) => {
                    let mut index = self.index.lock().await;
                    index.touch(key);
                    if let Some(e) = index.entries.get(key) {
                        return Ok(e.clone());
                    }
                }
                Err(reason) => {
                    warn!(item_id = %item.id, key = %key, reason = %reason, "Discarding invalid cache entry");
                    self.discard(key).await?;
                }
            }
        }

        let tmp = self.dir.join(format!("{}.{}{}", key, Uuid::new_v4(), PART_SUFFIX));
        let result = self.download_and_admit(item, key, &tmp).await;
        if result.is_err() {
            let _ = remove_if_exists(&tmp).await;
        }
        result
    }

    async fn download_and_admit(&self, item: &MediaItem, key: &str, tmp: &Path) -> AgentResult<CacheEntry> {
        debug!(item_id = %item.id, url = %item.source_url, "Downloading media");
        let downloaded = self.client.download_to(&item.source_url, tmp).await?;

        if downloaded.size_bytes == 0 {
            return Err(AgentError::Validation("empty download".into()));
        }
        if let Some(expected) = item.size_bytes {
            if expected != downloaded.size_bytes {
                return Err(AgentError::Validation(format!(
                    "size mismatch: expected {} bytes, got {}",
                    expected, downloaded.size_bytes
                )));
            }
        }
        if let Some(ref expected) = item.checksum {
            if *expected != downloaded.sha256 {
                return Err(AgentError::Validation("checksum mismatch".into()));
            }
        }

        self.admit(key, tmp, downloaded.size_bytes, Some(downloaded.sha256))
            .await
    }

    /// Moves a validated temp file into the cache, evicting LRU entries
    /// as needed. Fails with `CacheFull` if pinned entries leave no room.
    async fn admit(&self, key: &str, tmp: &Path, size_bytes: u64, sha256: Option<String>) -> AgentResult<CacheEntry> {
        let mut index = self.index.lock().await;

        if size_bytes > self.max_bytes {
            return Err(AgentError::CacheFull {
                needed: size_bytes,
                cap: self.max_bytes,
            });
        }

        if !self.evict_until_fits(&mut index, size_bytes, key).await {
            return Err(AgentError::CacheFull {
                needed: size_bytes,
                cap: self.max_bytes,
            });
        }

        let local_path = self.dir.join(key);
        tokio::fs::rename(tmp, &local_path).await?;

        let entry = CacheEntry {
            key: key.to_string(),
            local_path,
            size_bytes,
            last_accessed_at: Utc::now(),
            valid: true,
            sha256,
        };
        index.entries.insert(key.to_string(), entry.clone());
        index.touch(key);

        debug!(key = %key, size_bytes, used_bytes = index.used_bytes(), "Cache entry admitted");
        Ok(entry)
    }

    /// Evicts until `incoming` more bytes fit. Returns false if it can't.
    async fn evict_until_fits(&self, index: &mut CacheIndex, incoming: u64, except: &str) -> bool {
        // An entry being replaced frees its own space
        let replaced = index.entries.get(except).map(|e| e.size_bytes).unwrap_or(0);

        while index.used_bytes() - replaced + incoming > self.max_bytes {
            let Some(victim) = index.eviction_candidate(except) else {
                return false;
            };
            if let Some(mut entry) = index.remove(&victim) {
                entry.valid = false;
                if let Err(e) = remove_if_exists(&entry.local_path).await {
                    warn!(key = %victim, error = %e, "Failed to delete evicted file");
                }
                info!(key = %victim, size_bytes = entry.size_bytes, "Evicted cache entry");
            }
        }
        true
    }

    async fn validate_existing(&self, entry: &CacheEntry, item: &MediaItem) -> Result<(), String> {
        let meta = match tokio::fs::metadata(&entry.local_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err("file missing".into()),
            Err(e) => return Err(e.to_string()),
        };
        if meta.len() != entry.size_bytes || meta.len() == 0 {
            return Err(format!("size {} != recorded {}", meta.len(), entry.size_bytes));
        }
        if let Some(expected) = item.size_bytes {
            if expected != meta.len() {
                return Err(format!("size {} != declared {}", meta.len(), expected));
            }
        }

        if let Some(ref expected) = item.checksum {
            let actual = match entry.sha256.clone() {
                Some(known) => known,
                None => {
                    let digest = hash_file(entry.local_path.clone()).await.map_err(|e| e.to_string())?;
                    if let Some(e) = self.index.lock().await.entries.get_mut(&entry.key) {
                        e.sha256 = Some(digest.clone());
                    }
                    digest
                }
            };
            if *expected != actual {
                return Err("checksum mismatch".into());
            }
        }
        Ok(())
    }

    async fn discard(&self, key: &str) -> AgentResult<()> {
        let removed = self.index.lock().await.remove(key);
        if let Some(entry) = removed {
            remove_if_exists(&entry.local_path).await?;
        }
        Ok(())
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.key_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock for `key` once no other `ensure` holds a reference.
    fn release_key_lock(&self, key: &str) {
        let mut locks = match self.key_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn key_lock_count(&self) -> usize {
        match self.key_locks.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

async fn hash_file(path: PathBuf) -> AgentResult<String> {
    tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await?
    .map_err(AgentError::from)
}
