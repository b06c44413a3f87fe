//! # Credential Store
//!
//! Durable device identity: `registration.json` and `branchInfo.json` in
//! the state directory.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Atomic Replace                                      │
//! │                                                                         │
//! │  set(creds)                                                            │
//! │     │                                                                   │
//! │     ├─► lock writer mutex           (one writer at a time)             │
//! │     ├─► write .registration.json.<uuid>.tmp                            │
//! │     ├─► fsync                                                          │
//! │     ├─► rename over registration.json                                  │
//! │     └─► publish on watch channel    (readers never block)              │
//! │                                                                         │
//! │  A crash at any point leaves either the old or the new document.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers go through [`CredentialStore::get`] or a [`watch::Receiver`] from
//! [`CredentialStore::subscribe`]; the heartbeat's delete is observed by
//! the synchronizer and the agent through that channel.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kiosk_core::{BranchInfo, DeviceCredentials};

use crate::error::{AgentError, AgentResult};

pub const REGISTRATION_FILE: &str = "registration.json";
pub const BRANCH_FILE: &str = "branchInfo.json";

#[derive(Debug, Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    dir: PathBuf,
    write_lock: Mutex<()>,
    current: watch::Sender<Option<DeviceCredentials>>,
    branch: RwLock<Option<BranchInfo>>,
}

impl CredentialStore {
    /// Opens (creating if needed) the state directory and loads what is there.
    pub async fn open(dir: impl Into<PathBuf>) -> AgentResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let (current, _) = watch::channel(None);
        let store = CredentialStore {
            inner: Arc::new(StoreInner {
                dir,
                write_lock: Mutex::new(()),
                current,
                branch: RwLock::new(None),
            }),
        };
        store.load().await?;
        Ok(store)
    }

    /// Re-reads both documents from disk.
    ///
    /// A corrupt document is logged and treated as absent.
    pub async fn load(&self) -> AgentResult<Option<DeviceCredentials>> {
        let _guard = self.inner.write_lock.lock().await;

        let creds = read_json::<DeviceCredentials>(&self.registration_path())
            .await?
            .map(DeviceCredentials::normalized);
        let branch = read_json::<BranchInfo>(&self.branch_path()).await?;

        if let Some(ref c) = creds {
            info!(
                assigned_guid = %c.assigned_guid,
                status = %c.device_status,
                "Loaded stored credentials"
            );
        }

        *self.inner.branch.write().await = branch;
        self.inner.current.send_replace(creds.clone());
        Ok(creds)
    }

    /// Current credentials, if any.
    pub fn get(&self) -> Option<DeviceCredentials> {
        self.inner.current.borrow().clone()
    }

    /// Atomically replaces the credential document.
    pub async fn set(&self, creds: DeviceCredentials) -> AgentResult<()> {
        let creds = creds.normalized();
        let _guard = self.inner.write_lock.lock().await;

        write_json_atomic(&self.registration_path(), &creds).await?;
        debug!(status = %creds.device_status, "Credentials persisted");

        self.inner.current.send_replace(Some(creds));
        Ok(())
    }

    /// Removes both documents and tells every subscriber.
    pub async fn delete(&self) -> AgentResult<()> {
        let _guard = self.inner.write_lock.lock().await;

        *self.inner.branch.write().await = None;
        self.inner.current.send_replace(None);

        // Attempt both files before reporting
        let registration = remove_if_exists(&self.registration_path()).await;
        let branch = remove_if_exists(&self.branch_path()).await;
        registration?;
        branch?;

        info!("Credentials and branch info deleted");
        Ok(())
    }

    pub async fn branch(&self) -> Option<BranchInfo> {
        self.inner.branch.read().await.clone()
    }

    pub async fn set_branch(&self, info: BranchInfo) -> AgentResult<()> {
        let _guard = self.inner.write_lock.lock().await;

        write_json_atomic(&self.branch_path(), &info).await?;
        info!(branch = ?info.name, "Branch info persisted");

        *self.inner.branch.write().await = Some(info);
        Ok(())
    }

    /// Watch the credentials. Fires on every set/delete.
    pub fn subscribe(&self) -> watch::Receiver<Option<DeviceCredentials>> {
        self.inner.current.subscribe()
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn registration_path(&self) -> PathBuf {
        self.inner.dir.join(REGISTRATION_FILE)
    }

    pub fn branch_path(&self) -> PathBuf {
        self.inner.dir.join(BRANCH_FILE)
    }
}

// =============================================================================
// File Helpers
// =============================================================================

/// Write-temp, fsync, rename.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> AgentResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes).await
}

pub(crate) async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> AgentResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AgentError::Storage(format!("{} has no parent", path.display())))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(AgentError::Storage(format!("{}: {}", path.display(), e)));
    }
    Ok(())
}

/// Reads a JSON document; `None` if the file is missing or unreadable as JSON.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> AgentResult<Option<T>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, raw = %raw, "Ignoring corrupt document");
            Ok(None)
        }
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> AgentResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosk_core::DeviceStatus;

    #[tokio::test]
    async fn test_set_get_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).await.unwrap();
        assert!(store.get().is_none());

        let mut creds = DeviceCredentials::issued("guid-1", "tok");
        creds.observe("Claimed", None, Some(2), Some("X".into()));
        store.set(creds.clone()).await.unwrap();
        assert_eq!(store.get(), Some(creds.clone()));

        let reopened = CredentialStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get(), Some(creds));
    }

    #[tokio::test]
    async fn test_delete_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).await.unwrap();

        let mut creds = DeviceCredentials::issued("guid-1", "tok");
        creds.observe("Activated", Some("key".into()), None, None);
        store.set(creds).await.unwrap();
        store
            .set_branch(BranchInfo {
                name: Some("Downtown".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(store.registration_path().exists());
        assert!(store.branch_path().exists());

        let mut rx = store.subscribe();
        store.delete().await.unwrap();

        assert!(!store.registration_path().exists());
        assert!(!store.branch_path().exists());
        assert!(store.get().is_none());
        assert!(store.branch().await.is_none());
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_none());

        // Deleting twice is fine
        store.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(REGISTRATION_FILE), "{ truncated").unwrap();

        let store = CredentialStore::open(dir.path()).await.unwrap();
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn test_legacy_blank_key_normalized() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(REGISTRATION_FILE),
            r#"{"AssignedGuid":"g","AccessToken":"t","DeviceStatus":"Activated","ApiKey":""}"#,
        )
        .unwrap();

        let store = CredentialStore::open(dir.path()).await.unwrap();
        let creds = store.get().unwrap();
        assert_eq!(creds.device_status, DeviceStatus::Claimed);
        assert!(creds.api_key.is_none());
    }

    #[tokio::test]
    async fn test_no_temp_files_left() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).await.unwrap();
        store
            .set(DeviceCredentials::issued("g", "t"))
            .await
            .unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![REGISTRATION_FILE.to_string()]);
    }
}
