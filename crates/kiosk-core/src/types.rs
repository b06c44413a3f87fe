//! # Domain Types
//!
//! Core domain types shared by every kiosk-agent component.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌───────────────────┐   ┌─────────────────┐   ┌─────────────────┐     │
//! │  │ DeviceCredentials │   │   BranchInfo    │   │ HeartbeatState  │     │
//! │  │ ───────────────── │   │  ─────────────  │   │  ─────────────  │     │
//! │  │ assigned_guid     │   │  id, name       │   │  message_count  │     │
//! │  │ access_token      │   │  address, city  │   │  last_checked_at│     │
//! │  │ device_status     │   │  (+ extra)      │   └─────────────────┘     │
//! │  │ api_key?          │   └─────────────────┘                           │
//! │  └───────────────────┘                                                 │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────────┐   │
//! │  │   MediaItem     │   │   MediaKind     │   │ UpdateNotification  │   │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────────  │   │
//! │  │  id, url, order │   │  Photo          │   │  type, playlistId   │   │
//! │  │  duration?      │   │  Video          │   │  action, item?      │   │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Presence Rules
//! Optional backend fields are modelled as `Option<_>` and normalised at the
//! parse boundary. The one hard invariant: `api_key` is `Some` iff
//! `device_status == Activated`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::validation::validate_item;

// =============================================================================
// Device Status
// =============================================================================

/// Registration status of the device as persisted in the credential store.
///
/// ## Status Flow
/// ```text
/// QrIssued ──(code scanned)──► Claimed ──(api key issued)──► Activated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Claim code issued, waiting for a human to scan it.
    #[serde(alias = "QR issued", alias = "Pending")]
    QrIssued,

    /// Device associated with an account, no API key yet.
    Claimed,

    /// Long-lived API key issued.
    Activated,
}

impl DeviceStatus {
    /// Maps a backend `deviceStatus` string onto a status.
    ///
    /// Unknown strings (including "Pending") count as still waiting for a scan.
    pub fn from_backend(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "claimed" => DeviceStatus::Claimed,
            "activated" | "active" => DeviceStatus::Activated,
            _ => DeviceStatus::QrIssued,
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::QrIssued => write!(f, "qr_issued"),
            DeviceStatus::Claimed => write!(f, "claimed"),
            DeviceStatus::Activated => write!(f, "activated"),
        }
    }
}

// =============================================================================
// Device Credentials
// =============================================================================

/// Durable device identity written by registration, read by heartbeat and sync.
///
/// Serialized with the PascalCase keys the device has always used on disk:
/// ```json
/// { "AssignedGuid": "...", "AccessToken": "...", "DeviceStatus": "Claimed",
///   "BranchId": 2, "Branch": "Downtown" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceCredentials {
    /// Identity assigned by the backend at claim time.
    pub assigned_guid: String,

    /// Short-lived bearer token used only for status polling.
    pub access_token: String,

    /// Current registration status.
    pub device_status: DeviceStatus,

    /// Present iff `device_status == Activated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub branch_id: Option<i64>,

    #[serde(default)]
    pub branch: Option<String>,
}

impl DeviceCredentials {
    /// Credentials right after a successful claim request.
    pub fn issued(assigned_guid: impl Into<String>, access_token: impl Into<String>) -> Self {
        DeviceCredentials {
            assigned_guid: assigned_guid.into(),
            access_token: access_token.into(),
            device_status: DeviceStatus::QrIssued,
            api_key: None,
            branch_id: None,
            branch: None,
        }
    }

    /// Folds one status-poll observation into these credentials.
    ///
    /// Status is derived from the key: a non-blank `api_key` means Activated
    /// whatever the backend string says, and a blank one can never be Activated.
    pub fn observe(
        &mut self,
        device_status: &str,
        api_key: Option<String>,
        branch_id: Option<i64>,
        branch: Option<String>,
    ) {
        self.device_status = DeviceStatus::from_backend(device_status);
        self.api_key = api_key;
        self.branch_id = branch_id;
        self.branch = branch.filter(|b| !b.trim().is_empty());
        self.normalize();
    }

    /// Enforces the api-key/status invariant in place.
    pub fn normalize(&mut self) {
        self.api_key = self
            .api_key
            .take()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        match (&self.api_key, self.device_status) {
            (Some(_), _) => self.device_status = DeviceStatus::Activated,
            (None, DeviceStatus::Activated) => self.device_status = DeviceStatus::Claimed,
            (None, _) => {}
        }
    }

    /// Returns a normalized copy (used after loading from disk).
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Returns true once a long-lived API key has been issued.
    pub fn is_activated(&self) -> bool {
        self.device_status == DeviceStatus::Activated && self.api_key.is_some()
    }

    /// Returns the API key if activated.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }
}

// =============================================================================
// Branch Info
// =============================================================================

/// Location record fetched once after activation.
///
/// Only the commonly displayed fields are typed; everything else the
/// inventory service returns is kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchInfo {
    #[serde(default)]
    pub id: Option<i64>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub address1: Option<String>,

    #[serde(default)]
    pub city: Option<String>,

    #[serde(default)]
    pub state: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// Heartbeat State
// =============================================================================

/// In-memory bookkeeping owned by the heartbeat monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatState {
    /// Pending message count last reported by the backend.
    pub message_count: u64,

    /// When the last liveness request completed (any outcome).
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl HeartbeatState {
    /// Records a reported count. Returns true if it changed.
    pub fn record_count(&mut self, count: u64) -> bool {
        let changed = self.message_count != count;
        self.message_count = count;
        changed
    }

    /// Resets the counter (deletion detected or monitor restarted).
    pub fn reset(&mut self) {
        self.message_count = 0;
    }
}

// =============================================================================
// Media Items
// =============================================================================

/// Kind of media a playlist item points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[serde(alias = "image")]
    Photo,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Photo => write!(f, "photo"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "photo" | "image" => Ok(MediaKind::Photo),
            "video" => Ok(MediaKind::Video),
            other => Err(other.to_string()),
        }
    }
}

/// A validated playlist item.
///
/// Construct via [`MediaItem::try_from`] on a [`RawMediaItem`]; the wire
/// shape is identical so a serialized item parses back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: MediaKind,

    #[serde(rename = "url")]
    pub source_url: String,

    /// Display time. Always `Some` for photos, always `None` for videos.
    #[serde(rename = "duration", default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,

    #[serde(default)]
    pub order: i64,

    /// Declared download size in bytes.
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    /// Declared SHA-256 of the file, lowercase hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl MediaItem {
    /// Returns the unvalidated form, useful as a base for patches.
    pub fn to_raw(&self) -> RawMediaItem {
        RawMediaItem {
            id: Some(self.id.clone()),
            kind: Some(self.kind.to_string()),
            url: Some(self.source_url.clone()),
            duration: self.duration_seconds.map(f64::from),
            order: Some(self.order),
            size: self.size_bytes,
            checksum: self.checksum.clone(),
        }
    }

    /// Overlays the present fields of `patch` and re-validates.
    pub fn patched(&self, patch: &RawMediaItem) -> Result<MediaItem, crate::ValidationError> {
        let mut raw = self.to_raw();
        if patch.kind.is_some() {
            raw.kind = patch.kind.clone();
        }
        if patch.url.is_some() {
            raw.url = patch.url.clone();
        }
        if patch.duration.is_some() {
            raw.duration = patch.duration;
        }
        if patch.order.is_some() {
            raw.order = patch.order;
        }
        if patch.size.is_some() {
            raw.size = patch.size;
        }
        if patch.checksum.is_some() {
            raw.checksum = patch.checksum.clone();
        }
        validate_item(raw)
    }
}

impl TryFrom<RawMediaItem> for MediaItem {
    type Error = crate::ValidationError;

    fn try_from(raw: RawMediaItem) -> Result<Self, Self::Error> {
        validate_item(raw)
    }
}

/// A playlist item exactly as the backend sent it. Nothing is trusted yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMediaItem {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub id: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub duration: Option<f64>,

    #[serde(default)]
    pub order: Option<i64>,

    #[serde(default)]
    pub size: Option<u64>,

    #[serde(default)]
    pub checksum: Option<String>,
}

// =============================================================================
// Update Notifications
// =============================================================================

/// Incremental playlist actions pushed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Refresh,
    Add,
    Remove,
    Update,
}

impl std::fmt::Display for UpdateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateAction::Refresh => write!(f, "refresh"),
            UpdateAction::Add => write!(f, "add"),
            UpdateAction::Remove => write!(f, "remove"),
            UpdateAction::Update => write!(f, "update"),
        }
    }
}

impl std::str::FromStr for UpdateAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "refresh" => Ok(UpdateAction::Refresh),
            "add" => Ok(UpdateAction::Add),
            "remove" | "delete" => Ok(UpdateAction::Remove),
            "update" => Ok(UpdateAction::Update),
            other => Err(CoreError::UnsupportedAction(other.to_string())),
        }
    }
}

/// Message type that always means "re-fetch everything".
pub const CONTENT_CHANGED: &str = "ContentChanged";

/// An out-of-band notification as delivered by the real-time transport.
///
/// ```json
/// { "type": "PlaylistUpdated", "playlistId": "pl-1", "action": "add",
///   "item": { "id": "a", "type": "photo", "url": "https://...", "order": 3 } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNotification {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub playlist_id: Option<String>,

    #[serde(default)]
    pub action: Option<String>,

    #[serde(default)]
    pub item: Option<RawMediaItem>,

    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub item_id: Option<String>,
}

/// A notification resolved into the `(action, payload)` the synchronizer applies.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistUpdate {
    Refresh,
    Add(MediaItem),
    Remove(String),
    Update(RawMediaItem),
}

impl PlaylistUpdate {
    pub fn action(&self) -> UpdateAction {
        match self {
            PlaylistUpdate::Refresh => UpdateAction::Refresh,
            PlaylistUpdate::Add(_) => UpdateAction::Add,
            PlaylistUpdate::Remove(_) => UpdateAction::Remove,
            PlaylistUpdate::Update(_) => UpdateAction::Update,
        }
    }
}

impl UpdateNotification {
    /// Parses a notification from a JSON text frame.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Resolves the action. `ContentChanged` and a missing action mean refresh.
    pub fn action(&self) -> CoreResult<UpdateAction> {
        if self.kind.as_deref() == Some(CONTENT_CHANGED) {
            return Ok(UpdateAction::Refresh);
        }
        match self.action.as_deref() {
            None => Ok(UpdateAction::Refresh),
            Some(raw) => raw.parse(),
        }
    }

    /// Validates the payload for the resolved action.
    pub fn into_update(self) -> CoreResult<PlaylistUpdate> {
        let action = self.action()?;
        match action {
            UpdateAction::Refresh => Ok(PlaylistUpdate::Refresh),
            UpdateAction::Add => {
                let raw = self.item.ok_or_else(|| missing(action, "item"))?;
                Ok(PlaylistUpdate::Add(MediaItem::try_from(raw)?))
            }
            UpdateAction::Remove => {
                let id = self
                    .item_id
                    .or_else(|| self.item.and_then(|i| i.id))
                    .filter(|id| !id.trim().is_empty())
                    .ok_or_else(|| missing(action, "itemId"))?;
                Ok(PlaylistUpdate::Remove(id))
            }
            UpdateAction::Update => {
                let raw = self.item.ok_or_else(|| missing(action, "item"))?;
                if raw.id.as_deref().map_or(true, |id| id.trim().is_empty()) {
                    return Err(missing(action, "item.id"));
                }
                Ok(PlaylistUpdate::Update(raw))
            }
        }
    }
}

fn missing(action: UpdateAction, field: &str) -> CoreError {
    CoreError::IncompleteNotification {
        action: action.to_string(),
        field: field.to_string(),
    }
}

// =============================================================================
// Lenient Deserializers
// =============================================================================

pub(crate) mod lenient {
    //! The backend is not consistent about ids: sometimes strings, sometimes numbers.

    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_backend() {
        assert_eq!(DeviceStatus::from_backend("Claimed"), DeviceStatus::Claimed);
        assert_eq!(DeviceStatus::from_backend("QR issued"), DeviceStatus::QrIssued);
        assert_eq!(DeviceStatus::from_backend("Pending"), DeviceStatus::QrIssued);
        assert_eq!(DeviceStatus::from_backend("Activated"), DeviceStatus::Activated);
    }

    #[test]
    fn test_observe_claimed_without_key() {
        let mut creds = DeviceCredentials::issued("guid-1", "tok");
        creds.observe("Claimed", None, Some(2), Some("X".into()));

        assert_eq!(creds.device_status, DeviceStatus::Claimed);
        assert!(!creds.is_activated());
        assert_eq!(creds.branch_id, Some(2));
        assert_eq!(creds.branch.as_deref(), Some("X"));
    }

    #[test]
    fn test_api_key_drives_activation() {
        let mut creds = DeviceCredentials::issued("guid-1", "tok");
        creds.observe("Claimed", Some("key-123".into()), None, None);
        assert_eq!(creds.device_status, DeviceStatus::Activated);
        assert_eq!(creds.api_key(), Some("key-123"));

        // Backend claims activation but sends a blank key
        creds.observe("Activated", Some("   ".into()), None, None);
        assert_eq!(creds.device_status, DeviceStatus::Claimed);
        assert!(creds.api_key.is_none());
    }

    #[test]
    fn test_credentials_disk_shape() {
        let json = r#"{"AssignedGuid":"g","AccessToken":"t","DeviceStatus":"QR issued","ApiKey":"","BranchId":null,"Branch":""}"#;
        let creds: DeviceCredentials = serde_json::from_str(json).unwrap();
        let creds = creds.normalized();
        assert_eq!(creds.device_status, DeviceStatus::QrIssued);
        assert!(creds.api_key.is_none());

        let out = serde_json::to_string(&creds).unwrap();
        assert!(out.contains("\"AssignedGuid\":\"g\""));
        assert!(!out.contains("ApiKey"));
    }

    #[test]
    fn test_heartbeat_state_record() {
        let mut state = HeartbeatState::default();
        assert!(state.record_count(3));
        assert!(!state.record_count(3));
        state.reset();
        assert_eq!(state.message_count, 0);
    }

    #[test]
    fn test_notification_actions() {
        let n = UpdateNotification::from_json(r#"{"type":"PlaylistUpdated","playlistId":7}"#).unwrap();
        assert_eq!(n.playlist_id.as_deref(), Some("7"));
        assert_eq!(n.action().unwrap(), UpdateAction::Refresh);

        let n = UpdateNotification::from_json(r#"{"type":"ContentChanged","action":"add"}"#).unwrap();
        assert_eq!(n.action().unwrap(), UpdateAction::Refresh);

        let n = UpdateNotification::from_json(r#"{"type":"PlaylistUpdated","action":"shuffle"}"#).unwrap();
        assert!(matches!(n.action(), Err(CoreError::UnsupportedAction(_))));
    }

    #[test]
    fn test_notification_remove_payload() {
        let n = UpdateNotification::from_json(
            r#"{"type":"PlaylistUpdated","action":"remove","item":{"id":"a"}}"#,
        )
        .unwrap();
        assert_eq!(n.into_update().unwrap(), PlaylistUpdate::Remove("a".into()));

        let n = UpdateNotification::from_json(r#"{"type":"PlaylistUpdated","action":"remove"}"#)
            .unwrap();
        assert!(matches!(
            n.into_update(),
            Err(CoreError::IncompleteNotification { .. })
        ));
    }

    #[test]
    fn test_notification_add_rejects_malformed_item() {
        let n = UpdateNotification::from_json(
            r#"{"type":"PlaylistUpdated","action":"add","item":{"id":"a","type":"audio","url":"https://x/a.mp3"}}"#,
        )
        .unwrap();
        assert!(matches!(n.into_update(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_patch_keeps_untouched_fields() {
        let item = MediaItem::try_from(RawMediaItem {
            id: Some("a".into()),
            kind: Some("photo".into()),
            url: Some("https://cdn/a.jpg".into()),
            duration: Some(5.0),
            order: Some(2),
            ..Default::default()
        })
        .unwrap();

        let patched = item
            .patched(&RawMediaItem {
                id: Some("a".into()),
                order: Some(9),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(patched.order, 9);
        assert_eq!(patched.duration_seconds, Some(5));
        assert_eq!(patched.source_url, item.source_url);
    }
}
