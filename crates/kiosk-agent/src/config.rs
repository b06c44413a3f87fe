//! # Agent Configuration
//!
//! The base configuration document: read-only input to the agent.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     KIOSK_BASE_URL=https://api.example.com                             │
//! │     KIOSK_HEARTBEAT_INTERVAL=60                                        │
//! │                                                                         │
//! │  2. JSON Config File                                                   │
//! │     explicit path, or $KIOSK_CONFIG, or                                │
//! │     ~/.config/kiosk-agent/config.json (Linux)                          │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```json
//! {
//!   "device":       { "device_type": 11 },
//!   "backend":      { "base_url": "https://api.example.com",
//!                     "inventory_url": "https://inventory.example.com",
//!                     "notify_url": "wss://notify.example.com/playlist" },
//!   "registration": { "poll_interval_secs": 10 },
//!   "heartbeat":    { "interval_secs": 60, "timeout_secs": 10 },
//!   "cache":        { "max_bytes": 53687091200 },
//!   "sync":         { "max_concurrent_downloads": 3, "max_attempts": 3 },
//!   "paths":        { "state_dir": "/var/lib/kiosk" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};

// =============================================================================
// Device Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Sent as `DeviceType` in the claim request.
    #[serde(default = "default_device_type")]
    pub device_type: u32,
}

fn default_device_type() -> u32 {
    11
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            device_type: default_device_type(),
        }
    }
}

// =============================================================================
// Backend Settings
// =============================================================================

/// Where the backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Registration, heartbeat and playlist API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Inventory service (branch lookup).
    #[serde(default = "default_inventory_url")]
    pub inventory_url: String,

    /// WebSocket feed of playlist notifications. Disabled when unset.
    #[serde(default)]
    pub notify_url: Option<String>,

    /// Per-request timeout for API calls (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Per-request timeout for media downloads (seconds).
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_inventory_url() -> String {
    "http://localhost:5001".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    300
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            base_url: default_base_url(),
            inventory_url: default_inventory_url(),
            notify_url: None,
            request_timeout_secs: default_request_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

// =============================================================================
// Loop Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationSettings {
    #[serde(default = "default_registration_poll")]
    pub poll_interval_secs: u64,
}

fn default_registration_poll() -> u64 {
    10
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        RegistrationSettings {
            poll_interval_secs: default_registration_poll(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// Bound on a single liveness request.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    60
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        HeartbeatSettings {
            interval_secs: default_heartbeat_interval(),
            timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Media directory. Defaults to `<state_dir>/media`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Total bytes the cache may hold.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
}

fn default_cache_max_bytes() -> u64 {
    50 * 1024 * 1024 * 1024
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            dir: None,
            max_bytes: default_cache_max_bytes(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Content synchronizer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Download worker pool size.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Attempts per item before it is skipped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay (milliseconds); doubles after each failure.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_max_concurrent() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    kiosk_core::MAX_DOWNLOAD_ATTEMPTS
}
fn default_initial_backoff() -> u64 {
    2000
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_concurrent_downloads: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Paths
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathSettings {
    /// Holds registration.json, branchInfo.json and playlist.json.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

// =============================================================================
// Main Agent Configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub registration: RegistrationSettings,

    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub paths: PathSettings,
}

impl AgentConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (config.json)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> AgentResult<Self> {
        let mut config = Self::default();

        let path = config_path
            .or_else(|| std::env::var_os("KIOSK_CONFIG").map(PathBuf::from))
            .or_else(Self::default_config_path);

        if let Some(path) = path {
            if path.exists() {
                info!(?path, "Loading agent config from file");
                config = Self::from_file(&path)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load agent config: {}. Using defaults.", e);
            Self::default()
        })
    }

    fn from_file(path: &Path) -> AgentResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AgentError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| AgentError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> AgentResult<()> {
        for (name, raw) in [
            ("base_url", &self.backend.base_url),
            ("inventory_url", &self.backend.inventory_url),
        ] {
            let parsed = url::Url::parse(raw)?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(AgentError::InvalidUrl(format!(
                    "{} must start with http:// or https://, got: {}",
                    name, raw
                )));
            }
        }

        if let Some(ref raw) = self.backend.notify_url {
            let parsed = url::Url::parse(raw)?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(AgentError::InvalidUrl(format!(
                    "notify_url must start with ws:// or wss://, got: {}",
                    raw
                )));
            }
        }

        let non_zero = [
            ("registration.poll_interval_secs", self.registration.poll_interval_secs),
            ("heartbeat.interval_secs", self.heartbeat.interval_secs),
            ("heartbeat.timeout_secs", self.heartbeat.timeout_secs),
            ("backend.request_timeout_secs", self.backend.request_timeout_secs),
            ("backend.download_timeout_secs", self.backend.download_timeout_secs),
            ("cache.max_bytes", self.cache.max_bytes),
            ("sync.max_concurrent_downloads", self.sync.max_concurrent_downloads as u64),
            ("sync.max_attempts", u64::from(self.sync.max_attempts)),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(AgentError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("KIOSK_BASE_URL") {
            debug!(url = %url, "Overriding base URL from environment");
            self.backend.base_url = url;
        }

        if let Ok(url) = std::env::var("KIOSK_INVENTORY_URL") {
            self.backend.inventory_url = url;
        }

        if let Ok(url) = std::env::var("KIOSK_NOTIFY_URL") {
            debug!(url = %url, "Overriding notification URL from environment");
            self.backend.notify_url = Some(url).filter(|u| !u.is_empty());
        }

        if let Some(v) = env_parse::<u32>("KIOSK_DEVICE_TYPE") {
            self.device.device_type = v;
        }

        if let Some(v) = env_parse::<u64>("KIOSK_REGISTRATION_POLL_INTERVAL") {
            self.registration.poll_interval_secs = v;
        }

        if let Some(v) = env_parse::<u64>("KIOSK_HEARTBEAT_INTERVAL") {
            self.heartbeat.interval_secs = v;
        }

        if let Some(dir) = std::env::var_os("KIOSK_STATE_DIR") {
            self.paths.state_dir = Some(PathBuf::from(dir));
        }

        if let Some(dir) = std::env::var_os("KIOSK_CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }

        if let Some(v) = env_parse::<u64>("KIOSK_CACHE_MAX_BYTES") {
            self.cache.max_bytes = v;
        }

        if let Some(v) = env_parse::<usize>("KIOSK_MAX_CONCURRENT_DOWNLOADS") {
            self.sync.max_concurrent_downloads = v;
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("config.json"))
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "kiosk", "kiosk-agent")
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Directory holding the credential, branch and playlist documents.
    pub fn state_dir(&self) -> PathBuf {
        self.paths
            .state_dir
            .clone()
            .or_else(|| Self::project_dirs().map(|d| d.data_local_dir().to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("./state"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("media"))
    }

    pub fn registration_poll_interval(&self) -> Duration {
        Duration::from_secs(self.registration.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = %key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.registration.poll_interval_secs, 10);
        assert_eq!(config.heartbeat.interval_secs, 60);
        assert_eq!(config.sync.max_concurrent_downloads, 3);
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.device.device_type, 11);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"backend":{"base_url":"https://api.example.com"}}"#).unwrap();
        assert_eq!(config.backend.base_url, "https://api.example.com");
        assert_eq!(config.backend.inventory_url, "http://localhost:5001");
        assert_eq!(config.heartbeat.timeout_secs, 10);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AgentConfig::default();

        config.backend.base_url = "ftp://nope".into();
        assert!(config.validate().unwrap_err().is_config_error());

        config.backend.base_url = "https://api.example.com".into();
        config.backend.notify_url = Some("http://not-ws".into());
        assert!(config.validate().is_err());

        config.backend.notify_url = Some("wss://notify.example.com".into());
        assert!(config.validate().is_ok());

        config.sync.max_concurrent_downloads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"heartbeat":{"interval_secs":30},"paths":{"state_dir":"/tmp/kiosk-state"}}"#,
        )
        .unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/kiosk-state"));
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/kiosk-state/media"));
    }

    #[test]
    fn test_load_or_default_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(AgentConfig::from_file(&path).is_err());
        let config = AgentConfig::load_or_default(Some(path));
        assert_eq!(config.heartbeat.interval_secs, 60);
    }
}
