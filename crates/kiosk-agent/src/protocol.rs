//! # Backend Protocol
//!
//! Request/response bodies and header names of the backend HTTP contract.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  POST {base}/device-registration/qr-registration     (no auth)         │
//! │  GET  {base}/device-registration/device-status/{id}  Bearer token      │
//! │  GET  {inventory}/api/v1/branches/current            X-Api-Key         │
//! │  GET  {base}/device-registration/heartbeat           X-Api-Key         │
//! │  GET  {base}/api/playlist                            X-Api-Key         │
//! │                                                                         │
//! │  Every request: `version: v1`, `Accept: application/json`              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The backend is not consistent about key casing, so every response field
//! accepts both the camelCase and PascalCase spelling.

use serde::{Deserialize, Serialize};

use kiosk_core::BranchInfo;

// =============================================================================
// Headers & Paths
// =============================================================================

pub const HEADER_VERSION: &str = "version";
pub const API_VERSION: &str = "v1";
pub const HEADER_API_KEY: &str = "X-Api-Key";

pub const CLAIM_PATH: &str = "/device-registration/qr-registration";
pub const STATUS_PATH: &str = "/device-registration/device-status";
pub const HEARTBEAT_PATH: &str = "/device-registration/heartbeat";
pub const PLAYLIST_PATH: &str = "/api/playlist";
pub const BRANCH_PATH: &str = "/api/v1/branches/current";

// =============================================================================
// Claim
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ClaimRequest {
    #[serde(rename = "DeviceType")]
    pub device_type: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimResponse {
    #[serde(rename = "assignedGuid", alias = "AssignedGuid", default)]
    pub assigned_guid: Option<String>,

    #[serde(rename = "accessToken", alias = "AccessToken", default)]
    pub access_token: Option<String>,

    /// Base64 PNG, possibly with a `data:` prefix.
    #[serde(rename = "qrCodeImage", alias = "QrCodeImage", alias = "qrCode", default)]
    pub qr_code_image: Option<String>,

    #[serde(rename = "url", alias = "Url", default)]
    pub url: Option<String>,
}

// =============================================================================
// Status Poll
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceStatusResponse {
    #[serde(rename = "deviceStatus", alias = "DeviceStatus", default)]
    pub device_status: Option<String>,

    #[serde(rename = "apiKey", alias = "ApiKey", default)]
    pub api_key: Option<String>,

    #[serde(rename = "branchId", alias = "BranchId", default)]
    pub branch_id: Option<i64>,

    #[serde(rename = "branch", alias = "Branch", default)]
    pub branch: Option<String>,
}

// =============================================================================
// Branch
// =============================================================================

/// The inventory service wraps the record in `success`; older builds don't.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BranchEnvelope {
    Wrapped { success: BranchInfo },
    Bare(BranchInfo),
}

impl BranchEnvelope {
    pub fn into_branch(self) -> BranchInfo {
        match self {
            BranchEnvelope::Wrapped { success } => success,
            BranchEnvelope::Bare(info) => info,
        }
    }
}

// =============================================================================
// Heartbeat
// =============================================================================

/// Raw heartbeat outcome. Classification happens in kiosk-core.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}
