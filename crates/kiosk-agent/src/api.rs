//! # Backend Client
//!
//! Thin reqwest wrapper for the five backend endpoints plus media downloads.
//!
//! One shared [`reqwest::Client`] (connection pool) serves every component.
//! Timeouts are set per request, so a stalled call only costs its own loop
//! one cycle.

use std::path::Path;
use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use kiosk_core::BranchInfo;

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::protocol::{
    BranchEnvelope, ClaimRequest, ClaimResponse, DeviceStatusResponse, RawResponse, API_VERSION,
    BRANCH_PATH, CLAIM_PATH, HEADER_API_KEY, HEADER_VERSION, HEARTBEAT_PATH, PLAYLIST_PATH,
    STATUS_PATH,
};

/// What a finished download produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the bytes written.
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    inventory_url: String,
    request_timeout: Duration,
    download_timeout: Duration,
}

impl BackendClient {
    pub fn new(config: &AgentConfig) -> AgentResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.backend.request_timeout_secs))
            .build()
            .map_err(|e| AgentError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(BackendClient {
            http,
            base_url: config.backend.base_url.trim_end_matches('/').to_string(),
            inventory_url: config.backend.inventory_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.backend.request_timeout_secs),
            download_timeout: Duration::from_secs(config.backend.download_timeout_secs),
        })
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// `POST /device-registration/qr-registration`. 200 and 201 both count.
    pub async fn request_claim(&self, device_type: u32) -> AgentResult<ClaimResponse> {
        let url = format!("{}{}", self.base_url, CLAIM_PATH);
        info!(url = %url, device_type, "Requesting claim code");

        let resp = self
            .request(self.http.post(&url))
            .json(&ClaimRequest { device_type })
            .send()
            .await?;
        read_json(resp).await
    }

    /// `GET /device-registration/device-status/{id}` with the bearer token.
    pub async fn device_status(
        &self,
        assigned_guid: &str,
        access_token: &str,
    ) -> AgentResult<DeviceStatusResponse> {
        let url = format!("{}{}/{}", self.base_url, STATUS_PATH, assigned_guid);
        let resp = self
            .request(self.http.get(&url))
            .bearer_auth(access_token)
            .send()
            .await?;
        read_json(resp).await
    }

    /// `GET {inventory}/api/v1/branches/current`.
    pub async fn branch_info(&self, api_key: &str) -> AgentResult<BranchInfo> {
        let url = format!("{}{}", self.inventory_url, BRANCH_PATH);
        debug!(url = %url, "Fetching branch info");

        let resp = self
            .request(self.http.get(&url))
            .header(HEADER_API_KEY, api_key)
            .send()
            .await?;
        let envelope: BranchEnvelope = read_json(resp).await?;
        Ok(envelope.into_branch())
    }

    // =========================================================================
    // Heartbeat & Playlist
    // =========================================================================

    /// `GET /device-registration/heartbeat`. Returns status and body as-is;
    /// the caller classifies them.
    pub async fn heartbeat(&self, api_key: &str, timeout: Duration) -> AgentResult<RawResponse> {
        let url = format!("{}{}", self.base_url, HEARTBEAT_PATH);
        let resp = self
            .request(self.http.get(&url))
            .timeout(timeout)
            .header(HEADER_API_KEY, api_key)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(RawResponse { status, body })
    }

    /// `GET /api/playlist`. Returns the raw document for the caller to parse.
    pub async fn fetch_playlist(&self, api_key: &str) -> AgentResult<String> {
        let url = format!("{}{}", self.base_url, PLAYLIST_PATH);
        let resp = self
            .request(self.http.get(&url))
            .header(HEADER_API_KEY, api_key)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(AgentError::from_status(status.as_u16(), body));
        }
        Ok(body)
    }

    // =========================================================================
    // Media
    // =========================================================================

    /// Streams `url` into `dest`, hashing as it goes.
    ///
    /// `dest` is always a temp path; the cache decides whether to promote it.
    pub async fn download_to(&self, url: &str, dest: &Path) -> AgentResult<DownloadedFile> {
        let mut resp = self
            .http
            .get(url)
            .header(HEADER_VERSION, API_VERSION)
            .timeout(self.download_timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AgentError::from_status(status.as_u16(), String::new()));
        }
        let declared = resp.content_length();

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;

        while let Some(chunk) = resp.chunk().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            size_bytes += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = declared {
            if expected != size_bytes {
                return Err(AgentError::Validation(format!(
                    "truncated download: got {} of {} bytes",
                    size_bytes, expected
                )));
            }
        }

        debug!(url = %url, size_bytes, "Download complete");
        Ok(DownloadedFile {
            size_bytes,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header(HEADER_VERSION, API_VERSION)
            .header(ACCEPT, "application/json")
            .timeout(self.request_timeout)
    }
}

/// Reads a JSON body, mapping non-2xx statuses and keeping the raw text on parse failure.
async fn read_json<T: DeserializeOwned>(resp: Response) -> AgentResult<T> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        return Err(AgentError::from_status(status.as_u16(), body));
    }

    serde_json::from_str(&body).map_err(|e| AgentError::parse(e, body))
}
