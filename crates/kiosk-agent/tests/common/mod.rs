//! In-process mock backend shared by the integration tests.
//!
//! Every endpoint replies with whatever the test last configured, and
//! counts how often it was hit.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use kiosk_agent::{AgentConfig, BackendClient, CredentialStore, EventBus};
use kiosk_core::DeviceCredentials;

pub const API_KEY: &str = "key-123";

#[derive(Default)]
pub struct MockState {
    pub claim: Mutex<Option<(u16, Value)>>,
    pub status: Mutex<Option<(u16, Value)>>,
    pub branch: Mutex<Option<(u16, Value)>>,
    pub heartbeat: Mutex<Option<(u16, String)>>,
    pub playlist: Mutex<Option<(u16, String)>>,
    pub media: Mutex<HashMap<String, Vec<u8>>>,
    /// Delays before answering, to hold requests in flight.
    pub heartbeat_delay: Mutex<Option<Duration>>,
    pub media_delay: Mutex<Option<Duration>>,

    pub claim_hits: AtomicUsize,
    pub status_hits: AtomicUsize,
    pub heartbeat_hits: AtomicUsize,
    pub playlist_hits: AtomicUsize,
    pub media_hits: Mutex<HashMap<String, usize>>,
    pub last_api_key: Mutex<Option<String>>,
}

impl MockState {
    pub fn set_claim(&self, status: u16, body: Value) {
        *self.claim.lock().unwrap() = Some((status, body));
    }

    pub fn set_status(&self, status: u16, body: Value) {
        *self.status.lock().unwrap() = Some((status, body));
    }

    pub fn set_branch(&self, status: u16, body: Value) {
        *self.branch.lock().unwrap() = Some((status, body));
    }

    pub fn set_heartbeat(&self, status: u16, body: &str) {
        *self.heartbeat.lock().unwrap() = Some((status, body.to_string()));
    }

    pub fn set_playlist(&self, status: u16, body: &str) {
        *self.playlist.lock().unwrap() = Some((status, body.to_string()));
    }

    pub fn put_media(&self, name: &str, bytes: &[u8]) {
        self.media.lock().unwrap().insert(name.to_string(), bytes.to_vec());
    }

    pub fn set_heartbeat_delay(&self, delay: Duration) {
        *self.heartbeat_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_media_delay(&self, delay: Duration) {
        *self.media_delay.lock().unwrap() = Some(delay);
    }

    pub fn media_hits(&self, name: &str) -> usize {
        self.media_hits.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

pub struct MockBackend {
    pub base_url: String,
    pub state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());

        let app = Router::new()
            .route("/device-registration/qr-registration", post(claim))
            .route("/device-registration/device-status/{id}", get(device_status))
            .route("/device-registration/heartbeat", get(heartbeat))
            .route("/api/playlist", get(playlist))
            .route("/api/v1/branches/current", get(branch))
            .route("/media/{name}", get(media))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockBackend {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn media_url(&self, name: &str) -> String {
        format!("{}/media/{}", self.base_url, name)
    }

    /// Config pointing both services at this mock, state under `dir`.
    pub fn config(&self, dir: &Path) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.backend.base_url = self.base_url.clone();
        config.backend.inventory_url = self.base_url.clone();
        config.backend.request_timeout_secs = 5;
        config.paths.state_dir = Some(dir.to_path_buf());
        config.registration.poll_interval_secs = 1;
        config.heartbeat.interval_secs = 1;
        config.heartbeat.timeout_secs = 2;
        config.sync.initial_backoff_ms = 10;
        config.sync.max_backoff_secs = 1;
        config
    }

    pub fn client(&self, dir: &Path) -> BackendClient {
        BackendClient::new(&self.config(dir)).unwrap()
    }
}

fn json_response(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap();
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn canned(slot: &Mutex<Option<(u16, Value)>>) -> Response {
    match slot.lock().unwrap().clone() {
        Some((status, body)) => json_response(status, body.to_string()),
        None => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

fn remember_key(state: &MockState, headers: &axum::http::HeaderMap) {
    let key = headers
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *state.last_api_key.lock().unwrap() = key;
}

async fn claim(State(state): State<Arc<MockState>>) -> Response {
    state.claim_hits.fetch_add(1, Ordering::SeqCst);
    canned(&state.claim)
}

async fn device_status(State(state): State<Arc<MockState>>, UrlPath(_id): UrlPath<String>) -> Response {
    state.status_hits.fetch_add(1, Ordering::SeqCst);
    canned(&state.status)
}

async fn branch(State(state): State<Arc<MockState>>) -> Response {
    canned(&state.branch)
}

async fn heartbeat(State(state): State<Arc<MockState>>, headers: axum::http::HeaderMap) -> Response {
    state.heartbeat_hits.fetch_add(1, Ordering::SeqCst);
    remember_key(&state, &headers);
    let delay = *state.heartbeat_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    match state.heartbeat.lock().unwrap().clone() {
        Some((status, body)) => json_response(status, body),
        None => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

async fn playlist(State(state): State<Arc<MockState>>, headers: axum::http::HeaderMap) -> Response {
    state.playlist_hits.fetch_add(1, Ordering::SeqCst);
    remember_key(&state, &headers);
    match state.playlist.lock().unwrap().clone() {
        Some((status, body)) => json_response(status, body),
        None => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

async fn media(State(state): State<Arc<MockState>>, UrlPath(name): UrlPath<String>) -> Response {
    *state.media_hits.lock().unwrap().entry(name.clone()).or_insert(0) += 1;
    let delay = *state.media_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    match state.media.lock().unwrap().get(&name).cloned() {
        Some(bytes) => (StatusCode::OK, bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn activated_credentials() -> DeviceCredentials {
    let mut creds = DeviceCredentials::issued("guid-1", "token-1");
    creds.observe("Activated", Some(API_KEY.to_string()), Some(2), Some("Downtown".into()));
    creds
}

pub async fn activated_store(dir: &Path) -> CredentialStore {
    let store = CredentialStore::open(dir).await.unwrap();
    store.set(activated_credentials()).await.unwrap();
    store
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn playlist_json(id: &str, items: Value) -> String {
    json!({
        "playlistId": id,
        "version": "1",
        "lastUpdated": "2024-05-01T10:00:00Z",
        "items": items,
    })
    .to_string()
}

pub fn events() -> EventBus {
    EventBus::new()
}

/// Polls `check` every 20ms until it returns true or `within` elapses.
pub async fn wait_until<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
