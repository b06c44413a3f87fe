//! # Update Notification Feed
//!
//! Listens on the backend's WebSocket feed and forwards playlist
//! notifications to the synchronizer's update channel.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                    success   │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │                   │
//! │        │              └─────┬──────┘  └─────┬──────┘                   │
//! │        │              close/error           │ timer expired             │
//! │        └────────────────────┴───────────────┘                           │
//! │                                                                         │
//! │  Text frames:                                                          │
//! │    PlaylistUpdated / ContentChanged → UpdateNotification → mpsc        │
//! │    anything else                    → ignored                          │
//! │                                                                         │
//! │  Backoff: 500ms, 1s, 2s, ... capped at 60s. Reset after a connect.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The device's API key is sent as `X-Api-Key` on the upgrade request
//! when one is stored.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use kiosk_core::{UpdateNotification, CONTENT_CHANGED};

use crate::error::{AgentError, AgentResult};
use crate::protocol::HEADER_API_KEY;
use crate::shutdown::{stopped, StopSignal};
use crate::store::CredentialStore;

/// Notification type carrying playlist actions.
pub const PLAYLIST_UPDATED: &str = "PlaylistUpdated";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Feed State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedState::Disconnected => write!(f, "disconnected"),
            FeedState::Connecting => write!(f, "connecting"),
            FeedState::Connected => write!(f, "connected"),
            FeedState::Backoff => write!(f, "backoff"),
        }
    }
}

// =============================================================================
// Feed Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl FeedConfig {
    pub fn new(url: impl Into<String>) -> Self {
        FeedConfig {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Decodes one text frame. `None` for frames that are not playlist notifications.
pub fn decode_frame(text: &str) -> Option<UpdateNotification> {
    let notification = match UpdateNotification::from_json(text) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, raw = %text, "Unparseable notification frame");
            return None;
        }
    };

    match notification.kind.as_deref() {
        Some(PLAYLIST_UPDATED) | Some(CONTENT_CHANGED) => Some(notification),
        other => {
            debug!(kind = ?other, "Ignoring notification");
            None
        }
    }
}

// =============================================================================
// Notification Feed
// =============================================================================

pub struct NotificationFeed {
    config: FeedConfig,
    store: CredentialStore,
    updates: mpsc::Sender<UpdateNotification>,
    state: Arc<RwLock<FeedState>>,
}

impl NotificationFeed {
    pub fn new(
        config: FeedConfig,
        store: CredentialStore,
        updates: mpsc::Sender<UpdateNotification>,
    ) -> Self {
        NotificationFeed {
            config,
            store,
            updates,
            state: Arc::new(RwLock::new(FeedState::Disconnected)),
        }
    }

    pub fn state_handle(&self) -> Arc<RwLock<FeedState>> {
        self.state.clone()
    }

    /// Connect, forward, reconnect. Returns on stop or when the update
    /// receiver is gone.
    pub async fn run(self, mut stop: StopSignal) {
        info!(url = %self.config.url, "Notification feed starting");
        let mut backoff = reconnect_backoff(&self.config);

        loop {
            if *stop.borrow() {
                break;
            }
            *self.state.write().await = FeedState::Connecting;

            let connected = tokio::select! {
                result = self.connect() => result,
                _ = stopped(&mut stop) => break,
            };

            match connected {
                Ok(ws) => {
                    info!("Notification feed connected");
                    *self.state.write().await = FeedState::Connected;
                    backoff.reset();

                    match self.receive_loop(ws, &mut stop).await {
                        Ok(true) => break,
                        Ok(false) => info!("Notification feed closed by server"),
                        Err(AgentError::Channel(_)) => {
                            warn!("Update receiver dropped, stopping feed");
                            break;
                        }
                        Err(e) => warn!(error = %e, "Notification feed dropped"),
                    }
                }
                Err(e) if e.is_retryable() => warn!(error = %e, "Notification feed connect failed"),
                Err(e) => error!(error = %e, "Notification feed connect rejected"),
            }

            *self.state.write().await = FeedState::Backoff;
            let wait = backoff.next_backoff().unwrap_or(self.config.max_backoff);
            debug!(?wait, "Waiting before reconnect");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stopped(&mut stop) => break,
            }
        }

        *self.state.write().await = FeedState::Disconnected;
        info!("Notification feed stopped");
    }

    async fn connect(&self) -> AgentResult<WsStream> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(key) = self.store.get().and_then(|c| c.api_key().map(str::to_string)) {
            let value = HeaderValue::from_str(&key)
                .map_err(|e| AgentError::InvalidConfig(format!("api key not a valid header: {}", e)))?;
            request.headers_mut().insert(HEADER_API_KEY, value);
        }

        match timeout(self.config.connect_timeout, connect_async(request)).await {
            Ok(Ok((ws, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(ws)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(AgentError::Timeout),
        }
    }

    /// `Ok(true)` when stopped, `Ok(false)` when the server closed.
    async fn receive_loop(&self, ws: WsStream, stop: &mut StopSignal) -> AgentResult<bool> {
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(notification) = decode_frame(&text) {
                                debug!(action = ?notification.action, playlist_id = ?notification.playlist_id, "Notification received");
                                self.updates
                                    .send(notification)
                                    .await
                                    .map_err(|_| AgentError::Channel("update receiver dropped".into()))?;
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            debug!(?frame, "Close frame received");
                            return Ok(false);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(false),
                    }
                }

                _ = stopped(stop) => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(true);
                }
            }
        }
    }

}

fn reconnect_backoff(config: &FeedConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: config.initial_backoff,
        initial_interval: config.initial_backoff,
        max_interval: config.max_backoff,
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}
