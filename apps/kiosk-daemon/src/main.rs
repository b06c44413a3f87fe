//! # kioskd
//!
//! Runs the kiosk agent until Ctrl-C or SIGTERM.
//!
//! ```text
//! kioskd [CONFIG_PATH]
//!
//!   CONFIG_PATH   JSON base configuration. Falls back to $KIOSK_CONFIG,
//!                 then the platform config directory, then defaults.
//!   RUST_LOG      Log filter (default: info,kiosk=debug)
//! ```

use std::path::PathBuf;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use kiosk_agent::{AgentConfig, AgentEvent, AgentHandle, KioskAgent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = AgentConfig::load(config_path)?;
    info!(
        base_url = %config.backend.base_url,
        notify = config.backend.notify_url.is_some(),
        "Configuration loaded"
    );

    let agent = KioskAgent::start(config).await?;
    tokio::spawn(log_events(agent.clone()));

    shutdown_signal().await;
    agent.shutdown().await;

    info!("kioskd exited");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// - `RUST_LOG=debug` - everything at debug
/// - `RUST_LOG=kiosk_agent=trace` - trace for the agent crate only
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kiosk=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .with_target(true)
        .init();
}

/// Lifecycle events the display collaborators would act on.
async fn log_events(agent: AgentHandle) {
    let mut rx = agent.subscribe();

    loop {
        match rx.recv().await {
            Ok(AgentEvent::ClaimIssued(ticket)) => info!(
                assigned_guid = %ticket.assigned_guid,
                activation_code = ?ticket.activation_code,
                claim_url = ?ticket.claim_url,
                "Show claim code"
            ),
            Ok(AgentEvent::Activated { assigned_guid }) => {
                info!(%assigned_guid, "Device activated")
            }
            Ok(AgentEvent::DeviceDeleted { reason }) => {
                warn!(%reason, "Device removed from backend, re-registering")
            }
            Ok(AgentEvent::PlaylistChanged { playlist_id, version, item_count }) => {
                let status = agent.status().await;
                info!(
                    playlist_id = ?playlist_id,
                    version = ?version,
                    item_count,
                    ready = status.ready_count,
                    cache_used = status.cache.used_bytes,
                    "Playlist changed"
                )
            }
            Ok(AgentEvent::ItemSkipped { item_id, reason }) => {
                warn!(%item_id, %reason, "Item will not be shown")
            }
            Ok(event) => debug!(?event, "Agent event"),
            Err(RecvError::Lagged(n)) => warn!(missed = n, "Event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
