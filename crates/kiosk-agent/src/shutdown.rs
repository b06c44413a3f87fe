//! Cooperative stop signal shared by every background loop.
//!
//! A `watch<bool>` rather than an mpsc: one sender, any number of loops
//! observing it, and a late subscriber still sees that stop was requested.

use tokio::sync::watch;

pub type StopSignal = watch::Receiver<bool>;

#[derive(Debug)]
pub struct StopSender {
    tx: watch::Sender<bool>,
}

impl StopSender {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> StopSignal {
        self.tx.subscribe()
    }
}

pub fn stop_channel() -> (StopSender, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopSender { tx }, rx)
}

/// Resolves once stop is requested (or the sender is gone).
pub async fn stopped(signal: &mut StopSignal) {
    let _ = signal.wait_for(|stop| *stop).await;
}
