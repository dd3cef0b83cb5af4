//! Background services

pub mod blacklist_eviction;
pub mod persistence;

use tokio::sync::watch;

pub use blacklist_eviction::{BlacklistEvictionConfig, BlacklistEvictionService};
pub use persistence::{FlushReport, PersistenceConfig, PersistenceService};

/// Shutdown signal shared by background services
pub struct ServiceHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ServiceHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ServiceHandle {
    fn default() -> Self {
        Self::new().0
    }
}
