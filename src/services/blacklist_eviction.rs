//! Blacklist eviction service
//!
//! Blacklisted proxies are kept for inspection and manual reset, then removed
//! once they have been blacklisted for longer than the retention period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, instrument};

use crate::proxy::Registry;

#[derive(Debug, Clone)]
pub struct BlacklistEvictionConfig {
    pub check_interval: Duration,
    /// `None` keeps blacklisted proxies forever
    pub retention: Option<Duration>,
}

impl Default for BlacklistEvictionConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60 * 60),
            retention: Some(Duration::from_secs(72 * 60 * 60)),
        }
    }
}

pub struct BlacklistEvictionService {
    registry: Arc<Registry>,
    config: BlacklistEvictionConfig,
}

impl BlacklistEvictionService {
    pub fn new(registry: Arc<Registry>, config: BlacklistEvictionConfig) -> Self {
        Self { registry, config }
    }

    /// Remove proxies blacklisted longer than the retention period before `now`
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let Some(retention) = self.config.retention else {
            return Vec::new();
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Vec::new();
        };

        let evicted = self.registry.evict_blacklisted_before(now - retention);
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted expired blacklisted proxies");
        }
        evicted
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(retention) = self.config.retention else {
            info!("Blacklist eviction disabled");
            return;
        };

        info!(
            "Starting blacklist eviction service (interval: {}s, retention: {}h)",
            self.config.check_interval.as_secs(),
            retention.as_secs() / 3600
        );

        let mut ticker = interval(self.config.check_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Blacklist eviction service shutting down");
                        break;
                    }
                }
            }
        }
    }
}
