//! Write-behind persistence of pool state
//!
//! The registry tracks which keys changed; this service periodically drains
//! those sets into the store. When the store is unreachable the keys go back
//! so the next flush retries them, and the in-memory pool keeps running
//! regardless. A batch the store rejects is split into single rows, so one
//! bad row is skipped instead of holding back every other change.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::models::ProxyRecord;
use crate::proxy::Registry;
use crate::repository::ProxyStore;

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub flush_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub upserted: usize,
    pub deleted: usize,
    /// Rows the store refused; written again once the proxy next changes
    pub rejected: usize,
}

pub struct PersistenceService {
    registry: Arc<Registry>,
    store: Arc<dyn ProxyStore>,
    config: PersistenceConfig,
}

impl PersistenceService {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn ProxyStore>,
        config: PersistenceConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Write every pending change to the store
    pub async fn flush(&self) -> Result<FlushReport> {
        let (records, removed) = self.registry.take_dirty();
        if records.is_empty() && removed.is_empty() {
            return Ok(FlushReport::default());
        }

        let dirty_keys = || records.iter().map(|r| r.key.clone()).collect::<Vec<_>>();

        // deletes first so a re-ingested key is written back afterwards
        if !removed.is_empty() {
            if let Err(e) = self.store.delete_many(&removed).await {
                self.registry.requeue_removed(removed);
                self.registry.mark_dirty(dirty_keys());
                return Err(e);
            }
        }

        let mut report = FlushReport {
            deleted: removed.len(),
            ..FlushReport::default()
        };

        if !records.is_empty() {
            match self.store.upsert_many(&records).await {
                Ok(_) => report.upserted = records.len(),
                Err(e) if e.is_connection_error() => {
                    self.registry.mark_dirty(dirty_keys());
                    return Err(e);
                }
                Err(e) => {
                    warn!(rows = records.len(), "Batch upsert rejected, writing rows one by one: {}", e);
                    self.upsert_each(&records, &mut report).await?;
                }
            }
        }

        debug!(
            upserted = report.upserted,
            deleted = report.deleted,
            rejected = report.rejected,
            "Flushed pool state"
        );
        Ok(report)
    }

    async fn upsert_each(&self, records: &[ProxyRecord], report: &mut FlushReport) -> Result<()> {
        for (i, record) in records.iter().enumerate() {
            match self.store.upsert_many(std::slice::from_ref(record)).await {
                Ok(_) => report.upserted += 1,
                Err(e) if e.is_connection_error() => {
                    self.registry
                        .mark_dirty(records[i..].iter().map(|r| r.key.clone()));
                    return Err(e);
                }
                Err(e) => {
                    report.rejected += 1;
                    error!(key = %record.key, "Store rejected row, skipping it: {}", e);
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting persistence service (interval: {}s)",
            self.config.flush_interval.as_secs()
        );

        let mut ticker = interval(self.config.flush_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!(pending = self.registry.pending_writes(), "Persisting pool state failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        match self.flush().await {
            Ok(report) => info!(
                upserted = report.upserted,
                deleted = report.deleted,
                "Persistence service shutting down after final flush"
            ),
            Err(e) => error!("Final flush failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProbeErrorKind, ProbeResult};
    use crate::proxy::ScorePolicy;
    use crate::repository::MemoryProxyStore;

    fn setup() -> (Arc<Registry>, Arc<MemoryProxyStore>, PersistenceService) {
        let registry = Arc::new(Registry::new(ScorePolicy::default(), 16));
        let store = Arc::new(MemoryProxyStore::new());
        let service = PersistenceService::new(
            Arc::clone(&registry),
            store.clone(),
            PersistenceConfig::default(),
        );
        (registry, store, service)
    }

    #[tokio::test]
    async fn test_flush_writes_changes_and_deletions() {
        let (registry, store, service) = setup();
        registry.ingest_lines(["10.0.0.1:80", "10.0.0.2:80"], None);

        let report = service.flush().await.unwrap();
        assert_eq!(report.upserted, 2);
        assert_eq!(store.len(), 2);

        registry
            .apply_probe_result("10.0.0.1:80", &ProbeResult::failed(ProbeErrorKind::Timeout))
            .unwrap();
        registry.remove("10.0.0.2:80").unwrap();

        let report = service.flush().await.unwrap();
        assert_eq!(
            report,
            FlushReport {
                upserted: 1,
                deleted: 1,
                rejected: 0
            }
        );
        assert_eq!(store.len(), 1);
        let row = store.get("10.0.0.1:80").unwrap();
        assert_eq!(row.status, "degraded");
        assert_eq!(row.consecutive_failures, 1);

        assert_eq!(service.flush().await.unwrap(), FlushReport::default());
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried() {
        let (registry, store, service) = setup();
        registry.ingest_lines(["10.0.0.1:80"], None);

        store.set_fail_writes(true);
        assert!(service.flush().await.is_err());
        assert_eq!(registry.pending_writes(), 1);
        assert!(store.is_empty());

        store.set_fail_writes(false);
        assert_eq!(service.flush().await.unwrap().upserted, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(registry.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_rejected_row_does_not_block_others() {
        let (registry, store, service) = setup();
        registry.ingest_lines(["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"], None);
        store.reject_key("10.0.0.2:80");

        let report = service.flush().await.unwrap();
        assert_eq!(report.upserted, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(store.len(), 2);
        assert!(store.get("10.0.0.2:80").is_none());
        assert_eq!(registry.pending_writes(), 0);

        // later changes keep flowing while the bad row stays out
        registry
            .apply_probe_result("10.0.0.1:80", &ProbeResult::healthy(200, 90))
            .unwrap();
        let report = service.flush().await.unwrap();
        assert_eq!(report.upserted, 1);
        assert_eq!(store.get("10.0.0.1:80").unwrap().latency_ms, Some(90));

        // the skipped row is written once it changes and the store accepts it
        store.accept_key("10.0.0.2:80");
        registry
            .apply_probe_result("10.0.0.2:80", &ProbeResult::healthy(200, 40))
            .unwrap();
        assert_eq!(service.flush().await.unwrap().upserted, 1);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let (registry, store, service) = setup();
        registry.ingest_lines(["10.0.0.1:80:user:pass"], Some("nl"));
        service.flush().await.unwrap();

        let restored = Registry::new(ScorePolicy::default(), 16);
        assert_eq!(restored.restore(store.load_all().await.unwrap()), 1);
        assert_eq!(restored.get("10.0.0.1:80"), registry.get("10.0.0.1:80"));
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let (registry, store, service) = setup();
        let service = PersistenceService {
            config: PersistenceConfig {
                flush_interval: Duration::from_secs(3600),
            },
            ..service
        };
        registry.ingest_lines(["10.0.0.1:80"], None);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { service.run(rx).await });
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(store.len(), 1);
    }
}
