use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::ProxyStore;
use crate::error::{Result, WardenError};
use crate::models::ProxyRecord;

/// In-process store, for running without a database and for tests
#[derive(Default)]
pub struct MemoryProxyStore {
    rows: Mutex<BTreeMap<String, ProxyRecord>>,
    fail_writes: AtomicBool,
    rejected: Mutex<HashSet<String>>,
}

impl MemoryProxyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<ProxyRecord>) -> Self {
        let store = Self::default();
        store
            .rows
            .lock()
            .extend(records.into_iter().map(|r| (r.key.clone(), r)));
        store
    }

    /// Make subsequent writes fail, to exercise retry paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make any batch containing `key` fail the way a constraint violation does
    pub fn reject_key(&self, key: impl Into<String>) {
        self.rejected.lock().insert(key.into());
    }

    pub fn accept_key(&self, key: &str) {
        self.rejected.lock().remove(key);
    }

    pub fn get(&self, key: &str) -> Option<ProxyRecord> {
        self.rows.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WardenError::DatabaseConnection(
                "store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_rows(&self, records: &[ProxyRecord]) -> Result<()> {
        let rejected = self.rejected.lock();
        match records.iter().find(|r| rejected.contains(&r.key)) {
            Some(record) => Err(WardenError::Database(sqlx::Error::Protocol(format!(
                "row {} violates a column constraint",
                record.key
            )))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProxyStore for MemoryProxyStore {
    async fn load_all(&self) -> Result<Vec<ProxyRecord>> {
        Ok(self.rows.lock().values().cloned().collect())
    }

    async fn upsert_many(&self, records: &[ProxyRecord]) -> Result<u64> {
        self.check_writable()?;
        // all or nothing, like the transaction in the Postgres store
        self.check_rows(records)?;
        let mut rows = self.rows.lock();
        for record in records {
            let mut record = record.clone();
            // created_at is fixed on first insert
            if let Some(existing) = rows.get(&record.key) {
                record.created_at = existing.created_at;
            }
            rows.insert(record.key.clone(), record);
        }
        Ok(records.len() as u64)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        self.check_writable()?;
        let mut rows = self.rows.lock();
        Ok(keys.iter().filter(|k| rows.remove(*k).is_some()).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Proxy, ProxyEntry};
    use chrono::Utc;

    fn record(line: &str) -> ProxyRecord {
        ProxyRecord::from(&Proxy::new(ProxyEntry::parse(line).unwrap(), 50, Utc::now()))
    }

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let store = MemoryProxyStore::new();
        store
            .upsert_many(&[record("10.0.0.1:80"), record("10.0.0.2:80")])
            .await
            .unwrap();
        assert_eq!(store.len(), 2);

        let mut updated = record("10.0.0.1:80");
        updated.score = 77;
        store.upsert_many(&[updated]).await.unwrap();
        assert_eq!(store.get("10.0.0.1:80").unwrap().score, 77);

        let deleted = store
            .delete_many(&["10.0.0.2:80".to_string(), "missing:1".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryProxyStore::new();
        store.set_fail_writes(true);
        assert!(store.upsert_many(&[record("10.0.0.1:80")]).await.is_err());
        assert!(store.is_empty());

        store.set_fail_writes(false);
        assert_eq!(store.upsert_many(&[record("10.0.0.1:80")]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejected_row_fails_whole_batch() {
        let store = MemoryProxyStore::new();
        store.reject_key("10.0.0.2:80");

        let err = store
            .upsert_many(&[record("10.0.0.1:80"), record("10.0.0.2:80")])
            .await
            .unwrap_err();
        assert!(!err.is_connection_error());
        assert!(store.is_empty());

        store.accept_key("10.0.0.2:80");
        assert_eq!(
            store
                .upsert_many(&[record("10.0.0.1:80"), record("10.0.0.2:80")])
                .await
                .unwrap(),
            2
        );
    }
}
