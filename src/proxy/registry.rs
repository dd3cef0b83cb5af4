//! In-memory proxy pool
//!
//! A sharded map of per-entry locks. Lock order is always map shard, then
//! entry; no code path touches the map while holding an entry lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Result, WardenError};
use crate::models::{
    IngestReport, PaginatedResponse, PoolEvent, PoolStats, ProbeResult, Proxy, ProxyEntry,
    ProxyFilter, ProxyRecord, ProxyStatus,
};
use crate::proxy::scoring::{AssignmentEffect, ScorePolicy, Transition};

/// Largest page `list_paginated` will return
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug)]
struct Slot {
    proxy: Proxy,
    /// Status held before the in-flight probe started; `Some` while probing
    probe_from: Option<ProxyStatus>,
    /// Set once the slot has been taken out of the map
    detached: bool,
}

impl Slot {
    fn new(proxy: Proxy) -> Self {
        Self {
            proxy,
            probe_from: None,
            detached: false,
        }
    }

    fn probing(&self) -> bool {
        self.probe_from.is_some()
    }

    /// Row to persist; a proxy under test is stored with its pre-test status
    fn record(&self) -> ProxyRecord {
        let mut record = ProxyRecord::from(&self.proxy);
        if let Some(from) = self.probe_from {
            if self.proxy.status == ProxyStatus::Testing {
                record.status = from.as_str().to_string();
            }
        }
        record
    }
}

type SlotRef = Arc<Mutex<Slot>>;

/// Authoritative store of pool members
pub struct Registry {
    entries: DashMap<String, SlotRef>,
    policy: ScorePolicy,
    events: broadcast::Sender<PoolEvent>,
    dirty: DashSet<String>,
    removed: DashSet<String>,
}

impl Registry {
    pub fn new(policy: ScorePolicy, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            entries: DashMap::new(),
            policy,
            events,
            dirty: DashSet::new(),
            removed: DashSet::new(),
        }
    }

    pub fn policy(&self) -> &ScorePolicy {
        &self.policy
    }

    /// Subscribe to pool events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn slot(&self, key: &str) -> Option<SlotRef> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn slot_or_not_found(&self, key: &str) -> Result<SlotRef> {
        self.slot(key).ok_or_else(|| WardenError::ProxyNotFound {
            key: key.to_string(),
        })
    }

    fn publish(&self, proxy: &Proxy, transition: &Transition) {
        if transition.changed() {
            self.emit(PoolEvent::StatusChanged {
                key: proxy.key.clone(),
                from: transition.from,
                to: transition.to,
                at: Utc::now(),
            });
        }

        match &transition.effect {
            Some(AssignmentEffect::Degraded { account_id }) => {
                warn!(key = %proxy.key, account_id = %account_id, score = proxy.score, "Assigned proxy failed health check");
                self.emit(PoolEvent::AssignedProxyDegraded {
                    key: proxy.key.clone(),
                    account_id: account_id.clone(),
                    score: proxy.score,
                    error: proxy.last_error,
                });
            }
            Some(AssignmentEffect::Blacklisted { account_id }) => {
                warn!(key = %proxy.key, account_id = %account_id, "Assigned proxy blacklisted, assignment dropped");
                self.emit(PoolEvent::AssignedProxyBlacklisted {
                    key: proxy.key.clone(),
                    account_id: account_id.clone(),
                });
            }
            None => {}
        }
    }

    /// Add a proxy if its key is new. Existing entries are never overwritten.
    pub fn ingest(&self, entry: ProxyEntry) -> bool {
        let key = entry.key();
        let added = match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let proxy = Proxy::new(entry, self.policy.initial_score, Utc::now());
                vacant.insert(Arc::new(Mutex::new(Slot::new(proxy))));
                true
            }
        };

        if added {
            self.removed.remove(&key);
            self.dirty.insert(key);
        }
        added
    }

    /// Ingest `host:port[:user:pass]` lines, skipping blanks and `#` comments
    pub fn ingest_lines<I, S>(&self, lines: I, country: Option<&str>) -> IngestReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = IngestReport::default();

        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match ProxyEntry::parse(line).and_then(|entry| entry.with_country(country)) {
                Ok(entry) => {
                    if self.ingest(entry) {
                        report.added += 1;
                    } else {
                        report.existing += 1;
                    }
                }
                Err(e) => {
                    debug!("Skipping proxy line: {}", e);
                    report.invalid.push(line.to_string());
                }
            }
        }

        info!(
            added = report.added,
            existing = report.existing,
            invalid = report.invalid.len(),
            "Ingested proxy list"
        );
        report
    }

    /// Load persisted proxies. Rows whose key is already present are skipped.
    pub fn restore(&self, records: Vec<ProxyRecord>) -> usize {
        let mut restored = 0;

        for record in records {
            let key = record.key.clone();
            let mut proxy = match Proxy::try_from(record) {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!(key = %key, "Skipping unreadable stored proxy: {}", e);
                    continue;
                }
            };

            let status = self.policy.restored_status(&proxy);
            let normalized = status != proxy.status;
            proxy.status = status;
            if !proxy.is_assigned() {
                proxy.assigned_account_id = None;
            }

            if let dashmap::mapref::entry::Entry::Vacant(vacant) = self.entries.entry(key.clone()) {
                vacant.insert(Arc::new(Mutex::new(Slot::new(proxy))));
                restored += 1;
                if normalized {
                    self.dirty.insert(key);
                }
            }
        }

        restored
    }

    pub fn get(&self, key: &str) -> Option<Proxy> {
        self.slot(key).map(|slot| slot.lock().proxy.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Proxy> {
        self.entries
            .iter()
            .map(|entry| entry.value().lock().proxy.clone())
            .collect()
    }

    pub fn snapshot_matching(&self, filter: &ProxyFilter) -> Vec<Proxy> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let slot = entry.value().lock();
                filter.matches(&slot.proxy).then(|| slot.proxy.clone())
            })
            .collect()
    }

    /// Proxies the scheduler may consider: not under test and not blacklisted
    pub fn schedule_candidates(&self) -> Vec<Proxy> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let slot = entry.value().lock();
                let eligible = !slot.probing()
                    && !matches!(
                        slot.proxy.status,
                        ProxyStatus::Testing | ProxyStatus::Blacklisted
                    );
                eligible.then(|| slot.proxy.clone())
            })
            .collect()
    }

    /// Mark a proxy as under test.
    ///
    /// Returns `None` when it is gone, blacklisted, or already being probed.
    /// Assigned proxies keep their status and only carry the probing marker.
    pub fn begin_test(&self, key: &str) -> Option<Proxy> {
        let slot = self.slot(key)?;
        let mut slot = slot.lock();

        if slot.probing()
            || matches!(
                slot.proxy.status,
                ProxyStatus::Testing | ProxyStatus::Blacklisted
            )
        {
            return None;
        }

        slot.probe_from = Some(slot.proxy.status);
        if !slot.proxy.is_assigned() {
            slot.proxy.status = ProxyStatus::Testing;
        }
        Some(slot.proxy.clone())
    }

    /// Like `begin_test`, but also accepts blacklisted proxies, for operator probes.
    pub fn begin_manual_test(&self, key: &str) -> Result<Proxy> {
        let slot = self.slot_or_not_found(key)?;
        let mut slot = slot.lock();

        if slot.probing() || slot.proxy.status == ProxyStatus::Testing {
            return Err(WardenError::ConcurrentModification {
                key: key.to_string(),
            });
        }

        slot.probe_from = Some(slot.proxy.status);
        if matches!(
            slot.proxy.status,
            ProxyStatus::Available | ProxyStatus::Degraded
        ) {
            slot.proxy.status = ProxyStatus::Testing;
        }
        Ok(slot.proxy.clone())
    }

    /// Apply a probe result to the proxy and clear its probing marker
    pub fn apply_probe_result(&self, key: &str, result: &ProbeResult) -> Result<Transition> {
        let slot = self.slot_or_not_found(key)?;
        let (proxy, transition) = {
            let mut slot = slot.lock();
            slot.probe_from = None;
            let transition = self.policy.apply(&mut slot.proxy, result, Utc::now());
            (slot.proxy.clone(), transition)
        };

        debug!(
            key = %key,
            ok = result.ok(),
            score = proxy.score,
            from = %transition.from,
            to = %transition.to,
            "Applied probe result"
        );

        self.dirty.insert(key.to_string());
        self.publish(&proxy, &transition);
        Ok(transition)
    }

    /// Give up on a probe that will never report back.
    ///
    /// Restores the status the proxy had before the test and clears the
    /// probing marker. A no-op when no probe is in flight.
    pub fn abandon_test(&self, key: &str) {
        let Some(slot) = self.slot(key) else {
            return;
        };
        let mut slot = slot.lock();
        if let Some(from) = slot.probe_from.take() {
            if slot.proxy.status == ProxyStatus::Testing {
                slot.proxy.status = from;
            }
            debug!(key = %key, status = %slot.proxy.status, "Abandoned unfinished test");
        }
    }

    /// Compare-and-set `AVAILABLE -> ASSIGNED`.
    ///
    /// Fails with `ConcurrentModification` when the proxy no longer matches
    /// `filter` by the time its lock is held.
    pub fn try_assign(&self, key: &str, account_id: &str, filter: &ProxyFilter) -> Result<Proxy> {
        let slot = self.slot_or_not_found(key)?;
        self.assign_slot(&slot, key, account_id, filter)
    }

    /// `try_assign` against an already looked-up slot. A slot removed from the
    /// map in the meantime is reported as not found.
    fn assign_slot(
        &self,
        slot: &SlotRef,
        key: &str,
        account_id: &str,
        filter: &ProxyFilter,
    ) -> Result<Proxy> {
        let proxy = {
            let mut slot = slot.lock();
            if slot.detached {
                return Err(WardenError::ProxyNotFound {
                    key: key.to_string(),
                });
            }
            if slot.probing()
                || slot.proxy.status != ProxyStatus::Available
                || !filter.matches(&slot.proxy)
            {
                return Err(WardenError::ConcurrentModification {
                    key: key.to_string(),
                });
            }

            slot.proxy.status = ProxyStatus::Assigned;
            slot.proxy.assigned_account_id = Some(account_id.to_string());
            slot.proxy.clone()
        };

        self.dirty.insert(key.to_string());
        self.emit(PoolEvent::StatusChanged {
            key: key.to_string(),
            from: ProxyStatus::Available,
            to: ProxyStatus::Assigned,
            at: Utc::now(),
        });
        self.emit(PoolEvent::Assigned {
            key: key.to_string(),
            account_id: account_id.to_string(),
        });
        Ok(proxy)
    }

    /// Undo an assignment held by `account_id`
    pub fn release_assignment(&self, key: &str, account_id: &str) -> Result<Proxy> {
        let slot = self.slot(key).ok_or_else(|| WardenError::NotAssigned {
            account_id: account_id.to_string(),
        })?;

        let proxy = {
            let mut slot = slot.lock();
            if slot.proxy.assigned_account_id.as_deref() != Some(account_id) {
                return Err(WardenError::NotAssigned {
                    account_id: account_id.to_string(),
                });
            }

            slot.proxy.assigned_account_id = None;
            slot.proxy.status = self.policy.released_status(&slot.proxy);
            slot.proxy.clone()
        };

        self.dirty.insert(key.to_string());
        self.emit(PoolEvent::StatusChanged {
            key: key.to_string(),
            from: ProxyStatus::Assigned,
            to: proxy.status,
            at: Utc::now(),
        });
        self.emit(PoolEvent::Released {
            key: key.to_string(),
            account_id: account_id.to_string(),
        });
        Ok(proxy)
    }

    /// Record an externally computed fraud score
    pub fn record_fraud_score(&self, key: &str, fraud_score: u8) -> Result<Proxy> {
        if fraud_score > 100 {
            return Err(WardenError::InvalidRequest(format!(
                "fraud score {} is out of range 0-100",
                fraud_score
            )));
        }

        let slot = self.slot_or_not_found(key)?;
        let (proxy, transition) = {
            let mut slot = slot.lock();
            let transition = self
                .policy
                .apply_fraud_score(&mut slot.proxy, fraud_score, Utc::now());
            (slot.proxy.clone(), transition)
        };

        self.dirty.insert(key.to_string());
        self.publish(&proxy, &transition);
        Ok(proxy)
    }

    /// Manual `BLACKLISTED -> AVAILABLE` reset
    pub fn reset(&self, key: &str) -> Result<Proxy> {
        let slot = self.slot_or_not_found(key)?;
        let (proxy, transition) = {
            let mut slot = slot.lock();
            if slot.proxy.status != ProxyStatus::Blacklisted {
                return Err(WardenError::InvalidRequest(format!(
                    "proxy {} is {}, only blacklisted proxies can be reset",
                    key, slot.proxy.status
                )));
            }
            let transition = self.policy.reset(&mut slot.proxy);
            (slot.proxy.clone(), transition)
        };

        info!(key = %key, "Proxy reset from blacklist");
        self.dirty.insert(key.to_string());
        self.publish(&proxy, &transition);
        Ok(proxy)
    }

    /// Mark a slot taken out of the map and return its last state
    fn detach(slot: &SlotRef) -> Proxy {
        let mut slot = slot.lock();
        slot.detached = true;
        slot.proxy.clone()
    }

    fn forget(&self, proxy: &Proxy) {
        self.dirty.remove(&proxy.key);
        self.removed.insert(proxy.key.clone());
        self.emit(PoolEvent::Removed {
            key: proxy.key.clone(),
            account_id: proxy.assigned_account_id.clone(),
        });
    }

    /// Remove a proxy regardless of status
    pub fn remove(&self, key: &str) -> Result<Proxy> {
        let (_, slot) = self
            .entries
            .remove(key)
            .ok_or_else(|| WardenError::ProxyNotFound {
                key: key.to_string(),
            })?;
        let proxy = Self::detach(&slot);
        self.forget(&proxy);
        Ok(proxy)
    }

    /// Remove every blacklisted proxy for which `pred` holds
    fn remove_blacklisted_where<F>(&self, pred: F) -> Vec<String>
    where
        F: Fn(&Proxy) -> bool,
    {
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let slot = entry.value().lock();
                (slot.proxy.status == ProxyStatus::Blacklisted && pred(&slot.proxy))
                    .then(|| entry.key().clone())
            })
            .collect();

        let mut removed = Vec::with_capacity(candidates.len());
        for key in candidates {
            // status may have changed (manual reset) since the scan
            let taken = self.entries.remove_if(&key, |_, slot| {
                let slot = slot.lock();
                slot.proxy.status == ProxyStatus::Blacklisted && pred(&slot.proxy)
            });
            if let Some((_, slot)) = taken {
                let proxy = Self::detach(&slot);
                self.forget(&proxy);
                removed.push(key);
            }
        }
        removed
    }

    /// Bulk delete of all blacklisted proxies
    pub fn remove_blacklisted(&self) -> Vec<String> {
        self.remove_blacklisted_where(|_| true)
    }

    /// Remove proxies blacklisted before `cutoff`
    pub fn evict_blacklisted_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.remove_blacklisted_where(|proxy| {
            proxy
                .blacklisted_at
                .map(|at| at < cutoff)
                .unwrap_or(false)
        })
    }

    /// List proxies matching `filter`, best score first. `page` is 1-based.
    pub fn list_paginated(
        &self,
        filter: &ProxyFilter,
        page: usize,
        page_size: usize,
    ) -> PaginatedResponse<Proxy> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        let mut matching = self.snapshot_matching(filter);
        matching.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.key.cmp(&b.key)));

        let total = matching.len();
        let data = matching
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();

        PaginatedResponse::new(data, total, page, page_size)
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        let mut score_sum: u64 = 0;
        let mut latency_sum: u64 = 0;
        let mut latency_count: u64 = 0;

        for entry in self.entries.iter() {
            let slot = entry.value().lock();
            let proxy = &slot.proxy;
            stats.total += 1;
            match proxy.status {
                ProxyStatus::Available => stats.available += 1,
                ProxyStatus::Assigned => stats.assigned += 1,
                ProxyStatus::Testing => stats.testing += 1,
                ProxyStatus::Degraded => stats.degraded += 1,
                ProxyStatus::Blacklisted => stats.blacklisted += 1,
            }
            score_sum += u64::from(proxy.score);
            if let Some(latency) = proxy.latency_ms {
                latency_sum = latency_sum.saturating_add(latency);
                latency_count += 1;
            }
        }

        if stats.total > 0 {
            stats.average_score = score_sum as f64 / stats.total as f64;
        }
        if latency_count > 0 {
            stats.average_latency_ms = Some(latency_sum / latency_count);
        }
        stats
    }

    /// Live `(account_id, key)` pairs
    pub fn assignments(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let slot = entry.value().lock();
                slot.proxy
                    .assigned_account_id
                    .clone()
                    .map(|account| (account, slot.proxy.key.clone()))
            })
            .collect()
    }

    /// Drain pending writes: current rows for changed keys, and keys to delete
    pub fn take_dirty(&self) -> (Vec<ProxyRecord>, Vec<String>) {
        let dirty: Vec<String> = self.dirty.iter().map(|k| k.key().clone()).collect();
        let mut records = Vec::with_capacity(dirty.len());
        for key in dirty {
            if self.dirty.remove(&key).is_some() {
                if let Some(slot) = self.slot(&key) {
                    records.push(slot.lock().record());
                }
            }
        }

        let removed: Vec<String> = self.removed.iter().map(|k| k.key().clone()).collect();
        let removed = removed
            .into_iter()
            .filter(|key| self.removed.remove(key).is_some())
            .collect();

        (records, removed)
    }

    /// Re-queue keys whose write failed
    pub fn mark_dirty<I: IntoIterator<Item = String>>(&self, keys: I) {
        for key in keys {
            if self.entries.contains_key(&key) {
                self.dirty.insert(key);
            }
        }
    }

    /// Re-queue deletions that failed
    pub fn requeue_removed<I: IntoIterator<Item = String>>(&self, keys: I) {
        for key in keys {
            if !self.entries.contains_key(&key) {
                self.removed.insert(key);
            }
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.dirty.len() + self.removed.len()
    }
}
