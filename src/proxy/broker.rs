//! Exclusive proxy assignment to accounts

use std::cmp::Ordering;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Result, WardenError};
use crate::models::{AcquireRequest, PoolEvent, Proxy, ProxyStatus, MAX_ACCOUNT_ID_LEN};
use crate::proxy::registry::Registry;

/// Hands out proxies so that no two live accounts share one.
///
/// The registry entry is the source of truth for an assignment; the account
/// index here only routes `acquire`/`release` calls to the right key.
pub struct AssignmentBroker {
    registry: Arc<Registry>,
    accounts: DashMap<String, String>,
}

/// Best candidates first: higher score, then lower latency, then key
fn candidate_order(a: &Proxy, b: &Proxy) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| match (a.latency_ms, b.latency_ms) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.key.cmp(&b.key))
}

impl AssignmentBroker {
    /// Create a broker, indexing assignments already present in the registry
    pub fn new(registry: Arc<Registry>) -> Self {
        let accounts = DashMap::new();
        for (account_id, key) in registry.assignments() {
            accounts.insert(account_id, key);
        }
        Self { registry, accounts }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.registry.subscribe()
    }

    /// The proxy currently held by `account_id`, if any
    pub fn assignment_for(&self, account_id: &str) -> Option<Proxy> {
        let key = self.accounts.get(account_id).map(|k| k.value().clone())?;
        self.registry
            .get(&key)
            .filter(|p| p.assigned_account_id.as_deref() == Some(account_id))
    }

    pub fn active_assignments(&self) -> usize {
        self.accounts.len()
    }

    fn assign_best(&self, request: &AcquireRequest) -> Result<Proxy> {
        let filter = request.filter();
        let mut candidates = self.registry.snapshot_matching(&filter);
        candidates.sort_by(candidate_order);

        for candidate in candidates {
            match self
                .registry
                .try_assign(&candidate.key, &request.account_id, &filter)
            {
                Ok(proxy) => return Ok(proxy),
                Err(WardenError::ConcurrentModification { .. })
                | Err(WardenError::ProxyNotFound { .. }) => {
                    debug!(key = %candidate.key, "Candidate taken, trying next");
                }
                Err(e) => return Err(e),
            }
        }

        Err(WardenError::AssignmentExhausted)
    }

    /// Assign the best matching AVAILABLE proxy to an account.
    ///
    /// An account that already holds a live assignment gets the same proxy back.
    pub fn acquire(&self, request: &AcquireRequest) -> Result<Proxy> {
        if request.account_id.trim().is_empty() {
            return Err(WardenError::InvalidRequest(
                "account_id must not be empty".to_string(),
            ));
        }
        if request.account_id.len() > MAX_ACCOUNT_ID_LEN {
            return Err(WardenError::InvalidRequest(format!(
                "account_id longer than {} bytes",
                MAX_ACCOUNT_ID_LEN
            )));
        }

        // the entry guard serializes acquires for the same account
        match self.accounts.entry(request.account_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(proxy) = self.registry.get(occupied.get()) {
                    if proxy.status == ProxyStatus::Assigned
                        && proxy.assigned_account_id.as_deref() == Some(request.account_id.as_str())
                    {
                        return Ok(proxy);
                    }
                }

                // stale: the proxy was blacklisted or removed under the account
                let proxy = self.assign_best(request)?;
                occupied.insert(proxy.key.clone());
                info!(key = %proxy.key, account_id = %request.account_id, "Proxy reassigned");
                Ok(proxy)
            }
            Entry::Vacant(vacant) => {
                let proxy = self.assign_best(request)?;
                vacant.insert(proxy.key.clone());
                info!(key = %proxy.key, account_id = %request.account_id, "Proxy assigned");
                Ok(proxy)
            }
        }
    }

    /// Release whatever `account_id` holds. Unknown or stale accounts are a no-op.
    pub fn release(&self, account_id: &str) -> Option<Proxy> {
        let (_, key) = self.accounts.remove(account_id)?;

        match self.registry.release_assignment(&key, account_id) {
            Ok(proxy) => {
                info!(key = %key, account_id = %account_id, status = %proxy.status, "Proxy released");
                Some(proxy)
            }
            Err(WardenError::NotAssigned { .. }) => {
                debug!(key = %key, account_id = %account_id, "Release of stale assignment ignored");
                None
            }
            Err(e) => {
                warn!(key = %key, account_id = %account_id, "Release failed: {}", e);
                None
            }
        }
    }
}
