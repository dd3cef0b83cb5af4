use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ProbeErrorKind, ProxyStatus};

/// Notifications published by the pool.
///
/// Delivered over a bounded broadcast channel; slow receivers lose the oldest
/// events rather than blocking the publisher.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    StatusChanged {
        key: String,
        from: ProxyStatus,
        to: ProxyStatus,
        at: DateTime<Utc>,
    },
    Assigned {
        key: String,
        account_id: String,
    },
    Released {
        key: String,
        account_id: String,
    },
    /// A test of an assigned proxy failed; the owning workflow may want a replacement
    AssignedProxyDegraded {
        key: String,
        account_id: String,
        score: u8,
        error: Option<ProbeErrorKind>,
    },
    /// An assigned proxy was blacklisted and its assignment dropped
    AssignedProxyBlacklisted {
        key: String,
        account_id: String,
    },
    Removed {
        key: String,
        account_id: Option<String>,
    },
}

impl PoolEvent {
    pub fn key(&self) -> &str {
        match self {
            PoolEvent::StatusChanged { key, .. }
            | PoolEvent::Assigned { key, .. }
            | PoolEvent::Released { key, .. }
            | PoolEvent::AssignedProxyDegraded { key, .. }
            | PoolEvent::AssignedProxyBlacklisted { key, .. }
            | PoolEvent::Removed { key, .. } => key,
        }
    }

    /// The account affected by this event, if it concerns a live assignment
    pub fn account_id(&self) -> Option<&str> {
        match self {
            PoolEvent::Assigned { account_id, .. }
            | PoolEvent::Released { account_id, .. }
            | PoolEvent::AssignedProxyDegraded { account_id, .. }
            | PoolEvent::AssignedProxyBlacklisted { account_id, .. } => Some(account_id),
            PoolEvent::Removed { account_id, .. } => account_id.as_deref(),
            PoolEvent::StatusChanged { .. } => None,
        }
    }
}
