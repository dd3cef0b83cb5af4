//! Decides which proxies are due for a health check, and in which order

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::{Proxy, ProxyStatus};

/// Urgency of a health check, lower is more urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
}

impl PriorityLevel {
    pub fn for_proxy(proxy: &Proxy) -> Self {
        if proxy.status == ProxyStatus::Assigned {
            PriorityLevel::Critical
        } else if proxy.last_checked_at.is_none() {
            PriorityLevel::Medium
        } else if proxy.status == ProxyStatus::Available {
            PriorityLevel::High
        } else {
            PriorityLevel::Low
        }
    }
}

/// A proxy scheduled for a health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTask {
    pub proxy_key: String,
    pub priority: PriorityLevel,
    /// Last check plus the priority's interval; never-checked proxies are
    /// due since `DateTime::<Utc>::MIN_UTC`
    pub due_at: DateTime<Utc>,
}

/// Scheduler configuration
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub critical_interval: Duration,
    pub high_interval: Duration,
    pub medium_interval: Duration,
    pub low_interval: Duration,
    /// How long a queued proxy stays out of subsequent schedules
    pub dedup_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            critical_interval: Duration::from_secs(5 * 60),
            high_interval: Duration::from_secs(15 * 60),
            medium_interval: Duration::from_secs(30 * 60),
            low_interval: Duration::from_secs(60 * 60),
            dedup_window: Duration::from_secs(5 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self, priority: PriorityLevel) -> Duration {
        match priority {
            PriorityLevel::Critical => self.critical_interval,
            PriorityLevel::High => self.high_interval,
            PriorityLevel::Medium => self.medium_interval,
            PriorityLevel::Low => self.low_interval,
        }
    }
}

/// Priority-based scheduler with per-proxy de-duplication
pub struct PriorityScheduler {
    config: SchedulerConfig,
    recently_queued: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PriorityScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            recently_queued: Mutex::new(HashMap::new()),
        }
    }

    /// When `proxy` next needs a check at `priority`
    fn due_at(&self, proxy: &Proxy, priority: PriorityLevel) -> DateTime<Utc> {
        let Some(last) = proxy.last_checked_at else {
            return DateTime::<Utc>::MIN_UTC;
        };
        chrono::Duration::from_std(self.config.interval(priority))
            .ok()
            .and_then(|interval| last.checked_add_signed(interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Compute the due tasks for `pool` and remember them as queued
    pub fn due_tasks<'a, I>(&self, now: DateTime<Utc>, pool: I) -> Vec<HealthTask>
    where
        I: IntoIterator<Item = &'a Proxy>,
    {
        let mut queued = self.recently_queued.lock();
        let window = self.config.dedup_window;
        queued.retain(|_, at| match (now - *at).to_std() {
            Ok(elapsed) => elapsed < window,
            Err(_) => true,
        });

        let mut tasks: Vec<HealthTask> = pool
            .into_iter()
            .filter(|proxy| {
                !matches!(
                    proxy.status,
                    ProxyStatus::Testing | ProxyStatus::Blacklisted
                )
            })
            .filter(|proxy| !queued.contains_key(&proxy.key))
            .filter_map(|proxy| {
                let priority = PriorityLevel::for_proxy(proxy);
                // a check stamped in the future (clock skew) is not due yet
                let due_at = self.due_at(proxy, priority);
                (due_at <= now).then(|| HealthTask {
                    proxy_key: proxy.key.clone(),
                    priority,
                    due_at,
                })
            })
            .collect();

        // one interval per priority, so earliest due is also stalest
        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.due_at.cmp(&b.due_at))
                .then_with(|| a.proxy_key.cmp(&b.proxy_key))
        });

        for task in &tasks {
            queued.insert(task.proxy_key.clone(), now);
        }

        tasks
    }

    /// Let `key` be scheduled again before its window expires
    pub fn forget(&self, key: &str) {
        self.recently_queued.lock().remove(key);
    }

    pub fn queued_len(&self) -> usize {
        self.recently_queued.lock().len()
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
