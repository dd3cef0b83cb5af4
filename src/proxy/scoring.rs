//! Score and status rules for pool members
//!
//! Everything here is pure: callers hold the per-entry lock and hand in the
//! current time, so the same rules drive live probes, restores and tests.

use chrono::{DateTime, Utc};

use crate::models::{ProbeResult, Proxy, ProxyStatus};

/// Thresholds and score dynamics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScorePolicy {
    pub initial_score: u8,
    /// Successful proxies below this score stay DEGRADED
    pub healthy_floor: u8,
    /// At or below this score a proxy is blacklisted
    pub blacklist_score_floor: u8,
    pub blacklist_failures: u32,
    /// Fraud scores strictly above this blacklist the proxy
    pub fraud_ceiling: u8,
    pub success_gain_percent: u8,
    pub failure_penalty_base: u8,
    pub failure_penalty_cap: u8,
}

impl Default for ScorePolicy {
    fn default() -> Self {
        Self {
            initial_score: 50,
            healthy_floor: 20,
            blacklist_score_floor: 0,
            blacklist_failures: 5,
            fraud_ceiling: 80,
            success_gain_percent: 10,
            failure_penalty_base: 4,
            failure_penalty_cap: 25,
        }
    }
}

/// What a transition means for the account holding the proxy, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentEffect {
    /// Test failed while assigned; the assignment is kept
    Degraded { account_id: String },
    /// Proxy was blacklisted and the assignment dropped
    Blacklisted { account_id: String },
}

/// Result of applying a rule to a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ProxyStatus,
    pub to: ProxyStatus,
    pub effect: Option<AssignmentEffect>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

impl ScorePolicy {
    pub fn success_delta(&self, score: u8) -> u8 {
        let gain = (100 - u32::from(score.min(100))) * u32::from(self.success_gain_percent) / 100;
        gain.max(1) as u8
    }

    pub fn failure_delta(&self, consecutive_failures: u32) -> u8 {
        let delta = u32::from(self.failure_penalty_base).saturating_mul(consecutive_failures);
        delta.min(u32::from(self.failure_penalty_cap)) as u8
    }

    pub fn should_blacklist(&self, proxy: &Proxy) -> bool {
        proxy.consecutive_failures >= self.blacklist_failures
            || proxy.fraud_score > self.fraud_ceiling
            || proxy.score <= self.blacklist_score_floor
    }

    /// Apply a probe result. Blacklisted proxies keep their status whatever the result.
    pub fn apply(&self, proxy: &mut Proxy, result: &ProbeResult, now: DateTime<Utc>) -> Transition {
        let from = proxy.status;

        proxy.last_checked_at = Some(now);
        if result.latency_ms.is_some() {
            proxy.latency_ms = result.latency_ms;
        }

        if result.ok() {
            proxy.consecutive_failures = 0;
            proxy.last_error = None;
            proxy.score = proxy.score.saturating_add(self.success_delta(proxy.score)).min(100);
        } else {
            proxy.consecutive_failures = proxy.consecutive_failures.saturating_add(1);
            proxy.last_error = result.error_kind();
            proxy.score = proxy
                .score
                .saturating_sub(self.failure_delta(proxy.consecutive_failures));
        }

        if from == ProxyStatus::Blacklisted {
            return Transition {
                from,
                to: from,
                effect: None,
            };
        }

        if self.should_blacklist(proxy) {
            let effect = self.blacklist(proxy, now);
            return Transition {
                from,
                to: ProxyStatus::Blacklisted,
                effect,
            };
        }

        if proxy.is_assigned() {
            let effect = match (&proxy.assigned_account_id, result.ok()) {
                (Some(account_id), false) => Some(AssignmentEffect::Degraded {
                    account_id: account_id.clone(),
                }),
                _ => None,
            };
            return Transition {
                from,
                to: ProxyStatus::Assigned,
                effect,
            };
        }

        proxy.status = if result.ok() && proxy.score >= self.healthy_floor {
            ProxyStatus::Available
        } else {
            ProxyStatus::Degraded
        };

        Transition {
            from,
            to: proxy.status,
            effect: None,
        }
    }

    /// Record an external fraud assessment
    pub fn apply_fraud_score(&self, proxy: &mut Proxy, fraud_score: u8, now: DateTime<Utc>) -> Transition {
        let from = proxy.status;
        proxy.fraud_score = fraud_score.min(100);

        let effect = if from != ProxyStatus::Blacklisted && self.should_blacklist(proxy) {
            self.blacklist(proxy, now)
        } else {
            None
        };

        Transition {
            from,
            to: proxy.status,
            effect,
        }
    }

    /// Status a proxy returns to when its account lets go of it
    pub fn released_status(&self, proxy: &Proxy) -> ProxyStatus {
        if proxy.consecutive_failures > 0 || proxy.score < self.healthy_floor {
            ProxyStatus::Degraded
        } else {
            ProxyStatus::Available
        }
    }

    /// Status for a proxy loaded from storage.
    ///
    /// A stored TESTING row means the process died mid-probe.
    pub fn restored_status(&self, proxy: &Proxy) -> ProxyStatus {
        match proxy.status {
            ProxyStatus::Testing if proxy.consecutive_failures == 0 => ProxyStatus::Available,
            ProxyStatus::Testing => ProxyStatus::Degraded,
            ProxyStatus::Assigned if proxy.assigned_account_id.is_none() => {
                self.released_status(proxy)
            }
            status => status,
        }
    }

    /// Manual `BLACKLISTED -> AVAILABLE` reset
    pub fn reset(&self, proxy: &mut Proxy) -> Transition {
        let from = proxy.status;
        proxy.status = ProxyStatus::Available;
        proxy.score = self.initial_score.min(100);
        proxy.fraud_score = 0;
        proxy.consecutive_failures = 0;
        proxy.last_error = None;
        proxy.blacklisted_at = None;
        proxy.assigned_account_id = None;

        Transition {
            from,
            to: ProxyStatus::Available,
            effect: None,
        }
    }

    fn blacklist(&self, proxy: &mut Proxy, now: DateTime<Utc>) -> Option<AssignmentEffect> {
        proxy.status = ProxyStatus::Blacklisted;
        proxy.blacklisted_at = Some(now);
        proxy
            .assigned_account_id
            .take()
            .map(|account_id| AssignmentEffect::Blacklisted { account_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProbeErrorKind, ProxyEntry};
    use proptest::prelude::*;

    fn proxy_with_score(score: u8) -> Proxy {
        Proxy::new(ProxyEntry::parse("10.0.0.1:8080").unwrap(), score, Utc::now())
    }

    fn tcp_failure() -> ProbeResult {
        ProbeResult::failed(ProbeErrorKind::TcpFailed)
    }

    #[test]
    fn test_success_delta_has_diminishing_returns() {
        let policy = ScorePolicy::default();
        assert_eq!(policy.success_delta(50), 5);
        assert_eq!(policy.success_delta(0), 10);
        assert_eq!(policy.success_delta(95), 1);
        assert_eq!(policy.success_delta(100), 1);
    }

    #[test]
    fn test_failure_delta_accelerates_and_caps() {
        let policy = ScorePolicy::default();
        assert_eq!(policy.failure_delta(1), 4);
        assert_eq!(policy.failure_delta(3), 12);
        assert_eq!(policy.failure_delta(10), 25);
        assert_eq!(policy.failure_delta(u32::MAX), 25);
    }

    #[test]
    fn test_five_tcp_failures_blacklist_from_initial_score() {
        let policy = ScorePolicy::default();
        let mut proxy = proxy_with_score(50);
        let now = Utc::now();

        let mut scores = Vec::new();
        for _ in 0..4 {
            let t = policy.apply(&mut proxy, &tcp_failure(), now);
            assert_eq!(t.to, ProxyStatus::Degraded);
            scores.push(proxy.score);
        }
        assert_eq!(scores, vec![46, 38, 26, 10]);

        let t = policy.apply(&mut proxy, &tcp_failure(), now);
        assert_eq!(t.to, ProxyStatus::Blacklisted);
        assert_eq!(proxy.consecutive_failures, 5);
        assert_eq!(proxy.score, 0);
        assert_eq!(proxy.blacklisted_at, Some(now));
        assert_eq!(proxy.last_error, Some(ProbeErrorKind::TcpFailed));
    }

    #[test]
    fn test_success_below_floor_stays_degraded() {
        let policy = ScorePolicy::default();
        let mut proxy = proxy_with_score(10);
        proxy.status = ProxyStatus::Testing;

        let t = policy.apply(&mut proxy, &ProbeResult::healthy(200, 90), Utc::now());
        assert_eq!(proxy.score, 19);
        assert_eq!(t.from, ProxyStatus::Testing);
        assert_eq!(t.to, ProxyStatus::Degraded);
        assert_eq!(proxy.latency_ms, Some(90));

        policy.apply(&mut proxy, &ProbeResult::healthy(200, 70), Utc::now());
        assert_eq!(proxy.status, ProxyStatus::Available);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let policy = ScorePolicy::default();
        let mut proxy = proxy_with_score(50);
        policy.apply(&mut proxy, &tcp_failure(), Utc::now());
        policy.apply(&mut proxy, &ProbeResult::http_error(502, 30), Utc::now());
        assert_eq!(proxy.consecutive_failures, 2);
        assert_eq!(proxy.latency_ms, Some(30));

        policy.apply(&mut proxy, &ProbeResult::healthy(200, 40), Utc::now());
        assert_eq!(proxy.consecutive_failures, 0);
        assert!(proxy.last_error.is_none());
    }

    #[test]
    fn test_failure_while_assigned_keeps_assignment() {
        let policy = ScorePolicy::default();
        let mut proxy = proxy_with_score(50);
        proxy.status = ProxyStatus::Assigned;
        proxy.assigned_account_id = Some("acct".to_string());

        let t = policy.apply(&mut proxy, &ProbeResult::failed(ProbeErrorKind::Timeout), Utc::now());
        assert_eq!(t.to, ProxyStatus::Assigned);
        assert_eq!(
            t.effect,
            Some(AssignmentEffect::Degraded {
                account_id: "acct".to_string()
            })
        );
        assert!(proxy.assignment_consistent());
        assert_eq!(policy.released_status(&proxy), ProxyStatus::Degraded);
    }

    #[test]
    fn test_blacklist_while_assigned_clears_assignment() {
        let policy = ScorePolicy::default();
        let mut proxy = proxy_with_score(50);
        proxy.status = ProxyStatus::Assigned;
        proxy.assigned_account_id = Some("acct".to_string());
        proxy.consecutive_failures = 4;

        let t = policy.apply(&mut proxy, &tcp_failure(), Utc::now());
        assert_eq!(t.to, ProxyStatus::Blacklisted);
        assert_eq!(
            t.effect,
            Some(AssignmentEffect::Blacklisted {
                account_id: "acct".to_string()
            })
        );
        assert!(proxy.assigned_account_id.is_none());
        assert!(proxy.assignment_consistent());
    }

    #[test]
    fn test_fraud_score_above_ceiling_blacklists() {
        let policy = ScorePolicy::default();
        let mut proxy = proxy_with_score(90);

        let t = policy.apply_fraud_score(&mut proxy, 80, Utc::now());
        assert!(!t.changed());
        assert_eq!(proxy.status, ProxyStatus::Available);

        let t = policy.apply_fraud_score(&mut proxy, 81, Utc::now());
        assert_eq!(t.to, ProxyStatus::Blacklisted);

        // a healthy probe cannot undo it
        policy.apply(&mut proxy, &ProbeResult::healthy(200, 10), Utc::now());
        assert_eq!(proxy.status, ProxyStatus::Blacklisted);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let policy = ScorePolicy::default();
        let mut proxy = proxy_with_score(50);
        for _ in 0..5 {
            policy.apply(&mut proxy, &tcp_failure(), Utc::now());
        }
        proxy.fraud_score = 90;

        let t = policy.reset(&mut proxy);
        assert_eq!(t.from, ProxyStatus::Blacklisted);
        assert_eq!(proxy.status, ProxyStatus::Available);
        assert_eq!(proxy.score, 50);
        assert_eq!(proxy.fraud_score, 0);
        assert_eq!(proxy.consecutive_failures, 0);
        assert!(proxy.blacklisted_at.is_none());
    }

    #[test]
    fn test_restored_status() {
        let policy = ScorePolicy::default();
        let mut proxy = proxy_with_score(50);
        proxy.status = ProxyStatus::Testing;
        assert_eq!(policy.restored_status(&proxy), ProxyStatus::Available);

        proxy.consecutive_failures = 2;
        assert_eq!(policy.restored_status(&proxy), ProxyStatus::Degraded);

        proxy.status = ProxyStatus::Blacklisted;
        assert_eq!(policy.restored_status(&proxy), ProxyStatus::Blacklisted);
    }

    fn probe_result_strategy() -> impl Strategy<Value = ProbeResult> {
        prop_oneof![
            (200u16..400, 1u64..5_000).prop_map(|(s, l)| ProbeResult::healthy(s, l)),
            (400u16..600, 1u64..5_000).prop_map(|(s, l)| ProbeResult::http_error(s, l)),
            Just(ProbeResult::failed(ProbeErrorKind::TcpFailed)),
            Just(ProbeResult::failed(ProbeErrorKind::Timeout)),
            Just(ProbeResult::failed(ProbeErrorKind::ProxyError)),
        ]
    }

    proptest! {
        #[test]
        fn prop_scores_stay_in_bounds(
            initial in 0u8..=100,
            fraud in proptest::option::of(0u8..=255),
            results in proptest::collection::vec(probe_result_strategy(), 0..60),
        ) {
            let policy = ScorePolicy::default();
            let mut proxy = proxy_with_score(initial);
            let now = Utc::now();

            for (i, result) in results.iter().enumerate() {
                if i == results.len() / 2 {
                    if let Some(f) = fraud {
                        policy.apply_fraud_score(&mut proxy, f, now);
                    }
                }
                policy.apply(&mut proxy, result, now);
                prop_assert!(proxy.score <= 100);
                prop_assert!(proxy.fraud_score <= 100);
                prop_assert!(proxy.assignment_consistent());
            }
        }

        #[test]
        fn prop_blacklist_is_sticky(
            results in proptest::collection::vec(probe_result_strategy(), 1..60),
        ) {
            let policy = ScorePolicy::default();
            let mut proxy = proxy_with_score(50);
            let mut blacklisted = false;

            for result in &results {
                policy.apply(&mut proxy, result, Utc::now());
                if blacklisted {
                    prop_assert_eq!(proxy.status, ProxyStatus::Blacklisted);
                }
                blacklisted |= proxy.status == ProxyStatus::Blacklisted;
            }
        }
    }
}
