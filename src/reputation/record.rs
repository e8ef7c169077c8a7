//! Immutable per-endpoint connection history.

use crate::core::endpoint::Endpoint;
use std::cmp::Ordering;

/// Event reported against an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Endpoint advertised by another peer, with the advertised timestamp
    PeerNotify { claimed: u32 },
    ConnectSuccess,
    ConnectFail,
    ConnectAttempt,
}

/// Timing parameters governing record updates and candidate eligibility, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReputationPolicy {
    /// Subtracted from "now" to cap advertised timestamps
    pub network_penalty: u32,
    /// Cool-down after a failed connection
    pub fail_timeout: u32,
    /// Cool-down after a connection attempt
    pub attempt_timeout: u32,
}

impl Default for ReputationPolicy {
    fn default() -> Self {
        Self {
            network_penalty: 2 * 60 * 60,
            fail_timeout: 10 * 60,
            attempt_timeout: 60,
        }
    }
}

/// Snapshot of an endpoint's history. Updates produce a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReputationRecord {
    pub endpoint: Endpoint,
    pub last_success: u32,
    pub last_attempt: u32,
    pub last_fail: u32,
    pub last_network: u32,
}

impl ReputationRecord {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            last_success: 0,
            last_attempt: 0,
            last_fail: 0,
            last_network: 0,
        }
    }

    /// Record after applying `event` at time `now`, or `None` if nothing changes
    pub fn apply(&self, event: PeerEvent, now: u32, policy: &ReputationPolicy) -> Option<Self> {
        let mut next = *self;
        match event {
            PeerEvent::ConnectSuccess => next.last_success = now,
            PeerEvent::ConnectFail => next.last_fail = now,
            PeerEvent::ConnectAttempt => next.last_attempt = now,
            PeerEvent::PeerNotify { claimed } => {
                let ceiling = now.saturating_sub(policy.network_penalty);
                let observed = claimed.min(ceiling);
                if observed <= self.last_network {
                    return None;
                }
                next.last_network = observed;
            }
        }
        (next.timestamps() != self.timestamps()).then_some(next)
    }

    fn timestamps(&self) -> [u32; 4] {
        [
            self.last_success,
            self.last_attempt,
            self.last_fail,
            self.last_network,
        ]
    }

    /// Most recent evidence the endpoint is reachable
    pub fn last_seen_good(&self) -> u32 {
        self.last_network.max(self.last_success)
    }

    /// Reconnection priority; higher is better.
    ///
    /// `min(last_seen_good, last_fail + fail_timeout)`. The cap applies to
    /// every record, so one that never failed ranks at `fail_timeout`.
    pub fn compare_key(&self, fail_timeout: u32) -> u64 {
        let good = u64::from(self.last_seen_good());
        good.min(u64::from(self.last_fail) + u64::from(fail_timeout))
    }

    /// Total order used for persistence and address replies; best first
    pub fn priority_cmp(&self, other: &Self, fail_timeout: u32) -> Ordering {
        other
            .compare_key(fail_timeout)
            .cmp(&self.compare_key(fail_timeout))
            .then(self.last_success.cmp(&other.last_success))
            .then(self.last_fail.cmp(&other.last_fail))
            .then(self.last_attempt.cmp(&other.last_attempt))
            .then(self.last_network.cmp(&other.last_network))
            .then(self.endpoint.cmp(&other.endpoint))
    }

    /// Whether the endpoint is inside a failure or attempt cool-down at `now`
    pub fn cooling_down(&self, now: u32, policy: &ReputationPolicy) -> bool {
        let now = u64::from(now);
        let failed = self.last_fail != 0
            && u64::from(self.last_fail) + u64::from(policy.fail_timeout) > now;
        let attempted = self.last_attempt != 0
            && u64::from(self.last_attempt) + u64::from(policy.attempt_timeout) > now;
        failed || attempted
    }
}
