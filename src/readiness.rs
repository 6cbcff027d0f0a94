//! Tracks recent direct-probe successes between node pairs.
//!
//! The controller only advertises `p2p_ready` for a pair while fresh probe
//! evidence exists. Under the default `mutual` policy both directions must
//! have succeeded recently; flipping relay traffic to a direct /32 while only
//! one side can reach the other black-holes the opposite half of the pair.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Freshness window for probe evidence.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Readiness policy for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyPolicy {
    /// Recent success required in both directions.
    Mutual,
    /// Recent success in either direction suffices.
    Either,
}

impl ReadyPolicy {
    pub fn parse(value: &str) -> ReadyPolicy {
        match value {
            "either" => ReadyPolicy::Either,
            _ => ReadyPolicy::Mutual,
        }
    }
}

/// Per-pair record of the most recent direct probe success.
///
/// Only successes are recorded; failures age out existing evidence through
/// the TTL alone.
#[derive(Debug)]
pub struct DirectReadiness {
    ttl: Duration,
    policy: ReadyPolicy,
    ok: HashMap<String, HashMap<String, Instant>>,
}

impl DirectReadiness {
    pub fn new(ttl: Duration, policy: ReadyPolicy) -> Self {
        Self {
            ttl,
            policy,
            ok: HashMap::new(),
        }
    }

    /// Records a successful probe from `source` to `target`. Later successes
    /// overwrite earlier timestamps.
    pub fn record_success(&mut self, source: &str, target: &str, now: Instant) {
        self.ok
            .entry(source.to_string())
            .or_default()
            .insert(target.to_string(), now);
    }

    /// Whether the pair (a, b) currently satisfies the readiness policy.
    pub fn ready(&self, a: &str, b: &str, now: Instant) -> bool {
        let ab = self.fresh(a, b, now);
        let ba = self.fresh(b, a, now);
        match self.policy {
            ReadyPolicy::Mutual => ab && ba,
            ReadyPolicy::Either => ab || ba,
        }
    }

    fn fresh(&self, source: &str, target: &str, now: Instant) -> bool {
        self.ok
            .get(source)
            .and_then(|m| m.get(target))
            .map(|t| now.duration_since(*t) <= self.ttl)
            .unwrap_or(false)
    }
}

impl Default for DirectReadiness {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, ReadyPolicy::Mutual)
    }
}
