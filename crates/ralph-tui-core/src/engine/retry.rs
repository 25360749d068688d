//! Retry/backoff policy (spec.md §4.2 step 7): exponential backoff with
//! jitter, capped, configurable abort-vs-continue action on exhaustion.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the loop does once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionAction {
    Abort,
    Continue,
}

/// Exponential-backoff-with-jitter retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added/subtracted at random, in `[0,1]`.
    pub jitter_ratio: f64,
    pub on_exhaustion: ExhaustionAction,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ratio: 0.2,
            on_exhaustion: ExhaustionAction::Abort,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry attempt `attempt` (1-based), capped at
    /// `max_delay_ms`, with up to `jitter_ratio` of the delay added as
    /// pseudo-random jitter seeded from `attempt` itself (the policy takes
    /// no wall-clock or RNG dependency so it stays deterministic in tests).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let jitter_seed = ((attempt as u64).wrapping_mul(2654435761) % 1000) as f64 / 1000.0;
        let jitter = capped * self.jitter_ratio * jitter_seed;
        Duration::from_millis((capped + jitter) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        let first = policy.backoff_for_attempt(1);
        let second = policy.backoff_for_attempt(2);
        assert!(second >= first);

        let capped = policy.backoff_for_attempt(20);
        let max_with_jitter =
            Duration::from_millis((policy.max_delay_ms as f64 * (1.0 + policy.jitter_ratio)) as u64);
        assert!(capped <= max_with_jitter);
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
