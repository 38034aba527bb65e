//! Per-step retry policy and consecutive-timeout bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    /// `delay * n` before the n-th retry.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive timeouts after which the step gives up.
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Decide what to do after the `timeouts`-th consecutive timeout.
    pub fn decide(&self, timeouts: u32) -> RetryDecision {
        if timeouts >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.saturating_mul(timeouts.max(1)),
        };
        RetryDecision::Retry(delay)
    }
}

/// Tracks consecutive timeouts per step for one session.
#[derive(Debug, Default)]
pub struct RetryController {
    timeouts: HashMap<usize, u32>,
    retries: u32,
}

impl RetryController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a timeout on `step` and ask its policy what happens next.
    pub fn on_timeout(&mut self, step: usize, policy: &RetryPolicy) -> (u32, RetryDecision) {
        let count = self.timeouts.entry(step).or_insert(0);
        *count += 1;
        let decision = policy.decide(*count);
        if matches!(decision, RetryDecision::Retry(_)) {
            self.retries += 1;
        }
        (*count, decision)
    }

    /// A match on `step` breaks its run of timeouts.
    pub fn on_match(&mut self, step: usize) {
        self.timeouts.remove(&step);
    }

    pub fn timeouts(&self, step: usize) -> u32 {
        self.timeouts.get(&step).copied().unwrap_or(0)
    }

    /// Retries granted across all steps so far.
    pub fn total_retries(&self) -> u32 {
        self.retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gives_up_after_exactly_max_retries() {
        let policy = RetryPolicy {
            max_retries: 3,
            ..Default::default()
        };
        let mut ctl = RetryController::new();
        assert!(matches!(ctl.on_timeout(0, &policy), (1, RetryDecision::Retry(_))));
        assert!(matches!(ctl.on_timeout(0, &policy), (2, RetryDecision::Retry(_))));
        assert_eq!(ctl.on_timeout(0, &policy), (3, RetryDecision::GiveUp));
        assert_eq!(ctl.total_retries(), 2);
    }

    #[test]
    fn test_zero_or_one_means_no_retry() {
        for max_retries in [0, 1] {
            let policy = RetryPolicy {
                max_retries,
                ..Default::default()
            };
            assert_eq!(policy.decide(1), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            max_retries: 10,
            delay: Duration::from_millis(500),
            backoff: Backoff::Linear,
        };
        assert_eq!(policy.decide(1), RetryDecision::Retry(Duration::from_millis(500)));
        assert_eq!(policy.decide(3), RetryDecision::Retry(Duration::from_millis(1500)));
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(2), RetryDecision::Retry(Duration::from_secs(1)));
    }

    #[test]
    fn test_match_resets_counter() {
        let policy = RetryPolicy::default();
        let mut ctl = RetryController::new();
        ctl.on_timeout(4, &policy);
        ctl.on_timeout(4, &policy);
        ctl.on_match(4);
        assert_eq!(ctl.timeouts(4), 0);
        assert_eq!(ctl.on_timeout(4, &policy).0, 1);
    }

    #[test]
    fn test_counters_are_per_step() {
        let policy = RetryPolicy::default();
        let mut ctl = RetryController::new();
        ctl.on_timeout(0, &policy);
        ctl.on_timeout(1, &policy);
        assert_eq!(ctl.timeouts(0), 1);
        assert_eq!(ctl.timeouts(1), 1);
    }
}
