//! Per-key requeue bookkeeping
//!
//! `kube::runtime::Controller` schedules requeues but does not count them, so
//! the attempt history that [`crate::retry::decide`] needs lives here.

use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use tracing::debug;

use crate::crd::ResourceKey;
use crate::retry::{classify, exponential_delay, Decision};
use crate::Error;

/// Base delay of the default per-item rate limiter
pub const RATE_LIMIT_BASE: Duration = Duration::from_millis(5);

/// Ceiling of the default per-item rate limiter
pub const RATE_LIMIT_MAX: Duration = Duration::from_secs(1000);

/// Delay the default rate limiter applies after `attempts` requeues
pub fn rate_limited_delay(attempts: u32) -> Duration {
    exponential_delay(RATE_LIMIT_BASE, RATE_LIMIT_MAX, attempts)
}

/// Requeue counts keyed by resource
#[derive(Debug, Default)]
pub struct RequeueTracker {
    counts: DashMap<ResourceKey, u32>,
}

impl RequeueTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `key` has been requeued since it last succeeded
    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Reset the history of `key`
    pub fn forget(&self, key: &ResourceKey) {
        self.counts.remove(key);
    }

    fn bump(&self, key: &ResourceKey) {
        *self.counts.entry(key.clone()).or_insert(0) += 1;
    }

    /// Turn a failed reconcile of `key` into the next queue action
    pub fn action_for(&self, key: &ResourceKey, error: &Error) -> Action {
        let attempts = self.num_requeues(key);
        match classify(error, attempts) {
            Decision::Forget => {
                debug!(policy = %key, attempts, "giving up until the next change");
                self.forget(key);
                Action::await_change()
            }
            Decision::RetryAfter(delay) => {
                self.bump(key);
                Action::requeue(delay)
            }
            Decision::RateLimited => {
                self.bump(key);
                Action::requeue(rate_limited_delay(attempts))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;

    fn key() -> ResourceKey {
        ResourceKey::new("ns1", "web")
    }

    /// Story: a bounded error is retried with backoff, then forgotten
    #[test]
    fn story_bounded_error_exhausts_its_attempts() {
        let tracker = RequeueTracker::new();
        let err = Error::backend(
            "patch /infra/x",
            "conflict",
            Some(RetryPolicy::bounded(
                Duration::from_secs(1),
                Duration::from_secs(30),
                2,
            )),
        );

        assert_eq!(tracker.action_for(&key(), &err), Action::requeue(Duration::from_secs(1)));
        assert_eq!(tracker.action_for(&key(), &err), Action::requeue(Duration::from_secs(2)));
        assert_eq!(tracker.action_for(&key(), &err), Action::requeue(Duration::from_secs(4)));
        assert_eq!(tracker.num_requeues(&key()), 3);

        assert_eq!(tracker.action_for(&key(), &err), Action::await_change());
        assert_eq!(tracker.num_requeues(&key()), 0);
    }

    #[test]
    fn test_unclassified_error_is_forgotten_immediately() {
        let tracker = RequeueTracker::new();
        let action = tracker.action_for(&key(), &Error::validation("bad selector"));
        assert_eq!(action, Action::await_change());
        assert_eq!(tracker.num_requeues(&key()), 0);
    }

    #[test]
    fn test_rate_limited_requeue_grows_per_key() {
        let tracker = RequeueTracker::new();
        let err = Error::backend("search Group", "flaky", Some(RetryPolicy::unbounded_default()));

        assert_eq!(tracker.action_for(&key(), &err), Action::requeue(Duration::from_millis(5)));
        assert_eq!(tracker.action_for(&key(), &err), Action::requeue(Duration::from_millis(10)));

        let other = ResourceKey::new("ns2", "web");
        assert_eq!(tracker.action_for(&other, &err), Action::requeue(Duration::from_millis(5)));

        tracker.forget(&key());
        assert_eq!(tracker.action_for(&key(), &err), Action::requeue(Duration::from_millis(5)));
    }

    #[test]
    fn test_rate_limiter_is_capped() {
        assert_eq!(rate_limited_delay(0), RATE_LIMIT_BASE);
        assert_eq!(rate_limited_delay(40), RATE_LIMIT_MAX);
    }
}
