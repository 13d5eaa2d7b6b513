//! Retry classification for failed reconciliations.
//!
//! Errors are classified where they are produced by attaching a [`RetryPolicy`].
//! [`decide`] turns that classification plus the number of requeues the key has
//! already seen into a [`Decision`]. It performs no I/O and holds no state; the
//! attempt count comes from the work queue.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use nsx_operator::retry::{decide, Decision, RetryPolicy};
//!
//! let policy = RetryPolicy::bounded(Duration::from_secs(1), Duration::from_secs(30), 3);
//! assert_eq!(decide(Some(&policy), 2), Decision::RetryAfter(Duration::from_secs(4)));
//! assert_eq!(decide(Some(&policy), 4), Decision::Forget);
//! assert_eq!(decide(None, 0), Decision::Forget);
//! ```

use std::time::Duration;

use crate::Error;

/// Backoff shape shared by bounded and unbounded policies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Backoff {
    /// Base delay; also the flat delay during the linear phase
    pub min: Option<Duration>,
    /// Upper bound for the exponential phase
    pub max: Option<Duration>,
    /// Number of attempts spaced flat at `min` before going exponential
    pub linear_attempts: Option<u32>,
}

impl Backoff {
    /// Exponential backoff between `min` and `max`
    pub const fn exponential(min: Duration, max: Duration) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            linear_attempts: None,
        }
    }

    /// Keep the first `attempts` retries flat at `min`
    pub const fn with_linear_attempts(mut self, attempts: u32) -> Self {
        self.linear_attempts = Some(attempts);
        self
    }
}

/// Retry classification attached to an error at its throw site.
///
/// Errors without a policy are non-retryable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry until `max_attempts` requeues have been spent
    Bounded {
        /// Delay computation
        backoff: Backoff,
        /// Requeue count after which the key is forgotten
        max_attempts: u32,
    },
    /// Retry forever
    Unbounded {
        /// Delay computation
        backoff: Backoff,
    },
}

impl RetryPolicy {
    /// Bounded exponential policy
    pub const fn bounded(min: Duration, max: Duration, max_attempts: u32) -> Self {
        Self::Bounded {
            backoff: Backoff::exponential(min, max),
            max_attempts,
        }
    }

    /// Unbounded exponential policy
    pub const fn unbounded(min: Duration, max: Duration) -> Self {
        Self::Unbounded {
            backoff: Backoff::exponential(min, max),
        }
    }

    /// Unbounded policy with no intervals; defers to the queue's rate limiter
    pub const fn unbounded_default() -> Self {
        Self::Unbounded {
            backoff: Backoff {
                min: None,
                max: None,
                linear_attempts: None,
            },
        }
    }

    /// Keep the first `attempts` retries flat at the minimum interval
    pub const fn with_linear_attempts(self, attempts: u32) -> Self {
        match self {
            Self::Bounded {
                backoff,
                max_attempts,
            } => Self::Bounded {
                backoff: backoff.with_linear_attempts(attempts),
                max_attempts,
            },
            Self::Unbounded { backoff } => Self::Unbounded {
                backoff: backoff.with_linear_attempts(attempts),
            },
        }
    }

    fn backoff(&self) -> &Backoff {
        match self {
            Self::Bounded { backoff, .. } | Self::Unbounded { backoff } => backoff,
        }
    }
}

/// What the work queue should do with a failed key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Drop the key; wait for the next change event
    Forget,
    /// Requeue after exactly this delay
    RetryAfter(Duration),
    /// Requeue through the queue's default per-item rate limiter
    RateLimited,
}

/// Decide whether and when to retry, given a classification and the number of
/// requeues the key has already accumulated.
pub fn decide(policy: Option<&RetryPolicy>, attempts: u32) -> Decision {
    let Some(policy) = policy else {
        return Decision::Forget;
    };

    if let RetryPolicy::Bounded { max_attempts, .. } = policy {
        if attempts > *max_attempts {
            return Decision::Forget;
        }
    }

    let backoff = policy.backoff();
    if let (Some(linear), Some(min)) = (backoff.linear_attempts, backoff.min) {
        if attempts < linear {
            return Decision::RetryAfter(min);
        }
    }

    match (backoff.min, backoff.max) {
        (Some(min), Some(max)) => Decision::RetryAfter(exponential_delay(min, max, attempts)),
        _ => Decision::RateLimited,
    }
}

/// Decide for an operator error using the classification it carries
pub fn classify(error: &Error, attempts: u32) -> Decision {
    decide(error.retry_policy(), attempts)
}

/// `min * 2^attempts`, capped at `max`, saturating instead of overflowing
pub fn exponential_delay(min: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
    min.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(60);

    #[test]
    fn test_unclassified_errors_are_forgotten() {
        assert_eq!(decide(None, 0), Decision::Forget);
        assert_eq!(decide(None, 10), Decision::Forget);
    }

    /// Story: a bounded error gives up once its attempt budget is spent
    #[test]
    fn story_bounded_policy_gives_up_after_max_attempts() {
        let policy = RetryPolicy::bounded(MIN, MAX, 3);

        assert_eq!(decide(Some(&policy), 3), Decision::RetryAfter(MIN * 8));
        assert_eq!(decide(Some(&policy), 4), Decision::Forget);
        assert_eq!(decide(Some(&policy), 100), Decision::Forget);
    }

    /// Story: the linear phase spaces early retries evenly before going exponential
    #[test]
    fn story_linear_phase_uses_unscaled_minimum() {
        let policy = RetryPolicy::bounded(MIN, MAX, 10).with_linear_attempts(2);

        assert_eq!(decide(Some(&policy), 0), Decision::RetryAfter(MIN));
        assert_eq!(decide(Some(&policy), 1), Decision::RetryAfter(MIN));
        // Leaving the linear phase: min * 2^2
        assert_eq!(decide(Some(&policy), 2), Decision::RetryAfter(MIN * 4));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::unbounded(MIN, MAX);
        assert_eq!(decide(Some(&policy), 0), Decision::RetryAfter(MIN));
        assert_eq!(decide(Some(&policy), 1), Decision::RetryAfter(MIN * 2));
        assert_eq!(decide(Some(&policy), 20), Decision::RetryAfter(MAX));
        // Far past u32 exponent range, still capped and no overflow
        assert_eq!(decide(Some(&policy), 500), Decision::RetryAfter(MAX));
    }

    /// Story: unbounded errors never run out of attempts
    #[test]
    fn story_unbounded_policy_never_forgets() {
        let policy = RetryPolicy::unbounded(MIN, MAX).with_linear_attempts(1);
        for attempts in [0, 1, 5, 50, 5000] {
            assert_ne!(decide(Some(&policy), attempts), Decision::Forget);
        }
    }

    #[test]
    fn test_missing_intervals_defer_to_rate_limiter() {
        let policy = RetryPolicy::unbounded_default();
        assert_eq!(decide(Some(&policy), 0), Decision::RateLimited);
        assert_eq!(decide(Some(&policy), 7), Decision::RateLimited);

        let bounded_without_intervals = RetryPolicy::Bounded {
            backoff: Backoff::default(),
            max_attempts: 2,
        };
        assert_eq!(
            decide(Some(&bounded_without_intervals), 1),
            Decision::RateLimited
        );
        assert_eq!(
            decide(Some(&bounded_without_intervals), 3),
            Decision::Forget
        );
    }

    #[test]
    fn test_classify_reads_policy_from_error() {
        let err = Error::backend(
            "delete /infra/x",
            "timeout",
            Some(RetryPolicy::unbounded(MIN, MAX)),
        );
        assert_eq!(classify(&err, 0), Decision::RetryAfter(MIN));
        assert_eq!(classify(&Error::validation("bad"), 0), Decision::Forget);
    }
}
