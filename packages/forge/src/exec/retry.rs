//! Retry policy with exponential backoff and jitter.

use std::time::Duration;

use bon::Builder;
use rand::Rng;

use crate::error::ErrorCategory;

/// Backoff shape for one error category.
#[derive(Copy, Clone, Debug, Builder)]
pub struct BackoffPolicy {
    #[builder(default = Duration::from_millis(100))]
    pub initial: Duration,
    #[builder(default = 2.0)]
    pub multiplier: f64,
    #[builder(default = Duration::from_secs(30))]
    pub max_delay: Duration,
    /// Fraction of the delay applied as symmetric random jitter.
    #[builder(default = 0.2)]
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt (1-based; attempt 1 is the first
    /// retry): `min(initial · multiplier^(attempt−1), max)` ± jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter_bound = capped * self.jitter;
        let jittered = if jitter_bound > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter_bound..=jitter_bound);
            (capped + offset).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

/// Per-category retry policy.
///
/// Attempt budgets come from the category itself; the backoff shape is
/// configurable per category, with system and network failures backing off
/// hardest.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    process: BackoffPolicy,
    remote: BackoffPolicy,
    cache: BackoffPolicy,
    io: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            process: BackoffPolicy::builder()
                .initial(Duration::from_millis(250))
                .max_delay(Duration::from_secs(60))
                .build(),
            remote: BackoffPolicy::builder()
                .initial(Duration::from_millis(250))
                .max_delay(Duration::from_secs(60))
                .build(),
            cache: BackoffPolicy::default(),
            io: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed for failures of this category, including the
    /// first.
    pub fn max_attempts(&self, category: ErrorCategory) -> u32 {
        category.max_attempts()
    }

    /// Whether another attempt is allowed after `attempts` tries failed
    /// with `category`.
    pub fn should_retry(&self, category: ErrorCategory, attempts: u32) -> bool {
        attempts < self.max_attempts(category)
    }

    /// Backoff delay before retry number `attempt` for the category.
    pub fn delay(&self, category: ErrorCategory, attempt: u32) -> Duration {
        let policy = match category {
            ErrorCategory::Process => &self.process,
            ErrorCategory::Remote => &self.remote,
            ErrorCategory::Cache => &self.cache,
            ErrorCategory::Io => &self.io,
            // Non-retryable categories never reach here; zero keeps the
            // caller honest if one does.
            _ => return Duration::ZERO,
        };
        policy.delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = BackoffPolicy::builder()
            .initial(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(400))
            .jitter(0.0)
            .build();

        pretty_assert_eq!(policy.delay(1), Duration::from_millis(100));
        pretty_assert_eq!(policy.delay(2), Duration::from_millis(200));
        pretty_assert_eq!(policy.delay(3), Duration::from_millis(400));
        // Capped.
        pretty_assert_eq!(policy.delay(10), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = BackoffPolicy::builder()
            .initial(Duration::from_millis(100))
            .multiplier(1.0)
            .jitter(0.5)
            .build();

        for _ in 0..100 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(50), "delay {delay:?}");
            assert!(delay <= Duration::from_millis(150), "delay {delay:?}");
        }
    }

    #[test]
    fn budgets_follow_categories() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(ErrorCategory::Process, 4));
        assert!(!policy.should_retry(ErrorCategory::Process, 5));
        assert!(policy.should_retry(ErrorCategory::Io, 2));
        assert!(!policy.should_retry(ErrorCategory::Io, 3));
        assert!(!policy.should_retry(ErrorCategory::Build, 1));
    }

    #[test]
    fn non_retryable_categories_have_zero_delay() {
        let policy = RetryPolicy::default();
        pretty_assert_eq!(policy.delay(ErrorCategory::Build, 1), Duration::ZERO);
    }
}
