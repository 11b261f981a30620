//! Adaptive retry budgets for flaky tests.
//!
//! Each test id carries a Beta posterior over its flakiness probability:
//! `alpha` accumulates flaky evidence (a pass after an in-run failure),
//! `beta` accumulates consistent evidence (clean passes and terminal
//! failures). The posterior mean maps to a confidence band, and the band
//! to an attempt budget. A test that recovers on a later attempt does not
//! fail the build; it raises its flakiness estimate instead.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How confident the tracker is that a test is flaky.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Confidence {
    /// Attempt budget for this confidence band, including the first run.
    pub fn budget(self) -> u32 {
        match self {
            Confidence::None => 1,
            Confidence::Low => 2,
            Confidence::Medium => 3,
            Confidence::High => 4,
            Confidence::VeryHigh => 5,
        }
    }

    fn from_probability(p: f64) -> Self {
        match p {
            p if p < 0.05 => Confidence::None,
            p if p < 0.20 => Confidence::Low,
            p if p < 0.40 => Confidence::Medium,
            p if p < 0.60 => Confidence::High,
            _ => Confidence::VeryHigh,
        }
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
struct Posterior {
    alpha: f64,
    beta: f64,
}

impl Default for Posterior {
    fn default() -> Self {
        // Beta(1, 9) prior: tests are presumed stable (mean 0.1) but a
        // couple of flaky observations move the estimate quickly.
        Self {
            alpha: 1.0,
            beta: 9.0,
        }
    }
}

impl Posterior {
    fn mean(self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

/// Flakiness estimates keyed by test id.
#[derive(Debug, Default)]
pub struct FlakyTracker {
    posteriors: DashMap<String, Posterior>,
}

impl FlakyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The attempt budget for a test, per its current estimate.
    pub fn budget(&self, test_id: &str) -> u32 {
        self.confidence(test_id).budget()
    }

    /// The current confidence band for a test.
    pub fn confidence(&self, test_id: &str) -> Confidence {
        let mean = self
            .posteriors
            .get(test_id)
            .map(|posterior| posterior.mean())
            .unwrap_or_else(|| Posterior::default().mean());
        Confidence::from_probability(mean)
    }

    /// Record a completed test run.
    ///
    /// `passed` is the final verdict; `failed_attempts` counts the
    /// attempts that failed before it. A pass with prior failures is the
    /// flaky signal; everything else is evidence of consistency.
    pub fn record(&self, test_id: &str, passed: bool, failed_attempts: u32) {
        let mut posterior = self.posteriors.entry(test_id.to_string()).or_default();
        if passed && failed_attempts > 0 {
            posterior.alpha += f64::from(failed_attempts);
            debug!(
                test_id,
                failed_attempts,
                mean = posterior.mean(),
                "recorded flaky recovery"
            );
        } else {
            posterior.beta += 1.0;
        }
    }
}
