//! Retry policy for transient step failures.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use docpipe_core::StepName;

use crate::config::duration_ms;

/// Retry policy configuration.
///
/// One policy for the whole pipeline; individual steps may override the retry
/// limit (e.g. embedding calls that hit provider rate limits).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first failure (0 = fail on first transient failure)
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay cap
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Per-step retry limits
    #[serde(default)]
    pub step_overrides: BTreeMap<StepName, u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            step_overrides: BTreeMap::new(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            step_overrides: BTreeMap::new(),
        }
    }

    pub fn with_step_limit(mut self, step: StepName, limit: u32) -> Self {
        self.step_overrides.insert(step, limit);
        self
    }

    /// Retry limit that applies to `step`.
    pub fn limit_for(&self, step: &StepName) -> u32 {
        self.step_overrides
            .get(step)
            .copied()
            .unwrap_or(self.max_retries)
    }

    /// Largest retry limit of any step.
    pub fn highest_limit(&self) -> u32 {
        self.step_overrides
            .values()
            .copied()
            .fold(self.max_retries, u32::max)
    }

    /// Delay before retrying after the `attempt`-th failure: `base * 2^attempt`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
