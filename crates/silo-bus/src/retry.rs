//! Retry policies for transient handler failures.

use serde::{Deserialize, Serialize};
use silo_types::FailureCategory;
use std::time::Duration;

/// Backoff curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Same delay every attempt.
    Constant,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Delay doubles each attempt.
    Exponential,
}

/// Policy governing retries of retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff curve.
    pub strategy: RetryStrategy,
    /// Total attempt budget, including the first.
    pub max_attempts: u32,
    /// Base delay fed into the curve.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based: the delay after the
    /// first failure is `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.strategy {
            RetryStrategy::Constant => self.base_delay,
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt),
            RetryStrategy::Exponential => self
                .base_delay
                .saturating_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX)),
        }
    }

    /// Whether another attempt is allowed for a failure of `category`
    /// after `attempts_made` attempts.
    ///
    /// `Transient` uses the policy budget; `System` is retried at most
    /// once; everything else never retries.
    pub fn allows_retry(&self, category: FailureCategory, attempts_made: u32) -> bool {
        if !category.is_retryable() {
            return false;
        }
        let budget = match category.retry_ceiling() {
            Some(ceiling) => ceiling.saturating_add(1).min(self.max_attempts),
            None => self.max_attempts,
        };
        attempts_made < budget
    }
}
