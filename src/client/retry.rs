//! Retry with exponential backoff and jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{QuotaError, Result};
use crate::ratelimit::Clock;

/// How often and how patiently to retry a failing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failure
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Wait before the first retry in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Growth factor of the wait between retries
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound of the random extra wait added per retry in milliseconds
    #[serde(default = "default_randomness_ms")]
    pub randomness_ms: u64,

    /// Longest wait between retries in milliseconds
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            interval_ms: default_interval_ms(),
            multiplier: default_multiplier(),
            randomness_ms: default_randomness_ms(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

fn default_attempts() -> u32 {
    4
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_randomness_ms() -> u64 {
    1000
}

fn default_max_interval_ms() -> u64 {
    300_000
}

impl RetryPolicy {
    /// Check the policy can be used for backoff.
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 0.0 {
            return Err(QuotaError::Config(format!(
                "retry multiplier must be a non-negative number, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// The wait before the first retry.
    fn first_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms).min(self.max_interval())
    }

    /// The wait following `interval`, before jitter, capped at the maximum.
    fn next_interval(&self, interval: Duration, jitter: Duration) -> Duration {
        let max = self.max_interval();
        Duration::try_from_secs_f64(interval.as_secs_f64() * self.multiplier)
            .unwrap_or(max)
            .saturating_add(jitter)
            .min(max)
    }

    fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

/// Re-runs failing calls according to a [`RetryPolicy`], waiting on a clock.
#[derive(Debug, Clone)]
pub struct RetryProxy<C: Clock> {
    policy: RetryPolicy,
    clock: C,
}

impl<C: Clock> RetryProxy<C> {
    /// Create a retry proxy.
    pub fn new(policy: RetryPolicy, clock: C) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy, clock })
    }

    /// Get the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op`, retrying every failure.
    pub fn call<T, E, F>(&self, op: F) -> std::result::Result<T, E>
    where
        E: Display,
        F: FnMut() -> std::result::Result<T, E>,
    {
        self.call_if(op, |_| true)
    }

    /// Run `op`, retrying failures accepted by `retryable`.
    ///
    /// Returns the last error once the attempts are used up, or the first
    /// error `retryable` rejects.
    pub fn call_if<T, E, F, P>(&self, mut op: F, retryable: P) -> std::result::Result<T, E>
    where
        E: Display,
        F: FnMut() -> std::result::Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempts = self.policy.attempts;
        let mut interval = self.policy.first_interval();
        let mut rng = rand::thread_rng();

        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !retryable(&err) {
                return Err(err);
            }

            warn!(error = %err, remaining = attempts, "Call failed");
            if attempts == 0 {
                error!(error = %err, "Retry attempts exhausted");
                return Err(err);
            }

            self.clock.sleep(interval);
            attempts -= 1;

            let jitter = if self.policy.randomness_ms > 0 {
                rng.gen_range(0..=self.policy.randomness_ms)
            } else {
                0
            };
            interval = self
                .policy
                .next_interval(interval, Duration::from_millis(jitter));
        }
    }
}
