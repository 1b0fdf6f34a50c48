//! Configuration management for multiquota.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::client::RetryPolicy;
use crate::error::{QuotaError, Result};
use crate::ratelimit::{Bucket, Clock, Period, RateLimiter};

/// Main configuration: the buckets of one limiter plus retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Buckets in declaration order
    pub buckets: Vec<BucketConfig>,

    /// Retry policy for callers that back off and retry
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            buckets: vec![
                BucketConfig::new("per_second", 3, PeriodConfig::Named(Period::Second)),
                BucketConfig::new("per_minute", 10, PeriodConfig::Named(Period::Minute)),
            ],
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration of a single named bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Name unique within the limiter
    pub name: String,
    /// Maximum number of tokens
    pub capacity: u64,
    /// Time to refill from empty to full
    pub period: PeriodConfig,
}

impl BucketConfig {
    /// Create a bucket configuration.
    pub fn new(name: impl Into<String>, capacity: u64, period: PeriodConfig) -> Self {
        Self {
            name: name.into(),
            capacity,
            period,
        }
    }
}

/// A refill period given either by name or in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeriodConfig {
    /// One of the named periods, e.g. `minute`
    Named(Period),
    /// Arbitrary number of seconds, e.g. `2.5`
    Seconds(f64),
}

impl PeriodConfig {
    /// Convert to a duration.
    pub fn to_duration(&self) -> Result<Duration> {
        match *self {
            PeriodConfig::Named(period) => Ok(period.duration()),
            PeriodConfig::Seconds(secs) => Duration::try_from_secs_f64(secs).map_err(|e| {
                QuotaError::Config(format!("invalid period of {} seconds: {}", secs, e))
            }),
        }
    }
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)?;
        config.retry.validate()?;
        Ok(config)
    }

    /// Build a rate limiter on `clock`, with every bucket full as of now.
    pub fn build_limiter<C: Clock>(&self, clock: C) -> Result<RateLimiter<C>> {
        let rate_of = Bucket::builder().starting_at(clock.now());
        let buckets = self
            .buckets
            .iter()
            .map(|b| Ok((b.name.clone(), rate_of.build(b.capacity, b.period.to_duration()?)?)))
            .collect::<Result<Vec<_>>>()?;

        RateLimiter::with_clock(buckets, clock)
    }
}
