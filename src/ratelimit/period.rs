//! Named refill periods.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const SECS_PER_DAY: u64 = 86_400;

/// Common refill periods for buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// One second
    Second,
    /// Sixty seconds
    Minute,
    /// Sixty minutes
    Hour,
    /// Twenty-four hours
    Day,
    /// Seven days
    Week,
    /// Thirty days
    Month,
    /// 365 days
    Year,
}

impl Period {
    /// Get the duration of this period.
    pub fn duration(&self) -> Duration {
        match self {
            Period::Second => Duration::from_secs(1),
            Period::Minute => Duration::from_secs(60),
            Period::Hour => Duration::from_secs(3600),
            Period::Day => Duration::from_secs(SECS_PER_DAY),
            Period::Week => Duration::from_secs(7 * SECS_PER_DAY),
            Period::Month => Duration::from_secs(30 * SECS_PER_DAY),
            Period::Year => Duration::from_secs(365 * SECS_PER_DAY),
        }
    }
}

impl From<Period> for Duration {
    fn from(period: Period) -> Self {
        period.duration()
    }
}
