//! Token bucket implementation.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{QuotaError, Result};

/// Fixed-point units per token.
pub const UNITS_PER_TOKEN: u64 = 1_000_000;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Largest capacity whose fixed-point representation fits in a `u64`.
pub const MAX_CAPACITY: u64 = u64::MAX / UNITS_PER_TOKEN;

/// A self-replenishing bucket of tokens.
///
/// The bucket refills continuously at `capacity / period` and never holds
/// more than `capacity` tokens. Refill is lazy: it happens whenever the
/// bucket is inspected at some instant, never in the background.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// Maximum number of tokens
    capacity: u64,
    /// Time to refill from empty to full
    period: Duration,
    /// Current level in fixed-point units
    units: u64,
    /// Refill remainder carried between refills, always below `period` in nanos
    carry: u128,
    /// Instant the level was last recomputed
    last_refill: Instant,
}

impl Bucket {
    /// Create a full bucket at the current instant.
    pub fn new(capacity: u64, period: impl Into<Duration>) -> Result<Self> {
        Self::new_at(capacity, period, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn new_at(capacity: u64, period: impl Into<Duration>, now: Instant) -> Result<Self> {
        let period = period.into();

        if capacity == 0 {
            return Err(QuotaError::Config(
                "bucket capacity must be positive".to_string(),
            ));
        }
        if capacity > MAX_CAPACITY {
            return Err(QuotaError::Config(format!(
                "bucket capacity {} exceeds maximum {}",
                capacity, MAX_CAPACITY
            )));
        }
        if period.is_zero() {
            return Err(QuotaError::Config(
                "bucket period must be positive".to_string(),
            ));
        }

        debug!(capacity, period = ?period, "Creating token bucket");

        Ok(Self {
            capacity,
            period,
            units: capacity * UNITS_PER_TOKEN,
            carry: 0,
            last_refill: now,
        })
    }

    /// Start building buckets with shared defaults.
    pub fn builder() -> BucketBuilder {
        BucketBuilder::default()
    }

    /// Get the capacity of this bucket.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Get the refill period of this bucket.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Recompute the token level for `now`.
    ///
    /// Calling this twice with the same instant is a no-op the second time.
    /// An instant earlier than the last refill counts as no elapsed time.
    pub fn refill_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.last_refill = now;

        let full = self.full_units();
        if self.units >= full {
            self.carry = 0;
            return;
        }

        let numerator = elapsed
            .as_nanos()
            .saturating_mul(u128::from(full))
            .saturating_add(self.carry);
        let period_nanos = self.period.as_nanos();
        let added = numerator / period_nanos;
        let missing = u128::from(full - self.units);

        if added >= missing {
            self.units = full;
            self.carry = 0;
        } else {
            // added < missing <= u64::MAX
            self.units += added as u64;
            self.carry = numerator % period_nanos;
        }
    }

    /// Refill, then report whether `tokens` could be taken without taking them.
    pub fn has_tokens_at(&mut self, tokens: u64, now: Instant) -> bool {
        self.refill_at(now);
        match tokens.checked_mul(UNITS_PER_TOKEN) {
            Some(needed) => self.units >= needed,
            None => false,
        }
    }

    /// Remove `tokens` from the bucket.
    ///
    /// Callers check [`Bucket::has_tokens_at`] first; the level saturates at
    /// zero if they did not.
    pub fn commit(&mut self, tokens: u64) {
        let units = tokens.saturating_mul(UNITS_PER_TOKEN);
        self.units = self.units.saturating_sub(units);
    }

    /// Take one token if available.
    ///
    /// Returns `true` on success; on failure the level is left untouched.
    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        if self.has_tokens_at(1, now) {
            self.commit(1);
            true
        } else {
            false
        }
    }

    /// Tokens available at `now`, including fractional refill.
    pub fn remaining_at(&mut self, now: Instant) -> f64 {
        self.refill_at(now);
        self.units as f64 / UNITS_PER_TOKEN as f64
    }

    /// Whole tokens available at `now`.
    pub fn whole_tokens_at(&mut self, now: Instant) -> u64 {
        self.refill_at(now);
        self.units / UNITS_PER_TOKEN
    }

    /// How long after `now` until `tokens` are available.
    ///
    /// Returns `None` when `tokens` exceeds the capacity and can never be
    /// available.
    pub fn time_until_at(&mut self, tokens: u64, now: Instant) -> Option<Duration> {
        if tokens > self.capacity {
            return None;
        }
        self.refill_at(now);

        let needed = tokens * UNITS_PER_TOKEN;
        if self.units >= needed {
            return Some(Duration::ZERO);
        }

        let missing = u128::from(needed - self.units);
        let target = missing
            .saturating_mul(self.period.as_nanos())
            .saturating_sub(self.carry);
        let full = u128::from(self.full_units());
        let nanos = target.div_ceil(full);

        let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
        Some(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
    }

    /// Capacity, remaining tokens and period at `now`.
    pub fn status_at(&mut self, now: Instant) -> BucketStatus {
        BucketStatus {
            capacity: self.capacity,
            remaining: self.remaining_at(now),
            period: self.period,
        }
    }

    /// Fill the bucket and restart its refill clock at `now`.
    pub fn reset_at(&mut self, now: Instant) {
        self.units = self.full_units();
        self.carry = 0;
        self.last_refill = now;
    }

    fn full_units(&self) -> u64 {
        self.capacity * UNITS_PER_TOKEN
    }
}

/// Snapshot of a bucket for display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketStatus {
    /// Maximum number of tokens
    pub capacity: u64,
    /// Tokens available when the snapshot was taken
    pub remaining: f64,
    /// Time to refill from empty to full
    pub period: Duration,
}

impl fmt::Display for BucketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}/{} per {:?}",
            self.remaining, self.capacity, self.period
        )
    }
}

/// Builds buckets sharing common settings.
#[derive(Debug, Clone, Default)]
pub struct BucketBuilder {
    start: Option<Instant>,
}

impl BucketBuilder {
    /// Start every built bucket's refill clock at `start` instead of the
    /// instant `build` is called.
    pub fn starting_at(mut self, start: Instant) -> Self {
        self.start = Some(start);
        self
    }

    /// Build a full bucket.
    pub fn build(&self, capacity: u64, period: impl Into<Duration>) -> Result<Bucket> {
        let now = self.start.unwrap_or_else(Instant::now);
        Bucket::new_at(capacity, period, now)
    }
}
