//! Time sources for the rate limiter.
//!
//! Every bucket and limiter operation takes an explicit `now`; a [`Clock`]
//! only supplies that instant for the convenience forms and lets callers
//! (the retry proxy, the demo client) wait for quota to come back.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{QuotaError, Result};

/// A monotonic time source that can also wait.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Wait for `duration` as measured by this clock.
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same timeline, so a test can hand one clone to the
/// limiter and advance the other.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Create a clock frozen at the real current instant.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Create a clock frozen at `start`.
    pub fn starting_at(start: Instant) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    ///
    /// An advance past the furthest representable instant is ignored.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock();
        if let Some(next) = current.checked_add(duration) {
            *current = next;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Slowest accepted skew factor.
pub const MIN_SKEW: f64 = 1.0e-6;

/// Fastest accepted skew factor.
pub const MAX_SKEW: f64 = 1.0e6;

/// A clock running `factor` times faster (or slower) than real time.
#[derive(Debug, Clone)]
pub struct SkewedClock {
    origin: Instant,
    factor: f64,
}

impl SkewedClock {
    /// Create a skewed clock. `factor` must lie in `MIN_SKEW..=MAX_SKEW`.
    pub fn new(factor: f64) -> Result<Self> {
        if !(MIN_SKEW..=MAX_SKEW).contains(&factor) {
            return Err(QuotaError::Config(format!(
                "clock skew factor must be between {} and {}, got {}",
                MIN_SKEW, MAX_SKEW, factor
            )));
        }
        Ok(Self {
            origin: Instant::now(),
            factor,
        })
    }

    /// The skew factor.
    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl Clock for SkewedClock {
    fn now(&self) -> Instant {
        let real = self.origin.elapsed();
        Duration::try_from_secs_f64(real.as_secs_f64() * self.factor)
            .ok()
            .and_then(|skewed| self.origin.checked_add(skewed))
            .unwrap_or_else(Instant::now)
    }

    fn sleep(&self, duration: Duration) {
        let real = Duration::try_from_secs_f64(duration.as_secs_f64() / self.factor)
            .unwrap_or(Duration::MAX);
        std::thread::sleep(real);
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}
