//! Core rate limiter implementation.

use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroU64;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::bucket::{Bucket, BucketStatus};
use super::clock::{Clock, SystemClock};
use crate::error::{QuotaError, Result};

/// A rate limiter enforcing several named buckets at once.
///
/// Every admission takes one token from every bucket or from none of them.
/// All state lives behind a single lock, so the limiter can be shared across
/// threads through an `Arc` and concurrent callers never both get the last
/// token.
pub struct RateLimiter<C: Clock = SystemClock> {
    /// Buckets and the outcome of the last reduce
    state: Mutex<LimiterState>,
    /// Time source for the convenience methods
    clock: C,
}

struct LimiterState {
    /// Buckets in declaration order
    buckets: Vec<(String, Bucket)>,
    /// Buckets that refused the most recent reduce
    exhausted: Vec<String>,
}

/// Outcome of a reduce.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Admission {
    /// Whether tokens were taken from every bucket
    pub allowed: bool,
    /// Buckets that lacked tokens, in declaration order; empty when allowed
    pub exhausted: Vec<String>,
}

impl Admission {
    /// Whether the event was admitted.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Convert a refusal into [`QuotaError::QuotaExceeded`].
    pub fn into_result(self) -> Result<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(QuotaError::QuotaExceeded {
                exhausted: self.exhausted,
            })
        }
    }
}

impl RateLimiter<SystemClock> {
    /// Create a rate limiter on the system clock.
    pub fn new<I, N>(buckets: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, Bucket)>,
        N: Into<String>,
    {
        Self::with_clock(buckets, SystemClock)
    }

    /// Start declaring buckets one by one.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a rate limiter on a custom clock.
    ///
    /// Bucket names must be unique and at least one bucket is required.
    pub fn with_clock<I, N>(buckets: I, clock: C) -> Result<Self>
    where
        I: IntoIterator<Item = (N, Bucket)>,
        N: Into<String>,
    {
        let buckets: Vec<(String, Bucket)> = buckets
            .into_iter()
            .map(|(name, bucket)| (name.into(), bucket))
            .collect();

        if buckets.is_empty() {
            return Err(QuotaError::Config(
                "rate limiter needs at least one bucket".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (name, _) in &buckets {
            if !seen.insert(name.as_str()) {
                return Err(QuotaError::Config(format!(
                    "duplicate bucket name: {}",
                    name
                )));
            }
        }

        debug!(
            buckets = ?buckets.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            "Rate limiter initialized"
        );

        Ok(Self {
            state: Mutex::new(LimiterState {
                buckets,
                exhausted: Vec::new(),
            }),
            clock,
        })
    }

    /// Get the clock this limiter reads.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Names of the buckets in declaration order.
    pub fn bucket_names(&self) -> Vec<String> {
        let state = self.state.lock();
        state.buckets.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Try to take one token from every bucket at the current instant.
    pub fn reduce(&self) -> Admission {
        self.reduce_at(self.clock.now())
    }

    /// Try to take one token from every bucket at `now`.
    pub fn reduce_at(&self, now: Instant) -> Admission {
        self.reduce_tokens_at(NonZeroU64::MIN, now)
    }

    /// Try to take `tokens` from every bucket at `now`.
    ///
    /// Every bucket is refilled and checked first. Only when none of them is
    /// short are the tokens taken, from all of them. A refusal leaves every
    /// level as refilled; nothing is consumed.
    pub fn reduce_tokens_at(&self, tokens: NonZeroU64, now: Instant) -> Admission {
        let tokens = tokens.get();
        let mut state = self.state.lock();

        trace!(tokens, "Checking rate limit");

        let exhausted: Vec<String> = state
            .buckets
            .iter_mut()
            .filter_map(|(name, bucket)| {
                (!bucket.has_tokens_at(tokens, now)).then(|| name.clone())
            })
            .collect();

        if !exhausted.is_empty() {
            debug!(exhausted = ?exhausted, "Rate limit exceeded");
            state.exhausted = exhausted.clone();
            return Admission {
                allowed: false,
                exhausted,
            };
        }

        for (_, bucket) in state.buckets.iter_mut() {
            bucket.commit(tokens);
        }
        state.exhausted.clear();

        Admission {
            allowed: true,
            exhausted: Vec::new(),
        }
    }

    /// How long after `now` until a reduce of `tokens` would be admitted.
    ///
    /// Returns `None` when some bucket's capacity is below `tokens`.
    pub fn time_until_allowed_at(&self, tokens: NonZeroU64, now: Instant) -> Option<Duration> {
        let mut state = self.state.lock();
        state
            .buckets
            .iter_mut()
            .map(|(_, bucket)| bucket.time_until_at(tokens.get(), now))
            .try_fold(Duration::ZERO, |longest, wait| wait.map(|w| longest.max(w)))
    }

    /// How long until the next single-token reduce would be admitted.
    pub fn time_until_allowed(&self) -> Duration {
        self.time_until_allowed_at(NonZeroU64::MIN, self.clock.now())
            .unwrap_or(Duration::ZERO)
    }

    /// Buckets that refused the most recent reduce.
    pub fn exhausted(&self) -> Vec<String> {
        self.state.lock().exhausted.clone()
    }

    /// Tokens remaining in the named bucket at the current instant.
    pub fn get(&self, name: &str) -> Result<f64> {
        self.get_at(name, self.clock.now())
    }

    /// Tokens remaining in the named bucket at `now`.
    pub fn get_at(&self, name: &str, now: Instant) -> Result<f64> {
        let mut state = self.state.lock();
        state
            .buckets
            .iter_mut()
            .find(|(bucket_name, _)| bucket_name == name)
            .map(|(_, bucket)| bucket.remaining_at(now))
            .ok_or_else(|| QuotaError::UnknownBucket(name.to_string()))
    }

    /// Status of the named bucket at the current instant.
    pub fn status_of(&self, name: &str) -> Result<BucketStatus> {
        self.status_of_at(name, self.clock.now())
    }

    /// Status of the named bucket at `now`.
    pub fn status_of_at(&self, name: &str, now: Instant) -> Result<BucketStatus> {
        let mut state = self.state.lock();
        state
            .buckets
            .iter_mut()
            .find(|(bucket_name, _)| bucket_name == name)
            .map(|(_, bucket)| bucket.status_at(now))
            .ok_or_else(|| QuotaError::UnknownBucket(name.to_string()))
    }

    /// Status of every bucket at the current instant.
    pub fn status(&self) -> LimiterStatus {
        self.status_at(self.clock.now())
    }

    /// Status of every bucket at `now`, in declaration order.
    pub fn status_at(&self, now: Instant) -> LimiterStatus {
        let mut state = self.state.lock();
        let buckets = state
            .buckets
            .iter_mut()
            .map(|(name, bucket)| (name.clone(), bucket.status_at(now)))
            .collect();
        LimiterStatus { buckets }
    }

    /// Refill every bucket and forget the last refusal.
    pub fn reset(&self) {
        self.reset_at(self.clock.now())
    }

    /// Refill every bucket as of `now` and forget the last refusal.
    pub fn reset_at(&self, now: Instant) {
        let mut state = self.state.lock();
        for (_, bucket) in state.buckets.iter_mut() {
            bucket.reset_at(now);
        }
        state.exhausted.clear();
    }
}

impl<C: Clock> fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("buckets", &self.bucket_names())
            .finish_non_exhaustive()
    }
}

/// Collects named buckets for a [`RateLimiter`].
#[derive(Debug, Default)]
pub struct RateLimiterBuilder {
    buckets: Vec<(String, Bucket)>,
}

impl RateLimiterBuilder {
    /// Add a bucket under `name`.
    pub fn bucket(mut self, name: impl Into<String>, bucket: Bucket) -> Self {
        self.buckets.push((name.into(), bucket));
        self
    }

    /// Build a limiter on the system clock.
    pub fn build(self) -> Result<RateLimiter> {
        RateLimiter::new(self.buckets)
    }

    /// Build a limiter on a custom clock.
    pub fn build_with_clock<C: Clock>(self, clock: C) -> Result<RateLimiter<C>> {
        RateLimiter::with_clock(self.buckets, clock)
    }
}

/// Status of every bucket of a limiter, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterStatus {
    buckets: Vec<(String, BucketStatus)>,
}

impl LimiterStatus {
    /// Status of the named bucket.
    pub fn get(&self, name: &str) -> Result<&BucketStatus> {
        self.buckets
            .iter()
            .find(|(bucket_name, _)| bucket_name == name)
            .map(|(_, status)| status)
            .ok_or_else(|| QuotaError::UnknownBucket(name.to_string()))
    }

    /// Iterate over `(name, status)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BucketStatus)> {
        self.buckets
            .iter()
            .map(|(name, status)| (name.as_str(), status))
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether there are no buckets.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl fmt::Display for LimiterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, status)) in self.buckets.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, status)?;
        }
        Ok(())
    }
}

impl Serialize for LimiterStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.buckets.len()))?;
        for (name, status) in &self.buckets {
            map.serialize_entry(name, status)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, Period};
    use std::sync::{Arc, Barrier};

    fn create_test_limiter(start: Instant) -> RateLimiter<ManualClock> {
        let rate_of = Bucket::builder().starting_at(start);
        RateLimiter::builder()
            .bucket("per_second", rate_of.build(3, Period::Second).unwrap())
            .bucket("per_minute", rate_of.build(10, Period::Minute).unwrap())
            .build_with_clock(ManualClock::starting_at(start))
            .unwrap()
    }

    #[test]
    fn test_rate_limiter_creation() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);

        assert_eq!(limiter.bucket_names(), vec!["per_second", "per_minute"]);
        assert!(limiter.exhausted().is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = RateLimiter::new(vec![
            ("a", Bucket::new(1, Period::Second).unwrap()),
            ("a", Bucket::new(2, Period::Minute).unwrap()),
        ]);
        assert!(matches!(result, Err(QuotaError::Config(_))));
    }

    #[test]
    fn test_empty_limiter_rejected() {
        let result = RateLimiter::builder().build();
        assert!(matches!(result, Err(QuotaError::Config(_))));
    }

    #[test]
    fn test_reduce_reports_exhausted_bucket() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);

        for _ in 0..3 {
            assert!(limiter.reduce_at(start).is_allowed());
        }

        let admission = limiter.reduce_at(start);
        assert!(!admission.allowed);
        assert_eq!(admission.exhausted, vec!["per_second".to_string()]);
        assert_eq!(limiter.exhausted(), vec!["per_second".to_string()]);
        assert_eq!(limiter.get_at("per_minute", start).unwrap(), 7.0);
    }

    #[test]
    fn test_refused_reduce_consumes_nothing() {
        let start = Instant::now();
        let limiter = RateLimiter::with_clock(
            vec![
                ("a", Bucket::new_at(1, Period::Second, start).unwrap()),
                ("b", Bucket::new_at(5, Period::Second, start).unwrap()),
            ],
            ManualClock::starting_at(start),
        )
        .unwrap();

        assert!(limiter.reduce_at(start).is_allowed());
        assert_eq!(limiter.get_at("b", start).unwrap(), 4.0);

        let admission = limiter.reduce_at(start);
        assert_eq!(admission.exhausted, vec!["a".to_string()]);
        assert_eq!(limiter.get_at("b", start).unwrap(), 4.0);
    }

    #[test]
    fn test_all_exhausted_in_declaration_order() {
        let start = Instant::now();
        let limiter = RateLimiter::with_clock(
            vec![
                ("zeta", Bucket::new_at(1, Period::Second, start).unwrap()),
                ("alpha", Bucket::new_at(1, Period::Minute, start).unwrap()),
            ],
            ManualClock::starting_at(start),
        )
        .unwrap();

        limiter.reduce_at(start);
        let admission = limiter.reduce_at(start);
        assert_eq!(admission.exhausted, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_allowed_reduce_clears_exhausted() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);

        for _ in 0..4 {
            limiter.reduce_at(start);
        }
        assert!(!limiter.exhausted().is_empty());

        assert!(limiter.reduce_at(start + Duration::from_secs(1)).is_allowed());
        assert!(limiter.exhausted().is_empty());
    }

    #[test]
    fn test_reduce_uses_clock() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);

        for _ in 0..3 {
            assert!(limiter.reduce().is_allowed());
        }
        assert!(!limiter.reduce().is_allowed());

        limiter.clock().advance(Duration::from_millis(400));
        assert!(limiter.reduce().is_allowed());
        assert!(!limiter.reduce().is_allowed());
    }

    #[test]
    fn test_per_minute_exhaustion() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);
        let mut now = start;

        // One request per second drains per_minute faster than it refills
        for _ in 0..11 {
            assert!(limiter.reduce_at(now).is_allowed());
            now += Duration::from_secs(1);
        }

        let admission = limiter.reduce_at(now);
        assert_eq!(admission.exhausted, vec!["per_minute".to_string()]);
    }

    #[test]
    fn test_reduce_tokens() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);

        let three = NonZeroU64::new(3).unwrap();
        assert!(limiter.reduce_tokens_at(three, start).is_allowed());
        assert_eq!(limiter.get_at("per_minute", start).unwrap(), 7.0);

        let eleven = NonZeroU64::new(11).unwrap();
        let admission = limiter.reduce_tokens_at(eleven, start + Duration::from_secs(60));
        assert_eq!(admission.exhausted, vec!["per_second", "per_minute"]);
    }

    #[test]
    fn test_time_until_allowed() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);
        let one = NonZeroU64::MIN;

        assert_eq!(limiter.time_until_allowed_at(one, start), Some(Duration::ZERO));

        for _ in 0..3 {
            limiter.reduce_at(start);
        }
        assert_eq!(
            limiter.time_until_allowed_at(one, start),
            Some(Duration::from_nanos(333_333_334))
        );
        assert_eq!(
            limiter.time_until_allowed_at(NonZeroU64::new(4).unwrap(), start),
            None
        );

        let wait = limiter.time_until_allowed_at(one, start).unwrap();
        assert!(limiter.reduce_at(start + wait).is_allowed());
    }

    #[test]
    fn test_get_unknown_bucket() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);

        let err = limiter.get_at("per_hour", start).unwrap_err();
        assert!(matches!(err, QuotaError::UnknownBucket(ref name) if name == "per_hour"));
    }

    #[test]
    fn test_status_by_name() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);
        limiter.reduce_at(start);

        let per_second = limiter.status_of_at("per_second", start).unwrap();
        assert_eq!(per_second.capacity, 3);
        assert_eq!(per_second.remaining, 2.0);

        assert!(matches!(
            limiter.status_of_at("per_hour", start),
            Err(QuotaError::UnknownBucket(ref name)) if name == "per_hour"
        ));
        assert!(matches!(
            limiter.status_at(start).get("per_hour"),
            Err(QuotaError::UnknownBucket(_))
        ));
    }

    #[test]
    fn test_status_in_declaration_order() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);
        limiter.reduce_at(start);

        let status = limiter.status_at(start);
        let names: Vec<&str> = status.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["per_second", "per_minute"]);
        assert_eq!(status.len(), 2);

        let per_minute = status.get("per_minute").unwrap();
        assert_eq!(per_minute.capacity, 10);
        assert_eq!(per_minute.remaining, 9.0);
        assert_eq!(per_minute.period, Duration::from_secs(60));

        assert_eq!(
            status.to_string(),
            "per_second: 2.00/3 per 1s, per_minute: 9.00/10 per 60s"
        );
    }

    #[test]
    fn test_status_serializes_in_order() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);

        let json = serde_json::to_string(&limiter.status_at(start)).unwrap();
        let second = json.find("per_second").unwrap();
        let minute = json.find("per_minute").unwrap();
        assert!(second < minute);
        assert!(json.contains("\"capacity\":3"));
    }

    #[test]
    fn test_reset() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);
        for _ in 0..4 {
            limiter.reduce_at(start);
        }

        limiter.reset_at(start);
        assert!(limiter.exhausted().is_empty());
        assert_eq!(limiter.get_at("per_second", start).unwrap(), 3.0);
        assert_eq!(limiter.get_at("per_minute", start).unwrap(), 10.0);
    }

    #[test]
    fn test_tokens_stay_within_capacity() {
        let start = Instant::now();
        let limiter = create_test_limiter(start);
        let mut now = start;

        for step in 0..500u64 {
            limiter.reduce_at(now);
            now += Duration::from_millis(37 * (step % 7));
            for (_, status) in limiter.status_at(now).iter() {
                assert!(status.remaining >= 0.0);
                assert!(status.remaining <= status.capacity as f64);
            }
        }
    }

    #[test]
    fn test_concurrent_reduce_single_token() {
        let start = Instant::now();
        let limiter = Arc::new(
            RateLimiter::with_clock(
                vec![("only", Bucket::new_at(1, Period::Hour, start).unwrap())],
                ManualClock::starting_at(start),
            )
            .unwrap(),
        );
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    limiter.reduce_at(start).allowed
                })
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(allowed, 1);
    }

    #[test]
    fn test_concurrent_reduce_never_overadmits() {
        let start = Instant::now();
        let limiter = Arc::new(create_test_limiter(start));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    (0..5).filter(|_| limiter.reduce_at(start).allowed).count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 3);
        assert_eq!(limiter.get_at("per_minute", start).unwrap(), 7.0);
    }
}
