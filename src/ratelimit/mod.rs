//! Token-bucket accounting and multi-bucket admission.

mod bucket;
mod clock;
mod limiter;
mod period;
mod wrap;

pub use bucket::{Bucket, BucketBuilder, BucketStatus, MAX_CAPACITY, UNITS_PER_TOKEN};
pub use clock::{Clock, ManualClock, SkewedClock, SystemClock, MAX_SKEW, MIN_SKEW};
pub use limiter::{Admission, LimiterStatus, RateLimiter, RateLimiterBuilder};
pub use period::Period;
pub use wrap::RateLimited;
