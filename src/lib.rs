//! Multiquota - In-Process Multi-Bucket Rate Limiting
//!
//! This crate enforces several token-bucket quotas ("3 per second",
//! "10 per minute") against a single stream of events. An event is admitted
//! only when every bucket has a token, and then takes one from each.

pub mod client;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{QuotaError, Result};
pub use ratelimit::{Bucket, Period, RateLimiter};
