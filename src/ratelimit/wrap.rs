//! Rate-limited actions.

use std::sync::Arc;
use std::time::Instant;

use super::clock::{Clock, SystemClock};
use super::limiter::RateLimiter;
use crate::error::Result;

/// An action that only runs when its limiter admits the call.
///
/// Each call reduces the limiter by one token. A refusal returns
/// [`QuotaError::QuotaExceeded`](crate::error::QuotaError::QuotaExceeded)
/// without running the action. Several arguments are passed as a tuple.
pub struct RateLimited<F, C: Clock = SystemClock> {
    limiter: Arc<RateLimiter<C>>,
    action: F,
}

impl<C: Clock> RateLimiter<C> {
    /// Wrap `action` so every call goes through this limiter.
    pub fn wrap<F>(self: &Arc<Self>, action: F) -> RateLimited<F, C> {
        RateLimited {
            limiter: Arc::clone(self),
            action,
        }
    }
}

impl<F, C: Clock> RateLimited<F, C> {
    /// Run the action if the limiter admits a call now.
    pub fn call<A, R>(&self, args: A) -> Result<R>
    where
        F: Fn(A) -> R,
    {
        self.call_at(args, self.limiter.clock().now())
    }

    /// Run the action if the limiter admits a call at `now`.
    pub fn call_at<A, R>(&self, args: A, now: Instant) -> Result<R>
    where
        F: Fn(A) -> R,
    {
        self.limiter.reduce_at(now).into_result()?;
        Ok((self.action)(args))
    }

    /// The limiter guarding this action.
    pub fn limiter(&self) -> &Arc<RateLimiter<C>> {
        &self.limiter
    }

    /// Turn the wrapper into a plain closure.
    pub fn into_fn<A, R>(self) -> impl Fn(A) -> Result<R>
    where
        F: Fn(A) -> R,
    {
        move |args| self.call(args)
    }
}
