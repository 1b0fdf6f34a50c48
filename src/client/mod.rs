//! A demo request sender guarded by a rate limiter.
//!
//! The client does not talk to any service; it serializes each request and
//! records it, which is enough to watch the limiter at work.

mod retry;

pub use retry::{RetryPolicy, RetryProxy};

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::Result;
use crate::ratelimit::{Clock, RateLimited, RateLimiter, SystemClock};

type SendFn = Box<dyn Fn(String) -> String + Send + Sync>;

/// Sends requests no faster than its limiter allows.
pub struct Client<C: Clock = SystemClock> {
    send: RateLimited<SendFn, C>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl<C: Clock> Client<C> {
    /// Create a client guarded by `limiter`.
    pub fn new(limiter: Arc<RateLimiter<C>>) -> Self {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        let action: SendFn = Box::new(move |payload: String| {
            info!(request = %payload, "Sending request");
            log.lock().push(payload.clone());
            payload
        });

        Self {
            send: limiter.wrap(action),
            sent,
        }
    }

    /// Send a request, returning its JSON payload.
    ///
    /// Fails with `QuotaExceeded` when any bucket is out of tokens.
    pub fn send<T: Serialize>(&self, request: &T) -> Result<String> {
        let payload = serde_json::to_string(request)?;
        self.send.call(payload)
    }

    /// Payloads sent so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// The limiter guarding this client.
    pub fn limiter(&self) -> &Arc<RateLimiter<C>> {
        self.send.limiter()
    }

    /// How long to wait for the given exhausted buckets to recover.
    ///
    /// This is the longest period among them; unknown names are ignored.
    pub fn backoff_for(&self, exhausted: &[String]) -> Duration {
        let status = self.limiter().status();
        exhausted
            .iter()
            .filter_map(|name| status.get(name).ok())
            .map(|bucket| bucket.period)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
