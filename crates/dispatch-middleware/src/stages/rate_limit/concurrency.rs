use super::{Permit, RateLimitAlgorithm};
use crate::keyed::KeyedState;
use std::sync::Arc;
use std::time::Duration;

/// Cap on in-flight requests per key.
///
/// The slot is held by the [`Permit`] and freed when it drops, whichever way
/// the request ends.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    max_concurrency: u32,
    in_flight: Arc<KeyedState<u32>>,
}

impl ConcurrencyLimiter {
    /// Creates a concurrency limiter.
    #[must_use]
    pub fn new(max_concurrency: u32) -> Self {
        Self {
            max_concurrency,
            in_flight: Arc::new(KeyedState::new(|| 0)),
        }
    }

    /// Returns the requests in flight for `key`.
    #[must_use]
    pub fn in_flight(&self, key: &str) -> u32 {
        self.in_flight.inspect(key, |n| *n).unwrap_or_default()
    }
}

impl RateLimitAlgorithm for ConcurrencyLimiter {
    fn name(&self) -> &'static str {
        "concurrency"
    }

    fn try_acquire(&self, key: &str) -> Result<Permit, Duration> {
        let entry = self.in_flight.entry(key);
        {
            let mut in_flight = entry.lock();
            if *in_flight >= self.max_concurrency {
                return Err(Duration::ZERO);
            }
            *in_flight += 1;
        }

        Ok(Permit::free().on_release(move || {
            let mut in_flight = entry.lock();
            *in_flight = in_flight.saturating_sub(1);
        }))
    }
}
