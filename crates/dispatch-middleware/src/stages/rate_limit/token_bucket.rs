use super::{Permit, RateLimitAlgorithm};
use crate::keyed::KeyedState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Token bucket with lazy refill.
///
/// Each key starts full with `token_limit` tokens. Every whole
/// `replenishment_period` since the last refill adds `tokens_per_period`
/// tokens, up to the limit; partial periods add nothing.
#[derive(Debug)]
pub struct TokenBucket {
    token_limit: u32,
    tokens_per_period: u32,
    period: Duration,
    buckets: Arc<KeyedState<Bucket>>,
}

impl TokenBucket {
    /// Creates a token bucket limiter.
    #[must_use]
    pub fn new(token_limit: u32, tokens_per_period: u32, replenishment_period: Duration) -> Self {
        let period = replenishment_period.max(Duration::from_nanos(1));
        Self {
            token_limit,
            tokens_per_period,
            period,
            buckets: Arc::new(KeyedState::new(move || Bucket {
                tokens: token_limit,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Returns the tokens currently available for `key`, after refill.
    #[must_use]
    pub fn available(&self, key: &str) -> u32 {
        self.buckets.with(key, |bucket| {
            self.refill(bucket, Instant::now());
            bucket.tokens
        })
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let period = self.period.as_nanos();
        let periods = elapsed.as_nanos() / period;
        if periods == 0 {
            return;
        }

        let added = periods.saturating_mul(u128::from(self.tokens_per_period));
        let tokens = (u128::from(bucket.tokens) + added).min(u128::from(self.token_limit));
        bucket.tokens = u32::try_from(tokens).unwrap_or(self.token_limit);

        // Keep the partial period so refills stay aligned.
        let partial = u64::try_from(elapsed.as_nanos() % period).unwrap_or(0);
        bucket.last_refill = now
            .checked_sub(Duration::from_nanos(partial))
            .unwrap_or(now);
    }
}

impl RateLimitAlgorithm for TokenBucket {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn try_acquire(&self, key: &str) -> Result<Permit, Duration> {
        let entry = self.buckets.entry(key);
        let now = Instant::now();
        {
            let mut bucket = entry.lock();
            self.refill(&mut bucket, now);
            if bucket.tokens == 0 {
                let since_refill = now.saturating_duration_since(bucket.last_refill);
                return Err(self.period.saturating_sub(since_refill));
            }
            bucket.tokens -= 1;
        }

        let limit = self.token_limit;
        Ok(Permit::free().on_rollback(move || {
            let mut bucket = entry.lock();
            bucket.tokens = bucket.tokens.saturating_add(1).min(limit);
        }))
    }
}
