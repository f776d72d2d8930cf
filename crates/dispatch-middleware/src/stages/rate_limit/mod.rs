//! Rate limiting stage.
//!
//! A [`RateLimitMiddleware`] holds up to two limiters: a global one shared by
//! every message, and a per-key one partitioned by a [`KeySelector`]
//! (tenant by default). A message is admitted only when both admit it; the
//! global check runs first and is rolled back if the per-key check rejects.
//!
//! # Algorithms
//!
//! | Algorithm | State per key | `retry_after` on rejection |
//! |-----------|---------------|----------------------------|
//! | [`TokenBucket`] | tokens, last refill | time to the next refill |
//! | [`FixedWindow`] | count, window start | time to the window end |
//! | [`SlidingWindow`] | segment ring | time until the oldest counted segment expires |
//! | [`ConcurrencyLimiter`] | in-flight count | zero |

mod concurrency;
mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use concurrency::ConcurrencyLimiter;
pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use crate::bypass::{BypassList, Capabilities, CapabilityRegistry, SkipRule};
use crate::context::PipelineContext;
use crate::keyed::{KeySelector, GLOBAL_KEY};
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_config::{LimiterConfig, RateLimitConfig};
use dispatch_core::{BoxFuture, DispatchError, DispatchResult, Message, MessageKind};
use dispatch_telemetry::metrics::record_rate_limit_rejection;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A rate limiting algorithm over per-key state.
pub trait RateLimitAlgorithm: Send + Sync {
    /// Returns the algorithm name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Takes a permit for `key`.
    ///
    /// # Errors
    ///
    /// Returns the suggested wait before trying again when the key is
    /// exhausted.
    fn try_acquire(&self, key: &str) -> Result<Permit, Duration>;
}

type Callback = Box<dyn FnOnce() + Send>;

/// An admitted request.
///
/// Dropping the permit releases whatever the algorithm holds for the duration
/// of the call (concurrency slots). [`rollback`](Self::rollback) additionally
/// returns the consumed capacity, for a request that was admitted but will
/// not run.
#[must_use = "dropping a permit releases it"]
pub struct Permit {
    release: Option<Callback>,
    rollback: Option<Callback>,
}

impl Permit {
    /// A permit with nothing to release or return.
    pub fn free() -> Self {
        Self {
            release: None,
            rollback: None,
        }
    }

    /// Runs `f` when the permit is dropped.
    pub fn on_release(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(f));
        self
    }

    /// Runs `f` when the permit is rolled back.
    pub fn on_rollback(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.rollback = Some(Box::new(f));
        self
    }

    /// Gives the consumed capacity back, then releases the permit.
    pub fn rollback(mut self) {
        if let Some(rollback) = self.rollback.take() {
            rollback();
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("release", &self.release.is_some())
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}

/// Builds a limiter from its configuration.
#[must_use]
pub fn limiter_from_config(config: &LimiterConfig) -> Box<dyn RateLimitAlgorithm> {
    match *config {
        LimiterConfig::TokenBucket {
            token_limit,
            tokens_per_period,
            replenishment_period_ms,
        } => Box::new(TokenBucket::new(
            token_limit,
            tokens_per_period,
            Duration::from_millis(replenishment_period_ms),
        )),
        LimiterConfig::FixedWindow {
            permit_limit,
            window_ms,
        } => Box::new(FixedWindow::new(permit_limit, Duration::from_millis(window_ms))),
        LimiterConfig::SlidingWindow {
            permit_limit,
            window_ms,
            segments_per_window,
        } => Box::new(SlidingWindow::new(
            permit_limit,
            Duration::from_millis(window_ms),
            segments_per_window,
        )),
        LimiterConfig::Concurrency { max_concurrency } => {
            Box::new(ConcurrencyLimiter::new(max_concurrency))
        }
    }
}

/// Global and per-key rate limiting.
///
/// # Example
///
/// ```
/// use dispatch_middleware::stages::rate_limit::{FixedWindow, RateLimitMiddleware, TokenBucket};
/// use dispatch_middleware::KeySelector;
/// use std::time::Duration;
///
/// let limiter = RateLimitMiddleware::new()
///     .with_global(TokenBucket::new(1000, 1000, Duration::from_secs(1)))
///     .with_per_key(FixedWindow::new(50, Duration::from_secs(1)))
///     .with_partition(KeySelector::Tenant);
/// ```
pub struct RateLimitMiddleware {
    global: Option<Box<dyn RateLimitAlgorithm>>,
    per_key: Option<Box<dyn RateLimitAlgorithm>>,
    partition: KeySelector,
    kinds: MessageKind,
    skip: SkipRule,
}

impl RateLimitMiddleware {
    /// Creates a unit with no limiters, partitioned by tenant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            global: None,
            per_key: None,
            partition: KeySelector::Tenant,
            kinds: MessageKind::ALL,
            skip: SkipRule::new(Capabilities::SKIP_RATE_LIMIT),
        }
    }

    /// Creates a unit from its configuration section.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            global: config.global.as_ref().map(limiter_from_config),
            per_key: config.per_key.as_ref().map(limiter_from_config),
            partition: config.partition.into(),
            ..Self::new()
        }
        .with_bypass(BypassList::from(&config.bypass))
    }

    /// Sets the limiter shared by every message.
    #[must_use]
    pub fn with_global(mut self, limiter: impl RateLimitAlgorithm + 'static) -> Self {
        self.global = Some(Box::new(limiter));
        self
    }

    /// Sets the limiter applied per partition key.
    #[must_use]
    pub fn with_per_key(mut self, limiter: impl RateLimitAlgorithm + 'static) -> Self {
        self.per_key = Some(Box::new(limiter));
        self
    }

    /// Sets how the per-key limiter partitions messages.
    #[must_use]
    pub fn with_partition(mut self, partition: KeySelector) -> Self {
        self.partition = partition;
        self
    }

    /// Sets the messages that skip rate limiting.
    #[must_use]
    pub fn with_bypass(mut self, bypass: BypassList) -> Self {
        self.skip.set_bypass(bypass);
        self
    }

    /// Consults a capability registry for [`Capabilities::SKIP_RATE_LIMIT`].
    #[must_use]
    pub fn with_capabilities(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.skip.set_registry(registry);
        self
    }

    /// Restricts the unit to the given message kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: MessageKind) -> Self {
        self.kinds = kinds;
        self
    }

    fn reject(
        scope: &'static str,
        limiter: &dyn RateLimitAlgorithm,
        key: String,
        retry_after: Duration,
        message: &Message,
    ) -> DispatchError {
        warn!(
            scope,
            algorithm = limiter.name(),
            key = %key,
            message_type = message.message_type(),
            retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
            "Rate limit exceeded"
        );
        record_rate_limit_rejection(scope, limiter.name());
        DispatchError::RateLimitExceeded { key, retry_after }
    }
}

impl Default for RateLimitMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RateLimitMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitMiddleware")
            .field("global", &self.global.as_ref().map(|l| l.name()))
            .field("per_key", &self.per_key.as_ref().map(|l| l.name()))
            .field("partition", &self.partition)
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn stage(&self) -> Stage {
        Stage::Processing
    }

    fn applicable_kinds(&self) -> MessageKind {
        self.kinds
    }

    fn invoke<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        next: Next<'a>,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        Box::pin(async move {
            if self.skip.skips(message) {
                return next.run(message, ctx, token).await;
            }

            let global = match &self.global {
                Some(limiter) => match limiter.try_acquire(GLOBAL_KEY) {
                    Ok(permit) => Some(permit),
                    Err(retry_after) => {
                        return Err(Self::reject(
                            "global",
                            limiter.as_ref(),
                            GLOBAL_KEY.to_string(),
                            retry_after,
                            message,
                        ));
                    }
                },
                None => None,
            };

            let _keyed = match &self.per_key {
                Some(limiter) => {
                    let key = self.partition.select(message, ctx);
                    match limiter.try_acquire(&key) {
                        Ok(permit) => Some(permit),
                        Err(retry_after) => {
                            if let Some(permit) = global {
                                permit.rollback();
                            }
                            return Err(Self::reject(
                                "per_key",
                                limiter.as_ref(),
                                key,
                                retry_after,
                                message,
                            ));
                        }
                    }
                }
                None => None,
            };
            let _global = global;

            next.run(message, ctx, token).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, Handler};
    use crate::Pipeline;
    use dispatch_core::{DispatchOutcome, MessageKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_handler() -> impl Handler {
        handler_fn(|_message, _token| async { Ok(DispatchOutcome::success()) })
    }

    fn tenant_message(tenant: &str) -> Message {
        Message::builder("PlaceOrder", MessageKind::ACTION)
            .header("tenant", tenant)
            .build()
    }

    fn by_tenant_header() -> KeySelector {
        KeySelector::custom(|message, _ctx| message.header("tenant").unwrap_or("none").to_string())
    }

    #[test]
    fn test_permit_callbacks() {
        let released = Arc::new(AtomicUsize::new(0));
        let rolled_back = Arc::new(AtomicUsize::new(0));

        let permit = {
            let released = Arc::clone(&released);
            let rolled_back = Arc::clone(&rolled_back);
            Permit::free()
                .on_release(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                })
                .on_rollback(move || {
                    rolled_back.fetch_add(1, Ordering::SeqCst);
                })
        };
        permit.rollback();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);

        drop(Permit::free());
    }

    #[test]
    fn test_limiter_from_config() {
        let limiter = limiter_from_config(&LimiterConfig::SlidingWindow {
            permit_limit: 2,
            window_ms: 1000,
            segments_per_window: 4,
        });
        assert_eq!(limiter.name(), "sliding_window");
        assert_eq!(
            limiter_from_config(&LimiterConfig::Concurrency { max_concurrency: 1 }).name(),
            "concurrency"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit_rejects() {
        let pipeline = Pipeline::builder()
            .add(RateLimitMiddleware::new().with_global(FixedWindow::new(2, Duration::from_secs(1))))
            .build();
        let handler = ok_handler();

        for _ in 0..2 {
            pipeline
                .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
                .await
                .unwrap();
        }
        let err = pipeline
            .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            DispatchError::RateLimitExceeded { key, retry_after } => {
                assert_eq!(key, GLOBAL_KEY);
                assert_eq!(retry_after, Duration::from_secs(1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_key_rejection_returns_global_token() {
        let pipeline = Pipeline::builder()
            .add(
                RateLimitMiddleware::new()
                    .with_global(TokenBucket::new(3, 3, Duration::from_secs(60)))
                    .with_per_key(TokenBucket::new(1, 1, Duration::from_secs(60)))
                    .with_partition(by_tenant_header()),
            )
            .build();
        let handler = ok_handler();
        let dispatch = |message: Message| {
            let pipeline = &pipeline;
            let handler = &handler;
            async move {
                pipeline
                    .dispatch(&message, handler, CancellationToken::new())
                    .await
            }
        };

        dispatch(tenant_message("acme")).await.unwrap();

        // Rejected per key: the global token is handed back each time.
        for _ in 0..5 {
            let err = dispatch(tenant_message("acme")).await.unwrap_err();
            assert!(matches!(
                err,
                DispatchError::RateLimitExceeded { ref key, .. } if key == "acme"
            ));
        }

        dispatch(tenant_message("globex")).await.unwrap();
        dispatch(tenant_message("initech")).await.unwrap();

        let err = dispatch(tenant_message("umbrella")).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::RateLimitExceeded { ref key, .. } if key == GLOBAL_KEY
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_slot_released_when_per_key_rejects() {
        let pipeline = Pipeline::builder()
            .add(
                RateLimitMiddleware::new()
                    .with_global(ConcurrencyLimiter::new(1))
                    .with_per_key(FixedWindow::new(1, Duration::from_secs(60)))
                    .with_partition(by_tenant_header()),
            )
            .build();
        let handler = ok_handler();

        pipeline
            .dispatch(&tenant_message("acme"), &handler, CancellationToken::new())
            .await
            .unwrap();
        pipeline
            .dispatch(&tenant_message("acme"), &handler, CancellationToken::new())
            .await
            .unwrap_err();
        pipeline
            .dispatch(&tenant_message("globex"), &handler, CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypass_skips_limits() {
        let pipeline = Pipeline::builder()
            .add(
                RateLimitMiddleware::new()
                    .with_global(FixedWindow::new(1, Duration::from_secs(60)))
                    .with_capabilities(Arc::new(
                        CapabilityRegistry::new().register("HealthCheck", Capabilities::SKIP_RATE_LIMIT),
                    )),
            )
            .build();
        let handler = ok_handler();

        for _ in 0..5 {
            pipeline
                .dispatch(&Message::action("HealthCheck"), &handler, CancellationToken::new())
                .await
                .unwrap();
        }
        pipeline
            .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
            .await
            .unwrap();
    }

    #[test]
    fn test_from_config() {
        let config = RateLimitConfig {
            per_key: Some(LimiterConfig::Concurrency { max_concurrency: 4 }),
            ..RateLimitConfig::default()
        };
        let unit = RateLimitMiddleware::from_config(&config);
        let debug = format!("{unit:?}");
        assert!(debug.contains("token_bucket"));
        assert!(debug.contains("concurrency"));
    }
}
