//! Timeout guard.
//!
//! The deadline for a message is resolved in this order:
//!
//! 1. a [`TimeoutOverride`] extension in the context;
//! 2. the timeout for the message kind (action, event, document);
//! 3. the timeout for the message type name;
//! 4. the default.
//!
//! Downstream units run with a child of the caller's token. When the
//! deadline fires first the child is cancelled and the dispatch ends with
//! [`DispatchError::MessageTimeout`], raised as an error or returned as a
//! failed outcome depending on `throw_on_timeout`.
//!
//! The [`Deadline`] is published in the context only while the downstream
//! chain runs; any deadline set by an enclosing guard is restored on return.

use crate::bypass::{BypassList, Capabilities, CapabilityRegistry, SkipRule};
use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_config::TimeoutConfig;
use dispatch_core::{BoxFuture, DispatchError, DispatchOutcome, DispatchResult, Message, MessageKind};
use dispatch_telemetry::metrics::record_timeout;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-dispatch deadline override, set by an earlier unit or the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutOverride(pub Duration);

/// The deadline in force, published in the [`PipelineContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// When the deadline fires, or `None` when the timeout is too large to
    /// fall on a representable instant.
    pub at: Option<Instant>,
    /// The resolved timeout.
    pub timeout: Duration,
}

impl Deadline {
    /// Returns the time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at
            .map_or(Duration::MAX, |at| at.saturating_duration_since(Instant::now()))
    }
}

/// Cooperative deadline for the downstream chain.
#[derive(Debug)]
pub struct TimeoutMiddleware {
    default_timeout: Duration,
    action: Option<Duration>,
    event: Option<Duration>,
    document: Option<Duration>,
    message_types: HashMap<String, Duration>,
    throw_on_timeout: bool,
    kinds: MessageKind,
    skip: SkipRule,
}

impl TimeoutMiddleware {
    /// Creates a guard with a single default timeout that raises on expiry.
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            action: None,
            event: None,
            document: None,
            message_types: HashMap::new(),
            throw_on_timeout: true,
            kinds: MessageKind::ALL,
            skip: SkipRule::new(Capabilities::SKIP_TIMEOUT),
        }
    }

    /// Creates a guard from its configuration section.
    #[must_use]
    pub fn from_config(config: &TimeoutConfig) -> Self {
        let mut guard = Self::new(config.default_timeout())
            .throw_on_timeout(config.throw_on_timeout)
            .with_bypass(BypassList::from(&config.bypass));
        guard.action = config.action_timeout_ms.map(Duration::from_millis);
        guard.event = config.event_timeout_ms.map(Duration::from_millis);
        guard.document = config.document_timeout_ms.map(Duration::from_millis);
        guard.message_types = config
            .message_types
            .iter()
            .map(|(name, ms)| (name.clone(), Duration::from_millis(*ms)))
            .collect();
        guard
    }

    /// Sets the timeout for one message kind.
    ///
    /// `kind` should be a single kind; combined masks set each listed kind.
    #[must_use]
    pub fn with_kind_timeout(mut self, kind: MessageKind, timeout: Duration) -> Self {
        if kind.contains(MessageKind::ACTION) {
            self.action = Some(timeout);
        }
        if kind.contains(MessageKind::EVENT) {
            self.event = Some(timeout);
        }
        if kind.contains(MessageKind::DOCUMENT) {
            self.document = Some(timeout);
        }
        self
    }

    /// Sets the timeout for one message type name.
    #[must_use]
    pub fn with_type_timeout(mut self, message_type: impl Into<String>, timeout: Duration) -> Self {
        self.message_types.insert(message_type.into(), timeout);
        self
    }

    /// Chooses between raising [`DispatchError::MessageTimeout`] and returning
    /// it as a failed outcome.
    #[must_use]
    pub fn throw_on_timeout(mut self, throw: bool) -> Self {
        self.throw_on_timeout = throw;
        self
    }

    /// Sets the messages that skip the guard.
    #[must_use]
    pub fn with_bypass(mut self, bypass: BypassList) -> Self {
        self.skip.set_bypass(bypass);
        self
    }

    /// Consults a capability registry for [`Capabilities::SKIP_TIMEOUT`].
    #[must_use]
    pub fn with_capabilities(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.skip.set_registry(registry);
        self
    }

    /// Restricts the guard to the given message kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: MessageKind) -> Self {
        self.kinds = kinds;
        self
    }

    /// Returns the timeout that applies to a message.
    #[must_use]
    pub fn resolve(&self, message: &Message, ctx: &PipelineContext) -> Duration {
        if let Some(TimeoutOverride(timeout)) = ctx.get_extension::<TimeoutOverride>() {
            return *timeout;
        }
        self.kind_timeout(message.kind())
            .or_else(|| self.message_types.get(message.message_type()).copied())
            .unwrap_or(self.default_timeout)
    }

    fn kind_timeout(&self, kind: MessageKind) -> Option<Duration> {
        if kind.contains(MessageKind::ACTION) {
            self.action
        } else if kind.contains(MessageKind::EVENT) {
            self.event
        } else if kind.contains(MessageKind::DOCUMENT) {
            self.document
        } else {
            None
        }
    }

    fn expired(&self, message: &Message, configured: Duration, started: Instant) -> DispatchResult {
        let error = DispatchError::MessageTimeout {
            configured,
            elapsed: started.elapsed(),
        };
        warn!(
            message_type = message.message_type(),
            timeout_ms = u64::try_from(configured.as_millis()).unwrap_or(u64::MAX),
            "Message timed out"
        );
        record_timeout(message.message_type());

        if self.throw_on_timeout {
            Err(error)
        } else {
            let instance = message.id().to_string();
            Ok(DispatchOutcome::failed(error.to_problem_details(Some(&instance))))
        }
    }
}

impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &'static str {
        "timeout"
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

            let timeout = self.resolve(message, ctx);
            let started = Instant::now();
            let at = started.checked_add(timeout);
            let enclosing = ctx.remove_extension::<Deadline>();
            ctx.set_extension(Deadline { at, timeout });

            let child = token.child_token();
            let _release = child.clone().drop_guard();
            let expiry = async move {
                match at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let result = tokio::select! {
                biased;
                () = token.cancelled() => Err(DispatchError::Cancelled),
                result = next.run(message, ctx, child.clone()) => result,
                () = expiry => {
                    child.cancel();
                    self.expired(message, timeout, started)
                }
            };

            ctx.remove_extension::<Deadline>();
            if let Some(deadline) = enclosing {
                ctx.set_extension(deadline);
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, FnMiddleware};
    use crate::Pipeline;
    use parking_lot::Mutex;

    fn slow_handler(
        work: Duration,
        seen: Arc<Mutex<Option<CancellationToken>>>,
    ) -> impl crate::Handler {
        handler_fn(move |_message, token: CancellationToken| {
            *seen.lock() = Some(token.clone());
            async move {
                tokio::select! {
                    () = token.cancelled() => Err(DispatchError::Cancelled),
                    () = tokio::time::sleep(work) => Ok(DispatchOutcome::success()),
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_handler_completes() {
        let pipeline = Pipeline::builder()
            .add(TimeoutMiddleware::new(Duration::from_secs(1)))
            .build();
        let seen = Arc::new(Mutex::new(None));
        let handler = slow_handler(Duration::from_millis(100), Arc::clone(&seen));

        let outcome = pipeline
            .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_success());

        // The child token is released once the guard returns.
        assert!(seen.lock().as_ref().unwrap().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_downstream() {
        let pipeline = Pipeline::builder()
            .add(TimeoutMiddleware::new(Duration::from_millis(100)))
            .build();
        let seen = Arc::new(Mutex::new(None));
        let handler = slow_handler(Duration::from_secs(10), Arc::clone(&seen));
        let caller = CancellationToken::new();

        let err = pipeline
            .dispatch(&Message::action("PlaceOrder"), &handler, caller.clone())
            .await
            .unwrap_err();

        match err {
            DispatchError::MessageTimeout {
                configured,
                elapsed,
            } => {
                assert_eq!(configured, Duration::from_millis(100));
                assert!(elapsed >= configured);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(seen.lock().as_ref().unwrap().is_cancelled());
        assert!(!caller.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_is_not_a_timeout() {
        let pipeline = Pipeline::builder()
            .add(TimeoutMiddleware::new(Duration::from_secs(5)))
            .build();
        let handler = slow_handler(Duration::from_secs(10), Arc::new(Mutex::new(None)));
        let caller = CancellationToken::new();

        let canceller = {
            let caller = caller.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                caller.cancel();
            })
        };

        let err = pipeline
            .dispatch(&Message::action("PlaceOrder"), &handler, caller)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_outcome_when_not_throwing() {
        let pipeline = Pipeline::builder()
            .add(TimeoutMiddleware::new(Duration::from_millis(100)).throw_on_timeout(false))
            .build();
        let handler = slow_handler(Duration::from_secs(10), Arc::new(Mutex::new(None)));
        let message = Message::action("PlaceOrder");

        let outcome = pipeline
            .dispatch(&message, &handler, CancellationToken::new())
            .await
            .unwrap();

        let problem = outcome.problem().unwrap();
        assert_eq!(problem.code, "MESSAGE_TIMEOUT");
        assert_eq!(problem.status, 504);
        assert_eq!(problem.instance, Some(message.id().to_string()));
    }

    #[test]
    fn test_resolution_precedence() {
        let guard = TimeoutMiddleware::new(Duration::from_secs(30))
            .with_kind_timeout(MessageKind::EVENT, Duration::from_secs(5))
            .with_type_timeout("OrderPlaced", Duration::from_secs(2))
            .with_type_timeout("PlaceOrder", Duration::from_secs(3));

        let action = Message::action("PlaceOrder");
        let event = Message::event("OrderPlaced");
        let document = Message::document("Invoice");

        let mut ctx = PipelineContext::for_message(&action);
        assert_eq!(guard.resolve(&action, &ctx), Duration::from_secs(3));
        assert_eq!(guard.resolve(&event, &ctx), Duration::from_secs(5));
        assert_eq!(guard.resolve(&document, &ctx), Duration::from_secs(30));

        ctx.set_extension(TimeoutOverride(Duration::from_millis(250)));
        assert_eq!(guard.resolve(&event, &ctx), Duration::from_millis(250));
    }

    #[test]
    fn test_from_config() {
        let config = TimeoutConfig {
            default_timeout_ms: 1_000,
            document_timeout_ms: Some(9_000),
            message_types: HashMap::from([("Export".to_string(), 60_000)]),
            ..TimeoutConfig::default()
        };
        let guard = TimeoutMiddleware::from_config(&config);
        let ctx = PipelineContext::for_message(&Message::action("Export"));

        assert_eq!(guard.resolve(&Message::action("Export"), &ctx), Duration::from_secs(60));
        assert_eq!(guard.resolve(&Message::document("Export"), &ctx), Duration::from_secs(9));
        assert_eq!(guard.resolve(&Message::event("Other"), &ctx), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_published_in_context() {
        struct ReadDeadline(Mutex<Option<Deadline>>);

        impl crate::Handler for ReadDeadline {
            fn handle<'a>(
                &'a self,
                _message: &'a Message,
                ctx: &'a mut PipelineContext,
                _token: CancellationToken,
            ) -> BoxFuture<'a, DispatchResult> {
                *self.0.lock() = ctx.get_extension::<Deadline>().copied();
                Box::pin(async { Ok(DispatchOutcome::success()) })
            }
        }

        let pipeline = Pipeline::builder()
            .add(TimeoutMiddleware::new(Duration::from_secs(2)))
            .build();
        let handler = ReadDeadline(Mutex::new(None));
        pipeline
            .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
            .await
            .unwrap();

        let deadline = handler.0.lock().take().unwrap();
        assert_eq!(deadline.timeout, Duration::from_secs(2));
        assert_eq!(deadline.remaining(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_override_never_expires() {
        struct SlowReadDeadline(Mutex<Option<Deadline>>);

        impl crate::Handler for SlowReadDeadline {
            fn handle<'a>(
                &'a self,
                _message: &'a Message,
                ctx: &'a mut PipelineContext,
                _token: CancellationToken,
            ) -> BoxFuture<'a, DispatchResult> {
                *self.0.lock() = ctx.get_extension::<Deadline>().copied();
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(DispatchOutcome::success())
                })
            }
        }

        let unbounded = FnMiddleware::new("unbounded", Stage::Authentication, |_message, ctx| {
            ctx.set_extension(TimeoutOverride(Duration::MAX));
            Ok(())
        });
        let pipeline = Pipeline::builder()
            .add(unbounded)
            .add(TimeoutMiddleware::new(Duration::from_secs(1)))
            .build();
        let handler = SlowReadDeadline(Mutex::new(None));

        let outcome = pipeline
            .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_success());

        let deadline = handler.0.lock().take().unwrap();
        assert_eq!(deadline.at, None);
        assert_eq!(deadline.timeout, Duration::MAX);
        assert_eq!(deadline.remaining(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_removed_on_return() {
        let pipeline = Pipeline::builder()
            .add(TimeoutMiddleware::new(Duration::from_millis(100)))
            .build();
        let message = Message::action("PlaceOrder");

        let fast = slow_handler(Duration::from_millis(10), Arc::new(Mutex::new(None)));
        let mut ctx = PipelineContext::for_message(&message);
        pipeline
            .dispatch_with_context(&message, &mut ctx, &fast, CancellationToken::new())
            .await
            .unwrap();
        assert!(!ctx.has_extension::<Deadline>());

        let slow = slow_handler(Duration::from_secs(10), Arc::new(Mutex::new(None)));
        let mut ctx = PipelineContext::for_message(&message);
        pipeline
            .dispatch_with_context(&message, &mut ctx, &slow, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!ctx.has_extension::<Deadline>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enclosing_deadline_restored() {
        let outer = Deadline {
            at: Some(Instant::now() + Duration::from_secs(60)),
            timeout: Duration::from_secs(60),
        };
        let pipeline = Pipeline::builder()
            .add(TimeoutMiddleware::new(Duration::from_secs(1)))
            .build();
        let message = Message::action("PlaceOrder");
        let handler = slow_handler(Duration::from_millis(10), Arc::new(Mutex::new(None)));

        let mut ctx = PipelineContext::for_message(&message);
        ctx.set_extension(outer);
        pipeline
            .dispatch_with_context(&message, &mut ctx, &handler, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ctx.get_extension::<Deadline>(), Some(&outer));
    }
}
