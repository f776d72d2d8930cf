//! Core middleware trait and types.
//!
//! This module defines the [`Middleware`] trait that every pipeline unit
//! implements, the [`Next`] continuation that drives the rest of the chain,
//! and the [`Handler`] trait for the terminal message handler.
//!
//! # Example
//!
//! ```ignore
//! use dispatch_middleware::{BoxFuture, Middleware, Next, PipelineContext, Stage};
//! use dispatch_core::{DispatchResult, Message};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Stopwatch;
//!
//! impl Middleware for Stopwatch {
//!     fn name(&self) -> &'static str {
//!         "stopwatch"
//!     }
//!
//!     fn stage(&self) -> Stage {
//!         Stage::Logging
//!     }
//!
//!     fn invoke<'a>(
//!         &'a self,
//!         message: &'a Message,
//!         ctx: &'a mut PipelineContext,
//!         next: Next<'a>,
//!         token: CancellationToken,
//!     ) -> BoxFuture<'a, DispatchResult> {
//!         Box::pin(async move {
//!             let result = next.run(message, ctx, token).await;
//!             println!("{} took {:?}", message.message_type(), ctx.elapsed());
//!             result
//!         })
//!     }
//! }
//! ```

use crate::context::PipelineContext;
use crate::pipeline::Stage;
use dispatch_core::{BoxFuture, DispatchError, DispatchOutcome, DispatchResult, Message, MessageKind};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A type-erased middleware that can be stored in a chain.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// A pipeline unit.
///
/// # Invariants
///
/// - A unit either calls `next.run()` or short-circuits with its own result.
///   Resilience units (retry) may call it more than once.
/// - A unit never turns [`DispatchError::Cancelled`] into anything else.
/// - Hooks run synchronously; the engine applies them around [`invoke`](Self::invoke).
pub trait Middleware: Send + Sync + 'static {
    /// Returns the unit name, used in logs and [`Pipeline::stage_names`](crate::Pipeline::stage_names).
    fn name(&self) -> &'static str;

    /// Returns the stage the unit belongs to.
    fn stage(&self) -> Stage;

    /// Returns the message kinds the unit applies to.
    fn applicable_kinds(&self) -> MessageKind {
        MessageKind::ALL
    }

    /// Returns the features that must be enabled for the unit to be kept.
    fn required_features(&self) -> &[String] {
        &[]
    }

    /// Runs before [`invoke`](Self::invoke).
    ///
    /// Returning `Some` short-circuits: neither the unit nor the rest of the
    /// chain runs, and the outcome is returned as is.
    fn before(&self, _message: &Message, _ctx: &mut PipelineContext) -> Option<DispatchOutcome> {
        None
    }

    /// Runs after a successful [`invoke`](Self::invoke) and may replace the outcome.
    fn after(
        &self,
        _message: &Message,
        _ctx: &mut PipelineContext,
        outcome: DispatchOutcome,
    ) -> DispatchOutcome {
        outcome
    }

    /// Runs when [`invoke`](Self::invoke) fails.
    ///
    /// Returning `Some` converts the error into an outcome. Never called for
    /// cancellation.
    fn on_error(
        &self,
        _message: &Message,
        _ctx: &mut PipelineContext,
        _error: &DispatchError,
    ) -> Option<DispatchOutcome> {
        None
    }

    /// Processes the message, usually by calling `next.run()`.
    fn invoke<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        next: Next<'a>,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult>;
}

/// The terminal message handler.
pub trait Handler: Send + Sync {
    /// Handles the message.
    ///
    /// Long-running handlers should observe `token` and return
    /// [`DispatchError::Cancelled`] once it fires.
    fn handle<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn handle<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        (**self).handle(message, ctx, token)
    }
}

/// Continuation to the rest of the chain.
///
/// `Next` is `Copy`: a unit may run the remainder of the chain several times,
/// each run starting from the same position.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    remaining: &'a [BoxedMiddleware],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [BoxedMiddleware], handler: &'a dyn Handler) -> Self {
        Self {
            remaining: chain,
            handler,
        }
    }

    /// Runs the next unit, or the handler at the end of the chain.
    pub fn run<'b>(
        self,
        message: &'b Message,
        ctx: &'b mut PipelineContext,
        token: CancellationToken,
    ) -> BoxFuture<'b, DispatchResult>
    where
        'a: 'b,
    {
        match self.remaining.split_first() {
            Some((unit, rest)) => {
                let next = Next::new(rest, self.handler);
                Box::pin(invoke_with_hooks(&**unit, message, ctx, next, token))
            }
            None if token.is_cancelled() => {
                Box::pin(std::future::ready(Err(DispatchError::Cancelled)))
            }
            None => self.handler.handle(message, ctx, token),
        }
    }

    /// Returns the number of units left before the handler.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field(
                "remaining",
                &self.remaining.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Invokes one unit with its lifecycle hooks.
///
/// Exactly one of short-circuit, completion or propagated error results.
pub(crate) async fn invoke_with_hooks<'a>(
    unit: &'a dyn Middleware,
    message: &'a Message,
    ctx: &'a mut PipelineContext,
    next: Next<'a>,
    token: CancellationToken,
) -> DispatchResult {
    if let Some(outcome) = unit.before(message, ctx) {
        tracing::debug!(unit = unit.name(), "Short-circuited before invoke");
        return Ok(outcome);
    }

    match unit.invoke(message, ctx, next, token).await {
        Ok(outcome) => Ok(unit.after(message, ctx, outcome)),
        Err(error) if error.is_cancelled() => Err(error),
        Err(error) => match unit.on_error(message, ctx, &error) {
            Some(outcome) => Ok(outcome),
            None => Err(error),
        },
    }
}

/// A unit built from a synchronous check.
///
/// The closure runs before the rest of the chain; returning an error stops
/// the dispatch.
///
/// # Example
///
/// ```
/// use dispatch_core::DispatchError;
/// use dispatch_middleware::{FnMiddleware, Stage};
///
/// let require_body = FnMiddleware::new("require_body", Stage::Validation, |message, _ctx| {
///     if message.body().is_empty() {
///         return Err(DispatchError::validation("body is required"));
///     }
///     Ok(())
/// });
/// ```
pub struct FnMiddleware<F> {
    name: &'static str,
    stage: Stage,
    kinds: MessageKind,
    features: Vec<String>,
    func: F,
}

impl<F> FnMiddleware<F>
where
    F: Fn(&Message, &mut PipelineContext) -> Result<(), DispatchError> + Send + Sync + 'static,
{
    /// Creates a new function-based unit applying to all message kinds.
    pub fn new(name: &'static str, stage: Stage, func: F) -> Self {
        Self {
            name,
            stage,
            kinds: MessageKind::ALL,
            features: Vec::new(),
            func,
        }
    }

    /// Restricts the unit to the given message kinds.
    #[must_use]
    pub fn kinds(mut self, kinds: MessageKind) -> Self {
        self.kinds = kinds;
        self
    }

    /// Keeps the unit only when `feature` is enabled.
    #[must_use]
    pub fn requires(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }
}

impl<F> fmt::Debug for FnMiddleware<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMiddleware")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .field("kinds", &self.kinds)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&Message, &mut PipelineContext) -> Result<(), DispatchError> + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    fn applicable_kinds(&self) -> MessageKind {
        self.kinds
    }

    fn required_features(&self) -> &[String] {
        &self.features
    }

    fn invoke<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        next: Next<'a>,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        Box::pin(async move {
            (self.func)(message, ctx)?;
            next.run(message, ctx, token).await
        })
    }
}

/// A handler built from an async closure.
///
/// The closure receives an owned copy of the message; implement [`Handler`]
/// directly to read or write the [`PipelineContext`].
pub struct FnHandler<F> {
    func: F,
}

/// Creates a [`FnHandler`].
///
/// # Example
///
/// ```
/// use dispatch_core::DispatchOutcome;
/// use dispatch_middleware::handler_fn;
///
/// let handler = handler_fn(|_message, _token| async { Ok(DispatchOutcome::success()) });
/// ```
pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(Message, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult> + Send + 'static,
{
    FnHandler { func }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Message, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        message: &'a Message,
        _ctx: &'a mut PipelineContext,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        Box::pin((self.func)(message.clone(), token))
    }
}
