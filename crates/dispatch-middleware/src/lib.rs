//! # Dispatch Middleware
//!
//! Middleware pipeline and resilience stages for Dispatch.
//!
//! A [`Pipeline`] drives one message at a time through an ordered chain of
//! [`Middleware`] units and finally a [`Handler`]. Units are sorted by
//! [`Stage`] when the pipeline is built; the chain for each message kind is
//! computed once and reused for every dispatch.
//!
//! ```text
//! Message → PreProcessing → Validation → Authentication → Authorization
//!                                                              ↓
//!         Logging ← ErrorHandling ← PostProcessing ← Processing → Handler
//! ```
//!
//! ## Resilience units
//!
//! | Unit | State | Rejects with |
//! |------|-------|--------------|
//! | [`RateLimitMiddleware`] | per-key counters | `RateLimitExceeded` |
//! | [`CircuitBreakerMiddleware`] | per-key Closed / Open / HalfOpen | `CircuitBreakerOpen` |
//! | [`RetryMiddleware`] | per-dispatch attempt | `RetriesExhausted` |
//! | [`TimeoutMiddleware`] | per-dispatch deadline | `MessageTimeout` |
//!
//! Per-key state lives in a [`KeyedState`] map: one lock per key, held only
//! across synchronous transitions.
//!
//! ## Example
//!
//! ```
//! use dispatch_core::{DispatchOutcome, Message};
//! use dispatch_middleware::{
//!     handler_fn, CircuitBreakerMiddleware, LoggingMiddleware, Pipeline, RetryMiddleware,
//! };
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = Pipeline::builder()
//!     .add(LoggingMiddleware::new())
//!     .add(CircuitBreakerMiddleware::new(5, Duration::from_secs(30)))
//!     .add(RetryMiddleware::exponential(3, Duration::from_millis(50), Duration::from_secs(2)))
//!     .build();
//!
//! assert_eq!(pipeline.stage_names(), vec!["circuit_breaker", "retry", "logging"]);
//!
//! # tokio_test::block_on(async {
//! let handler = handler_fn(|_message, _token| async { Ok(DispatchOutcome::success()) });
//! let outcome = pipeline
//!     .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
//!     .await
//!     .unwrap();
//! assert!(outcome.is_success());
//! # });
//! ```

#![doc(html_root_url = "https://docs.rs/dispatch-middleware/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod bypass;
pub mod context;
pub mod keyed;
pub mod middleware;
pub mod pipeline;
pub mod pool;
pub mod stages;

// Re-export main types at crate root
pub use bypass::{BypassList, Capabilities, CapabilityRegistry};
pub use context::PipelineContext;
pub use dispatch_core::BoxFuture;
pub use keyed::{KeySelector, KeyedState, GLOBAL_KEY, NO_TENANT_KEY};
pub use middleware::{handler_fn, BoxedMiddleware, FnHandler, FnMiddleware, Handler, Middleware, Next};
pub use pipeline::{Pipeline, PipelineBuilder, Stage};
pub use pool::{MiddlewarePool, Poolable, PooledMiddleware, Rented};
pub use stages::{
    AuditMiddleware, AuthenticationMiddleware, AuthorizationMiddleware, BackoffCalculator,
    CircuitBreakerMiddleware, CircuitState, Deadline, InboxMiddleware, LoggingMiddleware,
    OutboxMiddleware, RateLimitAlgorithm, RateLimitMiddleware, RetryAttempt, RetryMiddleware,
    SanitizationMiddleware, TenantMiddleware, TimeoutMiddleware, TimeoutOverride,
    ValidationMiddleware,
};
