//! Pipeline stages.
//!
//! ## Resilience units (Processing)
//!
//! - [`rate_limit`] - Global and per-key admission with four algorithms
//! - [`circuit_breaker`] - Per-key Closed / Open / HalfOpen state machine
//! - [`retry`] - Bounded retry with backoff
//! - [`timeout`] - Deadline with cooperative cancellation
//!
//! Registered in that order, a message is throttled first, then checked
//! against its circuit, and every retry attempt runs under the deadline.
//!
//! ## Collaborator stages
//!
//! Each calls one method of a trait in [`dispatch_core::ports`]:
//!
//! | Stage | Unit | Port |
//! |-------|------|------|
//! | PreProcessing | [`InboxMiddleware`] | `InboxStore` |
//! | PreProcessing | [`TenantMiddleware`] | `TenantResolver` |
//! | PreProcessing | [`SanitizationMiddleware`] | `Sanitizer` |
//! | Validation | [`ValidationMiddleware`] | `Validator` |
//! | Authentication | [`AuthenticationMiddleware`] | `Authenticator` |
//! | Authorization | [`AuthorizationMiddleware`] | `Authorizer` |
//! | PostProcessing | [`OutboxMiddleware`] | `OutboxStore` |
//! | Logging | [`AuditMiddleware`] | `AuditSink` |
//! | Logging | [`LoggingMiddleware`] | `TelemetrySanitizer` (optional) |

pub mod audit;
pub mod authentication;
pub mod authorization;
pub mod circuit_breaker;
pub mod inbox;
pub mod logging;
pub mod outbox;
pub mod rate_limit;
pub mod retry;
pub mod sanitization;
pub mod tenant;
pub mod timeout;
pub mod validation;

pub use audit::{AuditMiddleware, AUDIT_FEATURE};
pub use authentication::AuthenticationMiddleware;
pub use authorization::AuthorizationMiddleware;
pub use circuit_breaker::{CircuitBreakerMiddleware, CircuitState};
pub use inbox::InboxMiddleware;
pub use logging::LoggingMiddleware;
pub use outbox::{OutboxMiddleware, OUTBOX_FEATURE};
pub use rate_limit::{
    limiter_from_config, ConcurrencyLimiter, FixedWindow, Permit, RateLimitAlgorithm,
    RateLimitMiddleware, SlidingWindow, TokenBucket,
};
pub use retry::{BackoffCalculator, RetryAttempt, RetryMiddleware};
pub use sanitization::SanitizationMiddleware;
pub use tenant::TenantMiddleware;
pub use timeout::{Deadline, TimeoutMiddleware, TimeoutOverride};
pub use validation::ValidationMiddleware;
