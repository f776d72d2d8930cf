//! # Dispatch
//!
//! **Message-dispatch middleware pipeline with built-in resilience**
//!
//! Dispatch drives each message through an ordered chain of middleware units
//! and then a handler. The chain carries four resilience units:
//!
//! - **Rate limiting** – global and per-key admission with token bucket,
//!   fixed window, sliding window or concurrency limits
//! - **Circuit breaking** – per-key Closed / Open / HalfOpen state machine
//! - **Retry** – bounded retries with constant, linear or exponential backoff
//! - **Timeout** – per-attempt deadline with cooperative cancellation
//!
//! along with collaborator stages for tenancy, validation, authentication,
//! authorization, deduplication, outbox and audit.
//!
//! ## Quick Start
//!
//! ```
//! use dispatch::prelude::*;
//!
//! # block_on(async {
//! let pipeline = ResiliencePipeline::from_config(DispatchConfig::default()).unwrap();
//!
//! let handler = handler_fn(|_message, _token| async { Ok(DispatchOutcome::with_payload("ok")) });
//! let outcome = pipeline
//!     .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
//!     .await
//!     .unwrap();
//! assert!(outcome.is_success());
//! # });
//! # fn block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Message → Inbox → Tenant → Sanitization → Validation → Authentication → Authorization
//!                                                                               ↓
//!                                          Timeout ← Retry ← CircuitBreaker ← RateLimit
//!                                             ↓
//!                                          Handler → Outbox → Audit → Logging
//! ```
//!
//! ## Configuration
//!
//! ```no_run
//! # fn main() -> Result<(), dispatch::SetupError> {
//! let config = dispatch::load_config("dispatch.toml")?;
//! dispatch::init_telemetry(&config)?;
//! let pipeline = dispatch::ResiliencePipeline::from_config(config)?;
//! # Ok(())
//! # }
//! ```

#![doc(html_root_url = "https://docs.rs/dispatch/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod observability;
mod resilience;

use std::path::Path;

pub use error::SetupError;
pub use observability::{init_telemetry, telemetry_config};
pub use resilience::{ResiliencePipeline, ResiliencePipelineBuilder};

// Re-export core types
pub use dispatch_core as core;

// Re-export configuration types
pub use dispatch_config as config;

// Re-export middleware types
pub use dispatch_middleware as middleware;

// Re-export telemetry types
pub use dispatch_telemetry as telemetry;

pub use dispatch_config::{ConfigLoader, DispatchConfig};

/// Environment prefix read by [`load_config`].
pub const ENV_PREFIX: &str = "DISPATCH";

/// Loads defaults, then `path`, then `DISPATCH__SECTION__KEY` overrides.
///
/// A missing file is not an error; the defaults and environment still apply.
pub fn load_config(path: impl AsRef<Path>) -> Result<DispatchConfig, SetupError> {
    let config = ConfigLoader::new()
        .with_defaults()
        .with_optional_file(path)?
        .with_env_prefix(ENV_PREFIX)
        .load()?;
    Ok(config)
}

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```
/// use dispatch::prelude::*;
///
/// let message = Message::builder("PlaceOrder", MessageKind::ACTION).build();
/// assert_eq!(message.message_type(), "PlaceOrder");
/// ```
pub mod prelude {
    pub use crate::{ResiliencePipeline, SetupError};

    pub use dispatch_config::{ConfigLoader, DispatchConfig};

    pub use dispatch_core::{
        DispatchError, DispatchOutcome, DispatchResult, Message, MessageId, MessageKind,
        ProblemDetails,
    };

    // Re-export collaborator traits
    pub use dispatch_core::ports::{
        AuditSink, Authenticator, Authorizer, InboxStore, OutboxStore, Principal, Sanitizer,
        TelemetrySanitizer, TenantResolver, Validator,
    };

    pub use dispatch_middleware::{
        handler_fn, Capabilities, CapabilityRegistry, Handler, Middleware, Next, PipelineContext,
        Stage,
    };

    pub use tokio_util::sync::CancellationToken;
}
