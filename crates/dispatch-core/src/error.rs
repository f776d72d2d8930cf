//! Error types for Dispatch.
//!
//! [`DispatchError`] is the error half of a [`DispatchResult`](crate::DispatchResult).
//! Every variant maps to an [`ErrorCategory`], a status code and a
//! machine-readable code, and can be rendered into
//! [`ProblemDetails`](crate::ProblemDetails).
//!
//! | Variant | Code | Status |
//! |---|---|---|
//! | `Validation` | `VALIDATION_FAILURE` | 400 |
//! | `Authentication` | `AUTHENTICATION_FAILURE` | 401 |
//! | `Authorization` | `AUTHORIZATION_FAILURE` | 403 |
//! | `CircuitBreakerOpen` | `CIRCUIT_BREAKER_OPEN` | 503 |
//! | `CircuitBreakerFailure` | `CIRCUIT_BREAKER_FAILURE` | 500 |
//! | `RateLimitExceeded` | `RATE_LIMIT_EXCEEDED` | 429 |
//! | `MessageTimeout` | `MESSAGE_TIMEOUT` | 504 |
//! | `RetriesExhausted` | `RETRIES_EXHAUSTED` | 503 |
//! | `Rejected` | problem code | problem status |
//! | `Cancelled` | `CANCELLED` | 499 |
//! | `Handler` | `HANDLER_FAULT` | 500 |

use crate::outcome::ProblemDetails;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Categories of errors for classification and handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Message validation errors (invalid input, schema mismatch).
    Validation,
    /// Authentication errors (invalid or missing credentials).
    Authentication,
    /// Authorization errors (permission denied).
    Authorization,
    /// Rate limiting.
    RateLimited,
    /// Downstream temporarily unavailable (open circuit, exhausted retries).
    Unavailable,
    /// Deadline exceeded.
    Timeout,
    /// The caller cancelled the dispatch.
    Cancelled,
    /// Internal errors.
    Internal,
}

impl ErrorCategory {
    /// Returns the default status code for this error category.
    #[must_use]
    pub const fn default_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Authentication => 401,
            Self::Authorization => 403,
            Self::RateLimited => 429,
            Self::Unavailable => 503,
            Self::Timeout => 504,
            Self::Cancelled => 499,
            Self::Internal => 500,
        }
    }
}

/// Classification of a handler fault.
///
/// The first four kinds are programmer errors: retrying them cannot succeed,
/// so the retry executor never retries them unless explicitly allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// An argument had an invalid value.
    InvalidArgument,
    /// A required argument was missing.
    MissingArgument,
    /// The operation is invalid in the current state.
    InvalidOperation,
    /// The operation is not supported.
    NotSupported,
    /// A transient failure (e.g. a dropped connection).
    Transient,
    /// A dependency is unavailable.
    Unavailable,
    /// An I/O failure.
    Io,
    /// A dependency timed out.
    Timeout,
    /// Anything else.
    Other,
}

impl FaultKind {
    /// Returns `true` for kinds that indicate a bug in the caller.
    #[must_use]
    pub const fn is_programmer_error(self) -> bool {
        matches!(
            self,
            Self::InvalidArgument | Self::MissingArgument | Self::InvalidOperation | Self::NotSupported
        )
    }

    /// Returns the type name used by retry allow-lists and deny-lists.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::MissingArgument => "MissingArgument",
            Self::InvalidOperation => "InvalidOperation",
            Self::NotSupported => "NotSupported",
            Self::Transient => "Transient",
            Self::Unavailable => "Unavailable",
            Self::Io => "Io",
            Self::Timeout => "Timeout",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Standard error type for Dispatch.
///
/// # Example
///
/// ```
/// use dispatch_core::{DispatchError, ErrorCategory, FaultKind};
///
/// let error = DispatchError::fault(FaultKind::Transient, "connection reset");
/// assert_eq!(error.category(), ErrorCategory::Internal);
/// assert!(!error.is_programmer_error());
/// assert_eq!(error.type_name(), "Transient");
/// ```
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Message validation failed.
    #[error("Validation failure: {message}")]
    Validation {
        /// Human-readable error message.
        message: String,
        /// Field-specific validation errors.
        #[source]
        field_errors: Option<FieldErrors>,
    },

    /// Authentication failed.
    #[error("Authentication failure: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
    },

    /// Authorization denied.
    #[error("Authorization failure: {message}")]
    Authorization {
        /// Human-readable error message.
        message: String,
    },

    /// The circuit for a key is open; downstream was not called.
    #[error("Circuit '{circuit_key}' is open, retry after {retry_after:?}")]
    CircuitBreakerOpen {
        /// The circuit key.
        circuit_key: String,
        /// Time until the circuit admits a trial call.
        retry_after: Duration,
    },

    /// A call attempted through the circuit breaker failed.
    #[error("Call through circuit '{circuit_key}' failed: {source}")]
    CircuitBreakerFailure {
        /// The circuit key.
        circuit_key: String,
        /// The original error.
        #[source]
        source: Box<DispatchError>,
    },

    /// A rate limiter rejected the message.
    #[error("Rate limit exceeded for '{key}', retry after {retry_after:?}")]
    RateLimitExceeded {
        /// The throttled key (`"global"` for the global limiter).
        key: String,
        /// Hint for when a retry may succeed.
        retry_after: Duration,
    },

    /// Processing exceeded its deadline.
    #[error("Message timed out after {elapsed:?} (limit {configured:?})")]
    MessageTimeout {
        /// The configured deadline.
        configured: Duration,
        /// Time spent before the deadline fired.
        elapsed: Duration,
    },

    /// Every retry attempt failed.
    #[error("Retries exhausted after {attempts} attempts: {last_failure}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The failure of the last attempt.
        #[source]
        last_failure: Box<DispatchError>,
    },

    /// A failed outcome lifted into an error.
    #[error("Rejected: {}", problem.title)]
    Rejected {
        /// The failure description.
        problem: ProblemDetails,
    },

    /// The caller cancelled the dispatch.
    #[error("Dispatch cancelled")]
    Cancelled,

    /// The handler or a collaborator raised a fault.
    #[error("{kind} fault: {source}")]
    Handler {
        /// Fault classification.
        kind: FaultKind,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    /// Creates a validation failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field_errors: None,
        }
    }

    /// Creates a validation failure with field-specific errors.
    #[must_use]
    pub fn validation_with_fields(message: impl Into<String>, field_errors: FieldErrors) -> Self {
        Self::Validation {
            message: message.into(),
            field_errors: Some(field_errors),
        }
    }

    /// Creates an authentication failure.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Creates an authorization failure.
    #[must_use]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    /// Creates a handler fault from a message.
    #[must_use]
    pub fn fault(kind: FaultKind, message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Handler {
            kind,
            source: anyhow::Error::msg(message),
        }
    }

    /// Creates a handler fault wrapping an existing error.
    pub fn handler(kind: FaultKind, source: impl Into<anyhow::Error>) -> Self {
        Self::Handler {
            kind,
            source: source.into(),
        }
    }

    /// Creates a [`FaultKind::InvalidArgument`] fault.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::fault(FaultKind::InvalidArgument, message.into())
    }

    /// Creates a [`FaultKind::Transient`] fault.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::fault(FaultKind::Transient, message.into())
    }

    /// Lifts a failed outcome into an error.
    #[must_use]
    pub fn rejected(problem: ProblemDetails) -> Self {
        Self::Rejected { problem }
    }

    /// Returns the type name used by retry allow-lists and deny-lists.
    ///
    /// Handler faults report their [`FaultKind`]; every other variant reports
    /// its own name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationFailure",
            Self::Authentication { .. } => "AuthenticationFailure",
            Self::Authorization { .. } => "AuthorizationFailure",
            Self::CircuitBreakerOpen { .. } => "CircuitBreakerOpen",
            Self::CircuitBreakerFailure { .. } => "CircuitBreakerFailure",
            Self::RateLimitExceeded { .. } => "RateLimitExceeded",
            Self::MessageTimeout { .. } => "MessageTimeout",
            Self::RetriesExhausted { .. } => "RetriesExhausted",
            Self::Rejected { .. } => "Rejected",
            Self::Cancelled => "Cancelled",
            Self::Handler { kind, .. } => kind.as_str(),
        }
    }

    /// Returns `true` for handler faults that indicate a bug in the caller.
    #[must_use]
    pub const fn is_programmer_error(&self) -> bool {
        match self {
            Self::Handler { kind, .. } => kind.is_programmer_error(),
            _ => false,
        }
    }

    /// Returns `true` if the caller cancelled the dispatch.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Authorization { .. } => ErrorCategory::Authorization,
            Self::CircuitBreakerOpen { .. } | Self::RetriesExhausted { .. } => {
                ErrorCategory::Unavailable
            }
            Self::RateLimitExceeded { .. } => ErrorCategory::RateLimited,
            Self::MessageTimeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::CircuitBreakerFailure { .. } | Self::Rejected { .. } | Self::Handler { .. } => {
                ErrorCategory::Internal
            }
        }
    }

    /// Returns the status code for this error.
    ///
    /// A rejected outcome keeps the status of its problem.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::Rejected { problem } => problem.status,
            _ => self.category().default_status(),
        }
    }

    /// Returns the retry-after hint, if the error carries one.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitBreakerOpen { retry_after, .. }
            | Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns a machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Validation { .. } => "VALIDATION_FAILURE",
            Self::Authentication { .. } => "AUTHENTICATION_FAILURE",
            Self::Authorization { .. } => "AUTHORIZATION_FAILURE",
            Self::CircuitBreakerOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            Self::CircuitBreakerFailure { .. } => "CIRCUIT_BREAKER_FAILURE",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::MessageTimeout { .. } => "MESSAGE_TIMEOUT",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::Rejected { problem } => &problem.code,
            Self::Cancelled => "CANCELLED",
            Self::Handler { .. } => "HANDLER_FAULT",
        }
    }

    fn title(&self) -> &str {
        match self {
            Self::Validation { .. } => "Validation failure",
            Self::Authentication { .. } => "Authentication failure",
            Self::Authorization { .. } => "Authorization failure",
            Self::CircuitBreakerOpen { .. } => "Circuit breaker open",
            Self::CircuitBreakerFailure { .. } => "Call through circuit breaker failed",
            Self::RateLimitExceeded { .. } => "Rate limit exceeded",
            Self::MessageTimeout { .. } => "Message timeout",
            Self::RetriesExhausted { .. } => "Retries exhausted",
            Self::Rejected { problem } => &problem.title,
            Self::Cancelled => "Dispatch cancelled",
            Self::Handler { .. } => "Handler fault",
        }
    }

    /// Renders this error as a [`ProblemDetails`].
    #[must_use]
    pub fn to_problem_details(&self, instance: Option<&str>) -> ProblemDetails {
        if let Self::Rejected { problem } = self {
            let mut problem = problem.clone();
            if problem.instance.is_none() {
                problem.instance = instance.map(ToString::to_string);
            }
            return problem;
        }

        let mut problem =
            ProblemDetails::new(self.code(), self.title(), self.status()).with_detail(self.to_string());
        problem.instance = instance.map(ToString::to_string);

        match self {
            Self::Validation {
                field_errors: Some(errors),
                ..
            } => {
                if let Ok(value) = serde_json::to_value(&errors.fields) {
                    problem = problem.with_extension("field_errors", value);
                }
            }
            Self::CircuitBreakerOpen {
                circuit_key,
                retry_after,
            } => {
                problem = problem
                    .with_extension("circuit_key", circuit_key.as_str().into())
                    .with_extension("retry_after_ms", duration_ms(*retry_after).into());
            }
            Self::CircuitBreakerFailure { circuit_key, .. } => {
                problem = problem.with_extension("circuit_key", circuit_key.as_str().into());
            }
            Self::RateLimitExceeded { key, retry_after } => {
                problem = problem
                    .with_extension("key", key.as_str().into())
                    .with_extension("retry_after_ms", duration_ms(*retry_after).into());
            }
            Self::MessageTimeout {
                configured,
                elapsed,
            } => {
                problem = problem
                    .with_extension("configured_ms", duration_ms(*configured).into())
                    .with_extension("elapsed_ms", duration_ms(*elapsed).into());
            }
            Self::RetriesExhausted {
                attempts,
                last_failure,
            } => {
                problem = problem
                    .with_extension("attempts", (*attempts).into())
                    .with_extension("last_failure", last_failure.code().into());
            }
            Self::Handler { kind, .. } => {
                problem = problem.with_extension("fault_kind", kind.as_str().into());
            }
            _ => {}
        }
        problem
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Field-specific validation errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Error)]
#[error("Field validation errors")]
pub struct FieldErrors {
    /// Map of field path to list of error messages.
    pub fields: HashMap<String, Vec<String>>,
}

impl FieldErrors {
    /// Creates a new empty `FieldErrors`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an error for a field.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    /// Returns `true` if there are no field errors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the number of fields with errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }
}
