//! Dispatch outcomes.
//!
//! Every stage and handler returns a [`DispatchResult`]: either an outcome
//! (`Ok`) or an error (`Err`). An outcome is itself either a success with an
//! optional payload or a failure described by [`ProblemDetails`].

use crate::error::DispatchError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Result type returned by stages, handlers and the pipeline.
pub type DispatchResult = Result<DispatchOutcome, DispatchError>;

/// A machine-readable failure description (RFC 7807 shape).
///
/// # Example
///
/// ```
/// use dispatch_core::ProblemDetails;
///
/// let problem = ProblemDetails::new("ORDER_REJECTED", "Order rejected", 422)
///     .with_detail("SKU is discontinued");
///
/// assert_eq!(problem.status, 422);
/// assert_eq!(problem.type_uri, "urn:dispatch:problem:order-rejected");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    /// Problem type URI.
    #[serde(rename = "type")]
    pub type_uri: String,
    /// Machine-readable code (e.g. `RATE_LIMIT_EXCEEDED`).
    pub code: String,
    /// Short human-readable summary.
    pub title: String,
    /// Status code (HTTP semantics).
    pub status: u16,
    /// Human-readable explanation specific to this occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Identifier of this occurrence (usually the message id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Additional members (retry-after hints, keys, durations).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl ProblemDetails {
    /// Creates a problem from a code, title and status.
    ///
    /// The type URI is derived from the code.
    #[must_use]
    pub fn new(code: impl Into<String>, title: impl Into<String>, status: u16) -> Self {
        let code = code.into();
        Self {
            type_uri: format!(
                "urn:dispatch:problem:{}",
                code.to_lowercase().replace('_', "-")
            ),
            code,
            title: title.into(),
            status,
            detail: None,
            instance: None,
            extensions: serde_json::Map::new(),
        }
    }

    /// Sets the detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Sets the instance.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Adds an extension member.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }
}

/// The outcome of dispatching a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Processing succeeded, optionally producing a payload.
    Success(Option<Bytes>),
    /// Processing failed without raising an error.
    Failed(ProblemDetails),
}

impl DispatchOutcome {
    /// A success without payload.
    #[must_use]
    pub const fn success() -> Self {
        Self::Success(None)
    }

    /// A success with a payload.
    #[must_use]
    pub fn with_payload(payload: impl Into<Bytes>) -> Self {
        Self::Success(Some(payload.into()))
    }

    /// A failure.
    #[must_use]
    pub const fn failed(problem: ProblemDetails) -> Self {
        Self::Failed(problem)
    }

    /// Returns `true` for [`DispatchOutcome::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns `true` for [`DispatchOutcome::Failed`].
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns the problem of a failed outcome.
    #[must_use]
    pub const fn problem(&self) -> Option<&ProblemDetails> {
        match self {
            Self::Failed(problem) => Some(problem),
            Self::Success(_) => None,
        }
    }

    /// Returns the payload of a successful outcome.
    #[must_use]
    pub const fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::Success(payload) => payload.as_ref(),
            Self::Failed(_) => None,
        }
    }
}
