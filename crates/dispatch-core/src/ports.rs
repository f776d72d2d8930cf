//! Narrow interfaces to external collaborators.
//!
//! Tenant resolution, sanitization, validation, identity, inbox/outbox
//! persistence, audit storage and log scrubbing are owned by other services. The pipeline
//! reaches each of them through one async method, implemented by the host
//! application and handed to the matching stage at startup.

use crate::error::{DispatchError, FieldErrors};
use crate::message::{Message, MessageId, MessageKind};
use crate::BoxFuture;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Resolves the tenant a message belongs to.
pub trait TenantResolver: Send + Sync {
    /// Returns the tenant id, or `None` for tenant-less messages.
    fn resolve<'a>(&'a self, message: &'a Message)
        -> BoxFuture<'a, Result<Option<String>, DispatchError>>;
}

/// Inspects a message for unsafe content.
pub trait Sanitizer: Send + Sync {
    /// Returns the offending fields when the message must be rejected.
    fn sanitize<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), FieldErrors>>;
}

/// Validates a message against its contract.
pub trait Validator: Send + Sync {
    /// Returns field errors when the message is invalid.
    fn validate<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), FieldErrors>>;
}

/// Establishes the identity behind a message.
pub trait Authenticator: Send + Sync {
    /// Returns the authenticated principal, or an authentication failure.
    fn authenticate<'a>(&'a self, message: &'a Message)
        -> BoxFuture<'a, Result<Principal, DispatchError>>;
}

/// Decides whether a principal may dispatch a message.
pub trait Authorizer: Send + Sync {
    /// Returns `true` when access is granted.
    fn authorize<'a>(
        &'a self,
        principal: &'a Principal,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<bool, DispatchError>>;
}

/// Persistent record of processed message ids.
pub trait InboxStore: Send + Sync {
    /// Records a message id.
    ///
    /// Returns `true` if this is the first time the id was seen.
    fn try_record<'a>(
        &'a self,
        id: MessageId,
        message_type: &'a str,
    ) -> BoxFuture<'a, Result<bool, DispatchError>>;
}

/// Persistent queue of payloads to publish after successful processing.
pub trait OutboxStore: Send + Sync {
    /// Enqueues the payload produced for a message.
    fn enqueue<'a>(
        &'a self,
        message: &'a Message,
        payload: Option<&'a Bytes>,
    ) -> BoxFuture<'a, Result<(), DispatchError>>;
}

/// Append-only audit log.
pub trait AuditSink: Send + Sync {
    /// Records one dispatch.
    fn record(&self, record: AuditRecord) -> BoxFuture<'_, Result<(), DispatchError>>;
}

/// Scrubs message headers before they are written to logs.
pub trait TelemetrySanitizer: Send + Sync {
    /// Returns the headers that may be recorded, with secrets masked or removed.
    fn sanitize_headers<'a>(&'a self, message: &'a Message)
        -> BoxFuture<'a, HashMap<String, String>>;
}

/// An authenticated identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Subject identifier.
    pub subject: String,
    /// Granted roles.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Additional claims.
    #[serde(default)]
    pub claims: HashMap<String, String>,
}

impl Principal {
    /// Creates a principal with no roles or claims.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    /// Adds a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Returns `true` if the principal has the role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Final disposition of a dispatch, as written to the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The dispatch succeeded.
    Success,
    /// The dispatch produced a failed outcome.
    Failed {
        /// Problem code.
        code: String,
        /// Problem status.
        status: u16,
    },
    /// The dispatch raised an error.
    Error {
        /// Error code.
        code: String,
        /// Error status.
        status: u16,
    },
}

/// One audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// The message id.
    pub message_id: MessageId,
    /// The message type name.
    pub message_type: String,
    /// The message kind.
    pub kind: MessageKind,
    /// The tenant, if resolved.
    pub tenant_id: Option<String>,
    /// The correlation id.
    pub correlation_id: String,
    /// The authenticated subject, if any.
    pub subject: Option<String>,
    /// How the dispatch ended.
    pub outcome: AuditOutcome,
    /// Time spent in the pipeline.
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
