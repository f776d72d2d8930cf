//! Message envelope types.
//!
//! A [`Message`] is created by the caller and is never mutated by the
//! pipeline: every stage receives it by shared reference. Per-dispatch state
//! lives in the pipeline context instead.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use uuid::Uuid;

/// Header carrying the correlation id of a message, if the producer set one.
pub const CORRELATION_ID_HEADER: &str = "correlation-id";

/// A unique identifier for each message, using UUID v7.
///
/// UUID v7 is time-ordered, which keeps ids sortable in logs and inbox stores.
///
/// # Example
///
/// ```
/// use dispatch_core::MessageId;
///
/// let id = MessageId::new();
/// println!("Message ID: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new unique message ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// The kind of a message, as a bitmask.
///
/// A message normally carries a single kind, while middleware units declare
/// the set of kinds they apply to with a combined mask.
///
/// # Example
///
/// ```
/// use dispatch_core::MessageKind;
///
/// let applicable = MessageKind::ACTION | MessageKind::EVENT;
/// assert!(applicable.intersects(MessageKind::EVENT));
/// assert!(!applicable.intersects(MessageKind::DOCUMENT));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKind(u8);

impl MessageKind {
    /// No kind. A unit declaring this mask never runs.
    pub const NONE: Self = Self(0);
    /// A command requesting that something be done.
    pub const ACTION: Self = Self(0b001);
    /// A notification that something happened.
    pub const EVENT: Self = Self(0b010);
    /// A document or data payload.
    pub const DOCUMENT: Self = Self(0b100);
    /// Every kind.
    pub const ALL: Self = Self(0b111);

    /// Number of distinct masks, used to size per-mask lookup tables.
    pub const MASK_COUNT: usize = 8;

    /// Builds a kind from raw bits, dropping unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if `self` and `other` share at least one bit.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns `true` if no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the lowercase name of a single kind, or `"mixed"`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "none",
            0b001 => "action",
            0b010 => "event",
            0b100 => "document",
            0b111 => "all",
            _ => "mixed",
        }
    }
}

impl BitOr for MessageKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageKind {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for MessageKind {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageKind({})", self.name())
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable message envelope.
///
/// # Example
///
/// ```
/// use dispatch_core::{Message, MessageKind};
///
/// let message = Message::builder("PlaceOrder", MessageKind::ACTION)
///     .header("correlation-id", "abc-123")
///     .tag("idempotent")
///     .body("{\"sku\":\"A-1\"}")
///     .build();
///
/// assert_eq!(message.message_type(), "PlaceOrder");
/// assert_eq!(message.header("correlation-id"), Some("abc-123"));
/// assert!(message.has_tag("idempotent"));
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    kind: MessageKind,
    message_type: String,
    headers: HashMap<String, String>,
    tags: BTreeSet<String>,
    body: Bytes,
}

impl Message {
    /// Creates a builder for a message of the given type name and kind.
    #[must_use]
    pub fn builder(message_type: impl Into<String>, kind: MessageKind) -> MessageBuilder {
        MessageBuilder {
            id: None,
            kind,
            message_type: message_type.into(),
            headers: HashMap::new(),
            tags: BTreeSet::new(),
            body: Bytes::new(),
        }
    }

    /// Creates an empty action message.
    #[must_use]
    pub fn action(message_type: impl Into<String>) -> Self {
        Self::builder(message_type, MessageKind::ACTION).build()
    }

    /// Creates an empty event message.
    #[must_use]
    pub fn event(message_type: impl Into<String>) -> Self {
        Self::builder(message_type, MessageKind::EVENT).build()
    }

    /// Creates an empty document message.
    #[must_use]
    pub fn document(message_type: impl Into<String>) -> Self {
        Self::builder(message_type, MessageKind::DOCUMENT).build()
    }

    /// Returns the message ID.
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Returns the message kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Returns the message type name (e.g. `"PlaceOrder"`).
    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Returns a header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Returns all headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Returns `true` if the message carries the given marker tag.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Returns the marker tags.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    /// Returns the opaque body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Builder for [`Message`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    kind: MessageKind,
    message_type: String,
    headers: HashMap<String, String>,
    tags: BTreeSet<String>,
    body: Bytes,
}

impl MessageBuilder {
    /// Uses an existing message id instead of generating one.
    #[must_use]
    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds a marker tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds the message.
    #[must_use]
    pub fn build(self) -> Message {
        Message {
            id: self.id.unwrap_or_default(),
            kind: self.kind,
            message_type: self.message_type,
            headers: self.headers,
            tags: self.tags,
            body: self.body,
        }
    }
}
