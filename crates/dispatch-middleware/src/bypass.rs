//! Opting messages out of resilience units.
//!
//! Two mechanisms exist side by side:
//!
//! - a [`BypassList`] per unit, usually loaded from configuration, matching
//!   message type names and marker tags;
//! - a [`CapabilityRegistry`] built once at startup, mapping message types to
//!   [`Capabilities`] flags shared by all units.

use dispatch_config::BypassConfig;
use dispatch_core::Message;
use std::collections::{HashMap, HashSet};
use std::ops::BitOr;
use std::sync::Arc;

/// Message types and tags that skip one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BypassList {
    message_types: HashSet<String>,
    tags: HashSet<String>,
}

impl BypassList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a message type name.
    #[must_use]
    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_types.insert(message_type.into());
        self
    }

    /// Adds a marker tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Returns `true` if the message's type or any of its tags is listed.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        self.message_types.contains(message.message_type())
            || (!self.tags.is_empty() && message.tags().any(|tag| self.tags.contains(tag)))
    }

    /// Returns `true` if nothing is listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.message_types.is_empty() && self.tags.is_empty()
    }
}

impl From<&BypassConfig> for BypassList {
    fn from(config: &BypassConfig) -> Self {
        Self {
            message_types: config.message_types.iter().cloned().collect(),
            tags: config.tags.iter().cloned().collect(),
        }
    }
}

/// Per message type opt-outs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    /// Nothing skipped.
    pub const NONE: Self = Self(0);
    /// Skip the circuit breaker.
    pub const SKIP_CIRCUIT_BREAKER: Self = Self(0b0001);
    /// Skip rate limiting.
    pub const SKIP_RATE_LIMIT: Self = Self(0b0010);
    /// Skip retries.
    pub const SKIP_RETRY: Self = Self(0b0100);
    /// Skip the timeout guard.
    pub const SKIP_TIMEOUT: Self = Self(0b1000);

    /// Returns `true` if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Startup table from message type to [`Capabilities`].
///
/// # Example
///
/// ```
/// use dispatch_middleware::{Capabilities, CapabilityRegistry};
///
/// let registry = CapabilityRegistry::new()
///     .register("HealthCheck", Capabilities::SKIP_RATE_LIMIT | Capabilities::SKIP_RETRY);
///
/// assert!(registry.get("HealthCheck").contains(Capabilities::SKIP_RETRY));
/// assert_eq!(registry.get("PlaceOrder"), Capabilities::NONE);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, Capabilities>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers capabilities for a message type, merging with earlier ones.
    #[must_use]
    pub fn register(mut self, message_type: impl Into<String>, capabilities: Capabilities) -> Self {
        let entry = self.entries.entry(message_type.into()).or_default();
        *entry = *entry | capabilities;
        self
    }

    /// Returns the capabilities of a message type.
    #[must_use]
    pub fn get(&self, message_type: &str) -> Capabilities {
        self.entries.get(message_type).copied().unwrap_or_default()
    }
}

/// Skip decision for one resilience unit.
#[derive(Debug, Clone)]
pub(crate) struct SkipRule {
    bypass: BypassList,
    registry: Option<Arc<CapabilityRegistry>>,
    flag: Capabilities,
}

impl SkipRule {
    pub(crate) fn new(flag: Capabilities) -> Self {
        Self {
            bypass: BypassList::default(),
            registry: None,
            flag,
        }
    }

    pub(crate) fn set_bypass(&mut self, bypass: BypassList) {
        self.bypass = bypass;
    }

    pub(crate) fn set_registry(&mut self, registry: Arc<CapabilityRegistry>) {
        self.registry = Some(registry);
    }

    pub(crate) fn skips(&self, message: &Message) -> bool {
        self.bypass.matches(message)
            || self
                .registry
                .as_ref()
                .is_some_and(|r| r.get(message.message_type()).contains(self.flag))
    }
}
