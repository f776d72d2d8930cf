//! Per-key state shared across dispatches.
//!
//! Circuit breakers and rate limiters keep one small state machine per key.
//! [`KeyedState`] stores them in a sharded [`DashMap`]; each entry sits behind
//! its own [`parking_lot::Mutex`], so transitions for one key are serialized
//! while different keys proceed in parallel. Locks are only taken inside
//! synchronous closures and are never held across an `.await`.

use crate::context::PipelineContext;
use dashmap::DashMap;
use dispatch_config::KeyStrategy;
use dispatch_core::Message;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Key used when a unit is not partitioned.
pub const GLOBAL_KEY: &str = "global";

/// Key used by [`KeySelector::Tenant`] for tenant-less messages.
pub const NO_TENANT_KEY: &str = "no-tenant";

/// Lazily created per-key state.
pub struct KeyedState<S> {
    entries: DashMap<String, Arc<Mutex<S>>>,
    init: Box<dyn Fn() -> S + Send + Sync>,
}

impl<S> KeyedState<S> {
    /// Creates an empty map; `init` builds the state for a new key.
    pub fn new(init: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            entries: DashMap::new(),
            init: Box::new(init),
        }
    }

    /// Returns the entry for `key`, creating it on first use.
    ///
    /// Concurrent first use of the same key yields a single entry.
    pub fn entry(&self, key: &str) -> Arc<Mutex<S>> {
        if let Some(entry) = self.entries.get(key) {
            return Arc::clone(entry.value());
        }
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new((self.init)())));
        Arc::clone(entry.value())
    }

    /// Runs `f` on the state for `key` under its lock.
    pub fn with<R>(&self, key: &str, f: impl FnOnce(&mut S) -> R) -> R {
        let entry = self.entry(key);
        let mut state = entry.lock();
        f(&mut state)
    }

    /// Runs `f` on the state for `key` if the key has been used.
    pub fn inspect<R>(&self, key: &str, f: impl FnOnce(&S) -> R) -> Option<R> {
        let entry = self.entries.get(key).map(|e| Arc::clone(e.value()))?;
        let state = entry.lock();
        Some(f(&state))
    }

    /// Forgets the state for `key`.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Returns the number of keys seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no key has been used.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S> fmt::Debug for KeyedState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedState")
            .field("keys", &self.entries.len())
            .finish_non_exhaustive()
    }
}

/// Custom key function.
pub type KeyFn = Arc<dyn Fn(&Message, &PipelineContext) -> String + Send + Sync>;

/// Derives the state key for a message.
#[derive(Clone, Default)]
pub enum KeySelector {
    /// One key for every message.
    #[default]
    Global,
    /// One key per message type name.
    MessageType,
    /// One key per tenant resolved earlier in the pipeline.
    Tenant,
    /// Caller-supplied function.
    Custom(KeyFn),
}

impl KeySelector {
    /// Creates a selector from a custom function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Message, &PipelineContext) -> String + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Returns the key for a message.
    #[must_use]
    pub fn select(&self, message: &Message, ctx: &PipelineContext) -> String {
        match self {
            Self::Global => GLOBAL_KEY.to_string(),
            Self::MessageType => message.message_type().to_string(),
            Self::Tenant => ctx.tenant_id().unwrap_or(NO_TENANT_KEY).to_string(),
            Self::Custom(f) => f(message, ctx),
        }
    }
}

impl From<KeyStrategy> for KeySelector {
    fn from(strategy: KeyStrategy) -> Self {
        match strategy {
            KeyStrategy::Global => Self::Global,
            KeyStrategy::MessageType => Self::MessageType,
            KeyStrategy::Tenant => Self::Tenant,
        }
    }
}

impl fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "Global"),
            Self::MessageType => write!(f, "MessageType"),
            Self::Tenant => write!(f, "Tenant"),
            Self::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::MessageKind;

    #[test]
    fn test_entry_created_once() {
        let state = KeyedState::new(|| 0u32);
        state.with("a", |n| *n += 1);
        state.with("a", |n| *n += 1);
        state.with("b", |n| *n += 1);

        assert_eq!(state.len(), 2);
        assert_eq!(state.inspect("a", |n| *n), Some(2));
        assert_eq!(state.inspect("missing", |n| *n), None);
        assert!(state.remove("a"));
        assert!(!state.remove("a"));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_concurrent_first_use() {
        let state = Arc::new(KeyedState::new(|| 0u32));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        state.with("shared", |n| *n += 1);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(state.len(), 1);
        assert_eq!(state.inspect("shared", |n| *n), Some(8000));
    }

    #[test]
    fn test_key_selectors() {
        let message = Message::builder("PlaceOrder", MessageKind::ACTION)
            .header("region", "eu")
            .build();
        let mut ctx = PipelineContext::for_message(&message);

        assert_eq!(KeySelector::Global.select(&message, &ctx), GLOBAL_KEY);
        assert_eq!(KeySelector::MessageType.select(&message, &ctx), "PlaceOrder");
        assert_eq!(KeySelector::Tenant.select(&message, &ctx), NO_TENANT_KEY);

        ctx.set_tenant_id("acme");
        assert_eq!(KeySelector::from(KeyStrategy::Tenant).select(&message, &ctx), "acme");

        let by_region = KeySelector::custom(|message, _ctx| {
            message.header("region").unwrap_or("none").to_string()
        });
        assert_eq!(by_region.select(&message, &ctx), "eu");
        assert_eq!(format!("{by_region:?}"), "Custom(<fn>)");
    }
}
