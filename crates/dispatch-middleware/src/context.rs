//! Per-dispatch context.
//!
//! A [`PipelineContext`] is created for every message entering the pipeline
//! and handed mutably down the chain. Units enrich it as they run: the tenant
//! stage records the tenant, authentication stores the [`Principal`], retry
//! publishes the current [`RetryAttempt`](crate::stages::retry::RetryAttempt),
//! and the timeout guard publishes its [`Deadline`](crate::stages::timeout::Deadline).

use dispatch_core::{Message, MessageId, CORRELATION_ID_HEADER};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Mutable state that flows through the middleware chain for one message.
///
/// # Example
///
/// ```
/// use dispatch_core::Message;
/// use dispatch_middleware::PipelineContext;
///
/// let message = Message::builder("PlaceOrder", dispatch_core::MessageKind::ACTION)
///     .header("correlation-id", "corr-1")
///     .build();
///
/// let mut ctx = PipelineContext::for_message(&message);
/// assert_eq!(ctx.correlation_id(), "corr-1");
///
/// ctx.set_item("region", "eu-west");
/// assert_eq!(ctx.item("region"), Some("eu-west"));
/// ```
#[derive(Debug)]
pub struct PipelineContext {
    message_id: MessageId,

    /// Taken from the `correlation-id` header, or the message id.
    correlation_id: String,

    tenant_id: Option<String>,

    /// When the message entered the pipeline.
    started_at: Instant,

    /// Free-form string items shared between units.
    items: HashMap<String, String>,

    /// Type-erased extension data, keyed by type.
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl PipelineContext {
    /// Creates a context for a message.
    #[must_use]
    pub fn for_message(message: &Message) -> Self {
        let correlation_id = message
            .header(CORRELATION_ID_HEADER)
            .map_or_else(|| message.id().to_string(), ToString::to_string);

        Self {
            message_id: message.id(),
            correlation_id,
            tenant_id: None,
            started_at: Instant::now(),
            items: HashMap::new(),
            extensions: HashMap::new(),
        }
    }

    /// Returns the id of the message being dispatched.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Returns the correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Returns the resolved tenant, if any.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Sets the tenant.
    ///
    /// This should only be called by the tenant stage.
    pub fn set_tenant_id(&mut self, tenant_id: impl Into<String>) {
        self.tenant_id = Some(tenant_id.into());
    }

    /// Returns when the message entered the pipeline.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Returns the time since the message entered the pipeline.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Returns a string item.
    #[must_use]
    pub fn item(&self, key: &str) -> Option<&str> {
        self.items.get(key).map(String::as_str)
    }

    /// Sets a string item, replacing any previous value.
    pub fn set_item(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.items.insert(key.into(), value.into());
    }

    /// Sets an extension value.
    ///
    /// Extensions are keyed by type, so only one value per type may be stored.
    pub fn set_extension<T: Any + Send + Sync>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Returns an extension value.
    #[must_use]
    pub fn get_extension<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Removes and returns an extension value.
    pub fn remove_extension<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast().ok())
            .map(|boxed| *boxed)
    }

    /// Returns `true` if an extension of the given type is stored.
    #[must_use]
    pub fn has_extension<T: Any + Send + Sync>(&self) -> bool {
        self.extensions.contains_key(&TypeId::of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::ports::Principal;
    use dispatch_core::MessageKind;

    #[test]
    fn test_correlation_falls_back_to_message_id() {
        let message = Message::action("PlaceOrder");
        let ctx = PipelineContext::for_message(&message);
        assert_eq!(ctx.correlation_id(), message.id().to_string());
        assert_eq!(ctx.message_id(), message.id());
        assert!(ctx.tenant_id().is_none());
    }

    #[test]
    fn test_correlation_from_header() {
        let message = Message::builder("OrderPlaced", MessageKind::EVENT)
            .header(CORRELATION_ID_HEADER, "abc")
            .build();
        let ctx = PipelineContext::for_message(&message);
        assert_eq!(ctx.correlation_id(), "abc");
    }

    #[test]
    fn test_extensions() {
        let mut ctx = PipelineContext::for_message(&Message::action("PlaceOrder"));

        #[derive(Debug, PartialEq)]
        struct Marker(u32);

        ctx.set_extension(Marker(7));
        ctx.set_extension(Principal::new("alice"));
        assert!(ctx.has_extension::<Marker>());
        assert_eq!(ctx.get_extension::<Marker>(), Some(&Marker(7)));
        assert_eq!(
            ctx.get_extension::<Principal>().map(|p| p.subject.as_str()),
            Some("alice")
        );

        assert_eq!(ctx.remove_extension::<Marker>(), Some(Marker(7)));
        assert!(!ctx.has_extension::<Marker>());
        assert!(ctx.remove_extension::<Marker>().is_none());
    }

    #[test]
    fn test_tenant_and_items() {
        let mut ctx = PipelineContext::for_message(&Message::event("OrderPlaced"));
        ctx.set_tenant_id("acme");
        ctx.set_item("k", "v1");
        ctx.set_item("k", "v2");
        assert_eq!(ctx.tenant_id(), Some("acme"));
        assert_eq!(ctx.item("k"), Some("v2"));
        assert!(ctx.item("missing").is_none());
    }
}
