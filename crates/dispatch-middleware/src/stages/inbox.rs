//! Inbox (deduplication) stage.
//!
//! Records each message id before processing and drops redeliveries. Two
//! backends exist, selected by [`InboxPolicy`]:
//!
//! - `PreferStore`: the persistent [`InboxStore`] when one is supplied, the
//!   in-memory set otherwise;
//! - `MemoryOnly`: always the in-memory set.
//!
//! The in-memory set is bounded; once full, the oldest ids are forgotten. It
//! also forgets an id whose processing did not succeed, whether it raised an
//! error or returned a failed outcome, so a redelivery is processed again. A persistent store owns that decision itself.

use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_config::{InboxConfig, InboxPolicy};
use dispatch_core::ports::InboxStore;
use dispatch_core::{BoxFuture, DispatchOutcome, DispatchResult, Message, MessageId, MessageKind};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct MemoryInbox {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl MemoryInbox {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn try_record(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    fn forget(&mut self, id: MessageId) {
        if self.seen.remove(&id) {
            self.order.retain(|seen| *seen != id);
        }
    }
}

/// Drops messages that were already processed.
pub struct InboxMiddleware {
    store: Option<Arc<dyn InboxStore>>,
    policy: InboxPolicy,
    memory: Mutex<MemoryInbox>,
    kinds: MessageKind,
}

impl InboxMiddleware {
    /// Creates an in-memory inbox remembering up to `capacity` ids.
    #[must_use]
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            store: None,
            policy: InboxPolicy::MemoryOnly,
            memory: Mutex::new(MemoryInbox::new(capacity)),
            kinds: MessageKind::ACTION | MessageKind::EVENT,
        }
    }

    /// Creates an inbox from its configuration section.
    #[must_use]
    pub fn from_config(config: &InboxConfig, store: Option<Arc<dyn InboxStore>>) -> Self {
        Self {
            store,
            policy: config.policy,
            ..Self::in_memory(config.memory_capacity)
        }
    }

    /// Uses a persistent store, preferred over the in-memory set.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn InboxStore>) -> Self {
        self.store = Some(store);
        self.policy = InboxPolicy::PreferStore;
        self
    }

    /// Restricts deduplication to the given message kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: MessageKind) -> Self {
        self.kinds = kinds;
        self
    }

    fn record_in_memory(&self, id: MessageId) -> bool {
        self.memory.lock().try_record(id)
    }

    fn store(&self) -> Option<&dyn InboxStore> {
        match self.policy {
            InboxPolicy::PreferStore => self.store.as_deref(),
            InboxPolicy::MemoryOnly => None,
        }
    }
}

impl fmt::Debug for InboxMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboxMiddleware")
            .field("policy", &self.policy)
            .field("has_store", &self.store.is_some())
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}

impl Middleware for InboxMiddleware {
    fn name(&self) -> &'static str {
        "inbox"
    }

    fn stage(&self) -> Stage {
        Stage::PreProcessing
    }

    fn applicable_kinds(&self) -> MessageKind {
        self.kinds
    }

    fn invoke<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        next: Next<'a>,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        Box::pin(async move {
            let id = message.id();
            let first_delivery = if let Some(store) = self.store() {
                store.try_record(id, message.message_type()).await?
            } else {
                self.record_in_memory(id)
            };

            if !first_delivery {
                debug!(message_id = %id, message_type = message.message_type(), "Duplicate message dropped");
                return Ok(DispatchOutcome::success());
            }

            let result = next.run(message, ctx, token).await;
            let succeeded = matches!(result, Ok(DispatchOutcome::Success(_)));
            if !succeeded && self.store().is_none() {
                self.memory.lock().forget(id);
            }
            result
        })
    }
}
