//! Outbox stage.

use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_core::ports::OutboxStore;
use dispatch_core::{BoxFuture, DispatchOutcome, DispatchResult, Message};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Feature that enables [`OutboxMiddleware`].
pub const OUTBOX_FEATURE: &str = "outbox";

/// Enqueues the result of every successful dispatch in the [`OutboxStore`].
///
/// Failed outcomes and errors enqueue nothing. An enqueue error replaces the
/// successful outcome, so the caller can redeliver.
pub struct OutboxMiddleware {
    store: Arc<dyn OutboxStore>,
    features: Vec<String>,
}

impl OutboxMiddleware {
    /// Creates the stage. It is kept only when the `outbox` feature is enabled.
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self {
            store,
            features: vec![OUTBOX_FEATURE.to_string()],
        }
    }
}

impl fmt::Debug for OutboxMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboxMiddleware").finish_non_exhaustive()
    }
}

impl Middleware for OutboxMiddleware {
    fn name(&self) -> &'static str {
        "outbox"
    }

    fn stage(&self) -> Stage {
        Stage::PostProcessing
    }

    fn required_features(&self) -> &[String] {
        &self.features
    }

    fn invoke<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        next: Next<'a>,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        Box::pin(async move {
            let outcome = next.run(message, ctx, token).await?;
            if let DispatchOutcome::Success(payload) = &outcome {
                self.store.enqueue(message, payload.as_ref()).await?;
                debug!(message_id = %message.id(), "Enqueued in outbox");
            }
            Ok(outcome)
        })
    }
}
