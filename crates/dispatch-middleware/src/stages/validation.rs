//! Contract validation stage.
//!
//! Calls the host's [`Validator`] for every message and stops the dispatch
//! with a `ValidationFailure` (status 400) carrying the field errors it
//! reports. Restrict the stage with [`ValidationMiddleware::with_kinds`] when
//! only some message kinds carry a contract, e.g. actions and documents but
//! not events.

use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_core::ports::Validator;
use dispatch_core::{BoxFuture, DispatchError, DispatchResult, Message, MessageKind};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Validates messages against their contract.
pub struct ValidationMiddleware {
    validator: Arc<dyn Validator>,
    kinds: MessageKind,
}

impl ValidationMiddleware {
    /// Creates the stage for every message kind.
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self {
            validator,
            kinds: MessageKind::ALL,
        }
    }

    /// Restricts validation to the given message kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: MessageKind) -> Self {
        self.kinds = kinds;
        self
    }
}

impl fmt::Debug for ValidationMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationMiddleware")
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}

impl Middleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn stage(&self) -> Stage {
        Stage::Validation
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
            if let Err(fields) = self.validator.validate(message).await {
                debug!(
                    message_type = message.message_type(),
                    fields = fields.len(),
                    "Message failed validation"
                );
                return Err(DispatchError::validation_with_fields(
                    format!("{} failed validation", message.message_type()),
                    fields,
                ));
            }
            next.run(message, ctx, token).await
        })
    }
}
