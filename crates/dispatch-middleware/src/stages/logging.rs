//! Per-dispatch log event.

use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_core::ports::TelemetrySanitizer;
use dispatch_core::{BoxFuture, DispatchOutcome, DispatchResult, Message};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Emits one structured event when the downstream chain finishes.
///
/// Successes log at `INFO`; failed outcomes and errors log at `WARN` with
/// their code and status. Headers are logged at `DEBUG`, and only after a
/// [`TelemetrySanitizer`] has scrubbed them.
#[derive(Clone, Default)]
pub struct LoggingMiddleware {
    sanitizer: Option<Arc<dyn TelemetrySanitizer>>,
}

impl LoggingMiddleware {
    /// Creates the stage. Headers are not logged.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs headers as returned by `sanitizer`.
    #[must_use]
    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn TelemetrySanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    async fn log_headers(&self, message: &Message) {
        if let Some(sanitizer) = &self.sanitizer {
            let headers: HashMap<String, String> = sanitizer.sanitize_headers(message).await;
            debug!(message_id = %message.id(), headers = ?headers, "Message headers");
        }
    }
}

impl fmt::Debug for LoggingMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingMiddleware")
            .field("sanitized_headers", &self.sanitizer.is_some())
            .finish()
    }
}

fn millis(ctx: &PipelineContext) -> u64 {
    u64::try_from(ctx.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn stage(&self) -> Stage {
        Stage::Logging
    }

    fn invoke<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        next: Next<'a>,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        Box::pin(async move {
            self.log_headers(message).await;
            let result = next.run(message, ctx, token).await;
            let tenant_id = ctx.tenant_id().unwrap_or("");

            match &result {
                Ok(DispatchOutcome::Success(_)) => info!(
                    message_type = message.message_type(),
                    message_kind = message.kind().name(),
                    correlation_id = ctx.correlation_id(),
                    tenant_id,
                    duration_ms = millis(ctx),
                    "Message dispatched"
                ),
                Ok(DispatchOutcome::Failed(problem)) => warn!(
                    message_type = message.message_type(),
                    message_kind = message.kind().name(),
                    correlation_id = ctx.correlation_id(),
                    tenant_id,
                    duration_ms = millis(ctx),
                    code = %problem.code,
                    status = problem.status,
                    "Message failed"
                ),
                Err(error) => warn!(
                    message_type = message.message_type(),
                    message_kind = message.kind().name(),
                    correlation_id = ctx.correlation_id(),
                    tenant_id,
                    duration_ms = millis(ctx),
                    code = error.code(),
                    status = error.status(),
                    error = %error,
                    "Message raised an error"
                ),
            }
            result
        })
    }
}
