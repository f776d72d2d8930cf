//! Input sanitization stage.

use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_core::ports::Sanitizer;
use dispatch_core::{BoxFuture, DispatchError, DispatchResult, Message};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Rejects messages the [`Sanitizer`] flags as unsafe.
pub struct SanitizationMiddleware {
    sanitizer: Arc<dyn Sanitizer>,
}

impl SanitizationMiddleware {
    /// Creates the stage.
    pub fn new(sanitizer: Arc<dyn Sanitizer>) -> Self {
        Self { sanitizer }
    }
}

impl fmt::Debug for SanitizationMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SanitizationMiddleware").finish_non_exhaustive()
    }
}

impl Middleware for SanitizationMiddleware {
    fn name(&self) -> &'static str {
        "sanitization"
    }

    fn stage(&self) -> Stage {
        Stage::PreProcessing
    }

    fn invoke<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        next: Next<'a>,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        Box::pin(async move {
            if let Err(fields) = self.sanitizer.sanitize(message).await {
                warn!(
                    message_type = message.message_type(),
                    fields = fields.len(),
                    "Unsafe content rejected"
                );
                return Err(DispatchError::validation_with_fields(
                    "Message contains unsafe content",
                    fields,
                ));
            }
            next.run(message, ctx, token).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler_fn;
    use crate::Pipeline;
    use dispatch_core::{DispatchOutcome, FieldErrors};

    struct NoScripts;

    impl Sanitizer for NoScripts {
        fn sanitize<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), FieldErrors>> {
            Box::pin(async move {
                let body = String::from_utf8_lossy(message.body());
                if body.contains("<script>") {
                    let mut fields = FieldErrors::new();
                    fields.add("body", "script tags are not allowed");
                    return Err(fields);
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_unsafe_body_rejected() {
        let pipeline = Pipeline::builder()
            .add(SanitizationMiddleware::new(Arc::new(NoScripts)))
            .build();
        let handler = handler_fn(|_m, _t| async { Ok(DispatchOutcome::success()) });

        let clean = Message::builder("PostComment", dispatch_core::MessageKind::ACTION)
            .body("hello")
            .build();
        assert!(pipeline
            .dispatch(&clean, &handler, CancellationToken::new())
            .await
            .unwrap()
            .is_success());

        let dirty = Message::builder("PostComment", dispatch_core::MessageKind::ACTION)
            .body("<script>alert(1)</script>")
            .build();
        let err = pipeline
            .dispatch(&dirty, &handler, CancellationToken::new())
            .await
            .unwrap_err();
        let problem = err.to_problem_details(None);
        assert_eq!(problem.code, "VALIDATION_FAILURE");
        assert_eq!(problem.extensions["field_errors"]["body"][0], "script tags are not allowed");
    }
}
