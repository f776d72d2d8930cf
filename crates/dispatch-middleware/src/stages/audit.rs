//! Audit stage.
//!
//! Writes one [`AuditRecord`] per dispatch to the host's [`AuditSink`] once
//! the rest of the chain has finished. The record carries the tenant, the
//! authenticated subject (when the authentication stage ran) and the final
//! disposition. A sink failure surfaces as the dispatch error unless the
//! chain already raised one, in which case that error is kept and the sink
//! failure is logged.

use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_core::ports::{AuditOutcome, AuditRecord, AuditSink, Principal};
use dispatch_core::{BoxFuture, DispatchOutcome, DispatchResult, Message};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Feature that enables [`AuditMiddleware`].
pub const AUDIT_FEATURE: &str = "audit";

/// Records every dispatch in the audit log.
pub struct AuditMiddleware {
    sink: Arc<dyn AuditSink>,
    features: Vec<String>,
}

impl AuditMiddleware {
    /// Creates the stage. It is kept only when the `audit` feature is enabled.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            features: vec![AUDIT_FEATURE.to_string()],
        }
    }
}

impl fmt::Debug for AuditMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditMiddleware").finish_non_exhaustive()
    }
}

fn audit_outcome(result: &DispatchResult) -> AuditOutcome {
    match result {
        Ok(DispatchOutcome::Success(_)) => AuditOutcome::Success,
        Ok(DispatchOutcome::Failed(problem)) => AuditOutcome::Failed {
            code: problem.code.clone(),
            status: problem.status,
        },
        Err(error) => AuditOutcome::Error {
            code: error.code().to_string(),
            status: error.status(),
        },
    }
}

fn audit_record(message: &Message, ctx: &PipelineContext, result: &DispatchResult) -> AuditRecord {
    AuditRecord {
        message_id: message.id(),
        message_type: message.message_type().to_string(),
        kind: message.kind(),
        tenant_id: ctx.tenant_id().map(ToString::to_string),
        correlation_id: ctx.correlation_id().to_string(),
        subject: ctx.get_extension::<Principal>().map(|p| p.subject.clone()),
        outcome: audit_outcome(result),
        elapsed: ctx.elapsed(),
    }
}

impl Middleware for AuditMiddleware {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn stage(&self) -> Stage {
        Stage::Logging
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
            let result = next.run(message, ctx, token).await;
            let record = audit_record(message, ctx, &result);
            if let Err(error) = self.sink.record(record).await {
                warn!(message_id = %message.id(), error = %error, "Failed to write audit record");
                return Err(result.err().unwrap_or(error));
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler_fn;
    use crate::{FnMiddleware, Pipeline};
    use dispatch_core::{DispatchError, MessageKind};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<AuditRecord>>,
        broken: bool,
    }

    impl AuditSink for MemorySink {
        fn record(&self, record: AuditRecord) -> BoxFuture<'_, Result<(), DispatchError>> {
            Box::pin(async move {
                if self.broken {
                    return Err(DispatchError::transient("audit store offline"));
                }
                self.records.lock().push(record);
                Ok(())
            })
        }
    }

    fn pipeline(sink: Arc<MemorySink>) -> Pipeline {
        let identify = FnMiddleware::new("identify", Stage::Authentication, |_message, ctx| {
            ctx.set_tenant_id("acme");
            ctx.set_extension(Principal::new("svc-orders"));
            Ok(())
        });
        Pipeline::builder()
            .add(identify)
            .add(AuditMiddleware::new(sink))
            .enable_feature(AUDIT_FEATURE)
            .build()
    }

    #[tokio::test]
    async fn test_success_recorded() {
        let sink = Arc::new(MemorySink::default());
        let handler = handler_fn(|_m, _t| async { Ok(DispatchOutcome::success()) });
        let message = Message::builder("PlaceOrder", MessageKind::ACTION)
            .header("correlation-id", "corr-7")
            .build();

        pipeline(sink.clone())
            .dispatch(&message, &handler, CancellationToken::new())
            .await
            .unwrap();

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.message_id, message.id());
        assert_eq!(record.kind, MessageKind::ACTION);
        assert_eq!(record.tenant_id.as_deref(), Some("acme"));
        assert_eq!(record.correlation_id, "corr-7");
        assert_eq!(record.subject.as_deref(), Some("svc-orders"));
        assert_eq!(record.outcome, AuditOutcome::Success);
    }

    #[tokio::test]
    async fn test_error_recorded() {
        let sink = Arc::new(MemorySink::default());
        let handler = handler_fn(|_m, _t| async { Err(DispatchError::invalid_argument("bad sku")) });

        pipeline(sink.clone())
            .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            sink.records.lock()[0].outcome,
            AuditOutcome::Error {
                code: "HANDLER_FAULT".to_string(),
                status: 500,
            }
        );
    }

    #[tokio::test]
    async fn test_sink_failure_surfaces() {
        let sink = Arc::new(MemorySink {
            broken: true,
            ..MemorySink::default()
        });
        let handler = handler_fn(|_m, _t| async { Ok(DispatchOutcome::with_payload("done")) });

        let err = pipeline(sink)
            .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "HANDLER_FAULT");
        assert!(err.to_string().contains("audit store offline"));
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_handler_error() {
        let sink = Arc::new(MemorySink {
            broken: true,
            ..MemorySink::default()
        });
        let handler = handler_fn(|_m, _t| async { Err(DispatchError::invalid_argument("bad sku")) });

        let err = pipeline(sink)
            .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad sku"));
    }
}
