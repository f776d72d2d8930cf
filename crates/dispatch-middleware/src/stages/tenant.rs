//! Tenant resolution stage.

use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_core::ports::TenantResolver;
use dispatch_core::{BoxFuture, DispatchResult, Message};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Resolves the tenant of each message and records it in the context.
///
/// Messages without a tenant pass through with no tenant set; rate limits
/// partitioned by tenant then share the `no-tenant` bucket.
pub struct TenantMiddleware {
    resolver: Arc<dyn TenantResolver>,
}

impl TenantMiddleware {
    /// Creates the stage.
    pub fn new(resolver: Arc<dyn TenantResolver>) -> Self {
        Self { resolver }
    }
}

impl fmt::Debug for TenantMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantMiddleware").finish_non_exhaustive()
    }
}

impl Middleware for TenantMiddleware {
    fn name(&self) -> &'static str {
        "tenant"
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
            if let Some(tenant_id) = self.resolver.resolve(message).await? {
                ctx.set_tenant_id(tenant_id);
            }
            next.run(message, ctx, token).await
        })
    }
}
