//! Authentication stage.
//!
//! Establishes the [`Principal`] behind a message through the host's
//! [`Authenticator`] and stores it as a context extension, where the
//! authorization and audit stages read it.

use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_core::ports::{Authenticator, Principal};
use dispatch_core::{BoxFuture, DispatchResult, Message};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Authenticates every message.
///
/// Authenticator errors stop the dispatch unchanged; they are expected to be
/// `AuthenticationFailure` (401).
pub struct AuthenticationMiddleware {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthenticationMiddleware {
    /// Creates the stage.
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

impl fmt::Debug for AuthenticationMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationMiddleware").finish_non_exhaustive()
    }
}

impl Middleware for AuthenticationMiddleware {
    fn name(&self) -> &'static str {
        "authentication"
    }

    fn stage(&self) -> Stage {
        Stage::Authentication
    }

    fn invoke<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        next: Next<'a>,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        Box::pin(async move {
            let principal: Principal = self.authenticator.authenticate(message).await?;
            debug!(subject = %principal.subject, "Message authenticated");
            ctx.set_extension(principal);
            next.run(message, ctx, token).await
        })
    }
}
