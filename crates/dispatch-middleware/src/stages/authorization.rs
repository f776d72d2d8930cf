//! Authorization stage.
//!
//! Runs after authentication:
//!
//! ```text
//! Message → Tenant → Validation → Authentication → [Authorization] → Processing → Handler
//! ```
//!
//! The stage asks the host's [`Authorizer`] whether the [`Principal`] stored
//! by the authentication stage may dispatch the message. A message that
//! reaches this stage without a principal is denied.

use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_core::ports::{Authorizer, Principal};
use dispatch_core::{BoxFuture, DispatchError, DispatchResult, Message};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Enforces access decisions.
pub struct AuthorizationMiddleware {
    authorizer: Arc<dyn Authorizer>,
}

impl AuthorizationMiddleware {
    /// Creates the stage.
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }
}

impl fmt::Debug for AuthorizationMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationMiddleware").finish_non_exhaustive()
    }
}

impl Middleware for AuthorizationMiddleware {
    fn name(&self) -> &'static str {
        "authorization"
    }

    fn stage(&self) -> Stage {
        Stage::Authorization
    }

    fn invoke<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a mut PipelineContext,
        next: Next<'a>,
        token: CancellationToken,
    ) -> BoxFuture<'a, DispatchResult> {
        Box::pin(async move {
            let Some(principal) = ctx.get_extension::<Principal>() else {
                warn!(message_type = message.message_type(), "No principal to authorize");
                return Err(DispatchError::authorization("no authenticated principal"));
            };

            if !self.authorizer.authorize(principal, message).await? {
                warn!(
                    subject = %principal.subject,
                    message_type = message.message_type(),
                    "Authorization denied"
                );
                return Err(DispatchError::authorization(format!(
                    "'{}' may not dispatch {}",
                    principal.subject,
                    message.message_type()
                )));
            }

            next.run(message, ctx, token).await
        })
    }
}
