//! Retry stage.
//!
//! Runs the rest of the chain up to `max_attempts` times. Between attempts it
//! waits for a [`BackoffCalculator`] delay; the wait ends early, with
//! [`DispatchError::Cancelled`], if the caller cancels.
//!
//! Classification of a failed attempt:
//!
//! 1. cancellation is returned immediately and never retried;
//! 2. an error whose type name is in `never_retry_on` is returned unchanged;
//! 3. with a non-empty `retry_on`, only listed type names are retried;
//! 4. otherwise every error except programmer errors is retried;
//! 5. a failed outcome is always retried.
//!
//! When attempts run out the result is [`DispatchError::RetriesExhausted`]
//! wrapping the last failure (a failed outcome is wrapped as
//! [`DispatchError::Rejected`]).

mod backoff;

pub use backoff::BackoffCalculator;

use crate::bypass::{BypassList, Capabilities, CapabilityRegistry, SkipRule};
use crate::context::PipelineContext;
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_config::{BackoffStrategy, RetryConfig};
use dispatch_core::{
    BoxFuture, DispatchError, DispatchOutcome, DispatchResult, Message, MessageKind, ProblemDetails,
};
use dispatch_telemetry::metrics::{record_retries_exhausted, record_retry_attempt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The attempt in progress, published in the [`PipelineContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Time since the first attempt started.
    pub elapsed: Duration,
    /// Type name or problem code of the previous attempt's failure.
    pub last_failure: Option<String>,
}

enum Failure {
    Outcome(ProblemDetails),
    Error(DispatchError),
}

impl Failure {
    fn reason(&self) -> &'static str {
        match self {
            Self::Outcome(_) => "FailedOutcome",
            Self::Error(error) => error.type_name(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Outcome(problem) => problem.code.clone(),
            Self::Error(error) => error.type_name().to_string(),
        }
    }

    fn into_error(self) -> DispatchError {
        match self {
            Self::Outcome(problem) => DispatchError::rejected(problem),
            Self::Error(error) => error,
        }
    }
}

/// Bounded retry of the downstream chain.
#[derive(Debug)]
pub struct RetryMiddleware {
    max_attempts: u32,
    backoff: BackoffCalculator,
    retry_on: HashSet<String>,
    never_retry_on: HashSet<String>,
    kinds: MessageKind,
    skip: SkipRule,
}

impl RetryMiddleware {
    /// Creates a retry unit. `max_attempts` counts the first attempt.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: BackoffCalculator) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retry_on: HashSet::new(),
            never_retry_on: HashSet::new(),
            kinds: MessageKind::ALL,
            skip: SkipRule::new(Capabilities::SKIP_RETRY),
        }
    }

    /// Creates a retry unit with exponential backoff and no jitter.
    #[must_use]
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(
            max_attempts,
            BackoffCalculator::new(BackoffStrategy::Exponential, base_delay, max_delay),
        )
    }

    /// Creates a retry unit from its configuration section.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        let mut unit = Self::new(config.max_attempts, BackoffCalculator::from_config(config))
            .with_bypass(BypassList::from(&config.bypass));
        unit.retry_on.extend(config.retry_on.iter().cloned());
        unit.never_retry_on.extend(config.never_retry_on.iter().cloned());
        unit
    }

    /// Retries only the listed error type names (plus failed outcomes).
    #[must_use]
    pub fn retry_on(mut self, type_name: impl Into<String>) -> Self {
        self.retry_on.insert(type_name.into());
        self
    }

    /// Never retries the listed error type name.
    #[must_use]
    pub fn never_retry_on(mut self, type_name: impl Into<String>) -> Self {
        self.never_retry_on.insert(type_name.into());
        self
    }

    /// Sets the messages that skip retries.
    #[must_use]
    pub fn with_bypass(mut self, bypass: BypassList) -> Self {
        self.skip.set_bypass(bypass);
        self
    }

    /// Consults a capability registry for [`Capabilities::SKIP_RETRY`].
    #[must_use]
    pub fn with_capabilities(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.skip.set_registry(registry);
        self
    }

    /// Restricts the unit to the given message kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: MessageKind) -> Self {
        self.kinds = kinds;
        self
    }

    /// Returns `true` if the error may be retried.
    #[must_use]
    pub fn is_retryable(&self, error: &DispatchError) -> bool {
        if error.is_cancelled() {
            return false;
        }
        let type_name = error.type_name();
        if self.never_retry_on.contains(type_name) {
            return false;
        }
        if self.retry_on.is_empty() {
            !error.is_programmer_error()
        } else {
            self.retry_on.contains(type_name)
        }
    }
}

impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn stage(&self) -> Stage {
        Stage::Processing
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
            if self.skip.skips(message) {
                return next.run(message, ctx, token).await;
            }

            let started = Instant::now();
            let mut attempt = 1;
            let mut last_failure = None;

            loop {
                ctx.set_extension(RetryAttempt {
                    attempt,
                    elapsed: started.elapsed(),
                    last_failure: last_failure.take(),
                });

                let failure = match next.run(message, ctx, token.clone()).await {
                    Ok(DispatchOutcome::Failed(problem)) => Failure::Outcome(problem),
                    Ok(outcome) => return Ok(outcome),
                    Err(error) if !self.is_retryable(&error) => return Err(error),
                    Err(error) => Failure::Error(error),
                };

                if attempt >= self.max_attempts {
                    warn!(
                        attempts = attempt,
                        message_type = message.message_type(),
                        reason = failure.reason(),
                        "Retries exhausted"
                    );
                    record_retries_exhausted(message.message_type());
                    return Err(DispatchError::RetriesExhausted {
                        attempts: attempt,
                        last_failure: Box::new(failure.into_error()),
                    });
                }

                let delay = self.backoff.delay(attempt);
                warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    message_type = message.message_type(),
                    reason = failure.reason(),
                    "Attempt failed, retrying"
                );
                record_retry_attempt(message.message_type(), failure.reason());
                last_failure = Some(failure.describe());

                tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(DispatchError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        })
    }
}
