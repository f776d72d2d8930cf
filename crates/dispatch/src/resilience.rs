//! Pipeline assembly from configuration.
//!
//! [`ResiliencePipeline`] turns a [`DispatchConfig`] into a ready [`Pipeline`]:
//!
//! | Section | Unit | Added when |
//! |---------|------|------------|
//! | `inbox` | [`InboxMiddleware`] | `inbox.enabled` |
//! | `rate_limit` | [`RateLimitMiddleware`] | `rate_limit.enabled` |
//! | `circuit_breaker` | [`CircuitBreakerMiddleware`] | `circuit_breaker.enabled` |
//! | `retry` | [`RetryMiddleware`] | `retry.enabled` |
//! | `timeout` | [`TimeoutMiddleware`] | `timeout.enabled` |
//! | `logging` | [`LoggingMiddleware`] | `logging.enabled` |
//!
//! The four resilience units share the Processing stage and are registered
//! in the order above, so a throttled message never touches its circuit and
//! each retry attempt gets a fresh deadline. Collaborator stages are added
//! for every collaborator supplied to the builder.

use crate::SetupError;
use dispatch_config::DispatchConfig;
use dispatch_core::ports::{
    AuditSink, Authenticator, Authorizer, InboxStore, OutboxStore, Sanitizer, TelemetrySanitizer,
    TenantResolver, Validator,
};
use dispatch_core::{DispatchResult, Message};
use dispatch_middleware::{
    AuditMiddleware, AuthenticationMiddleware, AuthorizationMiddleware, BoxedMiddleware,
    CapabilityRegistry, CircuitBreakerMiddleware, Handler, InboxMiddleware, LoggingMiddleware,
    Middleware, OutboxMiddleware, Pipeline, PipelineContext, RateLimitMiddleware, RetryMiddleware,
    SanitizationMiddleware, TenantMiddleware, TimeoutMiddleware, ValidationMiddleware,
};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A pipeline assembled from a [`DispatchConfig`].
///
/// # Example
///
/// ```
/// use dispatch::{DispatchConfig, ResiliencePipeline};
///
/// let pipeline = ResiliencePipeline::from_config(DispatchConfig::default()).unwrap();
/// assert_eq!(
///     pipeline.stage_names(),
///     vec!["rate_limit", "circuit_breaker", "retry", "timeout", "logging"]
/// );
/// ```
pub struct ResiliencePipeline {
    config: DispatchConfig,
    pipeline: Pipeline,
    circuit_breaker: Option<Arc<CircuitBreakerMiddleware>>,
}

impl ResiliencePipeline {
    /// Creates a builder for `config`.
    #[must_use]
    pub fn builder(config: DispatchConfig) -> ResiliencePipelineBuilder {
        ResiliencePipelineBuilder::new(config)
    }

    /// Assembles a pipeline with no collaborators.
    pub fn from_config(config: DispatchConfig) -> Result<Self, SetupError> {
        Self::builder(config).build()
    }

    /// Dispatches a message through the assembled chain, then the handler.
    pub async fn dispatch(
        &self,
        message: &Message,
        handler: &dyn Handler,
        token: CancellationToken,
    ) -> DispatchResult {
        self.pipeline.dispatch(message, handler, token).await
    }

    /// Dispatches a message with a caller-prepared context.
    pub async fn dispatch_with_context(
        &self,
        message: &Message,
        ctx: &mut PipelineContext,
        handler: &dyn Handler,
        token: CancellationToken,
    ) -> DispatchResult {
        self.pipeline
            .dispatch_with_context(message, ctx, handler, token)
            .await
    }

    /// Returns the configuration the pipeline was built from.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Returns the underlying pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Returns the circuit breaker, when enabled.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerMiddleware> {
        self.circuit_breaker.as_deref()
    }

    /// Returns the names of all enabled units in order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.pipeline.stage_names()
    }
}

impl fmt::Debug for ResiliencePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResiliencePipeline")
            .field("units", &self.stage_names())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ResiliencePipeline`].
pub struct ResiliencePipelineBuilder {
    config: DispatchConfig,
    capabilities: Arc<CapabilityRegistry>,
    features: Vec<String>,
    tenant_resolver: Option<Arc<dyn TenantResolver>>,
    sanitizer: Option<Arc<dyn Sanitizer>>,
    validator: Option<Arc<dyn Validator>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    inbox_store: Option<Arc<dyn InboxStore>>,
    outbox_store: Option<Arc<dyn OutboxStore>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    telemetry_sanitizer: Option<Arc<dyn TelemetrySanitizer>>,
    extra: Vec<BoxedMiddleware>,
}

impl ResiliencePipelineBuilder {
    /// Creates a builder with no collaborators.
    #[must_use]
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            capabilities: Arc::default(),
            features: Vec::new(),
            tenant_resolver: None,
            sanitizer: None,
            validator: None,
            authenticator: None,
            authorizer: None,
            inbox_store: None,
            outbox_store: None,
            audit_sink: None,
            telemetry_sanitizer: None,
            extra: Vec::new(),
        }
    }

    /// Sets the per message type opt-outs consulted by the resilience units.
    pub fn capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.capabilities = Arc::new(registry);
        self
    }

    /// Enables a feature in addition to `pipeline.features`.
    pub fn enable_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    /// Resolves the tenant of each message.
    pub fn tenant_resolver(mut self, resolver: Arc<dyn TenantResolver>) -> Self {
        self.tenant_resolver = Some(resolver);
        self
    }

    /// Rejects messages with unsafe content.
    pub fn sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    /// Validates message payloads.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Authenticates the sender of each message.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Authorizes the authenticated principal.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Persistent inbox used when `inbox.policy` prefers a store.
    pub fn inbox_store(mut self, store: Arc<dyn InboxStore>) -> Self {
        self.inbox_store = Some(store);
        self
    }

    /// Outbox written after successful dispatches. Requires the `outbox` feature.
    pub fn outbox_store(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox_store = Some(store);
        self
    }

    /// Audit log written after every dispatch. Requires the `audit` feature.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Scrubs headers so the logging stage can record them.
    pub fn telemetry_sanitizer(mut self, sanitizer: Arc<dyn TelemetrySanitizer>) -> Self {
        self.telemetry_sanitizer = Some(sanitizer);
        self
    }

    /// Registers an application unit. It is ordered by its own stage.
    pub fn add<M: Middleware>(mut self, unit: M) -> Self {
        self.extra.push(Arc::new(unit));
        self
    }

    /// Validates the configuration and assembles the pipeline.
    pub fn build(self) -> Result<ResiliencePipeline, SetupError> {
        self.config.validate()?;

        let config = self.config;
        let capabilities = self.capabilities;
        let mut builder = Pipeline::builder()
            .features(config.pipeline.features.iter().cloned())
            .features(self.features);

        if config.inbox.enabled {
            builder = builder.add(InboxMiddleware::from_config(&config.inbox, self.inbox_store));
        }
        if let Some(resolver) = self.tenant_resolver {
            builder = builder.add(TenantMiddleware::new(resolver));
        }
        if let Some(sanitizer) = self.sanitizer {
            builder = builder.add(SanitizationMiddleware::new(sanitizer));
        }
        if let Some(validator) = self.validator {
            builder = builder.add(ValidationMiddleware::new(validator));
        }
        if let Some(authenticator) = self.authenticator {
            builder = builder.add(AuthenticationMiddleware::new(authenticator));
        }
        if let Some(authorizer) = self.authorizer {
            builder = builder.add(AuthorizationMiddleware::new(authorizer));
        }

        if config.rate_limit.enabled {
            builder = builder.add(
                RateLimitMiddleware::from_config(&config.rate_limit)
                    .with_capabilities(capabilities.clone()),
            );
        }
        let circuit_breaker = config.circuit_breaker.enabled.then(|| {
            Arc::new(
                CircuitBreakerMiddleware::from_config(&config.circuit_breaker)
                    .with_capabilities(capabilities.clone()),
            )
        });
        if let Some(breaker) = &circuit_breaker {
            builder = builder.add_shared(breaker.clone());
        }
        if config.retry.enabled {
            builder = builder.add(
                RetryMiddleware::from_config(&config.retry).with_capabilities(capabilities.clone()),
            );
        }
        if config.timeout.enabled {
            builder = builder.add(
                TimeoutMiddleware::from_config(&config.timeout)
                    .with_capabilities(capabilities.clone()),
            );
        }

        if let Some(store) = self.outbox_store {
            builder = builder.add(OutboxMiddleware::new(store));
        }
        if let Some(sink) = self.audit_sink {
            builder = builder.add(AuditMiddleware::new(sink));
        }
        if config.logging.enabled {
            let logging = match self.telemetry_sanitizer {
                Some(sanitizer) => LoggingMiddleware::new().with_sanitizer(sanitizer),
                None => LoggingMiddleware::new(),
            };
            builder = builder.add(logging);
        }

        for unit in self.extra {
            builder = builder.add_shared(unit);
        }

        let pipeline = builder.build();
        debug!(units = ?pipeline.stage_names(), "Resilience pipeline assembled");

        Ok(ResiliencePipeline {
            config,
            pipeline,
            circuit_breaker,
        })
    }
}

impl fmt::Debug for ResiliencePipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResiliencePipelineBuilder")
            .field("config", &self.config)
            .field("extra", &self.extra.len())
            .finish_non_exhaustive()
    }
}
