//! Stage-ordered middleware pipeline.
//!
//! Units are registered on a [`PipelineBuilder`] in any order. [`build`]
//! sorts them once by [`Stage`] (registration order breaks ties), drops units
//! whose required features are not enabled, and precomputes one chain per
//! message-kind mask. Dispatch then only indexes the chain for the message's
//! kind and walks it.
//!
//! ## Stages
//!
//! | Order | Stage            | Typical units                              |
//! |-------|------------------|--------------------------------------------|
//! | 0     | `PreProcessing`  | tenant, sanitization, inbox                |
//! | 1     | `Validation`     | validation                                 |
//! | 2     | `Authentication` | authentication                             |
//! | 3     | `Authorization`  | authorization                              |
//! | 4     | `Processing`     | rate limit, circuit breaker, retry, timeout|
//! | 5     | `PostProcessing` | outbox                                     |
//! | 6     | `ErrorHandling`  | error mapping                              |
//! | 7     | `Logging`        | audit, logging                             |
//! | 8     | `End`            | -                                          |
//!
//! Earlier stages wrap later ones: a `PreProcessing` unit sees the result of
//! everything after it.
//!
//! [`build`]: PipelineBuilder::build

use crate::context::PipelineContext;
use crate::middleware::{BoxedMiddleware, Handler, Middleware, Next};
use dispatch_core::{DispatchError, DispatchOutcome, DispatchResult, Message, MessageKind};
use dispatch_telemetry::metrics::{record_dispatch, InFlightGuard};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// The built, immutable pipeline.
///
/// A pipeline holds no handler: the same pipeline drives every message type,
/// with the handler supplied per dispatch.
///
/// # Example
///
/// ```
/// use dispatch_core::{DispatchOutcome, Message};
/// use dispatch_middleware::{handler_fn, Pipeline};
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let pipeline = Pipeline::builder().build();
/// let handler = handler_fn(|_message, _token| async { Ok(DispatchOutcome::success()) });
///
/// let outcome = pipeline
///     .dispatch(&Message::action("PlaceOrder"), &handler, CancellationToken::new())
///     .await;
/// assert!(outcome.is_ok());
/// # });
/// ```
pub struct Pipeline {
    /// Enabled units in stage order.
    units: Vec<BoxedMiddleware>,

    /// One chain per kind mask, indexed by `MessageKind::bits()`.
    chains: Vec<Vec<BoxedMiddleware>>,
}

impl Pipeline {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Dispatches a message through the chain for its kind, then the handler.
    pub async fn dispatch(
        &self,
        message: &Message,
        handler: &dyn Handler,
        token: CancellationToken,
    ) -> DispatchResult {
        let mut ctx = PipelineContext::for_message(message);
        self.dispatch_with_context(message, &mut ctx, handler, token)
            .await
    }

    /// Dispatches a message with a caller-prepared context.
    ///
    /// Use this to seed extensions such as
    /// [`TimeoutOverride`](crate::stages::timeout::TimeoutOverride) before the
    /// chain runs.
    pub async fn dispatch_with_context(
        &self,
        message: &Message,
        ctx: &mut PipelineContext,
        handler: &dyn Handler,
        token: CancellationToken,
    ) -> DispatchResult {
        let span = tracing::info_span!(
            "dispatch",
            message_id = %message.id(),
            message_type = message.message_type(),
            message_kind = %message.kind(),
            correlation_id = ctx.correlation_id(),
        );

        let _in_flight = InFlightGuard::new();

        let result = if token.is_cancelled() {
            Err(DispatchError::Cancelled)
        } else {
            let chain = self.chain_for(message.kind());
            Next::new(chain, handler)
                .run(message, ctx, token)
                .instrument(span)
                .await
        };

        let (label, code) = match &result {
            Ok(DispatchOutcome::Success(_)) => ("success", ""),
            Ok(DispatchOutcome::Failed(problem)) => ("failed", problem.code.as_str()),
            Err(error) => ("error", error.code()),
        };
        record_dispatch(
            message.message_type(),
            message.kind().name(),
            label,
            code,
            ctx.elapsed(),
        );

        result
    }

    fn chain_for(&self, kind: MessageKind) -> &[BoxedMiddleware] {
        self.chains
            .get(usize::from(kind.bits()))
            .map_or(&[] as &[BoxedMiddleware], Vec::as_slice)
    }

    /// Returns the names of all enabled units in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.units.iter().map(|unit| unit.name()).collect()
    }

    /// Returns the names of the units a message of `kind` passes through.
    #[must_use]
    pub fn chain_names(&self, kind: MessageKind) -> Vec<&'static str> {
        self.chain_for(kind).iter().map(|unit| unit.name()).collect()
    }

    /// Returns the number of enabled units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns `true` if no unit is enabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("units", &self.stage_names())
            .finish()
    }
}

/// Builder for constructing a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    units: Vec<BoxedMiddleware>,
    features: HashSet<String>,
}

impl PipelineBuilder {
    /// Creates an empty builder with no features enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit.
    #[must_use]
    pub fn add<M: Middleware>(self, unit: M) -> Self {
        self.add_shared(Arc::new(unit))
    }

    /// Registers a shared unit.
    ///
    /// The caller keeps its handle, for example to inspect circuit state.
    #[must_use]
    pub fn add_shared(mut self, unit: BoxedMiddleware) -> Self {
        self.units.push(unit);
        self
    }

    /// Enables a feature.
    #[must_use]
    pub fn enable_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    /// Enables several features.
    #[must_use]
    pub fn features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    /// Builds the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline {
        let features = self.features;
        let mut units: Vec<BoxedMiddleware> = self
            .units
            .into_iter()
            .filter(|unit| {
                let missing = unit
                    .required_features()
                    .iter()
                    .find(|feature| !features.contains(feature.as_str()));
                if let Some(feature) = missing {
                    tracing::debug!(unit = unit.name(), feature = %feature, "Unit dropped, feature not enabled");
                }
                missing.is_none()
            })
            .collect();

        // Stable: equal stages keep registration order.
        units.sort_by_key(|unit| unit.stage());

        let chains = (0..=MessageKind::ALL.bits())
            .map(|bits| {
                let mask = MessageKind::from_bits_truncate(bits);
                units
                    .iter()
                    .filter(|unit| unit.applicable_kinds().intersects(mask))
                    .cloned()
                    .collect()
            })
            .collect();

        Pipeline { units, chains }
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("units", &self.units.iter().map(|u| u.name()).collect::<Vec<_>>())
            .field("features", &self.features)
            .finish()
    }
}

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Stage {
    /// Enrichment and deduplication before anything else.
    PreProcessing = 0,
    /// Contract validation.
    Validation = 1,
    /// Identity.
    Authentication = 2,
    /// Access control.
    Authorization = 3,
    /// Resilience units guarding the handler.
    Processing = 4,
    /// Work that follows a successful handler.
    PostProcessing = 5,
    /// Error mapping.
    ErrorHandling = 6,
    /// Audit and logging.
    Logging = 7,
    /// Last.
    End = 8,
}

impl Stage {
    /// Returns the stage name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PreProcessing => "pre_processing",
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Processing => "processing",
            Self::PostProcessing => "post_processing",
            Self::ErrorHandling => "error_handling",
            Self::Logging => "logging",
            Self::End => "end",
        }
    }

    /// Returns all stages in order.
    #[must_use]
    pub const fn all() -> [Stage; 9] {
        [
            Self::PreProcessing,
            Self::Validation,
            Self::Authentication,
            Self::Authorization,
            Self::Processing,
            Self::PostProcessing,
            Self::ErrorHandling,
            Self::Logging,
            Self::End,
        ]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
