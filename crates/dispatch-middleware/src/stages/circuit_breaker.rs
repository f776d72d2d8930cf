//! Circuit breaker stage.
//!
//! One three-state circuit per key:
//!
//! ```text
//!            failures >= threshold            open_duration elapsed
//!  Closed ──────────────────────────▶ Open ───────────────────────▶ HalfOpen
//!    ▲                                  ▲                              │
//!    │           trial succeeded        │        trial failed          │
//!    └──────────────────────────────────┼──────────────────────────────┘
//!                                       └──────────────────────────────┘
//! ```
//!
//! The Open→HalfOpen move happens lazily on the first request after the open
//! duration. HalfOpen admits a single trial; other requests are rejected as if
//! the circuit were still open until the trial settles.

use crate::bypass::{BypassList, Capabilities, CapabilityRegistry, SkipRule};
use crate::context::PipelineContext;
use crate::keyed::{KeySelector, KeyedState};
use crate::middleware::{Middleware, Next};
use crate::pipeline::Stage;
use dispatch_config::CircuitBreakerConfig;
use dispatch_core::{BoxFuture, DispatchError, DispatchResult, Message, MessageKind};
use dispatch_telemetry::metrics::{record_circuit_rejection, record_circuit_transition};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// State of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Calls flow through; consecutive failures are counted.
    #[default]
    Closed,
    /// Calls are rejected without reaching downstream.
    Open,
    /// A single trial call decides whether to close or reopen.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Default)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

impl Circuit {
    fn transition_to(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        self.opened_at = (to == CircuitState::Open).then_some(now);
        Transition { from, to }
    }
}

enum Admission {
    Allowed {
        trial: bool,
        transition: Option<Transition>,
    },
    Rejected {
        retry_after: Duration,
    },
}

/// Per-key circuit breaker.
///
/// # Errors
///
/// - [`DispatchError::CircuitBreakerOpen`] when the circuit rejects the call;
/// - [`DispatchError::CircuitBreakerFailure`] wrapping an error raised by an
///   admitted call. Programmer errors and cancellation pass through as is.
///
/// A failed outcome is not wrapped: it already carries its own problem
/// details, so it is returned unchanged. It still counts toward the failure
/// threshold.
#[derive(Debug)]
pub struct CircuitBreakerMiddleware {
    failure_threshold: u32,
    open_duration: Duration,
    key: KeySelector,
    kinds: MessageKind,
    skip: SkipRule,
    circuits: KeyedState<Circuit>,
}

impl CircuitBreakerMiddleware {
    /// Creates a breaker with one global circuit.
    #[must_use]
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_duration,
            key: KeySelector::Global,
            kinds: MessageKind::ALL,
            skip: SkipRule::new(Capabilities::SKIP_CIRCUIT_BREAKER),
            circuits: KeyedState::new(Circuit::default),
        }
    }

    /// Creates a breaker from its configuration section.
    #[must_use]
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.open_duration())
            .with_key(config.key.into())
            .with_bypass(BypassList::from(&config.bypass))
    }

    /// Sets how the circuit key is derived.
    #[must_use]
    pub fn with_key(mut self, key: KeySelector) -> Self {
        self.key = key;
        self
    }

    /// Sets the messages that skip the breaker.
    #[must_use]
    pub fn with_bypass(mut self, bypass: BypassList) -> Self {
        self.skip.set_bypass(bypass);
        self
    }

    /// Consults a capability registry for [`Capabilities::SKIP_CIRCUIT_BREAKER`].
    #[must_use]
    pub fn with_capabilities(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.skip.set_registry(registry);
        self
    }

    /// Restricts the breaker to the given message kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: MessageKind) -> Self {
        self.kinds = kinds;
        self
    }

    /// Returns the stored state of a circuit. Unused keys are closed.
    #[must_use]
    pub fn circuit_state(&self, key: &str) -> CircuitState {
        self.circuits
            .inspect(key, |c| c.state)
            .unwrap_or_default()
    }

    /// Returns the consecutive failure count of a circuit.
    #[must_use]
    pub fn failure_count(&self, key: &str) -> u32 {
        self.circuits
            .inspect(key, |c| c.consecutive_failures)
            .unwrap_or_default()
    }

    /// Closes a circuit and clears its counters.
    pub fn reset(&self, key: &str) {
        let transition = self
            .circuits
            .with(key, |c| c.transition_to(CircuitState::Closed, Instant::now()));
        if transition.from != CircuitState::Closed {
            self.report(key, transition);
        }
    }

    fn admit(&self, key: &str) -> Admission {
        let now = Instant::now();
        self.circuits.with(key, |c| match c.state {
            CircuitState::Closed => Admission::Allowed {
                trial: false,
                transition: None,
            },
            CircuitState::Open => {
                let elapsed = c.opened_at.map_or(self.open_duration, |at| now - at);
                if elapsed >= self.open_duration {
                    let transition = c.transition_to(CircuitState::HalfOpen, now);
                    c.trial_in_flight = true;
                    Admission::Allowed {
                        trial: true,
                        transition: Some(transition),
                    }
                } else {
                    Admission::Rejected {
                        retry_after: self.open_duration - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen if c.trial_in_flight => Admission::Rejected {
                retry_after: Duration::ZERO,
            },
            CircuitState::HalfOpen => {
                c.trial_in_flight = true;
                Admission::Allowed {
                    trial: true,
                    transition: None,
                }
            }
        })
    }

    fn record_success(&self, key: &str, trial: bool) {
        let transition = self.circuits.with(key, |c| match c.state {
            CircuitState::Closed => {
                c.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen if trial => {
                Some(c.transition_to(CircuitState::Closed, Instant::now()))
            }
            CircuitState::HalfOpen | CircuitState::Open => None,
        });
        if let Some(transition) = transition {
            self.report(key, transition);
        }
    }

    fn record_failure(&self, key: &str, trial: bool) {
        let threshold = self.failure_threshold;
        let transition = self.circuits.with(key, |c| match c.state {
            CircuitState::Closed => {
                c.consecutive_failures += 1;
                (c.consecutive_failures >= threshold)
                    .then(|| c.transition_to(CircuitState::Open, Instant::now()))
            }
            CircuitState::HalfOpen if trial => {
                Some(c.transition_to(CircuitState::Open, Instant::now()))
            }
            CircuitState::HalfOpen | CircuitState::Open => None,
        });
        if let Some(transition) = transition {
            self.report(key, transition);
        }
    }

    /// Frees the trial slot without deciding the circuit's fate.
    fn release_trial(&self, key: &str) {
        self.circuits.with(key, |c| {
            if c.state == CircuitState::HalfOpen {
                c.trial_in_flight = false;
            }
        });
    }

    fn report(&self, key: &str, transition: Transition) {
        debug!(
            key,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            "Circuit state changed"
        );
        record_circuit_transition(key, transition.from.as_str(), transition.to.as_str());
    }
}

/// Releases a half-open trial slot if the call never settles.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreakerMiddleware,
    key: &'a str,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial(self.key);
        }
    }
}

impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &'static str {
        "circuit_breaker"
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

            let key = self.key.select(message, ctx);
            let trial = match self.admit(&key) {
                Admission::Rejected { retry_after } => {
                    warn!(
                        key = %key,
                        message_type = message.message_type(),
                        retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                        "Circuit open, call rejected"
                    );
                    record_circuit_rejection(&key);
                    return Err(DispatchError::CircuitBreakerOpen {
                        circuit_key: key,
                        retry_after,
                    });
                }
                Admission::Allowed { trial, transition } => {
                    if let Some(transition) = transition {
                        self.report(&key, transition);
                    }
                    trial
                }
            };

            let guard = TrialGuard {
                breaker: self,
                key: &key,
                armed: trial,
            };
            let result = next.run(message, ctx, token).await;

            match result {
                Ok(outcome) => {
                    guard.disarm();
                    if outcome.is_success() {
                        self.record_success(&key, trial);
                    } else {
                        self.record_failure(&key, trial);
                    }
                    Ok(outcome)
                }
                // Dropping the guard frees the trial slot.
                Err(error) if error.is_cancelled() => Err(error),
                Err(error) => {
                    guard.disarm();
                    self.record_failure(&key, trial);
                    if error.is_programmer_error() {
                        Err(error)
                    } else {
                        Err(DispatchError::CircuitBreakerFailure {
                            circuit_key: key,
                            source: Box::new(error),
                        })
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyed::GLOBAL_KEY;
    use crate::middleware::{handler_fn, Handler};
    use crate::Pipeline;
    use dispatch_core::{DispatchOutcome, FaultKind, ProblemDetails};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn switchable_handler(fail: Arc<AtomicBool>, calls: Arc<AtomicUsize>) -> impl Handler {
        handler_fn(move |_message, _token| {
            let fail = fail.load(Ordering::SeqCst);
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if fail {
                    Err(DispatchError::transient("backend down"))
                } else {
                    Ok(DispatchOutcome::success())
                }
            }
        })
    }

    async fn dispatch(pipeline: &Pipeline, handler: &dyn Handler) -> DispatchResult {
        pipeline
            .dispatch(&Message::action("PlaceOrder"), handler, CancellationToken::new())
            .await
    }

    fn breaker_pipeline(breaker: &Arc<CircuitBreakerMiddleware>) -> Pipeline {
        Pipeline::builder()
            .add_shared(Arc::clone(breaker) as crate::BoxedMiddleware)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let breaker = Arc::new(CircuitBreakerMiddleware::new(3, Duration::from_secs(30)));
        let pipeline = breaker_pipeline(&breaker);
        let fail = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = switchable_handler(Arc::clone(&fail), Arc::clone(&calls));

        for expected in 1..=2 {
            let err = dispatch(&pipeline, &handler).await.unwrap_err();
            assert!(matches!(err, DispatchError::CircuitBreakerFailure { .. }));
            assert_eq!(breaker.failure_count(GLOBAL_KEY), expected);
            assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Closed);
        }

        let err = dispatch(&pipeline, &handler).await.unwrap_err();
        assert!(matches!(err, DispatchError::CircuitBreakerFailure { .. }));
        assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let err = dispatch(&pipeline, &handler).await.unwrap_err();
        match err {
            DispatchError::CircuitBreakerOpen {
                circuit_key,
                retry_after,
            } => {
                assert_eq!(circuit_key, GLOBAL_KEY);
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let breaker = Arc::new(CircuitBreakerMiddleware::new(3, Duration::from_secs(30)));
        let pipeline = breaker_pipeline(&breaker);
        let fail = Arc::new(AtomicBool::new(true));
        let handler = switchable_handler(Arc::clone(&fail), Arc::new(AtomicUsize::new(0)));

        dispatch(&pipeline, &handler).await.unwrap_err();
        dispatch(&pipeline, &handler).await.unwrap_err();
        fail.store(false, Ordering::SeqCst);
        dispatch(&pipeline, &handler).await.unwrap();
        assert_eq!(breaker.failure_count(GLOBAL_KEY), 0);

        fail.store(true, Ordering::SeqCst);
        dispatch(&pipeline, &handler).await.unwrap_err();
        dispatch(&pipeline, &handler).await.unwrap_err();
        assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_closes_circuit() {
        let breaker = Arc::new(CircuitBreakerMiddleware::new(1, Duration::from_secs(10)));
        let pipeline = breaker_pipeline(&breaker);
        let fail = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = switchable_handler(Arc::clone(&fail), Arc::clone(&calls));

        dispatch(&pipeline, &handler).await.unwrap_err();
        assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(4)).await;
        let err = dispatch(&pipeline, &handler).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(6)).await;
        fail.store(false, Ordering::SeqCst);
        dispatch(&pipeline, &handler).await.unwrap();
        assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let breaker = Arc::new(CircuitBreakerMiddleware::new(1, Duration::from_secs(10)));
        let pipeline = breaker_pipeline(&breaker);
        let handler = switchable_handler(Arc::new(AtomicBool::new(true)), Arc::new(AtomicUsize::new(0)));

        dispatch(&pipeline, &handler).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(10)).await;

        let err = dispatch(&pipeline, &handler).await.unwrap_err();
        assert!(matches!(err, DispatchError::CircuitBreakerFailure { .. }));
        assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Open);

        let err = dispatch(&pipeline, &handler).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = Arc::new(CircuitBreakerMiddleware::new(1, Duration::from_secs(1)));
        let pipeline = Arc::new(breaker_pipeline(&breaker));
        let fail = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = switchable_handler(Arc::clone(&fail), Arc::clone(&calls));
        dispatch(&pipeline, &handler).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;

        let slow = Arc::new(handler_fn(|_message, _token| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(DispatchOutcome::success())
        }));
        let trial = {
            let pipeline = Arc::clone(&pipeline);
            let slow = Arc::clone(&slow);
            tokio::spawn(async move {
                pipeline
                    .dispatch(&Message::action("PlaceOrder"), &*slow, CancellationToken::new())
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::HalfOpen);

        let err = dispatch(&pipeline, &*slow).await.unwrap_err();
        assert!(matches!(err, DispatchError::CircuitBreakerOpen { .. }));

        trial.await.unwrap().unwrap();
        assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_a_failure() {
        let breaker = Arc::new(CircuitBreakerMiddleware::new(1, Duration::from_secs(1)));
        let pipeline = breaker_pipeline(&breaker);
        let handler = handler_fn(|_message, _token| async { Err(DispatchError::Cancelled) });

        let err = dispatch(&pipeline, &handler).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Closed);
        assert_eq!(breaker.failure_count(GLOBAL_KEY), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_programmer_error_passes_through_and_counts() {
        let breaker = Arc::new(CircuitBreakerMiddleware::new(2, Duration::from_secs(1)));
        let pipeline = breaker_pipeline(&breaker);
        let handler = handler_fn(|_message, _token| async {
            Err(DispatchError::fault(FaultKind::InvalidArgument, "sku missing"))
        });

        let err = dispatch(&pipeline, &handler).await.unwrap_err();
        assert!(err.is_programmer_error());
        assert_eq!(breaker.failure_count(GLOBAL_KEY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_outcome_counts_as_failure() {
        let breaker = Arc::new(CircuitBreakerMiddleware::new(2, Duration::from_secs(1)));
        let pipeline = breaker_pipeline(&breaker);
        let handler = handler_fn(|_message, _token| async {
            Ok(DispatchOutcome::failed(ProblemDetails::new("OUT_OF_STOCK", "Out of stock", 409)))
        });

        let outcome = dispatch(&pipeline, &handler).await.unwrap();
        let problem = outcome.problem().unwrap();
        assert_eq!(problem.code, "OUT_OF_STOCK");
        assert_eq!(problem.status, 409);
        assert_eq!(breaker.failure_count(GLOBAL_KEY), 1);

        dispatch(&pipeline, &handler).await.unwrap();
        assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_type_keys_and_reset() {
        let breaker = Arc::new(
            CircuitBreakerMiddleware::new(1, Duration::from_secs(60)).with_key(KeySelector::MessageType),
        );
        let pipeline = breaker_pipeline(&breaker);
        let handler = switchable_handler(Arc::new(AtomicBool::new(true)), Arc::new(AtomicUsize::new(0)));

        dispatch(&pipeline, &handler).await.unwrap_err();
        assert_eq!(breaker.circuit_state("PlaceOrder"), CircuitState::Open);
        assert_eq!(breaker.circuit_state("CancelOrder"), CircuitState::Closed);

        breaker.reset("PlaceOrder");
        assert_eq!(breaker.circuit_state("PlaceOrder"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypassed_messages_are_not_counted() {
        let breaker = Arc::new(
            CircuitBreakerMiddleware::new(1, Duration::from_secs(60))
                .with_bypass(BypassList::new().with_message_type("PlaceOrder")),
        );
        let pipeline = breaker_pipeline(&breaker);
        let handler = switchable_handler(Arc::new(AtomicBool::new(true)), Arc::new(AtomicUsize::new(0)));

        let err = dispatch(&pipeline, &handler).await.unwrap_err();
        assert!(matches!(err, DispatchError::Handler { .. }));
        assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Closed);
    }
}
