//! Pipelines assembled from configuration, end to end.

use bytes::Bytes;
use dispatch::core::ports::AuditRecord;
use dispatch::core::{BoxFuture, FieldErrors};
use dispatch::middleware::{CircuitState, GLOBAL_KEY};
use dispatch::prelude::*;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct HeaderTenant;

impl TenantResolver for HeaderTenant {
    fn resolve<'a>(
        &'a self,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<Option<String>, DispatchError>> {
        Box::pin(async move { Ok(message.header("tenant-id").map(ToString::to_string)) })
    }
}

struct AllowAll;

impl Sanitizer for AllowAll {
    fn sanitize<'a>(&'a self, _message: &'a Message) -> BoxFuture<'a, Result<(), FieldErrors>> {
        Box::pin(async { Ok(()) })
    }
}

impl Validator for AllowAll {
    fn validate<'a>(&'a self, _message: &'a Message) -> BoxFuture<'a, Result<(), FieldErrors>> {
        Box::pin(async { Ok(()) })
    }
}

impl Authenticator for AllowAll {
    fn authenticate<'a>(
        &'a self,
        _message: &'a Message,
    ) -> BoxFuture<'a, Result<Principal, DispatchError>> {
        Box::pin(async { Ok(Principal::new("svc-orders")) })
    }
}

impl Authorizer for AllowAll {
    fn authorize<'a>(
        &'a self,
        _principal: &'a Principal,
        _message: &'a Message,
    ) -> BoxFuture<'a, Result<bool, DispatchError>> {
        Box::pin(async { Ok(true) })
    }
}

#[derive(Default)]
struct Recorder {
    outbox: Mutex<Vec<Option<Bytes>>>,
    audit: Mutex<Vec<AuditRecord>>,
}

impl OutboxStore for Recorder {
    fn enqueue<'a>(
        &'a self,
        _message: &'a Message,
        payload: Option<&'a Bytes>,
    ) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            self.outbox.lock().push(payload.cloned());
            Ok(())
        })
    }
}

impl AuditSink for Recorder {
    fn record(&self, record: AuditRecord) -> BoxFuture<'_, Result<(), DispatchError>> {
        Box::pin(async move {
            self.audit.lock().push(record);
            Ok(())
        })
    }
}

fn fully_wired(config: DispatchConfig, recorder: &Arc<Recorder>) -> ResiliencePipeline {
    ResiliencePipeline::builder(config)
        .tenant_resolver(Arc::new(HeaderTenant))
        .sanitizer(Arc::new(AllowAll))
        .validator(Arc::new(AllowAll))
        .authenticator(Arc::new(AllowAll))
        .authorizer(Arc::new(AllowAll))
        .outbox_store(recorder.clone())
        .audit_sink(recorder.clone())
        .build()
        .unwrap()
}

fn counting(calls: &Arc<AtomicUsize>, fail: bool) -> impl Handler {
    let calls = calls.clone();
    handler_fn(move |_message, _token| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail {
                Err(DispatchError::transient("downstream unavailable"))
            } else {
                Ok(DispatchOutcome::with_payload("receipt"))
            }
        }
    })
}

#[test]
fn test_collaborators_ordered_by_stage() {
    let mut config = DispatchConfig::default();
    config.inbox.enabled = true;
    config.pipeline.features = vec!["audit".to_string(), "outbox".to_string()];

    let pipeline = fully_wired(config, &Arc::new(Recorder::default()));

    assert_eq!(
        pipeline.stage_names(),
        vec![
            "inbox",
            "tenant",
            "sanitization",
            "validation",
            "authentication",
            "authorization",
            "rate_limit",
            "circuit_breaker",
            "retry",
            "timeout",
            "outbox",
            "audit",
            "logging",
        ]
    );
}

#[test]
fn test_feature_gated_units_dropped() {
    let pipeline = fully_wired(DispatchConfig::default(), &Arc::new(Recorder::default()));
    let names = pipeline.stage_names();

    assert!(!names.contains(&"outbox"));
    assert!(!names.contains(&"audit"));
    assert!(names.contains(&"authorization"));
}

#[test]
fn test_builder_feature_enables_unit() {
    let recorder = Arc::new(Recorder::default());
    let pipeline = ResiliencePipeline::builder(DispatchConfig::default())
        .outbox_store(recorder)
        .enable_feature("outbox")
        .build()
        .unwrap();

    assert!(pipeline.stage_names().contains(&"outbox"));
}

#[tokio::test]
async fn test_outbox_and_audit_see_dispatch() {
    let mut config = DispatchConfig::default();
    config.pipeline.features = vec!["audit".to_string(), "outbox".to_string()];
    let recorder = Arc::new(Recorder::default());
    let pipeline = fully_wired(config, &recorder);

    let calls = Arc::new(AtomicUsize::new(0));
    let message = Message::builder("PlaceOrder", MessageKind::ACTION)
        .header("tenant-id", "acme")
        .build();
    let outcome = pipeline
        .dispatch(&message, &counting(&calls, false), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(*recorder.outbox.lock(), vec![Some(Bytes::from_static(b"receipt"))]);

    let audit = recorder.audit.lock();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].tenant_id.as_deref(), Some("acme"));
    assert_eq!(audit[0].subject.as_deref(), Some("svc-orders"));
}

#[tokio::test]
async fn test_per_tenant_rate_limit_from_toml() {
    let toml = r#"
        [rate_limit]
        partition = "tenant"

        [rate_limit.per_key]
        algorithm = "fixed_window"
        permit_limit = 2
        window_ms = 3600000

        [retry]
        enabled = false
    "#;
    let config = ConfigLoader::new().with_string(toml, "toml").unwrap().load().unwrap();
    let pipeline = ResiliencePipeline::builder(config)
        .tenant_resolver(Arc::new(HeaderTenant))
        .build()
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = counting(&calls, false);
    let for_tenant = |tenant: &str| {
        Message::builder("PlaceOrder", MessageKind::ACTION)
            .header("tenant-id", tenant)
            .build()
    };

    for _ in 0..2 {
        pipeline
            .dispatch(&for_tenant("acme"), &handler, CancellationToken::new())
            .await
            .unwrap();
    }
    let err = pipeline
        .dispatch(&for_tenant("acme"), &handler, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::RateLimitExceeded { ref key, .. } if key == "acme"));

    pipeline
        .dispatch(&for_tenant("globex"), &handler, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_capabilities_skip_retry() {
    let mut config = DispatchConfig::default();
    config.rate_limit.enabled = false;
    config.circuit_breaker.enabled = false;
    config.retry.max_attempts = 3;

    let pipeline = ResiliencePipeline::builder(config)
        .capabilities(CapabilityRegistry::new().register("HealthCheck", Capabilities::SKIP_RETRY))
        .build()
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let failing = counting(&calls, true);

    let err = pipeline
        .dispatch(&Message::action("HealthCheck"), &failing, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "HANDLER_FAULT");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let err = pipeline
        .dispatch(&Message::action("PlaceOrder"), &failing, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_circuit_breaker_handle_reports_state() {
    let mut config = DispatchConfig::default();
    config.rate_limit.enabled = false;
    config.retry.enabled = false;
    config.circuit_breaker.failure_threshold = 2;

    let pipeline = ResiliencePipeline::from_config(config).unwrap();
    let breaker = pipeline.circuit_breaker().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let failing = counting(&calls, true);
    let message = Message::action("PlaceOrder");

    for _ in 0..2 {
        let err = pipeline
            .dispatch(&message, &failing, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CIRCUIT_BREAKER_FAILURE");
    }
    assert_eq!(breaker.circuit_state(GLOBAL_KEY), CircuitState::Open);

    let err = pipeline
        .dispatch(&message, &failing, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::CircuitBreakerOpen { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_inbox_skips_redelivery() {
    let mut config = DispatchConfig::default();
    config.inbox.enabled = true;

    let pipeline = ResiliencePipeline::from_config(config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = counting(&calls, false);
    let message = Message::event("OrderPlaced");

    for _ in 0..2 {
        let outcome = pipeline
            .dispatch(&message, &handler, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_success());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
        [circuit_breaker]
        failure_threshold = 7
        key = "message_type"

        [timeout]
        default_timeout_ms = 5000
        "#
    )
    .unwrap();

    let config = dispatch::load_config(file.path()).unwrap();
    assert_eq!(config.circuit_breaker.failure_threshold, 7);
    assert_eq!(config.timeout.default_timeout_ms, 5_000);
    assert_eq!(config.retry.max_attempts, 3);
}

#[test]
fn test_load_config_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = dispatch::load_config(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, DispatchConfig::default());
}
