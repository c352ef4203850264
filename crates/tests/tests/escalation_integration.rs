use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use cortex_core::{
    build_fallback_chain, is_dependency_ordered, CortexContext, Provenance, RuleRegistry,
    SharedRegistry,
};
use cortex_observability::PipelineMetrics;
use cortex_orchestrator::{
    BackendProtocol, FailureKind, HttpBackendConfig, HttpReasoningBackend, OrchestratorClassifier,
};
use cortex_pipeline::{FallbackChainCoordinator, PipelineState, StaticFlags, ESCALATION_FLAG};
use parking_lot::Mutex;
use serde_json::{json, Value};

#[derive(Clone)]
struct FakeBackend {
    status: StatusCode,
    body: Value,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    last_request: Arc<Mutex<Option<Value>>>,
}

impl FakeBackend {
    fn new(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            body,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

async fn reason(State(fake): State<FakeBackend>, Json(request): Json<Value>) -> Response {
    fake.calls.fetch_add(1, Ordering::SeqCst);
    *fake.last_request.lock() = Some(request);
    if !fake.delay.is_zero() {
        tokio::time::sleep(fake.delay).await;
    }
    (fake.status, Json(fake.body.clone())).into_response()
}

async fn spawn_backend(fake: FakeBackend) -> SocketAddr {
    let app = Router::new()
        .route("/reason", post(reason))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn registry() -> SharedRegistry {
    let path =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../rules/command_center.json");
    SharedRegistry::new(RuleRegistry::load(path).expect("bundled rules should load"))
}

async fn coordinator_for(
    fake: FakeBackend,
    protocol: BackendProtocol,
    timeout: Duration,
) -> FallbackChainCoordinator<HttpReasoningBackend, StaticFlags> {
    let addr = spawn_backend(fake).await;
    let mut config = HttpBackendConfig::new(&format!("http://{addr}/reason")).unwrap();
    config.protocol = protocol;
    let backend = HttpReasoningBackend::new(config).unwrap();

    FallbackChainCoordinator::new(
        registry(),
        StaticFlags::new([ESCALATION_FLAG]),
        PipelineMetrics::shared(),
    )
    .with_orchestrator(OrchestratorClassifier::new(backend, timeout))
}

fn appointment_chain() -> Value {
    json!({"steps": [
        {"intent": "create-appointment", "slots": {"when": "thursday 9am"}, "requires": ["patient_id"], "confidence": 0.82},
        {"intent": "select-patient", "slots": {"patient_name": "ada lovelace"}, "produces": ["patient_id"], "confidence": 0.91}
    ]})
}

fn context() -> CortexContext {
    CortexContext::builder()
        .location("/schedule")
        .active_record("patient-17")
        .build()
}

#[tokio::test]
async fn escalates_over_http_and_repairs_order() {
    let fake = FakeBackend::new(StatusCode::OK, appointment_chain());
    let calls = Arc::clone(&fake.calls);
    let received = Arc::clone(&fake.last_request);
    let coordinator = coordinator_for(fake, BackendProtocol::Json, Duration::from_secs(2)).await;

    let result = coordinator
        .classify("put ada lovelace in for thursday morning", &context())
        .await;

    assert_eq!(result.state, PipelineState::MergedOrchestrator);
    assert!(result.escalated);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let names = result
        .chain
        .steps()
        .iter()
        .map(|step| step.intent.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, ["select-patient", "create-appointment"]);
    assert!(is_dependency_ordered(result.chain.steps()));
    assert!(result
        .chain
        .steps()
        .iter()
        .all(|step| step.provenance == Provenance::Orchestrator));

    let request = received.lock().take().expect("backend should see the request");
    assert_eq!(request["text"], "put ada lovelace in for thursday morning");
    assert_eq!(request["context"]["active_record"], "patient-17");
    assert_eq!(request["hint"]["context_slots"]["active_record_id"], "patient-17");
    assert!(request["intents"]
        .as_array()
        .unwrap()
        .iter()
        .any(|intent| intent["name"] == "create-appointment"));
}

#[tokio::test]
async fn reads_chain_from_responses_output_text() {
    let text = format!("```json\n{}\n```", appointment_chain());
    let fake = FakeBackend::new(
        StatusCode::OK,
        json!({"output": [{"type": "message", "content": [{"type": "output_text", "text": text}]}]}),
    );
    let coordinator =
        coordinator_for(fake, BackendProtocol::Responses, Duration::from_secs(2)).await;

    let result = coordinator
        .classify("put ada lovelace in for thursday morning", &context())
        .await;

    assert_eq!(result.state, PipelineState::MergedOrchestrator);
    assert_eq!(result.chain.steps().len(), 2);
}

#[tokio::test]
async fn slow_backend_times_out_to_unknown() {
    let fake = FakeBackend::new(StatusCode::OK, appointment_chain()).slow(Duration::from_secs(3));
    let calls = Arc::clone(&fake.calls);
    let coordinator =
        coordinator_for(fake, BackendProtocol::Json, Duration::from_millis(100)).await;

    let result = coordinator
        .classify("do the thing with the stuff", &context())
        .await;

    assert_eq!(result.state, PipelineState::Unknown);
    assert_eq!(result.escalation_failure, Some(FailureKind::Timeout));
    assert!(result.chain.is_unknown());
    assert_eq!(result.chain.first().confidence, 0.0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_error_falls_back_to_reflex_chain() {
    let fake = FakeBackend::new(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": "overloaded"}),
    );
    let calls = Arc::clone(&fake.calls);
    let coordinator = coordinator_for(fake, BackendProtocol::Json, Duration::from_secs(2)).await;

    let result = coordinator
        .classify("take vitals for the patient in bed four", &context())
        .await;

    assert_eq!(result.state, PipelineState::FallbackToReflex);
    assert_eq!(result.escalation_failure, Some(FailureKind::BackendError));
    assert_eq!(result.chain, build_fallback_chain(&result.local));
    assert_eq!(result.chain.first().intent.as_str(), "record-vitals");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn out_of_vocabulary_answer_is_malformed() {
    let fake = FakeBackend::new(
        StatusCode::OK,
        json!({"steps": [{"intent": "order-pizza", "confidence": 0.99}]}),
    );
    let coordinator = coordinator_for(fake, BackendProtocol::Json, Duration::from_secs(2)).await;

    let result = coordinator
        .classify("do the thing with the stuff", &context())
        .await;

    assert_eq!(result.state, PipelineState::Unknown);
    assert_eq!(
        result.escalation_failure,
        Some(FailureKind::MalformedResponse)
    );
    assert_eq!(coordinator.metrics().snapshot().malformed_response_total, 1);
}

#[tokio::test]
async fn every_outcome_is_a_valid_chain() {
    let fake = FakeBackend::new(StatusCode::OK, json!({"steps": []}));
    let coordinator = coordinator_for(fake, BackendProtocol::Json, Duration::from_secs(2)).await;

    for text in [
        "note john medication",
        "refill lisinopril",
        "bp 120 over 80",
        "mrn 0042137",
        "go to inbox",
        "cancel appointment with ada",
        "",
        "¿dónde está el paciente?",
        "do the thing with the stuff",
    ] {
        let result = coordinator.classify(text, &context()).await;
        assert!(!result.chain.steps().is_empty(), "{text}");
        assert!(is_dependency_ordered(result.chain.steps()), "{text}");
    }
}
