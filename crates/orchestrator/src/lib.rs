mod http;
mod wire;

use std::future::Future;
use std::time::Duration;

use cortex_core::{
    order_steps, ChainOrderingError, CortexContext, IntentChain, IntentDefinition, ReflexHint,
    RuleRegistry,
};
use serde::Serialize;
use tracing::debug;

pub use http::{BackendProtocol, HttpBackendConfig, HttpReasoningBackend};
pub use wire::{BackendChain, BackendStep};

pub const DEFAULT_STEP_CONFIDENCE: f32 = 0.7;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReasoningRequest<'a> {
    pub text: &'a str,
    pub context: &'a CortexContext,
    pub hint: Option<&'a ReflexHint>,
    pub intents: &'a [IntentDefinition],
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("transport failure: {reason}")]
    Transport { reason: String },

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed backend response: {reason}")]
    Malformed { reason: String },
}

// No retries inside `reason`; the orchestrator's timeout drops the future.
pub trait ReasoningBackend: Send + Sync {
    fn name(&self) -> &str;

    fn reason(
        &self,
        request: &ReasoningRequest<'_>,
    ) -> impl Future<Output = Result<BackendChain, BackendError>> + Send;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorUnavailable {
    #[error("reasoning backend timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("reasoning backend failed: {reason}")]
    BackendError { reason: String },

    #[error("reasoning backend returned a malformed response: {reason}")]
    MalformedResponse { reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Unavailable(#[from] OrchestratorUnavailable),

    #[error("escalated chain could not be ordered: {0}")]
    Ordering(#[from] ChainOrderingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    BackendError,
    MalformedResponse,
    Ordering,
}

impl OrchestratorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Unavailable(OrchestratorUnavailable::Timeout { .. }) => FailureKind::Timeout,
            Self::Unavailable(OrchestratorUnavailable::BackendError { .. }) => {
                FailureKind::BackendError
            }
            Self::Unavailable(OrchestratorUnavailable::MalformedResponse { .. }) => {
                FailureKind::MalformedResponse
            }
            Self::Ordering(_) => FailureKind::Ordering,
        }
    }
}

impl From<BackendError> for OrchestratorUnavailable {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Malformed { reason } => Self::MalformedResponse { reason },
            other => Self::BackendError {
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorClassifier<B> {
    backend: B,
    timeout: Duration,
    default_confidence: f32,
}

impl<B: ReasoningBackend> OrchestratorClassifier<B> {
    pub fn new(backend: B, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            default_confidence: DEFAULT_STEP_CONFIDENCE,
        }
    }

    pub fn with_default_confidence(mut self, confidence: f32) -> Self {
        self.default_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn classify(
        &self,
        text: &str,
        context: &CortexContext,
        hint: Option<&ReflexHint>,
        registry: &RuleRegistry,
    ) -> Result<IntentChain, OrchestratorError> {
        let request = ReasoningRequest {
            text,
            context,
            hint,
            intents: registry.intents(),
        };

        let response = tokio::time::timeout(self.timeout, self.backend.reason(&request))
            .await
            .map_err(|_| OrchestratorUnavailable::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(OrchestratorUnavailable::from)?;

        let steps = wire::into_intents(response, registry, self.default_confidence)
            .map_err(|reason| OrchestratorUnavailable::MalformedResponse { reason })?;

        let ordered = order_steps(steps)?;
        if ordered.repaired {
            debug!(
                backend = self.backend.name(),
                steps = ordered.chain.steps().len(),
                "reordered escalated chain to satisfy slot dependencies"
            );
        }
        Ok(ordered.chain)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cortex_core::{Provenance, RuleRegistry};

    use super::*;

    const BUNDLE: &str = r#"{
        "intents": [
            {"name": "select-patient"},
            {"name": "create-appointment"}
        ],
        "rules": [
            {"id": "select", "intent": "select-patient", "pattern": {"template": "select <name>"}}
        ]
    }"#;

    struct Scripted {
        response: Result<BackendChain, BackendError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(response: Result<BackendChain, BackendError>) -> Self {
            Self {
                response,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl ReasoningBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn reason(
            &self,
            _request: &ReasoningRequest<'_>,
        ) -> Result<BackendChain, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response.clone()
        }
    }

    fn registry() -> RuleRegistry {
        RuleRegistry::from_json_str(BUNDLE).unwrap()
    }

    fn chain(raw: &str) -> BackendChain {
        serde_json::from_str(raw).unwrap()
    }

    async fn run(backend: Scripted) -> Result<IntentChain, OrchestratorError> {
        let orchestrator = OrchestratorClassifier::new(backend, Duration::from_millis(50));
        orchestrator
            .classify(
                "book ada for 3pm",
                &CortexContext::default(),
                None,
                &registry(),
            )
            .await
    }

    #[tokio::test]
    async fn repairs_dependency_order() {
        let backend = Scripted::new(Ok(chain(
            r#"{"steps": [
                {"intent": "create-appointment", "slots": {"time": "3pm"}, "requires": ["patient_id"], "confidence": 0.8},
                {"intent": "select-patient", "slots": {"name": "ada"}, "produces": ["patient_id"], "confidence": 0.9}
            ]}"#,
        )));

        let chain = run(backend).await.unwrap();
        let names = chain
            .steps()
            .iter()
            .map(|step| step.intent.as_str())
            .collect::<Vec<_>>();

        assert_eq!(names, ["select-patient", "create-appointment"]);
        assert!(chain
            .steps()
            .iter()
            .all(|step| step.provenance == Provenance::Orchestrator));
    }

    #[tokio::test]
    async fn times_out_slow_backend() {
        let backend = Scripted::new(Ok(chain(r#"{"steps": [{"intent": "select-patient"}]}"#)))
            .slow(Duration::from_secs(5));

        let err = run(backend).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[tokio::test]
    async fn distinguishes_backend_and_malformed_failures() {
        let status = Scripted::new(Err(BackendError::Status {
            status: 503,
            body: "busy".to_string(),
        }));
        assert_eq!(run(status).await.unwrap_err().kind(), FailureKind::BackendError);

        let garbage = Scripted::new(Err(BackendError::Malformed {
            reason: "not json".to_string(),
        }));
        assert_eq!(
            run(garbage).await.unwrap_err().kind(),
            FailureKind::MalformedResponse
        );
    }

    #[tokio::test]
    async fn rejects_intents_outside_vocabulary() {
        let backend = Scripted::new(Ok(chain(r#"{"steps": [{"intent": "launch-rocket"}]}"#)));
        assert_eq!(
            run(backend).await.unwrap_err().kind(),
            FailureKind::MalformedResponse
        );
    }

    #[tokio::test]
    async fn unrepairable_chain_is_an_ordering_failure() {
        let backend = Scripted::new(Ok(chain(
            r#"{"steps": [{"intent": "create-appointment", "requires": ["patient_id"]}]}"#,
        )));
        assert_eq!(run(backend).await.unwrap_err().kind(), FailureKind::Ordering);
    }

    #[tokio::test]
    async fn calls_backend_exactly_once() {
        let backend = Scripted::new(Err(BackendError::Transport {
            reason: "connection reset".to_string(),
        }));
        let orchestrator = OrchestratorClassifier::new(backend, Duration::from_millis(50));
        let _ = orchestrator
            .classify("x", &CortexContext::default(), None, &registry())
            .await;

        assert_eq!(orchestrator.backend().calls.load(Ordering::SeqCst), 1);
    }
}
