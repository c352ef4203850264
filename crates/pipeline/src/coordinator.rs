use std::sync::Arc;
use std::time::Instant;

use cortex_core::{
    build_chain_from_reflex, build_fallback_chain, CortexContext, IntentChain,
    LocalClassificationResult, ReflexClassifier, RuleRegistry, ScoringPolicy, SharedRegistry,
};
use cortex_observability::PipelineMetrics;
use cortex_orchestrator::{FailureKind, OrchestratorClassifier, ReasoningBackend};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, DEFAULT_AUTO_ACCEPT_THRESHOLD};
use crate::flags::{FeatureFlags, ESCALATION_FLAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    ReflexOnly,
    // Transient, logged only.
    Escalating,
    MergedOrchestrator,
    FallbackToReflex,
    Unknown,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReflexOnly => "reflex_only",
            Self::Escalating => "escalating",
            Self::MergedOrchestrator => "merged_orchestrator",
            Self::FallbackToReflex => "fallback_to_reflex",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_uncertain(self) -> bool {
        matches!(self, Self::FallbackToReflex | Self::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub request_id: Uuid,
    pub state: PipelineState,
    pub chain: IntentChain,
    pub local: LocalClassificationResult,
    pub uncertain: bool,
    pub escalated: bool,
    pub escalation_failure: Option<FailureKind>,
    pub registry_version: String,
}

struct Settled {
    state: PipelineState,
    chain: IntentChain,
    escalated: bool,
    failure: Option<FailureKind>,
}

pub struct FallbackChainCoordinator<B, F> {
    registry: SharedRegistry,
    policy: ScoringPolicy,
    auto_accept_threshold: f32,
    orchestrator: Option<OrchestratorClassifier<B>>,
    flags: F,
    metrics: Arc<PipelineMetrics>,
}

impl<B, F> FallbackChainCoordinator<B, F>
where
    B: ReasoningBackend,
    F: FeatureFlags,
{
    pub fn new(registry: SharedRegistry, flags: F, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            registry,
            policy: ScoringPolicy::default(),
            auto_accept_threshold: DEFAULT_AUTO_ACCEPT_THRESHOLD,
            orchestrator: None,
            flags,
            metrics,
        }
    }

    pub fn from_config(
        config: &PipelineConfig,
        registry: SharedRegistry,
        flags: F,
        metrics: Arc<PipelineMetrics>,
        backend: Option<B>,
    ) -> Self {
        let coordinator = Self::new(registry, flags, metrics)
            .with_policy(config.policy.clone())
            .with_auto_accept_threshold(config.auto_accept_threshold);
        match backend {
            Some(backend) => coordinator.with_orchestrator(OrchestratorClassifier::new(
                backend,
                config.orchestrator_timeout,
            )),
            None => coordinator,
        }
    }

    pub fn with_policy(mut self, policy: ScoringPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_auto_accept_threshold(mut self, threshold: f32) -> Self {
        self.auto_accept_threshold = threshold;
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: OrchestratorClassifier<B>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn flags(&self) -> &F {
        &self.flags
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn orchestrator(&self) -> Option<&OrchestratorClassifier<B>> {
        self.orchestrator.as_ref()
    }

    pub fn escalation_available(&self) -> bool {
        self.orchestrator.is_some() && self.flags.is_enabled(ESCALATION_FLAG)
    }

    #[instrument(
        skip(self, text, context),
        fields(request_id = tracing::field::Empty, chars = text.len())
    )]
    pub async fn classify(&self, text: &str, context: &CortexContext) -> Classification {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        tracing::Span::current().record("request_id", tracing::field::display(request_id));
        self.metrics.inc_request();

        let registry = self.registry.snapshot();
        let local =
            ReflexClassifier::new(Arc::clone(&registry), self.policy.clone()).classify(text, context);
        if local.budget_exhausted {
            self.metrics.inc_budget_exhausted();
        }
        debug!(
            intent = ?local.intent,
            rule = ?local.rule_id,
            confidence = local.confidence,
            alternatives = local.alternatives.len(),
            "reflex classification"
        );

        let settled = if local.is_match() && local.confidence >= self.auto_accept_threshold {
            self.metrics.inc_reflex_only();
            Settled {
                state: PipelineState::ReflexOnly,
                chain: build_fallback_chain(&local),
                escalated: false,
                failure: None,
            }
        } else {
            self.escalate_or_fall_back(text, context, &local, &registry)
                .await
        };

        self.metrics.observe_latency(started.elapsed());
        info!(
            state = settled.state.as_str(),
            steps = settled.chain.steps().len(),
            escalated = settled.escalated,
            elapsed_micros = started.elapsed().as_micros() as u64,
            "classification settled"
        );

        Classification {
            request_id,
            state: settled.state,
            uncertain: settled.state.is_uncertain(),
            chain: settled.chain,
            local,
            escalated: settled.escalated,
            escalation_failure: settled.failure,
            registry_version: registry.version().to_string(),
        }
    }

    async fn escalate_or_fall_back(
        &self,
        text: &str,
        context: &CortexContext,
        local: &LocalClassificationResult,
        registry: &RuleRegistry,
    ) -> Settled {
        let gate_open = self.flags.is_enabled(ESCALATION_FLAG);
        let orchestrator = match (&self.orchestrator, gate_open) {
            (Some(orchestrator), true) => orchestrator,
            (None, true) => {
                debug!("escalation enabled but no orchestrator configured");
                return self.settle_locally(local, false, None);
            }
            (_, false) => return self.settle_locally(local, false, None),
        };

        self.metrics.inc_escalation();
        debug!(
            state = PipelineState::Escalating.as_str(),
            backend = orchestrator.backend().name(),
            "escalating to orchestrator"
        );

        let hint = build_chain_from_reflex(local, context);
        match orchestrator
            .classify(text, context, Some(&hint), registry)
            .await
        {
            Ok(chain) => {
                self.metrics.inc_orchestrator_success();
                Settled {
                    state: PipelineState::MergedOrchestrator,
                    chain,
                    escalated: true,
                    failure: None,
                }
            }
            Err(err) => {
                let kind = err.kind();
                warn!(error = %err, kind = ?kind, "escalation failed, keeping reflex result");
                match kind {
                    FailureKind::Timeout => self.metrics.inc_orchestrator_timeout(),
                    FailureKind::BackendError => self.metrics.inc_backend_error(),
                    FailureKind::MalformedResponse => self.metrics.inc_malformed_response(),
                    FailureKind::Ordering => self.metrics.inc_ordering_failure(),
                }
                self.settle_locally(local, true, Some(kind))
            }
        }
    }

    fn settle_locally(
        &self,
        local: &LocalClassificationResult,
        escalated: bool,
        failure: Option<FailureKind>,
    ) -> Settled {
        let state = if local.is_match() {
            self.metrics.inc_fallback();
            PipelineState::FallbackToReflex
        } else {
            self.metrics.inc_unknown();
            PipelineState::Unknown
        };

        Settled {
            state,
            chain: build_fallback_chain(local),
            escalated,
            failure,
        }
    }
}
