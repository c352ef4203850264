use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    requests_total: AtomicU64,
    reflex_only_total: AtomicU64,
    escalations_total: AtomicU64,
    orchestrator_success_total: AtomicU64,
    orchestrator_timeout_total: AtomicU64,
    backend_error_total: AtomicU64,
    malformed_response_total: AtomicU64,
    ordering_failure_total: AtomicU64,
    fallback_total: AtomicU64,
    unknown_total: AtomicU64,
    budget_exhausted_total: AtomicU64,
    total_latency_micros: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub reflex_only_total: u64,
    pub escalations_total: u64,
    pub orchestrator_success_total: u64,
    pub orchestrator_timeout_total: u64,
    pub backend_error_total: u64,
    pub malformed_response_total: u64,
    pub ordering_failure_total: u64,
    pub fallback_total: u64,
    pub unknown_total: u64,
    pub budget_exhausted_total: u64,
    pub avg_latency_millis: f64,
}

fn bump(cell: &AtomicU64, name: &'static str) {
    cell.fetch_add(1, Ordering::Relaxed);
    counter!(name).increment(1);
}

impl PipelineMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_request(&self) {
        bump(&self.requests_total, "cortex_requests_total");
    }

    pub fn inc_reflex_only(&self) {
        bump(&self.reflex_only_total, "cortex_reflex_only_total");
    }

    pub fn inc_escalation(&self) {
        bump(&self.escalations_total, "cortex_escalations_total");
    }

    pub fn inc_orchestrator_success(&self) {
        bump(
            &self.orchestrator_success_total,
            "cortex_orchestrator_success_total",
        );
    }

    pub fn inc_orchestrator_timeout(&self) {
        bump(
            &self.orchestrator_timeout_total,
            "cortex_orchestrator_timeout_total",
        );
    }

    pub fn inc_backend_error(&self) {
        bump(&self.backend_error_total, "cortex_backend_error_total");
    }

    pub fn inc_malformed_response(&self) {
        bump(
            &self.malformed_response_total,
            "cortex_malformed_response_total",
        );
    }

    pub fn inc_ordering_failure(&self) {
        bump(&self.ordering_failure_total, "cortex_ordering_failure_total");
    }

    pub fn inc_fallback(&self) {
        bump(&self.fallback_total, "cortex_fallback_total");
    }

    pub fn inc_unknown(&self) {
        bump(&self.unknown_total, "cortex_unknown_total");
    }

    pub fn inc_budget_exhausted(&self) {
        bump(&self.budget_exhausted_total, "cortex_budget_exhausted_total");
    }

    pub fn observe_latency(&self, duration: Duration) {
        self.total_latency_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        histogram!("cortex_classify_latency_seconds").record(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests_total.load(Ordering::Relaxed);
        let latency = self.total_latency_micros.load(Ordering::Relaxed);

        MetricsSnapshot {
            requests_total: requests,
            reflex_only_total: self.reflex_only_total.load(Ordering::Relaxed),
            escalations_total: self.escalations_total.load(Ordering::Relaxed),
            orchestrator_success_total: self.orchestrator_success_total.load(Ordering::Relaxed),
            orchestrator_timeout_total: self.orchestrator_timeout_total.load(Ordering::Relaxed),
            backend_error_total: self.backend_error_total.load(Ordering::Relaxed),
            malformed_response_total: self.malformed_response_total.load(Ordering::Relaxed),
            ordering_failure_total: self.ordering_failure_total.load(Ordering::Relaxed),
            fallback_total: self.fallback_total.load(Ordering::Relaxed),
            unknown_total: self.unknown_total.load(Ordering::Relaxed),
            budget_exhausted_total: self.budget_exhausted_total.load(Ordering::Relaxed),
            avg_latency_millis: if requests == 0 {
                0.0
            } else {
                latency as f64 / requests as f64 / 1_000.0
            },
        }
    }
}

pub fn init_tracing(service_name: &str) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}=info,cortex_pipeline=info,cortex_api=info",
                service_name.replace('-', "_")
            ))
        });

        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(true)
            .init();
    });
}
