use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Json, State};
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{body::Body, Router};
use cortex_core::{ContextInput, IntentDefinition, RuleRegistry, SharedRegistry};
use cortex_observability::{MetricsSnapshot, PipelineMetrics};
use cortex_orchestrator::HttpReasoningBackend;
use cortex_pipeline::{
    Classification, FallbackChainCoordinator, FeatureFlags, PipelineConfig, StaticFlags,
    ESCALATION_FLAG,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const MAX_BATCH_ITEMS: usize = 32;
const DEFAULT_BODY_LIMIT_BYTES: usize = 64 * 1024;

pub type Coordinator = FallbackChainCoordinator<HttpReasoningBackend, Arc<StaticFlags>>;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
    pub flags: Arc<StaticFlags>,
    pub metrics: Arc<PipelineMetrics>,
    pub config: Arc<PipelineConfig>,
    pub settings: Arc<ApiSettings>,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
    pub body_limit_bytes: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
        }
    }
}

impl ApiSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let api_key = env::var("CORTEX_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let allowed_origins = env::var("CORTEX_ALLOWED_ORIGINS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(|origin| origin.trim().trim_end_matches('/').to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.allowed_origins);
        let body_limit_bytes = env::var("CORTEX_BODY_LIMIT_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.body_limit_bytes);

        Self {
            api_key,
            allowed_origins,
            body_limit_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp_utc: String,
    metrics: MetricsSnapshot,
    registry: cortex_core::RegistrySummary,
    escalation: EscalationStatus,
}

#[derive(Debug, Serialize)]
struct EscalationStatus {
    configured: bool,
    enabled: bool,
    available: bool,
}

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub text: String,
    #[serde(default)]
    pub context: Option<ContextInput>,
}

#[derive(Debug, Deserialize)]
pub struct BatchClassifyRequest {
    pub items: Vec<ClassifyRequest>,
}

#[derive(Debug, Serialize)]
struct BatchClassifyResponse {
    results: Vec<Classification>,
}

#[derive(Debug, Serialize)]
struct RuleView {
    id: String,
    intent: String,
    priority: u32,
    locations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct RulesResponse {
    version: String,
    source: String,
    loaded_at: String,
    intents: Vec<IntentDefinition>,
    rules: Vec<RuleView>,
}

#[derive(Debug, Deserialize)]
struct FlagUpdate {
    name: String,
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct FlagsResponse {
    enabled: Vec<String>,
}

pub async fn build_app(config: PipelineConfig, settings: ApiSettings) -> Result<Router> {
    let registry = RuleRegistry::load(&config.rules_path).with_context(|| {
        format!(
            "failed to load rule registry from {}",
            config.rules_path.display()
        )
    })?;
    let backend = config
        .http_backend()
        .context("failed to configure reasoning backend")?;
    if backend.is_none() && config.escalation_enabled {
        warn!("escalation enabled but CORTEX_BACKEND_URL is unset; running reflex-only");
    }

    let summary = registry.summary();
    info!(
        version = %summary.version,
        source = %summary.source,
        rules = summary.rules.len(),
        "rule registry loaded"
    );

    let state = build_state(config, settings, SharedRegistry::new(registry), backend);
    Ok(build_router(state))
}

pub fn build_state(
    config: PipelineConfig,
    settings: ApiSettings,
    registry: SharedRegistry,
    backend: Option<HttpReasoningBackend>,
) -> ApiState {
    let flags = Arc::new(config.feature_flags());
    let metrics = PipelineMetrics::shared();
    let coordinator = FallbackChainCoordinator::from_config(
        &config,
        registry,
        Arc::clone(&flags),
        Arc::clone(&metrics),
        backend,
    );

    ApiState {
        coordinator: Arc::new(coordinator),
        flags,
        metrics,
        config: Arc::new(config),
        settings: Arc::new(settings),
    }
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/classify", post(classify))
        .route("/v1/classify/batch", post(classify_batch))
        .route("/v1/rules", get(rules_list))
        .route("/v1/rules/reload", post(rules_reload))
        .route("/v1/flags", get(flags_list).post(flags_update))
        .layer(build_cors_layer(&state.settings.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(RequestBodyLimitLayer::new(state.settings.body_limit_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let enabled = state.flags.is_enabled(ESCALATION_FLAG);
    let configured = state.coordinator.orchestrator().is_some();
    let payload = HealthResponse {
        status: "ok",
        timestamp_utc: chrono::Utc::now().to_rfc3339(),
        metrics: state.metrics.snapshot(),
        registry: state.coordinator.registry().snapshot().summary(),
        escalation: EscalationStatus {
            configured,
            enabled,
            available: configured && enabled,
        },
    };

    (StatusCode::OK, Json(payload))
}

async fn classify(State(state): State<ApiState>, Json(request): Json<ClassifyRequest>) -> Response {
    if request.text.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty_text", "text must not be empty");
    }

    let result = classify_one(&state, request).await;
    (StatusCode::OK, Json(result)).into_response()
}

async fn classify_batch(
    State(state): State<ApiState>,
    Json(request): Json<BatchClassifyRequest>,
) -> Response {
    if request.items.is_empty() || request.items.len() > MAX_BATCH_ITEMS {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_batch_size",
            &format!("batch must hold between 1 and {MAX_BATCH_ITEMS} items"),
        );
    }
    if let Some(idx) = request
        .items
        .iter()
        .position(|item| item.text.trim().is_empty())
    {
        return error_response(
            StatusCode::BAD_REQUEST,
            "empty_text",
            &format!("item {idx} has empty text"),
        );
    }

    let results = join_all(
        request
            .items
            .into_iter()
            .map(|item| classify_one(&state, item)),
    )
    .await;

    (StatusCode::OK, Json(BatchClassifyResponse { results })).into_response()
}

async fn classify_one(state: &ApiState, request: ClassifyRequest) -> Classification {
    let context = request
        .context
        .unwrap_or_default()
        .into_context(&request.text);
    state.coordinator.classify(&request.text, &context).await
}

async fn rules_list(State(state): State<ApiState>) -> impl IntoResponse {
    let registry = state.coordinator.registry().snapshot();
    let payload = RulesResponse {
        version: registry.version().to_string(),
        source: registry.source().to_string(),
        loaded_at: registry.loaded_at().to_rfc3339(),
        intents: registry.intents().to_vec(),
        rules: registry
            .rules()
            .iter()
            .map(|rule| RuleView {
                id: rule.id().to_string(),
                intent: rule.intent().to_string(),
                priority: rule.priority(),
                locations: rule.locations().to_vec(),
                description: rule.description().map(ToString::to_string),
            })
            .collect(),
    };

    (StatusCode::OK, Json(payload))
}

async fn rules_reload(State(state): State<ApiState>) -> Response {
    let registry = state.coordinator.registry().clone();
    let path = state.config.rules_path.clone();

    let reloaded = tokio::task::spawn_blocking(move || registry.reload_from(path)).await;
    match reloaded {
        Ok(Ok(active)) => {
            let summary = active.summary();
            info!(
                version = %summary.version,
                rules = summary.rules.len(),
                "rule registry reloaded"
            );
            (StatusCode::OK, Json(summary)).into_response()
        }
        Ok(Err(err)) => {
            warn!(error = %err, "rule reload rejected, keeping active registry");
            error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "rule_load_failed",
                &err.to_string(),
            )
        }
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "reload_task_failed",
            &err.to_string(),
        ),
    }
}

async fn flags_list(State(state): State<ApiState>) -> impl IntoResponse {
    Json(FlagsResponse {
        enabled: state.flags.enabled(),
    })
}

async fn flags_update(
    State(state): State<ApiState>,
    Json(update): Json<FlagUpdate>,
) -> Response {
    let name = update.name.trim();
    if name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty_flag", "flag name must not be empty");
    }

    state.flags.set(name, update.enabled);
    info!(flag = %name, enabled = update.enabled, "feature flag updated");
    (
        StatusCode::OK,
        Json(FlagsResponse {
            enabled: state.flags.enabled(),
        }),
    )
        .into_response()
}

async fn api_key_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.settings.api_key.as_deref() else {
        return next.run(request).await;
    };
    if request.method() == Method::OPTIONS || is_public_endpoint(request.uri().path()) {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if provided != expected {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid x-api-key",
        );
    }

    next.run(request).await
}

fn is_public_endpoint(path: &str) -> bool {
    path == "/health"
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": error,
            "message": message
        })),
    )
        .into_response()
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-api-key"),
        ])
}
