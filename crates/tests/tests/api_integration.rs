use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use cortex_api::{build_app, build_router, build_state, ApiSettings, MAX_BATCH_ITEMS};
use cortex_core::{RuleRegistry, SharedRegistry};
use cortex_pipeline::{PipelineConfig, ESCALATION_FLAG};
use serde_json::{json, Value};
use tower::ServiceExt;

fn rules_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../rules/command_center.json")
}

fn config() -> PipelineConfig {
    PipelineConfig {
        rules_path: rules_path(),
        ..PipelineConfig::default()
    }
}

fn app_with(config: PipelineConfig, settings: ApiSettings) -> Router {
    let registry = RuleRegistry::load(rules_path()).expect("bundled rules should load");
    build_router(build_state(
        config,
        settings,
        SharedRegistry::new(registry),
        None,
    ))
}

fn app() -> Router {
    app_with(config(), ApiSettings::default())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn scratch_file(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("cortex-{}-{nanos}-{name}", std::process::id()))
}

#[tokio::test]
async fn build_app_loads_bundled_rules() {
    let app = build_app(config(), ApiSettings::default())
        .await
        .expect("app should build");

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let parsed = body_json(response).await;
    assert_eq!(parsed["status"], "ok");
    assert_eq!(parsed["registry"]["version"], "command-center-2026.10");
    assert_eq!(parsed["escalation"]["configured"], false);
    assert_eq!(parsed["escalation"]["available"], false);
}

#[tokio::test]
async fn confident_command_is_reflex_only() {
    let response = app()
        .oneshot(post_json(
            "/v1/classify",
            json!({"text": "note john medication", "context": {"location": "/patients/7"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let parsed = body_json(response).await;
    assert_eq!(parsed["state"], "reflex_only");
    assert_eq!(parsed["uncertain"], false);
    assert_eq!(parsed["chain"]["steps"][0]["intent"], "create-note");
    assert_eq!(parsed["chain"]["steps"][0]["provenance"], "reflex");
    assert_eq!(parsed["chain"]["steps"][0]["slots"]["name"], "john");
    assert_eq!(parsed["chain"]["steps"][0]["slots"]["topic"], "medication");
    assert!(parsed["request_id"].as_str().is_some());
}

#[tokio::test]
async fn unmatched_command_without_backend_is_unknown() {
    let response = app()
        .oneshot(post_json(
            "/v1/classify",
            json!({"text": "do the thing with the stuff"}),
        ))
        .await
        .unwrap();

    let parsed = body_json(response).await;
    assert_eq!(parsed["state"], "unknown");
    assert_eq!(parsed["uncertain"], true);
    assert_eq!(parsed["escalated"], false);
    assert_eq!(parsed["chain"]["steps"][0]["intent"], "unknown");
    assert_eq!(parsed["chain"]["steps"][0]["confidence"], 0.0);
}

#[tokio::test]
async fn empty_text_is_rejected() {
    let response = app()
        .oneshot(post_json("/v1/classify", json!({"text": "   "})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "empty_text");
}

#[tokio::test]
async fn batch_classifies_every_item_in_order() {
    let response = app()
        .oneshot(post_json(
            "/v1/classify/batch",
            json!({"items": [
                {"text": "note john medication"},
                {"text": "refill lisinopril"},
                {"text": "nothing to see"}
            ]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let parsed = body_json(response).await;
    let results = parsed["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["chain"]["steps"][0]["intent"], "create-note");
    assert_eq!(results[1]["local"]["intent"], "prescribe-medication");
    assert_eq!(results[2]["state"], "unknown");
}

#[tokio::test]
async fn oversized_batch_is_rejected() {
    let items = (0..=MAX_BATCH_ITEMS)
        .map(|idx| json!({"text": format!("note patient{idx} vitals")}))
        .collect::<Vec<_>>();
    let response = app()
        .oneshot(post_json("/v1/classify/batch", json!({ "items": items })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rules_endpoint_lists_registry() {
    let response = app().oneshot(get("/v1/rules")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let parsed = body_json(response).await;
    let rules = parsed["rules"].as_array().unwrap();
    assert!(rules
        .iter()
        .any(|rule| rule["id"] == "note.name-topic" && rule["priority"] == 10));
    assert_eq!(parsed["intents"].as_array().unwrap().len(), 9);
}

#[tokio::test]
async fn failed_reload_keeps_active_registry() {
    let path = scratch_file("rules.json");
    fs::write(&path, "{ not json").unwrap();

    let app = app_with(
        PipelineConfig {
            rules_path: path.clone(),
            ..config()
        },
        ApiSettings::default(),
    );

    let response = app
        .clone()
        .oneshot(post_json("/v1/rules/reload", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["error"], "rule_load_failed");

    let current = body_json(app.clone().oneshot(get("/v1/rules")).await.unwrap()).await;
    assert_eq!(current["version"], "command-center-2026.10");

    fs::write(
        &path,
        json!({
            "version": "hotfix-1",
            "intents": [{"name": "navigate"}],
            "rules": [{"id": "nav.home", "intent": "navigate", "pattern": {"template": "go home"}}]
        })
        .to_string(),
    )
    .unwrap();

    let response = app
        .clone()
        .oneshot(post_json("/v1/rules/reload", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["version"], "hotfix-1");

    let classified = body_json(
        app.oneshot(post_json("/v1/classify", json!({"text": "go home"})))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(classified["registry_version"], "hotfix-1");
    assert_eq!(classified["local"]["rule_id"], "nav.home");

    let _ = fs::remove_file(path);
}

#[tokio::test]
async fn api_key_guards_everything_but_health() {
    let app = app_with(
        config(),
        ApiSettings {
            api_key: Some("test-key".to_string()),
            ..ApiSettings::default()
        },
    );

    let health = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let anonymous = app
        .clone()
        .oneshot(post_json("/v1/classify", json!({"text": "note john medication"})))
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let mut authorised = post_json("/v1/classify", json!({"text": "note john medication"}));
    authorised
        .headers_mut()
        .insert("x-api-key", "test-key".parse().unwrap());
    let response = app.oneshot(authorised).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn escalation_flag_can_be_toggled() {
    let app = app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/flags",
            json!({"name": ESCALATION_FLAG, "enabled": false}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let flags = body_json(response).await;
    assert!(flags["enabled"]
        .as_array()
        .unwrap()
        .iter()
        .all(|flag| flag.as_str() != Some(ESCALATION_FLAG)));

    let health = body_json(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(health["escalation"]["enabled"], false);
}
