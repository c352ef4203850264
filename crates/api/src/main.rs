use std::env;

use anyhow::{Context, Result};
use cortex_api::{build_app, ApiSettings};
use cortex_observability::init_tracing;
use cortex_pipeline::PipelineConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("cortex_api");

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    let rules_path = config.rules_path.display().to_string();
    let bind = env::var("CORTEX_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let app = build_app(config, ApiSettings::from_env()).await?;

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind = %bind, rules = %rules_path, "cortex classification api started");

    axum::serve(listener, app).await?;
    Ok(())
}
