use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::wire::BackendChain;
use crate::{BackendError, ReasoningBackend, ReasoningRequest};

const MAX_ERROR_BODY_CHARS: usize = 512;
const MAX_PROMPT_INTENTS: usize = 64;

const SYSTEM_PROMPT: &str = "You classify commands typed into a clinical command center. \
Split the command into one or more steps, in execution order. Use only intents from the \
provided vocabulary. For each step list the slots it fills, the slot names it requires from \
earlier steps and the slot names it produces. Reply with a single JSON object of the form \
{\"steps\":[{\"intent\":\"...\",\"slots\":{},\"confidence\":0.0,\"requires\":[],\"produces\":[]}]} \
and nothing else.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendProtocol {
    #[default]
    Json,
    Responses,
}

impl BackendProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "responses" | "openai" => Some(Self::Responses),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub endpoint: Url,
    pub api_key: Option<String>,
    pub model: String,
    pub protocol: BackendProtocol,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl HttpBackendConfig {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint.trim())
            .with_context(|| format!("invalid reasoning backend url `{endpoint}`"))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            anyhow::bail!(
                "reasoning backend url must be http or https, got `{}`",
                endpoint.scheme()
            );
        }

        Ok(Self {
            endpoint,
            api_key: None,
            model: "gpt-5.2".to_string(),
            protocol: BackendProtocol::Json,
            connect_timeout: Duration::from_secs(6),
            request_timeout: Duration::from_secs(20),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpReasoningBackend {
    client: Client,
    config: HttpBackendConfig,
}

impl HttpReasoningBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }

    fn payload(&self, request: &ReasoningRequest<'_>) -> Result<Value, BackendError> {
        match self.config.protocol {
            BackendProtocol::Json => {
                serde_json::to_value(request).map_err(|err| BackendError::Transport {
                    reason: format!("failed encoding request: {err}"),
                })
            }
            BackendProtocol::Responses => Ok(responses_payload(&self.config.model, request)),
        }
    }
}

impl ReasoningBackend for HttpReasoningBackend {
    fn name(&self) -> &str {
        match self.config.protocol {
            BackendProtocol::Json => "http-json",
            BackendProtocol::Responses => "http-responses",
        }
    }

    async fn reason(&self, request: &ReasoningRequest<'_>) -> Result<BackendChain, BackendError> {
        let payload = self.payload(request)?;

        let mut call = self.client.post(self.config.endpoint.clone()).json(&payload);
        if let Some(api_key) = self.config.api_key.as_deref() {
            call = call.bearer_auth(api_key);
        }

        let response = call.send().await.map_err(|err| BackendError::Transport {
            reason: err.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let body: Value = response.json().await.map_err(|err| BackendError::Malformed {
            reason: err.to_string(),
        })?;

        match self.config.protocol {
            BackendProtocol::Json => {
                serde_json::from_value(body).map_err(|err| BackendError::Malformed {
                    reason: err.to_string(),
                })
            }
            BackendProtocol::Responses => {
                let text = extract_output_text(&body)
                    .filter(|value| !value.trim().is_empty())
                    .ok_or_else(|| BackendError::Malformed {
                        reason: "output text missing".to_string(),
                    })?;
                BackendChain::parse(&text)
            }
        }
    }
}

fn responses_payload(model: &str, request: &ReasoningRequest<'_>) -> Value {
    let vocabulary = request
        .intents
        .iter()
        .take(MAX_PROMPT_INTENTS)
        .map(|intent| {
            serde_json::json!({
                "name": intent.name,
                "description": intent.description,
            })
        })
        .collect::<Vec<_>>();

    let context = serde_json::json!({
        "intents": vocabulary,
        "context": request.context,
        "reflex_hint": request.hint,
    });

    serde_json::json!({
        "model": model,
        "input": [
            {
                "role": "system",
                "content": [
                    { "type": "input_text", "text": SYSTEM_PROMPT }
                ]
            },
            {
                "role": "user",
                "content": [
                    { "type": "input_text", "text": request.text }
                ]
            },
            {
                "role": "user",
                "content": [
                    { "type": "input_text", "text": format!("Context JSON: {context}") }
                ]
            }
        ]
    })
}

pub(crate) fn extract_output_text(payload: &Value) -> Option<String> {
    if let Some(text) = payload.get("output_text").and_then(Value::as_str) {
        return Some(text.to_string());
    }

    let chunks = payload
        .get("output")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|content| content.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|content| content.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>();

    if chunks.is_empty() {
        None
    } else {
        Some(chunks.join("\n"))
    }
}
