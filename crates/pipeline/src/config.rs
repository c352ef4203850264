use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use cortex_core::config::unit_range;
use cortex_core::{ConfigError, ScoringPolicy};
use cortex_orchestrator::{BackendProtocol, HttpBackendConfig, HttpReasoningBackend};
use tracing::warn;

use crate::flags::{StaticFlags, ESCALATION_FLAG};

pub const DEFAULT_AUTO_ACCEPT_THRESHOLD: f32 = 0.85;
pub const DEFAULT_ORCHESTRATOR_TIMEOUT: Duration = Duration::from_millis(1_500);

#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    pub url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub protocol: BackendProtocol,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub rules_path: PathBuf,
    pub policy: ScoringPolicy,
    pub auto_accept_threshold: f32,
    pub orchestrator_timeout: Duration,
    pub escalation_enabled: bool,
    pub flags: Vec<String>,
    pub backend: Option<BackendSettings>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rules_path: PathBuf::from("rules"),
            policy: ScoringPolicy::default(),
            auto_accept_threshold: DEFAULT_AUTO_ACCEPT_THRESHOLD,
            orchestrator_timeout: DEFAULT_ORCHESTRATOR_TIMEOUT,
            escalation_enabled: true,
            flags: Vec::new(),
            backend: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut policy = defaults.policy.clone();
        if let Some(value) = read("CORTEX_TIE_EPSILON").and_then(|v| v.parse::<f32>().ok()) {
            policy.tie_epsilon = value;
        }
        if let Some(value) = read("CORTEX_REFLEX_BUDGET_MICROS").and_then(|v| v.parse::<u64>().ok())
        {
            policy.budget = Duration::from_micros(value);
        }
        if let Some(value) = read("CORTEX_MAX_INPUT_CHARS").and_then(|v| v.parse::<usize>().ok()) {
            policy.max_input_chars = value;
        }

        let backend = read("CORTEX_BACKEND_URL").map(|url| {
            let protocol = match read("CORTEX_BACKEND_PROTOCOL") {
                Some(raw) => BackendProtocol::parse(&raw).unwrap_or_else(|| {
                    warn!(protocol = %raw, "unknown backend protocol, using json");
                    BackendProtocol::Json
                }),
                None => BackendProtocol::Json,
            };
            BackendSettings {
                url,
                api_key: read("CORTEX_BACKEND_API_KEY"),
                model: read("CORTEX_BACKEND_MODEL"),
                protocol,
            }
        });

        let config = Self {
            rules_path: read("CORTEX_RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_path),
            policy,
            auto_accept_threshold: read("CORTEX_AUTO_ACCEPT_THRESHOLD")
                .and_then(|value| value.parse::<f32>().ok())
                .unwrap_or(defaults.auto_accept_threshold),
            orchestrator_timeout: read("CORTEX_ORCHESTRATOR_TIMEOUT_MS")
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.orchestrator_timeout),
            escalation_enabled: read("CORTEX_ESCALATION_ENABLED")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(defaults.escalation_enabled),
            flags: read("CORTEX_FLAGS")
                .map(|value| {
                    value
                        .split(',')
                        .map(|flag| flag.trim().to_string())
                        .filter(|flag| !flag.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            backend,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate()?;
        unit_range("auto_accept_threshold", self.auto_accept_threshold)?;
        if self.orchestrator_timeout.is_zero() {
            return Err(ConfigError::NonPositive {
                name: "orchestrator_timeout",
            });
        }
        Ok(())
    }

    pub fn feature_flags(&self) -> StaticFlags {
        let flags = StaticFlags::new(self.flags.iter().cloned());
        if self.escalation_enabled {
            flags.set(ESCALATION_FLAG, true);
        }
        flags
    }

    pub fn http_backend(&self) -> Result<Option<HttpReasoningBackend>> {
        let Some(settings) = &self.backend else {
            return Ok(None);
        };

        let mut config = HttpBackendConfig::new(&settings.url)?;
        config.api_key = settings.api_key.clone();
        config.protocol = settings.protocol;
        if let Some(model) = &settings.model {
            config.model = model.clone();
        }
        HttpReasoningBackend::new(config).map(Some)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
