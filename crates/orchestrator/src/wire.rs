use std::collections::BTreeMap;

use cortex_core::{CortexIntent, IntentType, Provenance, RuleRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::BackendError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendChain {
    #[serde(default)]
    pub steps: Vec<BackendStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStep {
    pub intent: String,
    #[serde(default)]
    pub slots: BTreeMap<String, Value>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub produces: Vec<String>,
}

impl BackendChain {
    pub fn parse(raw: &str) -> Result<Self, BackendError> {
        let trimmed = raw.trim();
        let body = match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => {
                return Err(BackendError::Malformed {
                    reason: "no JSON object in backend output".to_string(),
                })
            }
        };

        serde_json::from_str(body).map_err(|err| BackendError::Malformed {
            reason: err.to_string(),
        })
    }
}

pub(crate) fn into_intents(
    chain: BackendChain,
    registry: &RuleRegistry,
    default_confidence: f32,
) -> Result<Vec<CortexIntent>, String> {
    if chain.steps.is_empty() {
        return Err("response contains no steps".to_string());
    }

    chain
        .steps
        .into_iter()
        .enumerate()
        .map(|(idx, step)| into_intent(idx, step, registry, default_confidence))
        .collect()
}

fn into_intent(
    idx: usize,
    step: BackendStep,
    registry: &RuleRegistry,
    default_confidence: f32,
) -> Result<CortexIntent, String> {
    let name = step.intent.trim();
    if name.is_empty() {
        return Err(format!("step {idx} has an empty intent"));
    }
    let intent = IntentType::new(name);
    if !registry.has_intent(&intent) {
        return Err(format!("step {idx} uses unknown intent `{name}`"));
    }

    let confidence = match step.confidence {
        Some(value) if !value.is_finite() => {
            return Err(format!("step {idx} has a non-finite confidence"))
        }
        Some(value) => value.clamp(0.0, 1.0),
        None => default_confidence,
    };

    let mut slots = BTreeMap::new();
    for (key, value) in step.slots {
        let value = match value {
            Value::Null => continue,
            Value::String(text) => text,
            Value::Bool(flag) => flag.to_string(),
            Value::Number(number) => number.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(format!("step {idx} slot `{key}` is not a scalar"))
            }
        };
        slots.insert(key, value);
    }

    Ok(CortexIntent {
        intent,
        slots,
        confidence,
        provenance: Provenance::Orchestrator,
        requires: slot_names(step.requires),
        produces: slot_names(step.produces),
        source_rule: None,
    })
}

fn slot_names(raw: Vec<String>) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(raw.len());
    for name in raw {
        let name = name.trim();
        if !name.is_empty() && !names.iter().any(|seen| seen == name) {
            names.push(name.to_string());
        }
    }
    names
}
