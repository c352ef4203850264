use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{
    CortexContext, CortexIntent, IntentChain, IntentType, LocalClassificationResult, Provenance,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReflexHint {
    pub candidate: Option<IntentType>,
    pub slots: BTreeMap<String, String>,
    pub confidence: f32,
    pub rule_id: Option<String>,
    pub alternatives: Vec<IntentType>,
    pub context_slots: BTreeMap<String, String>,
    pub seed: IntentChain,
}

impl ReflexHint {
    pub fn is_empty(&self) -> bool {
        self.candidate.is_none()
    }
}

pub fn build_fallback_chain(result: &LocalClassificationResult) -> IntentChain {
    match &result.intent {
        Some(intent) => IntentChain::single(CortexIntent {
            intent: intent.clone(),
            slots: result.slots.clone(),
            confidence: result.confidence,
            provenance: Provenance::Reflex,
            requires: Vec::new(),
            produces: Vec::new(),
            source_rule: result.rule_id.clone(),
        }),
        None => IntentChain::unknown(),
    }
}

pub fn build_chain_from_reflex(
    result: &LocalClassificationResult,
    context: &CortexContext,
) -> ReflexHint {
    let mut alternatives: Vec<IntentType> = Vec::new();
    for candidate in &result.alternatives {
        let duplicate = result.intent.as_ref() == Some(&candidate.intent)
            || alternatives.contains(&candidate.intent);
        if !duplicate {
            alternatives.push(candidate.intent.clone());
        }
    }

    let mut context_slots = BTreeMap::new();
    if let Some(record) = context.active_record() {
        context_slots.insert("active_record_id".to_string(), record.to_string());
    }
    if let Some(previous) = context.last_intent() {
        context_slots.insert("previous_intent".to_string(), previous.to_string());
    }

    ReflexHint {
        candidate: result.intent.clone(),
        slots: result.slots.clone(),
        confidence: result.confidence,
        rule_id: result.rule_id.clone(),
        alternatives,
        context_slots,
        seed: build_fallback_chain(result),
    }
}
