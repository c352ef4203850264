use std::sync::Arc;

use crate::config::ScoringPolicy;
use crate::models::{Candidate, CortexContext, LocalClassificationResult};
use crate::registry::{RuleMatch, RuleRegistry};
use crate::text::normalize_text;

const MAX_ALTERNATIVES: usize = 3;
// Absorbs f32 rounding so a gap of exactly `tie_epsilon` stays in the band.
const BAND_TOLERANCE: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedCandidate {
    pub confidence: f32,
    pub affinity: bool,
}

#[derive(Debug, Clone)]
pub struct ReflexClassifier {
    registry: Arc<RuleRegistry>,
    policy: ScoringPolicy,
}

impl ReflexClassifier {
    pub fn new(registry: Arc<RuleRegistry>, policy: ScoringPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    pub fn classify(&self, text: &str, context: &CortexContext) -> LocalClassificationResult {
        let normalized = normalize_text(text, self.policy.max_input_chars);
        if normalized.is_empty() {
            return LocalClassificationResult::none();
        }

        let outcome = self
            .registry
            .lookup_capped(&normalized, self.policy.rule_cap());
        if outcome.matches.is_empty() {
            return LocalClassificationResult {
                budget_exhausted: outcome.budget_exhausted,
                ..LocalClassificationResult::none()
            };
        }

        let input_chars = normalized.chars().count();
        let mut scored = outcome
            .matches
            .into_iter()
            .map(|found| {
                let confidence = self.score(&found, &normalized, input_chars);
                (found, confidence)
            })
            .collect::<Vec<_>>();

        let ranked = scored
            .iter()
            .map(|(found, confidence)| RankedCandidate {
                confidence: *confidence,
                affinity: found.rule.has_affinity(context.location()),
            })
            .collect::<Vec<_>>();
        let chosen = select_with_affinity(&ranked, self.policy.tie_epsilon).unwrap_or(0);

        let alternatives = scored
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != chosen)
            .take(MAX_ALTERNATIVES)
            .map(|(_, (found, confidence))| Candidate {
                intent: found.rule.intent().clone(),
                rule_id: found.rule.id().to_string(),
                confidence: *confidence,
            })
            .collect();

        let (found, confidence) = scored.swap_remove(chosen);

        LocalClassificationResult {
            intent: Some(found.rule.intent().clone()),
            slots: found.slots,
            confidence,
            rule_id: Some(found.rule.id().to_string()),
            span: Some(found.span),
            alternatives,
            budget_exhausted: outcome.budget_exhausted,
        }
    }

    pub fn score(&self, found: &RuleMatch<'_>, normalized: &str, input_chars: usize) -> f32 {
        let policy = &self.policy;

        let priority = found.rule.priority() as f32;
        let priority_score = priority / (priority + policy.priority_half_saturation);

        let matched_chars = normalized
            .get(found.span.start..found.span.end)
            .map(|span| span.chars().count())
            .unwrap_or(0);
        let coverage = if input_chars == 0 {
            0.0
        } else {
            (matched_chars as f32 / input_chars as f32).min(1.0)
        };

        let declared = found.rule.declared_slots();
        let slot_fill = if declared == 0 {
            1.0
        } else {
            found.slots.len() as f32 / declared as f32
        };

        (policy.priority_weight * priority_score
            + policy.coverage_weight * coverage
            + policy.slot_weight * slot_fill)
            .clamp(0.0, 1.0)
    }
}

pub fn select_with_affinity(ranked: &[RankedCandidate], epsilon: f32) -> Option<usize> {
    let top = ranked.first()?;
    if top.affinity {
        return Some(0);
    }

    let preferred = ranked.iter().enumerate().skip(1).find(|(_, candidate)| {
        candidate.affinity
            && (top.confidence - candidate.confidence).abs() <= epsilon + BAND_TOLERANCE
    });

    Some(preferred.map(|(idx, _)| idx).unwrap_or(0))
}
