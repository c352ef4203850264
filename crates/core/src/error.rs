use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RegistryLoadError {
    #[error("duplicate rule id `{id}`")]
    DuplicateRuleId { id: String },

    #[error("rule with empty id (intent `{intent}`)")]
    EmptyRuleId { intent: String },

    #[error("rule `{rule_id}` targets undeclared intent `{intent}`")]
    UnknownIntent { rule_id: String, intent: String },

    #[error("intent `{intent}` declared more than once")]
    DuplicateIntent { intent: String },

    #[error("intent name `{intent}` is reserved")]
    ReservedIntent { intent: String },

    #[error("rule `{rule_id}` has an invalid pattern: {reason}")]
    InvalidPattern { rule_id: String, reason: String },

    #[error("rule bundle declares no rules")]
    Empty,

    #[error("failed reading rule source {}: {reason}", path.display())]
    Io { path: PathBuf, reason: String },

    #[error("failed parsing rule source {source_name}: {reason}")]
    Parse { source_name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainOrderingError {
    #[error("chain has no steps")]
    Empty,

    #[error("step {step} (`{intent}`) requires slot `{slot}` that no other step produces")]
    UnresolvedDependency {
        step: usize,
        intent: String,
        slot: String,
    },

    #[error("dependency cycle between steps {steps:?}")]
    Cycle { steps: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("scoring weights must sum to 1.0, got {sum}")]
    WeightSum { sum: f32 },

    #[error("{name} must be greater than zero")]
    NonPositive { name: &'static str },
}
