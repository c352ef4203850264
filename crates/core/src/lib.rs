pub mod chain;
pub mod config;
pub mod error;
pub mod models;
pub mod ordering;
pub mod pattern;
pub mod reflex;
pub mod registry;
pub mod text;

pub use chain::{build_chain_from_reflex, build_fallback_chain, ReflexHint};
pub use config::ScoringPolicy;
pub use error::{ChainOrderingError, ConfigError, RegistryLoadError};
pub use models::*;
pub use ordering::{is_dependency_ordered, order_steps, OrderedChain};
pub use pattern::PatternSpec;
pub use reflex::{select_with_affinity, RankedCandidate, ReflexClassifier};
pub use registry::{
    IntentDefinition, RegistrySummary, Rule, RuleMatch, RuleRegistry, RuleSet, RuleSpec,
    SharedRegistry,
};
pub use text::{detect_locale, normalize_text};
