pub mod config;
pub mod coordinator;
pub mod flags;

pub use config::{
    BackendSettings, PipelineConfig, DEFAULT_AUTO_ACCEPT_THRESHOLD, DEFAULT_ORCHESTRATOR_TIMEOUT,
};
pub use coordinator::{Classification, FallbackChainCoordinator, PipelineState};
pub use flags::{FeatureFlags, StaticFlags, ESCALATION_FLAG};
