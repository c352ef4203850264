use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

pub const ESCALATION_FLAG: &str = "cortex.orchestrator_escalation";

pub trait FeatureFlags: Send + Sync {
    fn is_enabled(&self, name: &str) -> bool;
}

impl<T: FeatureFlags + ?Sized> FeatureFlags for Arc<T> {
    fn is_enabled(&self, name: &str) -> bool {
        (**self).is_enabled(name)
    }
}

#[derive(Debug, Default)]
pub struct StaticFlags {
    enabled: RwLock<HashSet<String>>,
}

impl StaticFlags {
    pub fn new<I, S>(enabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: RwLock::new(enabled.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set(&self, name: &str, enabled: bool) {
        let mut flags = self.enabled.write();
        if enabled {
            flags.insert(name.to_string());
        } else {
            flags.remove(name);
        }
    }

    pub fn enabled(&self) -> Vec<String> {
        let mut names = self.enabled.read().iter().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl FeatureFlags for StaticFlags {
    fn is_enabled(&self, name: &str) -> bool {
        self.enabled.read().contains(name)
    }
}
