use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::RegistryLoadError;
use crate::models::{IntentType, MatchSpan, UNKNOWN_INTENT};
use crate::pattern::{CompiledPattern, PatternSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDefinition {
    pub name: IntentType,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub intent: IntentType,
    pub pattern: PatternSpec,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub slots: BTreeMap<String, String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub intents: Vec<IntentDefinition>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl RuleSet {
    pub fn from_json_str(raw: &str, source_name: &str) -> Result<Self, RegistryLoadError> {
        serde_json::from_str(raw).map_err(|err| RegistryLoadError::Parse {
            source_name: source_name.to_string(),
            reason: err.to_string(),
        })
    }

    pub fn merge(&mut self, other: RuleSet) {
        if self.version.is_empty() {
            self.version = other.version;
        } else if !other.version.is_empty() && other.version != self.version {
            self.version = format!("{}+{}", self.version, other.version);
        }
        self.intents.extend(other.intents);
        self.rules.extend(other.rules);
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    id: String,
    intent: IntentType,
    pattern: CompiledPattern,
    priority: u32,
    slot_map: BTreeMap<String, String>,
    locations: Vec<String>,
    description: Option<String>,
}

impl Rule {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn intent(&self) -> &IntentType {
        &self.intent
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn declared_slots(&self) -> usize {
        self.pattern.captures().len()
    }

    // `/patients` covers `/patients/42/notes`; `*` covers everything.
    pub fn has_affinity(&self, location: &str) -> bool {
        self.locations.iter().any(|entry| {
            let entry = entry.trim_end_matches('/');
            entry == "*"
                || location == entry
                || location
                    .strip_prefix(entry)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    fn slot_name<'a>(&'a self, capture: &'a str) -> &'a str {
        self.slot_map
            .get(capture)
            .map(String::as_str)
            .unwrap_or(capture)
    }
}

#[derive(Debug, Clone)]
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
    pub span: MatchSpan,
    pub slots: BTreeMap<String, String>,
    pub literal_chars: usize,
}

#[derive(Debug, Clone)]
pub struct LookupOutcome<'a> {
    pub matches: Vec<RuleMatch<'a>>,
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub version: String,
    pub source: String,
    pub loaded_at: DateTime<Utc>,
    pub intents: Vec<IntentType>,
    pub rules: Vec<String>,
}

// Rules sorted by descending priority, then id.
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    version: String,
    source: String,
    loaded_at: DateTime<Utc>,
    intents: Vec<IntentDefinition>,
    rules: Vec<Rule>,
}

impl RuleRegistry {
    pub fn from_rule_set(
        set: RuleSet,
        source: impl Into<String>,
    ) -> Result<Self, RegistryLoadError> {
        let mut declared = HashSet::new();
        for definition in &set.intents {
            let name = definition.name.as_str();
            if name.trim().is_empty() || name == UNKNOWN_INTENT {
                return Err(RegistryLoadError::ReservedIntent {
                    intent: name.to_string(),
                });
            }
            if !declared.insert(name.to_string()) {
                return Err(RegistryLoadError::DuplicateIntent {
                    intent: name.to_string(),
                });
            }
        }

        let mut seen_ids = HashSet::new();
        let mut rules = Vec::new();
        for spec in set.rules.into_iter().filter(|spec| spec.enabled) {
            rules.push(compile_rule(spec, &declared, &mut seen_ids)?);
        }

        if rules.is_empty() {
            return Err(RegistryLoadError::Empty);
        }

        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        Ok(Self {
            version: set.version,
            source: source.into(),
            loaded_at: Utc::now(),
            intents: set.intents,
            rules,
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, RegistryLoadError> {
        Self::from_rule_set(RuleSet::from_json_str(raw, "inline")?, "inline")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryLoadError> {
        let path = path.as_ref();
        let mut files = Vec::new();

        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.map_err(|err| RegistryLoadError::Io {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })?;
                let is_json = entry.path().extension().and_then(|ext| ext.to_str()) == Some("json");
                if entry.file_type().is_file() && is_json {
                    files.push(entry.into_path());
                }
            }
        } else {
            files.push(path.to_path_buf());
        }

        let mut merged = RuleSet::default();
        for file in &files {
            let raw = fs::read_to_string(file).map_err(|err| RegistryLoadError::Io {
                path: file.clone(),
                reason: err.to_string(),
            })?;
            merged.merge(RuleSet::from_json_str(&raw, &file.display().to_string())?);
        }

        Self::from_rule_set(merged, path.display().to_string())
    }

    pub fn lookup(&self, text: &str) -> Vec<RuleMatch<'_>> {
        self.lookup_capped(text, usize::MAX).matches
    }

    // Tries at most `max_rules` rules in priority order; anything skipped
    // ranks below everything tried.
    pub fn lookup_capped(&self, text: &str, max_rules: usize) -> LookupOutcome<'_> {
        let mut matches = Vec::new();

        for rule in self.rules.iter().take(max_rules) {
            if let Some(found) = rule.pattern.find(text) {
                let span_chars = text[found.span.start..found.span.end].chars().count();
                let slots = found
                    .captures
                    .into_iter()
                    .map(|(capture, value)| (rule.slot_name(&capture).to_string(), value))
                    .collect();
                matches.push(RuleMatch {
                    rule,
                    span: found.span,
                    slots,
                    literal_chars: span_chars.saturating_sub(found.captured_chars),
                });
            }
        }

        matches.sort_by(rank);
        LookupOutcome {
            matches,
            budget_exhausted: self.rules.len() > max_rules,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn intents(&self) -> &[IntentDefinition] {
        &self.intents
    }

    pub fn has_intent(&self, intent: &IntentType) -> bool {
        intent.is_unknown() || self.intents.iter().any(|def| &def.name == intent)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.id == id)
    }

    pub fn summary(&self) -> RegistrySummary {
        RegistrySummary {
            version: self.version.clone(),
            source: self.source.clone(),
            loaded_at: self.loaded_at,
            intents: self.intents.iter().map(|def| def.name.clone()).collect(),
            rules: self.rules.iter().map(|rule| rule.id.clone()).collect(),
        }
    }
}

fn compile_rule(
    spec: RuleSpec,
    declared: &HashSet<String>,
    seen_ids: &mut HashSet<String>,
) -> Result<Rule, RegistryLoadError> {
    let id = spec.id.trim().to_string();
    if id.is_empty() {
        return Err(RegistryLoadError::EmptyRuleId {
            intent: spec.intent.to_string(),
        });
    }
    if !seen_ids.insert(id.clone()) {
        return Err(RegistryLoadError::DuplicateRuleId { id });
    }
    if !declared.contains(spec.intent.as_str()) {
        return Err(RegistryLoadError::UnknownIntent {
            rule_id: id,
            intent: spec.intent.to_string(),
        });
    }

    let invalid = |reason: String| RegistryLoadError::InvalidPattern {
        rule_id: id.clone(),
        reason,
    };

    let pattern = CompiledPattern::compile(&spec.pattern).map_err(invalid)?;

    for capture in spec.slots.keys() {
        if !pattern.captures().contains(capture) {
            return Err(invalid(format!(
                "slot mapping references unknown capture `{capture}`"
            )));
        }
    }
    let mut slot_names = HashSet::new();
    for capture in pattern.captures() {
        let name = spec.slots.get(capture).unwrap_or(capture);
        if !slot_names.insert(name.clone()) {
            return Err(invalid(format!("two captures map to slot `{name}`")));
        }
    }

    Ok(Rule {
        id: id.clone(),
        intent: spec.intent,
        pattern,
        priority: spec.priority,
        slot_map: spec.slots,
        locations: spec.locations,
        description: spec.description,
    })
}

// Priority first, then specificity (slots captured, literal text matched), then id.
fn rank(a: &RuleMatch<'_>, b: &RuleMatch<'_>) -> Ordering {
    b.rule
        .priority
        .cmp(&a.rule.priority)
        .then_with(|| b.slots.len().cmp(&a.slots.len()))
        .then_with(|| b.literal_chars.cmp(&a.literal_chars))
        .then_with(|| a.rule.id.cmp(&b.rule.id))
}

#[derive(Debug, Clone)]
pub struct SharedRegistry {
    current: Arc<RwLock<Arc<RuleRegistry>>>,
}

impl SharedRegistry {
    pub fn new(registry: RuleRegistry) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleRegistry> {
        self.current.read().clone()
    }

    pub fn replace(&self, registry: RuleRegistry) -> Arc<RuleRegistry> {
        let next = Arc::new(registry);
        std::mem::replace(&mut *self.current.write(), next)
    }

    pub fn reload_from(&self, path: impl AsRef<Path>) -> Result<Arc<RuleRegistry>, RegistryLoadError> {
        let next = Arc::new(RuleRegistry::load(path)?);
        *self.current.write() = Arc::clone(&next);
        Ok(next)
    }
}
