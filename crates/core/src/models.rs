use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text::detect_locale;

pub const MAX_RECENT_ACTIONS: usize = 8;

pub const UNKNOWN_INTENT: &str = "unknown";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    En,
    Es,
    Fr,
    He,
    Ar,
    Ru,
    #[default]
    Unknown,
}

impl Locale {
    pub fn from_optional_str(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::Unknown;
        };
        let lower = value.trim().to_lowercase();
        match lower.split(['-', '_']).next().unwrap_or_default() {
            "en" | "english" => Self::En,
            "es" | "spanish" => Self::Es,
            "fr" | "french" => Self::Fr,
            "he" | "hebrew" => Self::He,
            "ar" | "arabic" => Self::Ar,
            "ru" | "russian" => Self::Ru,
            _ => Self::Unknown,
        }
    }

    pub fn as_code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::He => "he",
            Self::Ar => "ar",
            Self::Ru => "ru",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Physician,
    Nurse,
    Reception,
    Admin,
    #[default]
    Unknown,
}

impl UserRole {
    pub fn from_optional_str(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("physician" | "doctor" | "clinician") => Self::Physician,
            Some("nurse") => Self::Nurse,
            Some("reception" | "front_desk" | "frontdesk") => Self::Reception,
            Some("admin" | "administrator") => Self::Admin,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Physician => "physician",
            Self::Nurse => "nurse",
            Self::Reception => "reception",
            Self::Admin => "admin",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentType(String);

impl IntentType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_INTENT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_INTENT
    }
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IntentType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentAction {
    pub intent: IntentType,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CortexContext {
    active_record: Option<String>,
    location: String,
    recent_actions: Vec<RecentAction>,
    role: UserRole,
    locale: Locale,
}

impl CortexContext {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn active_record(&self) -> Option<&str> {
        self.active_record.as_deref()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn recent_actions(&self) -> &[RecentAction] {
        &self.recent_actions
    }

    pub fn last_intent(&self) -> Option<&IntentType> {
        self.recent_actions.last().map(|action| &action.intent)
    }

    pub fn role(&self) -> UserRole {
        self.role
    }

    pub fn locale(&self) -> Locale {
        self.locale
    }
}

impl Default for CortexContext {
    fn default() -> Self {
        ContextBuilder::default().build()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    active_record: Option<String>,
    location: Option<String>,
    recent_actions: Vec<RecentAction>,
    role: UserRole,
    locale: Option<Locale>,
}

impl ContextBuilder {
    pub fn active_record(mut self, record_id: impl Into<String>) -> Self {
        let record_id = record_id.into();
        let trimmed = record_id.trim();
        self.active_record = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn recent_action(mut self, action: RecentAction) -> Self {
        self.recent_actions.push(action);
        self
    }

    pub fn recent_actions(mut self, actions: impl IntoIterator<Item = RecentAction>) -> Self {
        self.recent_actions.extend(actions);
        self
    }

    pub fn role(mut self, role: UserRole) -> Self {
        self.role = role;
        self
    }

    pub fn locale(mut self, locale: Locale) -> Self {
        self.locale = (locale != Locale::Unknown).then_some(locale);
        self
    }

    pub fn build(self) -> CortexContext {
        self.finish(Locale::Unknown)
    }

    pub fn build_for(self, text: &str) -> CortexContext {
        let detected = detect_locale(text);
        self.finish(detected)
    }

    fn finish(mut self, fallback_locale: Locale) -> CortexContext {
        if self.recent_actions.len() > MAX_RECENT_ACTIONS {
            let keep_from = self.recent_actions.len() - MAX_RECENT_ACTIONS;
            self.recent_actions = self.recent_actions.split_off(keep_from);
        }

        let location = self
            .location
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "/".to_string());

        CortexContext {
            active_record: self.active_record,
            location,
            recent_actions: self.recent_actions,
            role: self.role,
            locale: self.locale.unwrap_or(fallback_locale),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextInput {
    #[serde(default)]
    pub active_record: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub recent_actions: Vec<RecentAction>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

impl ContextInput {
    pub fn into_context(self, text: &str) -> CortexContext {
        let mut builder = CortexContext::builder()
            .recent_actions(self.recent_actions)
            .role(UserRole::from_optional_str(self.role.as_deref()))
            .locale(Locale::from_optional_str(self.locale.as_deref()));
        if let Some(record) = self.active_record {
            builder = builder.active_record(record);
        }
        if let Some(location) = self.location {
            builder = builder.location(location);
        }
        builder.build_for(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Reflex,
    Orchestrator,
    DefaultUnknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSpan {
    pub start: usize,
    pub end: usize,
}

impl MatchSpan {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub intent: IntentType,
    pub rule_id: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalClassificationResult {
    pub intent: Option<IntentType>,
    pub slots: BTreeMap<String, String>,
    pub confidence: f32,
    pub rule_id: Option<String>,
    pub span: Option<MatchSpan>,
    pub alternatives: Vec<Candidate>,
    pub budget_exhausted: bool,
}

impl LocalClassificationResult {
    pub fn none() -> Self {
        Self {
            intent: None,
            slots: BTreeMap::new(),
            confidence: 0.0,
            rule_id: None,
            span: None,
            alternatives: Vec::new(),
            budget_exhausted: false,
        }
    }

    pub fn is_match(&self) -> bool {
        self.intent.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CortexIntent {
    pub intent: IntentType,
    pub slots: BTreeMap<String, String>,
    pub confidence: f32,
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_rule: Option<String>,
}

impl CortexIntent {
    pub fn unknown() -> Self {
        Self {
            intent: IntentType::unknown(),
            slots: BTreeMap::new(),
            confidence: 0.0,
            provenance: Provenance::DefaultUnknown,
            requires: Vec::new(),
            produces: Vec::new(),
            source_rule: None,
        }
    }
}

// Non-empty and dependency-ordered. Outside this crate the only way in is
// `IntentChain::new` or `order_steps`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentChain {
    steps: Vec<CortexIntent>,
}

impl IntentChain {
    // A lone step is ordered only if it requires nothing.
    pub(crate) fn single(intent: CortexIntent) -> Self {
        debug_assert!(intent.requires.is_empty());
        Self {
            steps: vec![intent],
        }
    }

    pub fn unknown() -> Self {
        Self::single(CortexIntent::unknown())
    }

    pub(crate) fn from_ordered(steps: Vec<CortexIntent>) -> Self {
        debug_assert!(!steps.is_empty());
        Self { steps }
    }

    pub fn steps(&self) -> &[CortexIntent] {
        &self.steps
    }

    pub fn first(&self) -> &CortexIntent {
        &self.steps[0]
    }

    pub fn is_unknown(&self) -> bool {
        self.steps.len() == 1 && self.steps[0].intent.is_unknown()
    }

    pub fn min_confidence(&self) -> f32 {
        self.steps
            .iter()
            .map(|step| step.confidence)
            .fold(f32::INFINITY, f32::min)
    }
}
