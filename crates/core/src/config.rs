use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// Worst case for one compiled rule against a `max_input_chars` input.
pub const RULE_EVAL_COST: Duration = Duration::from_micros(5);

// confidence = wp * p / (p + half_saturation) + wc * coverage + ws * slot_fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub priority_weight: f32,
    pub coverage_weight: f32,
    pub slot_weight: f32,
    pub priority_half_saturation: f32,
    pub tie_epsilon: f32,
    #[serde(with = "duration_micros")]
    pub budget: Duration,
    pub max_input_chars: usize,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            priority_weight: 0.3,
            coverage_weight: 0.5,
            slot_weight: 0.2,
            priority_half_saturation: 5.0,
            tie_epsilon: 0.05,
            budget: Duration::from_micros(2_000),
            max_input_chars: 256,
        }
    }
}

impl ScoringPolicy {
    // Rules the reflex layer may try within `budget`; fixed per policy.
    pub fn rule_cap(&self) -> usize {
        let cap = self.budget.as_micros() / RULE_EVAL_COST.as_micros();
        usize::try_from(cap).unwrap_or(usize::MAX).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("priority_weight", self.priority_weight),
            ("coverage_weight", self.coverage_weight),
            ("slot_weight", self.slot_weight),
        ] {
            unit_range(name, value)?;
        }

        let sum = self.priority_weight + self.coverage_weight + self.slot_weight;
        if (sum - 1.0).abs() > 1e-4 {
            return Err(ConfigError::WeightSum { sum });
        }

        if self.priority_half_saturation.is_nan() || self.priority_half_saturation <= 0.0 {
            return Err(ConfigError::NonPositive {
                name: "priority_half_saturation",
            });
        }
        unit_range("tie_epsilon", self.tie_epsilon)?;
        if self.budget.is_zero() {
            return Err(ConfigError::NonPositive { name: "budget" });
        }
        if self.max_input_chars == 0 {
            return Err(ConfigError::NonPositive {
                name: "max_input_chars",
            });
        }
        Ok(())
    }
}

pub fn unit_range(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            min: 0.0,
            max: 1.0,
        })
    }
}

mod duration_micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}
