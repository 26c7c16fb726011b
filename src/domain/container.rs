use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const UNKNOWN_FOOD_TYPE: &str = "unknown";

/// Device-level threshold overrides, e.g.
/// `{"temperature": {"critical": 20, "warn": 13}, "humidity": {"warn_high": 95}}`.
///
/// There is no fallback to a food-profile default: a bound that is not here is
/// not evaluated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdOverrides(Map<String, Value>);

impl ThresholdOverrides {
    /// Accepts only a JSON object. Anything else is not a threshold mapping.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn bound(&self, metric: &str, name: &str) -> Option<f64> {
        self.0.get(metric)?.get(name)?.as_f64()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub device_id: String,
    pub selected_food_type: String,
    pub threshold_overrides: ThresholdOverrides,
    pub last_seen: Option<String>,
    pub last_modified: Option<String>,
    pub source: Option<String>,
}

/// Full config snapshot. This is the retained MQTT broadcast and the payload of
/// `config` outbox items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub device_id: String,
    pub selected_food_type: String,
    pub threshold_overrides: ThresholdOverrides,
    pub last_modified: String,
    pub source: String,
}
