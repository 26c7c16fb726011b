use serde_json::{json, Value};

/// Condition type. Humidity direction is part of the type so that a high and a
/// low humidity warning are two distinct alert instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertType {
    Temperature,
    HumidityHigh,
    HumidityLow,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Temperature => "temperature",
            AlertType::HumidityHigh => "humidity_high",
            AlertType::HumidityLow => "humidity_low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertLevel {
    Warn,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warn => "warn",
            AlertLevel::Critical => "critical",
        }
    }
}

/// Dedup key of an alert: at most one unresolved alert per device and key.
///
/// Kept as plain strings so that rows written with types this build does not
/// know still take part in the diff (and get resolved).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub alert_type: String,
    pub level: String,
}

impl AlertKey {
    pub fn new(alert_type: impl Into<String>, level: impl Into<String>) -> Self {
        Self { alert_type: alert_type.into(), level: level.into() }
    }
}

/// A condition the engine found to be active for one reading.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCondition {
    pub alert_type: AlertType,
    pub level: AlertLevel,
    pub message: String,
}

impl AlertCondition {
    pub fn key(&self) -> AlertKey {
        AlertKey::new(self.alert_type.as_str(), self.level.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Alert {
    pub id: i64,
    pub device_id: String,
    pub alert_type: String,
    pub level: String,
    pub message: String,
    pub created_at: String,
    pub resolved: bool,
}

impl Alert {
    pub fn key(&self) -> AlertKey {
        AlertKey::new(self.alert_type.clone(), self.level.clone())
    }

    /// Snapshot forwarded to the remote store. `timestamp` doubles as the
    /// remote document id.
    pub fn to_payload(&self) -> Value {
        let metric = match self.alert_type.as_str() {
            "humidity_high" | "humidity_low" => "humidity",
            other => other,
        };
        json!({
            "id": self.id,
            "device_id": self.device_id,
            "type": self.alert_type,
            "metric": metric,
            "level": self.level,
            "message": self.message,
            "timestamp": self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(alert_type: &str) -> Alert {
        Alert {
            id: 7,
            device_id: "c1".into(),
            alert_type: alert_type.into(),
            level: "warn".into(),
            message: "Low humidity: 40%".into(),
            created_at: "2024-05-01T12:00:00.000000Z".into(),
            resolved: false,
        }
    }

    #[test]
    fn payload_groups_humidity_directions_under_one_metric() {
        let payload = alert(AlertType::HumidityLow.as_str()).to_payload();
        assert_eq!(payload["type"], "humidity_low");
        assert_eq!(payload["metric"], "humidity");
        assert_eq!(payload["timestamp"], "2024-05-01T12:00:00.000000Z");

        assert_eq!(alert("temperature").to_payload()["metric"], "temperature");
    }
}
