use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};

use super::{alert_collection, container_document, telemetry_collection, Alert, ContainerConfig, TelemetrySample};

/// Delivery kind of an outbox item; selects the remote write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxKind {
    Telemetry,
    Alert,
    Config,
    ContainerSummary,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::Telemetry => "telemetry",
            OutboxKind::Alert => "alert",
            OutboxKind::Config => "config",
            OutboxKind::ContainerSummary => "container_summary",
        }
    }
}

impl fmt::Display for OutboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telemetry" => Ok(OutboxKind::Telemetry),
            "alert" => Ok(OutboxKind::Alert),
            "config" => Ok(OutboxKind::Config),
            "container_summary" => Ok(OutboxKind::ContainerSummary),
            other => Err(format!("unknown outbox kind '{}'", other)),
        }
    }
}

/// Work to append to the outbox. The payload is an owned snapshot taken at
/// enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxItem {
    pub kind: OutboxKind,
    pub target_path: String,
    pub payload: Value,
}

impl NewOutboxItem {
    pub fn telemetry(device_id: &str, normalized: Value) -> Self {
        Self {
            kind: OutboxKind::Telemetry,
            target_path: telemetry_collection(device_id),
            payload: normalized,
        }
    }

    pub fn alert(alert: &Alert) -> Self {
        Self {
            kind: OutboxKind::Alert,
            target_path: alert_collection(&alert.device_id),
            payload: alert.to_payload(),
        }
    }

    pub fn config(config: &ContainerConfig) -> Self {
        Self {
            kind: OutboxKind::Config,
            target_path: container_document(&config.device_id),
            payload: json!({
                "device_id": config.device_id,
                "selected_food_type": config.selected_food_type,
                "threshold_overrides": config.threshold_overrides,
                "last_modified": config.last_modified,
                "source": config.source,
            }),
        }
    }

    pub fn container_summary(sample: &TelemetrySample, active_alerts: usize) -> Self {
        Self {
            kind: OutboxKind::ContainerSummary,
            target_path: container_document(&sample.device_id),
            payload: json!({
                "last_seen": sample.received_at,
                "latest_telemetry": sample.latest_telemetry(),
                "status": {"state": "online"},
                "active_alerts": active_alerts,
            }),
        }
    }
}

/// A persisted outbox row. `kind` is kept raw: rows with a kind this build
/// does not know must still be drained (and discarded).
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OutboxItem {
    pub id: i64,
    pub kind: String,
    pub target_path: String,
    pub payload: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
}

impl OutboxItem {
    pub fn parsed_kind(&self) -> Result<OutboxKind, String> {
        self.kind.parse()
    }
}
