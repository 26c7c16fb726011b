use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use super::{format_timestamp, normalize_timestamp};

/// Positioning fix reported by the container's GPS module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub fix: Option<i64>,
    pub satellites: Option<i64>,
}

impl GpsFix {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            lat: obj.get("lat").and_then(Value::as_f64),
            lon: obj.get("lon").and_then(Value::as_f64),
            fix: obj.get("fix").and_then(as_integer),
            satellites: obj.get("satellites").and_then(as_integer),
        })
    }
}

/// One telemetry row. Readings the device did not send stay `None`; they are
/// never coerced to zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub device_id: String,
    /// Producer-supplied event time (normalized).
    pub timestamp: String,
    /// Gateway receipt time.
    pub received_at: String,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub mq4_ppm: Option<f64>,
    pub gps: Option<GpsFix>,
}

impl TelemetrySample {
    /// Normalizes `payload` in place and extracts the sample from it.
    ///
    /// The event timestamp is rewritten to the gateway's fixed-width form. A
    /// numeric timestamp is read as unix seconds; a missing, empty or
    /// unparsable one is replaced by the receipt time so the forwarded copy
    /// always carries a usable document id. An unparsable string survives as
    /// `device_timestamp`.
    pub fn normalize(device_id: &str, payload: &mut Map<String, Value>, received_at: &str) -> Self {
        let timestamp = match payload.get("timestamp").cloned() {
            Some(Value::String(raw)) => match normalize_timestamp(&raw) {
                Some(ts) => ts,
                None => {
                    // unparsable producer clock: kept for inspection, never used as a document id
                    if !raw.trim().is_empty() {
                        payload.insert("device_timestamp".to_string(), Value::String(raw));
                    }
                    received_at.to_string()
                }
            },
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
                .map(format_timestamp)
                .unwrap_or_else(|| received_at.to_string()),
            _ => received_at.to_string(),
        };
        payload.insert("timestamp".to_string(), Value::String(timestamp.clone()));

        Self {
            device_id: device_id.to_string(),
            timestamp,
            received_at: received_at.to_string(),
            temperature_c: payload.get("temperature_c").and_then(Value::as_f64),
            humidity_pct: payload.get("humidity_pct").and_then(Value::as_f64),
            mq4_ppm: payload.get("mq4_ppm").and_then(Value::as_f64),
            gps: payload.get("gps").and_then(GpsFix::from_value),
        }
    }

    pub fn get_value(&self, key: &str) -> Option<f64> {
        match key {
            "temperature" => self.temperature_c,
            "humidity" => self.humidity_pct,
            "gas" | "mq4" => self.mq4_ppm,
            _ => None,
        }
    }

    /// `latest_telemetry` block of the container summary document.
    pub fn latest_telemetry(&self) -> Value {
        json!({
            "timestamp": self.timestamp,
            "temperature_c": self.temperature_c,
            "humidity_pct": self.humidity_pct,
            "mq4_ppm": self.mq4_ppm,
            "gps": self.gps,
        })
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}
