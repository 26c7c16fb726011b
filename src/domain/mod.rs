mod alert;
mod container;
mod outbox;
mod telemetry;

pub use alert::{Alert, AlertCondition, AlertKey, AlertLevel, AlertType};
pub use container::{Container, ContainerConfig, ThresholdOverrides, UNKNOWN_FOOD_TYPE};
pub use outbox::{NewOutboxItem, OutboxItem, OutboxKind};
pub use telemetry::{GpsFix, TelemetrySample};

use time::format_description::well_known::{Iso8601, Rfc3339};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Fixed-width UTC timestamp (`2024-05-01T12:00:00.000000Z`). Every timestamp
/// the gateway writes goes through here so that text order is time order.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    let fmt = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    at.to_offset(time::UtcOffset::UTC)
        .format(&fmt)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

pub fn now_timestamp() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

/// Parses an RFC 3339 timestamp (or a naive ISO 8601 one, read as UTC),
/// returning it in the gateway's fixed-width form.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    if let Ok(at) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(format_timestamp(at));
    }
    PrimitiveDateTime::parse(raw, &Iso8601::DEFAULT)
        .ok()
        .map(|naive| format_timestamp(naive.assume_utc()))
}

pub fn telemetry_collection(device_id: &str) -> String {
    format!("containers/{}/telemetry", device_id)
}

pub fn alert_collection(device_id: &str) -> String {
    format!("containers/{}/alerts", device_id)
}

pub fn container_document(device_id: &str) -> String {
    format!("containers/{}", device_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn timestamps_are_fixed_width() {
        let a = format_timestamp(datetime!(2024-05-01 12:00:00 UTC));
        let b = format_timestamp(datetime!(2024-05-01 12:00:00.5 UTC));
        let c = format_timestamp(datetime!(2024-05-01 12:00:00.25 UTC));
        assert_eq!(a, "2024-05-01T12:00:00.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < c && c < b);
    }

    #[test]
    fn offsets_are_converted_to_utc() {
        let ts = normalize_timestamp("2024-05-01T14:00:00+02:00").unwrap();
        assert_eq!(ts, "2024-05-01T12:00:00.000000Z");
        assert!(normalize_timestamp("yesterday").is_none());
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let ts = normalize_timestamp("2024-05-01T12:00:00.123456").unwrap();
        assert_eq!(ts, "2024-05-01T12:00:00.123456Z");
    }
}
