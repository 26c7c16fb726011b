use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::domain::{now_timestamp, NewOutboxItem, TelemetrySample};
use crate::error::IngestError;
use crate::ports::{ContainerRepository, OutboxRepository};
use crate::service::alert_engine::AlertEngine;

/// What one handled message changed.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub device_id: String,
    pub container_created: bool,
    pub alerts_created: usize,
    pub alerts_resolved: usize,
    pub active_alerts: usize,
}

/// Extracts the device id from `topic`, using the position of the single-level
/// wildcard in the subscription `filter` (e.g. `containers/+/telemetry`).
pub fn parse_device_id(filter: &str, topic: &str) -> Result<String, IngestError> {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    if filter_parts.len() != topic_parts.len() {
        return Err(IngestError::Malformed(format!(
            "topic '{}' does not match '{}'",
            topic, filter
        )));
    }

    let mut device_id = None;
    for (pattern, part) in filter_parts.iter().zip(&topic_parts) {
        match *pattern {
            "+" if device_id.is_none() => device_id = Some(part.trim()),
            "+" => {}
            literal if literal != *part => {
                return Err(IngestError::Malformed(format!(
                    "topic '{}' does not match '{}'",
                    topic, filter
                )))
            }
            _ => {}
        }
    }

    match device_id {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        Some(_) => Err(IngestError::Malformed(format!("empty device id in topic '{}'", topic))),
        None => Err(IngestError::Malformed(format!(
            "subscription '{}' has no device segment",
            filter
        ))),
    }
}

/// Turns raw transport messages into durable local state: the sample, the
/// container's liveness, alert transitions and the outbox items forwarding
/// all of it.
pub struct IngestService {
    containers: Arc<dyn ContainerRepository>,
    outbox: Arc<dyn OutboxRepository>,
    engine: AlertEngine,
    topic_filter: String,
    source_tag: String,
}

impl IngestService {
    pub fn new(
        containers: Arc<dyn ContainerRepository>,
        outbox: Arc<dyn OutboxRepository>,
        engine: AlertEngine,
        topic_filter: impl Into<String>,
        source_tag: impl Into<String>,
    ) -> Self {
        Self {
            containers,
            outbox,
            engine,
            topic_filter: topic_filter.into(),
            source_tag: source_tag.into(),
        }
    }

    /// Handles one message and records its outcome.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<IngestReport, IngestError> {
        let result = self.process(topic, payload).await;
        let outcome = match &result {
            Ok(_) => "stored",
            Err(IngestError::Malformed(_)) => "malformed",
            Err(IngestError::Store(_)) => "store_error",
        };
        metrics::counter!("telemetry_messages_total", 1, "outcome" => outcome);
        result
    }

    #[instrument(
        skip(self, payload),
        fields(topic = %topic, payload_len = payload.len(), device_id = tracing::field::Empty)
    )]
    async fn process(&self, topic: &str, payload: &[u8]) -> Result<IngestReport, IngestError> {
        let received_at = now_timestamp();

        let device_id = parse_device_id(&self.topic_filter, topic)?;
        tracing::Span::current().record("device_id", &device_id.as_str());

        let mut message = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(IngestError::Malformed(format!(
                    "payload must be a JSON object, got {}",
                    json_type(&other)
                )))
            }
            Err(e) => return Err(IngestError::Malformed(format!("invalid JSON: {}", e))),
        };

        let declared_food_type = message
            .get("selected_food_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let sample = TelemetrySample::normalize(&device_id, &mut message, &received_at);
        let normalized = Value::Object(message);

        let recorded = self
            .containers
            .record_telemetry(&sample, &normalized, declared_food_type.as_deref(), &self.source_tag)
            .await?;
        if recorded.created {
            info!("new container registered");
        }

        let outcome = self.engine.evaluate_device(&sample, &recorded.thresholds).await?;

        self.outbox
            .enqueue(&NewOutboxItem::container_summary(&sample, outcome.active))
            .await?;

        debug!(
            created = outcome.created.len(),
            resolved = outcome.resolved.len(),
            active = outcome.active,
            "telemetry stored"
        );

        Ok(IngestReport {
            device_id,
            container_created: recorded.created,
            alerts_created: outcome.created.len(),
            alerts_resolved: outcome.resolved.len(),
            active_alerts: outcome.active,
        })
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Alert, AlertCondition, AlertKey, Container, ContainerConfig, OutboxItem, OutboxKind,
        ThresholdOverrides,
    };
    use crate::ports::{AlertRepository, RecordedTelemetry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const FILTER: &str = "containers/+/telemetry";

    struct MockContainers {
        thresholds: ThresholdOverrides,
        recorded: Mutex<Vec<(TelemetrySample, Value, Option<String>)>>,
        fail: bool,
    }

    impl MockContainers {
        fn new(thresholds: Value) -> Self {
            Self {
                thresholds: ThresholdOverrides::from_value(thresholds).unwrap(),
                recorded: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ContainerRepository for MockContainers {
        async fn record_telemetry(
            &self,
            sample: &TelemetrySample,
            normalized: &Value,
            declared_food_type: Option<&str>,
            _source: &str,
        ) -> anyhow::Result<RecordedTelemetry> {
            if self.fail {
                anyhow::bail!("database is locked");
            }
            let mut recorded = self.recorded.lock().unwrap();
            recorded.push((sample.clone(), normalized.clone(), declared_food_type.map(str::to_string)));
            Ok(RecordedTelemetry {
                thresholds: self.thresholds.clone(),
                created: recorded.len() == 1,
            })
        }

        async fn find_container(&self, _device_id: &str) -> anyhow::Result<Option<Container>> {
            Ok(None)
        }

        async fn update_config(
            &self,
            _device_id: &str,
            _overrides: &ThresholdOverrides,
            _food_type: Option<&str>,
            _source: &str,
        ) -> anyhow::Result<Option<ContainerConfig>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct MockAlerts {
        active: Mutex<HashSet<AlertKey>>,
    }

    #[async_trait]
    impl AlertRepository for MockAlerts {
        async fn active_alert_keys(&self, _device_id: &str) -> anyhow::Result<HashSet<AlertKey>> {
            Ok(self.active.lock().unwrap().clone())
        }

        async fn apply_alert_changes(
            &self,
            device_id: &str,
            create: &[AlertCondition],
            resolve: &[AlertKey],
        ) -> anyhow::Result<Vec<Alert>> {
            let mut active = self.active.lock().unwrap();
            for key in resolve {
                active.remove(key);
            }
            Ok(create
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    active.insert(c.key());
                    Alert {
                        id: i as i64 + 1,
                        device_id: device_id.to_string(),
                        alert_type: c.alert_type.as_str().into(),
                        level: c.level.as_str().into(),
                        message: c.message.clone(),
                        created_at: now_timestamp(),
                        resolved: false,
                    }
                })
                .collect())
        }

        async fn recent_alerts(&self, _device_id: &str, _limit: i64) -> anyhow::Result<Vec<Alert>> {
            Ok(Vec::new())
        }

        async fn clear_alerts(&self, _device_id: &str) -> anyhow::Result<u64> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct MockOutbox {
        items: Mutex<Vec<NewOutboxItem>>,
    }

    #[async_trait]
    impl OutboxRepository for MockOutbox {
        async fn enqueue(&self, item: &NewOutboxItem) -> anyhow::Result<i64> {
            let mut items = self.items.lock().unwrap();
            items.push(item.clone());
            Ok(items.len() as i64)
        }
        async fn drain_candidates(&self, _max_attempts: i64) -> anyhow::Result<Vec<OutboxItem>> {
            Ok(Vec::new())
        }
        async fn ack(&self, _item_id: i64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn fail(&self, _item_id: i64, _error: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn pending_count(&self) -> anyhow::Result<i64> {
            Ok(self.items.lock().unwrap().len() as i64)
        }
        async fn exhausted(&self, _max_attempts: i64) -> anyhow::Result<Vec<OutboxItem>> {
            Ok(Vec::new())
        }
    }

    fn service(containers: Arc<MockContainers>, outbox: Arc<MockOutbox>) -> IngestService {
        let engine = AlertEngine::new(Arc::new(MockAlerts::default()));
        IngestService::new(containers, outbox, engine, FILTER, "pi")
    }

    #[test]
    fn device_id_comes_from_the_wildcard_segment() {
        assert_eq!(parse_device_id(FILTER, "containers/c-42/telemetry").unwrap(), "c-42");
        assert_eq!(parse_device_id("site/a/+/data", "site/a/d1/data").unwrap(), "d1");
    }

    #[test]
    fn mismatched_topics_are_malformed() {
        for topic in ["containers//telemetry", "containers/c1/config", "containers/c1", "other/c1/telemetry"] {
            assert!(
                matches!(parse_device_id(FILTER, topic), Err(IngestError::Malformed(_))),
                "{} should be rejected",
                topic
            );
        }
    }

    #[tokio::test]
    async fn stores_sample_then_enqueues_summary() {
        let containers = Arc::new(MockContainers::new(json!({"temperature": {"critical": 20, "warn": 13}})));
        let outbox = Arc::new(MockOutbox::default());
        let service = service(containers.clone(), outbox.clone());

        let report = service
            .handle(
                "containers/c1/telemetry",
                br#"{"temperature_c": 25, "humidity_pct": 70, "selected_food_type": "bananas"}"#,
            )
            .await
            .unwrap();

        assert!(report.container_created);
        assert_eq!(report.alerts_created, 1);
        assert_eq!(report.active_alerts, 1);

        let recorded = containers.recorded.lock().unwrap();
        let (sample, normalized, food) = &recorded[0];
        assert_eq!(sample.temperature_c, Some(25.0));
        assert_eq!(sample.mq4_ppm, None);
        assert_eq!(food.as_deref(), Some("bananas"));
        // missing event time is stamped before anything is persisted
        assert_eq!(normalized["timestamp"], json!(sample.received_at));

        let items = outbox.items.lock().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, OutboxKind::ContainerSummary);
        assert_eq!(items[0].target_path, "containers/c1");
        assert_eq!(items[0].payload["active_alerts"], json!(1));
        assert_eq!(items[0].payload["status"]["state"], "online");
    }

    #[tokio::test]
    async fn malformed_payloads_touch_nothing() {
        let containers = Arc::new(MockContainers::new(json!({})));
        let outbox = Arc::new(MockOutbox::default());
        let service = service(containers.clone(), outbox.clone());

        for payload in [&b"not json"[..], b"[1,2]", b"42"] {
            let err = service.handle("containers/c1/telemetry", payload).await.unwrap_err();
            assert!(matches!(err, IngestError::Malformed(_)));
        }
        let err = service.handle("containers//telemetry", b"{}").await.unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));

        assert!(containers.recorded.lock().unwrap().is_empty());
        assert!(outbox.items.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failures_are_not_malformed() {
        let mut containers = MockContainers::new(json!({}));
        containers.fail = true;
        let outbox = Arc::new(MockOutbox::default());
        let service = service(Arc::new(containers), outbox.clone());

        let err = service.handle("containers/c1/telemetry", b"{}").await.unwrap_err();
        assert!(matches!(err, IngestError::Store(_)));
        assert!(outbox.items.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replayed_sample_raises_nothing_new() {
        let containers = Arc::new(MockContainers::new(json!({"humidity": {"warn_high": 95}})));
        let outbox = Arc::new(MockOutbox::default());
        let service = service(containers, outbox);
        let payload = br#"{"timestamp": "2024-05-01T12:00:00Z", "humidity_pct": 96}"#;

        let first = service.handle("containers/c1/telemetry", payload).await.unwrap();
        let second = service.handle("containers/c1/telemetry", payload).await.unwrap();

        assert_eq!(first.alerts_created, 1);
        assert_eq!(second.alerts_created, 0);
        assert_eq!(second.alerts_resolved, 0);
        assert_eq!(second.active_alerts, 1);
    }
}
