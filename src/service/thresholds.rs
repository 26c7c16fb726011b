use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument};

use crate::domain::{ContainerConfig, ThresholdOverrides};
use crate::error::ThresholdError;
use crate::ports::{ContainerRepository, MessageBroker};

/// Retained per-device configuration topic read by the container itself.
pub fn config_topic(device_id: &str) -> String {
    format!("containers/{}/config", device_id)
}

pub struct ThresholdService {
    containers: Arc<dyn ContainerRepository>,
    broker: Arc<dyn MessageBroker>,
    source_tag: String,
}

impl ThresholdService {
    pub fn new(
        containers: Arc<dyn ContainerRepository>,
        broker: Arc<dyn MessageBroker>,
        source_tag: impl Into<String>,
    ) -> Self {
        Self {
            containers,
            broker,
            source_tag: source_tag.into(),
        }
    }

    /// Replaces the device's overrides (and profile, when given).
    ///
    /// The record and its `config` outbox item are committed first; the
    /// retained broadcast follows. A failed broadcast is reported as
    /// [`ThresholdError::Publish`] with the new state already durable.
    #[instrument(skip(self, overrides), fields(device_id = %device_id))]
    pub async fn update_thresholds(
        &self,
        device_id: &str,
        overrides: Value,
        food_type: Option<&str>,
    ) -> Result<ContainerConfig, ThresholdError> {
        let overrides = ThresholdOverrides::from_value(overrides).ok_or(ThresholdError::InvalidOverrides)?;

        let config = self
            .containers
            .update_config(device_id, &overrides, food_type, &self.source_tag)
            .await?
            .ok_or_else(|| ThresholdError::DeviceNotFound(device_id.to_string()))?;

        let message = serde_json::to_vec(&config).map_err(|e| ThresholdError::Publish(e.into()))?;
        self.broker
            .publish(&config_topic(device_id), message, true)
            .await
            .map_err(ThresholdError::Publish)?;

        info!(
            food_type = %config.selected_food_type,
            cleared = overrides.is_empty(),
            "thresholds updated"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{now_timestamp, Container, TelemetrySample};
    use crate::ports::RecordedTelemetry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct MockContainers {
        food_type: Mutex<String>,
    }

    #[async_trait]
    impl ContainerRepository for MockContainers {
        async fn record_telemetry(
            &self,
            _sample: &TelemetrySample,
            _normalized: &Value,
            _declared_food_type: Option<&str>,
            _source: &str,
        ) -> anyhow::Result<RecordedTelemetry> {
            unimplemented!()
        }

        async fn find_container(&self, _device_id: &str) -> anyhow::Result<Option<Container>> {
            Ok(None)
        }

        async fn update_config(
            &self,
            device_id: &str,
            overrides: &ThresholdOverrides,
            food_type: Option<&str>,
            source: &str,
        ) -> anyhow::Result<Option<ContainerConfig>> {
            if device_id != "c1" {
                return Ok(None);
            }
            let mut current = self.food_type.lock().unwrap();
            if let Some(food_type) = food_type {
                *current = food_type.to_string();
            }
            Ok(Some(ContainerConfig {
                device_id: device_id.to_string(),
                selected_food_type: current.clone(),
                threshold_overrides: overrides.clone(),
                last_modified: now_timestamp(),
                source: source.to_string(),
            }))
        }
    }

    struct MockBroker {
        published: Mutex<Vec<(String, Vec<u8>, bool)>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageBroker for MockBroker {
        async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("client disconnected");
            }
            self.published.lock().unwrap().push((topic.to_string(), payload, retain));
            Ok(())
        }
    }

    fn setup(fail_publish: bool) -> (ThresholdService, Arc<MockBroker>) {
        let containers = Arc::new(MockContainers { food_type: Mutex::new("bananas".into()) });
        let broker = Arc::new(MockBroker { published: Mutex::new(Vec::new()), fail: fail_publish });
        (ThresholdService::new(containers, broker.clone(), "pi"), broker)
    }

    #[tokio::test]
    async fn publishes_retained_config_snapshot() {
        let (service, broker) = setup(false);

        let config = service
            .update_thresholds("c1", json!({"temperature": {"warn": 8}}), None)
            .await
            .unwrap();
        assert_eq!(config.selected_food_type, "bananas");
        assert_eq!(config.source, "pi");

        let published = broker.published.lock().unwrap();
        let (topic, payload, retain) = &published[0];
        assert_eq!(topic, "containers/c1/config");
        assert!(*retain);

        let body: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(body["device_id"], "c1");
        assert_eq!(body["threshold_overrides"], json!({"temperature": {"warn": 8}}));
        assert_eq!(body["selected_food_type"], "bananas");
        assert!(body["last_modified"].is_string());
    }

    #[tokio::test]
    async fn food_type_is_replaced_when_given() {
        let (service, _) = setup(false);
        let config = service.update_thresholds("c1", json!({}), Some("fish")).await.unwrap();
        assert_eq!(config.selected_food_type, "fish");
        assert!(config.threshold_overrides.is_empty());
    }

    #[tokio::test]
    async fn rejects_non_object_overrides() {
        let (service, broker) = setup(false);
        let err = service.update_thresholds("c1", json!([1]), None).await.unwrap_err();
        assert!(matches!(err, ThresholdError::InvalidOverrides));
        assert!(broker.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_device_is_reported() {
        let (service, _) = setup(false);
        let err = service.update_thresholds("ghost", json!({}), None).await.unwrap_err();
        assert!(matches!(err, ThresholdError::DeviceNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn publish_failure_is_distinct() {
        let (service, _) = setup(true);
        let err = service.update_thresholds("c1", json!({}), None).await.unwrap_err();
        assert!(matches!(err, ThresholdError::Publish(_)));
    }
}
