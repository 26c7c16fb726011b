use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{
    Alert, AlertCondition, AlertKey, Container, ContainerConfig, NewOutboxItem, OutboxItem,
    TelemetrySample, ThresholdOverrides,
};
use crate::error::RemoteError;

/// Result of persisting one telemetry sample.
#[derive(Debug, Clone)]
pub struct RecordedTelemetry {
    /// Device-level overrides in effect when the sample was stored.
    pub thresholds: ThresholdOverrides,
    /// The container row was created by this sample.
    pub created: bool,
}

#[async_trait]
pub trait ContainerRepository: Send + Sync {
    /// One unit of work: create the container if absent, bump `last_seen`,
    /// append the sample and enqueue its `telemetry` outbox item.
    async fn record_telemetry(
        &self,
        sample: &TelemetrySample,
        normalized: &Value,
        declared_food_type: Option<&str>,
        source: &str,
    ) -> anyhow::Result<RecordedTelemetry>;

    async fn find_container(&self, device_id: &str) -> anyhow::Result<Option<Container>>;

    /// Replace overrides/profile and enqueue the resulting `config` snapshot in
    /// the same transaction. `None` when the device is unknown.
    async fn update_config(
        &self,
        device_id: &str,
        overrides: &ThresholdOverrides,
        food_type: Option<&str>,
        source: &str,
    ) -> anyhow::Result<Option<ContainerConfig>>;
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Keys of the device's unresolved alerts.
    async fn active_alert_keys(&self, device_id: &str) -> anyhow::Result<HashSet<AlertKey>>;

    /// Resolve `resolve`, create one alert per entry of `create` and enqueue an
    /// `alert` outbox item for each created alert. Returns the created rows.
    async fn apply_alert_changes(
        &self,
        device_id: &str,
        create: &[AlertCondition],
        resolve: &[AlertKey],
    ) -> anyhow::Result<Vec<Alert>>;

    async fn recent_alerts(&self, device_id: &str, limit: i64) -> anyhow::Result<Vec<Alert>>;

    /// Bulk clear: physically deletes every alert of the device.
    async fn clear_alerts(&self, device_id: &str) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Append with `attempts = 0`. Never rejects a well-formed item.
    async fn enqueue(&self, item: &NewOutboxItem) -> anyhow::Result<i64>;

    /// Items with `attempts < max_attempts`, oldest first.
    async fn drain_candidates(&self, max_attempts: i64) -> anyhow::Result<Vec<OutboxItem>>;

    /// Delivered (or undeliverable): delete the item.
    async fn ack(&self, item_id: i64) -> anyhow::Result<()>;

    /// Increment `attempts` and record the error. Never deletes.
    async fn fail(&self, item_id: i64, error: &str) -> anyhow::Result<()>;

    async fn pending_count(&self) -> anyhow::Result<i64>;

    /// Items left in place after running out of attempts.
    async fn exhausted(&self, max_attempts: i64) -> anyhow::Result<Vec<OutboxItem>>;
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish data to a specific topic (QoS 1).
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()>;
}

/// Logical writes against the remote document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Full overwrite of `collection_path/document_id`.
    async fn put(&self, collection_path: &str, document_id: &str, fields: &Value) -> Result<(), RemoteError>;

    /// Partial update, creating the document if absent.
    async fn merge(&self, collection_path: &str, document_id: &str, fields: &Value) -> Result<(), RemoteError>;

    /// Partial update of an existing document; fails if it is absent.
    async fn update(&self, document_path: &str, fields: &Value) -> Result<(), RemoteError>;

    /// Cheap connectivity check run before each drain.
    async fn probe(&self) -> Result<(), RemoteError>;
}
