use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use crate::ports::MessageBroker;
use tracing::instrument;
use std::time::Duration;
use crate::config::AppConfig;

pub struct MqttAdapter {
    client: AsyncClient,
}

impl MqttAdapter {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    /// Builds the client and its event loop. The event loop is driven by the
    /// ingest loop, which also owns acknowledgements.
    pub fn build(config: &AppConfig) -> (AsyncClient, EventLoop) {
        // Stable client id so the broker keeps our persistent session across restarts
        let client_id = format!("{}_{}", config.mqtt_client_id_prefix, config.instance_id);

        let mut mqttoptions = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(username, config.mqtt_password.clone().unwrap_or_default());
        }
        mqttoptions.set_keep_alive(Duration::from_secs(30));

        // QoS 1 with manual acks: a message whose processing hit a store error
        // is not acked and gets redelivered.
        mqttoptions.set_clean_session(false);
        mqttoptions.set_manual_acks(true);

        AsyncClient::new(mqttoptions, 100)
    }
}

#[async_trait]
impl MessageBroker for MqttAdapter {
    #[instrument(skip(self, payload), fields(topic = %topic, payload_size = payload.len(), retain))]
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| anyhow::anyhow!("MQTT publish failed: {:?}", e))?;
        Ok(())
    }
}
