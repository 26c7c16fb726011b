use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::IngestError;
use crate::service::ingest::IngestService;

/// MQTT ingest loop.
///
/// Drives the event loop and handles telemetry strictly one message at a time,
/// in delivery order. A message is acked once it is durable or found
/// malformed; a local-store failure leaves it unacked so the broker redelivers
/// it on the persistent session.
pub async fn run_ingest_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    ingest: Arc<IngestService>,
    topic: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    client.subscribe(&topic, QoS::AtLeastOnce).await?;
    info!(topic = %topic, "ingest loop started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match ingest.handle(&publish.topic, &publish.payload).await {
                    Ok(_) => {}
                    Err(IngestError::Malformed(reason)) => {
                        warn!(topic = %publish.topic, "dropping message: {}", reason);
                    }
                    Err(e @ IngestError::Store(_)) => {
                        error!(topic = %publish.topic, "{}; leaving message unacked", e);
                        continue;
                    }
                }
                if let Err(e) = client.ack(&publish).await {
                    error!("ack failed: {:?}", e);
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected, resubscribing to {}", topic);
                client.subscribe(&topic, QoS::AtLeastOnce).await?;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {:?}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!("MQTT disconnect failed: {:?}", e);
    }
    info!("ingest loop stopped");
    Ok(())
}
