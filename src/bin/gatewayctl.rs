use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet};
use telemetry_gateway::adapters::{sqlite, MqttAdapter, SqliteRepository};
use telemetry_gateway::config::AppConfig;
use telemetry_gateway::domain::ContainerConfig;
use telemetry_gateway::error::ThresholdError;
use telemetry_gateway::ports::{AlertRepository, ContainerRepository, OutboxRepository};
use telemetry_gateway::service::ThresholdService;

/// Operator CLI for the gateway's local store.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Device threshold overrides
    #[command(subcommand)]
    Thresholds(ThresholdsCommand),

    /// Forwarding queue
    #[command(subcommand)]
    Outbox(OutboxCommand),

    /// Alert history
    #[command(subcommand)]
    Alerts(AlertsCommand),

    /// Show one container record
    Container { device_id: String },
}

#[derive(Subcommand, Debug)]
enum ThresholdsCommand {
    /// Replace a device's overrides and broadcast the new config
    Set {
        device_id: String,
        /// Overrides as a JSON object, e.g. '{"temperature": {"warn": 8}}'
        overrides: String,
        #[arg(long)]
        food_type: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum OutboxCommand {
    /// Pending and exhausted item counts
    Status,
    /// Items that ran out of delivery attempts
    Exhausted,
}

#[derive(Subcommand, Debug)]
enum AlertsCommand {
    List {
        device_id: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Delete every alert of a device
    Clear { device_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load().context("failed to load configuration")?;

    let pool = sqlite::connect(&config.database_url, 1).await?;
    let repo = Arc::new(SqliteRepository::new(pool));

    match cli.command {
        Command::Thresholds(ThresholdsCommand::Set { device_id, overrides, food_type }) => {
            let overrides: serde_json::Value =
                serde_json::from_str(&overrides).context("overrides must be valid JSON")?;
            let updated = set_thresholds(&config, repo, &device_id, overrides, food_type.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }
        Command::Outbox(OutboxCommand::Status) => {
            let pending = repo.pending_count().await?;
            let exhausted = repo.exhausted(config.sync_max_attempts).await?.len();
            println!("pending:   {}", pending);
            println!("exhausted: {} (max attempts {})", exhausted, config.sync_max_attempts);
        }
        Command::Outbox(OutboxCommand::Exhausted) => {
            let items = repo.exhausted(config.sync_max_attempts).await?;
            if items.is_empty() {
                println!("no exhausted items");
            }
            for item in items {
                println!(
                    "#{} {} {} attempts={} created={} error={}",
                    item.id,
                    item.kind,
                    item.target_path,
                    item.attempts,
                    item.created_at,
                    item.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Alerts(AlertsCommand::List { device_id, limit }) => {
            for alert in repo.recent_alerts(&device_id, limit).await? {
                println!(
                    "#{} {} {}/{} {} {}",
                    alert.id,
                    alert.created_at,
                    alert.alert_type,
                    alert.level,
                    if alert.resolved { "resolved" } else { "ACTIVE" },
                    alert.message
                );
            }
        }
        Command::Alerts(AlertsCommand::Clear { device_id }) => {
            let removed = repo.clear_alerts(&device_id).await?;
            println!("removed {} alerts for {}", removed, device_id);
        }
        Command::Container { device_id } => match repo.find_container(&device_id).await? {
            Some(container) => {
                println!("device:      {}", container.device_id);
                println!("food type:   {}", container.selected_food_type);
                println!("overrides:   {}", container.threshold_overrides.to_value());
                println!("last seen:   {}", container.last_seen.as_deref().unwrap_or("-"));
                println!("modified:    {}", container.last_modified.as_deref().unwrap_or("-"));
                println!("source:      {}", container.source.as_deref().unwrap_or("-"));
            }
            None => anyhow::bail!("device not found: {}", device_id),
        },
    }

    Ok(())
}

/// How long the broker gets to acknowledge the retained config message.
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(10);

async fn set_thresholds(
    config: &AppConfig,
    repo: Arc<SqliteRepository>,
    device_id: &str,
    overrides: serde_json::Value,
    food_type: Option<&str>,
) -> anyhow::Result<ContainerConfig> {
    // Own clean session: must not take over the gateway's persistent one
    let client_id = format!("gatewayctl_{}", uuid::Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(username, config.mqtt_password.clone().unwrap_or_default());
    }
    options.set_keep_alive(Duration::from_secs(5));
    options.set_clean_session(true);

    let (client, eventloop) = AsyncClient::new(options, 10);
    let network = tokio::spawn(wait_for_puback(eventloop));

    let service = ThresholdService::new(repo, Arc::new(MqttAdapter::new(client.clone())), config.source_tag.clone());
    let updated = match service.update_thresholds(device_id, overrides, food_type).await {
        Ok(updated) => updated,
        Err(e) => {
            network.abort();
            return Err(e.into());
        }
    };

    let confirmed = match tokio::time::timeout(BROADCAST_TIMEOUT, network).await {
        Ok(Ok((eventloop, Ok(())))) => Ok(eventloop),
        Ok(Ok((_, Err(e)))) => Err(format!("{}", e)),
        Ok(Err(e)) => Err(format!("network task failed: {}", e)),
        Err(_) => Err(format!("no acknowledgement within {}s", BROADCAST_TIMEOUT.as_secs())),
    };

    match confirmed {
        Ok(mut eventloop) => {
            client.disconnect().await.ok();
            let _ = tokio::time::timeout(Duration::from_secs(2), async {
                while let Ok(event) = eventloop.poll().await {
                    if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                        break;
                    }
                }
            })
            .await;
            Ok(updated)
        }
        Err(reason) => Err(ThresholdError::Publish(anyhow::anyhow!(reason))).context(format!(
            "thresholds for {} are stored and queued for the remote store, but the retained config was not delivered",
            device_id
        )),
    }
}

/// Drives the event loop until the broker acknowledges our publish. Any
/// connection error ends the wait: the message was not delivered.
async fn wait_for_puback(mut eventloop: EventLoop) -> (EventLoop, Result<(), ConnectionError>) {
    let result = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::PubAck(_))) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(e),
        }
    };
    (eventloop, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use telemetry_gateway::domain::{now_timestamp, OutboxKind, TelemetrySample};

    /// Nothing listens on port 1, so every connection attempt is refused.
    fn unreachable_broker() -> AppConfig {
        AppConfig {
            mqtt_host: "127.0.0.1".into(),
            mqtt_port: 1,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id_prefix: "edge_gateway".into(),
            instance_id: "test".into(),
            telemetry_topic: "containers/+/telemetry".into(),
            database_url: "sqlite::memory:".into(),
            sync_interval_secs: 10,
            sync_max_attempts: 5,
            sync_offline_backoff_factor: 5,
            remote_base_url: "http://127.0.0.1:1".into(),
            remote_project_id: "demo".into(),
            remote_database: "(default)".into(),
            remote_auth_token: None,
            remote_timeout_secs: 1,
            source_tag: "pi".into(),
            metrics_port: 9000,
            otlp_endpoint: None,
        }
    }

    #[tokio::test]
    async fn connection_errors_end_the_wait_with_an_error() {
        let options = MqttOptions::new("gatewayctl_test", "127.0.0.1", 1);
        let (_client, eventloop) = AsyncClient::new(options, 10);

        let (_, result) = tokio::time::timeout(Duration::from_secs(5), wait_for_puback(eventloop))
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn undelivered_broadcast_is_reported_after_commit() {
        let repo = Arc::new(SqliteRepository::new(sqlite::connect_in_memory().await.unwrap()));
        let mut payload = json!({"temperature_c": 4}).as_object().cloned().unwrap();
        let sample = TelemetrySample::normalize("c1", &mut payload, &now_timestamp());
        repo.record_telemetry(&sample, &serde_json::Value::Object(payload), None, "pi")
            .await
            .unwrap();

        let err = set_thresholds(&unreachable_broker(), repo.clone(), "c1", json!({"temperature": {"warn": 8}}), None)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("retained config was not delivered"));

        let container = repo.find_container("c1").await.unwrap().unwrap();
        assert_eq!(container.threshold_overrides.bound("temperature", "warn"), Some(8.0));
        let configs = repo
            .drain_candidates(5)
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.kind == OutboxKind::Config.as_str())
            .count();
        // one from registration, one from the update
        assert_eq!(configs, 2);
    }
}
