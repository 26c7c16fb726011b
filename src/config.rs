use serde::Deserialize;
use std::env;
use std::time::Duration;
use anyhow::Context;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id_prefix: String,
    pub instance_id: String,
    pub telemetry_topic: String,
    pub database_url: String,
    pub sync_interval_secs: u64,
    pub sync_max_attempts: i64,
    pub sync_offline_backoff_factor: u32,
    pub remote_base_url: String,
    pub remote_project_id: String,
    pub remote_database: String,
    pub remote_auth_token: Option<String>,
    pub remote_timeout_secs: u64,
    pub source_tag: String,
    pub metrics_port: u16,
    pub otlp_endpoint: Option<String>,
}

/// Connection settings for the remote document store.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub project_id: String,
    pub database: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

/// Pacing and retry policy of the sync dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub interval: Duration,
    pub max_attempts: i64,
    /// Multiplier applied to `interval` while the remote store is unreachable.
    pub offline_backoff_factor: u32,
}

impl DispatcherConfig {
    pub fn offline_interval(&self) -> Duration {
        self.interval * self.offline_backoff_factor.max(1)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 5,
            offline_backoff_factor: 5,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists, ignore if not

        let config = AppConfig {
            mqtt_host: var_or("MQTT_HOST", "localhost"),
            mqtt_port: var_or("MQTT_PORT", "1883")
                .parse()
                .context("MQTT_PORT must be a valid u16")?,
            mqtt_username: optional_var("MQTT_USERNAME"),
            mqtt_password: optional_var("MQTT_PASSWORD"),
            mqtt_client_id_prefix: var_or("MQTT_CLIENT_ID_PREFIX", "edge_gateway"),
            instance_id: var_or("INSTANCE_ID", "1"),
            telemetry_topic: var_or("TELEMETRY_TOPIC", "containers/+/telemetry"),
            database_url: var_or("DATABASE_URL", "sqlite://gateway.db"),
            sync_interval_secs: var_or("SYNC_INTERVAL_SECS", "10")
                .parse()
                .context("SYNC_INTERVAL_SECS must be a number of seconds")?,
            sync_max_attempts: var_or("SYNC_MAX_ATTEMPTS", "5")
                .parse()
                .context("SYNC_MAX_ATTEMPTS must be an integer")?,
            sync_offline_backoff_factor: var_or("SYNC_OFFLINE_BACKOFF_FACTOR", "5")
                .parse()
                .context("SYNC_OFFLINE_BACKOFF_FACTOR must be a positive integer")?,
            remote_base_url: var_or("REMOTE_BASE_URL", "https://firestore.googleapis.com/v1"),
            remote_project_id: var_or("REMOTE_PROJECT_ID", ""),
            remote_database: var_or("REMOTE_DATABASE", "(default)"),
            remote_auth_token: optional_var("REMOTE_AUTH_TOKEN"),
            remote_timeout_secs: var_or("REMOTE_TIMEOUT_SECS", "15")
                .parse()
                .context("REMOTE_TIMEOUT_SECS must be a number of seconds")?,
            source_tag: var_or("GATEWAY_SOURCE_TAG", "pi"),
            metrics_port: var_or("METRICS_PORT", "9000")
                .parse()
                .context("METRICS_PORT must be a valid u16")?,
            otlp_endpoint: optional_var("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if config.sync_max_attempts < 1 {
            anyhow::bail!("SYNC_MAX_ATTEMPTS must be at least 1");
        }

        Ok(config)
    }

    pub fn remote(&self) -> RemoteConfig {
        RemoteConfig {
            base_url: self.remote_base_url.clone(),
            project_id: self.remote_project_id.clone(),
            database: self.remote_database.clone(),
            auth_token: self.remote_auth_token.clone(),
            timeout: Duration::from_secs(self.remote_timeout_secs),
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            interval: Duration::from_secs(self.sync_interval_secs),
            max_attempts: self.sync_max_attempts,
            offline_backoff_factor: self.sync_offline_backoff_factor,
        }
    }
}
