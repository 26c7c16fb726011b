use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    now_timestamp, Alert, AlertCondition, AlertKey, Container, ContainerConfig, NewOutboxItem,
    OutboxItem, TelemetrySample, ThresholdOverrides, UNKNOWN_FOOD_TYPE,
};
use crate::ports::{AlertRepository, ContainerRepository, OutboxRepository, RecordedTelemetry};

/// Opens the gateway database and applies the embedded migrations.
pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid DATABASE_URL '{}'", database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .context("failed to open local store")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to apply local store migrations")?;

    Ok(pool)
}

/// Private in-memory database. One connection that never expires, otherwise
/// the database vanishes with it.
pub async fn connect_in_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Appends an outbox row on the caller's connection, so it commits or rolls
/// back together with the state change it represents.
async fn insert_outbox_item(conn: &mut SqliteConnection, item: &NewOutboxItem) -> anyhow::Result<i64> {
    let result = sqlx::query(
        "INSERT INTO outbox (kind, target_path, payload, attempts, created_at) VALUES (?, ?, ?, 0, ?)",
    )
    .bind(item.kind.as_str())
    .bind(&item.target_path)
    .bind(serde_json::to_string(&item.payload)?)
    .bind(now_timestamp())
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

fn parse_overrides(device_id: &str, raw: &str) -> ThresholdOverrides {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(device_id, "unreadable threshold_overrides, treating as empty: {}", e);
        ThresholdOverrides::default()
    })
}

#[derive(sqlx::FromRow)]
struct ContainerRow {
    device_id: String,
    selected_food_type: String,
    threshold_overrides: String,
    last_seen: Option<String>,
    last_modified: Option<String>,
    source: Option<String>,
}

impl From<ContainerRow> for Container {
    fn from(row: ContainerRow) -> Self {
        Container {
            threshold_overrides: parse_overrides(&row.device_id, &row.threshold_overrides),
            device_id: row.device_id,
            selected_food_type: row.selected_food_type,
            last_seen: row.last_seen,
            last_modified: row.last_modified,
            source: row.source,
        }
    }
}

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ContainerRepository for SqliteRepository {
    #[instrument(skip(self, sample, normalized), fields(device_id = %sample.device_id, timestamp = %sample.timestamp))]
    async fn record_telemetry(
        &self,
        sample: &TelemetrySample,
        normalized: &Value,
        declared_food_type: Option<&str>,
        source: &str,
    ) -> anyhow::Result<RecordedTelemetry> {
        let device_id = sample.device_id.as_str();
        let food_type = declared_food_type.unwrap_or(UNKNOWN_FOOD_TYPE);
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query(
            r#"
            INSERT INTO containers (device_id, selected_food_type, threshold_overrides, last_seen, last_modified, source)
            VALUES (?, ?, '{}', ?, ?, ?)
            ON CONFLICT (device_id) DO NOTHING
            "#,
        )
        .bind(device_id)
        .bind(food_type)
        .bind(&sample.received_at)
        .bind(&sample.received_at)
        .bind(source)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if created {
            // The remote container document must exist before summaries update it.
            let config = ContainerConfig {
                device_id: device_id.to_string(),
                selected_food_type: food_type.to_string(),
                threshold_overrides: ThresholdOverrides::default(),
                last_modified: sample.received_at.clone(),
                source: source.to_string(),
            };
            insert_outbox_item(&mut tx, &NewOutboxItem::config(&config)).await?;
            info!("registered new container (food type '{}')", food_type);
        } else {
            sqlx::query("UPDATE containers SET last_seen = ? WHERE device_id = ?")
                .bind(&sample.received_at)
                .bind(device_id)
                .execute(&mut *tx)
                .await?;
        }

        let gps = sample.gps.clone().unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO telemetry (device_id, timestamp, received_at, temperature_c, humidity_pct, mq4_ppm, lat, lon, fix, satellites)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(&sample.timestamp)
        .bind(&sample.received_at)
        .bind(sample.temperature_c)
        .bind(sample.humidity_pct)
        .bind(sample.mq4_ppm)
        .bind(gps.lat)
        .bind(gps.lon)
        .bind(gps.fix)
        .bind(gps.satellites)
        .execute(&mut *tx)
        .await?;

        insert_outbox_item(&mut tx, &NewOutboxItem::telemetry(device_id, normalized.clone())).await?;

        let (raw_overrides,): (String,) =
            sqlx::query_as("SELECT threshold_overrides FROM containers WHERE device_id = ?")
                .bind(device_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        debug!("telemetry stored");

        Ok(RecordedTelemetry {
            thresholds: parse_overrides(device_id, &raw_overrides),
            created,
        })
    }

    async fn find_container(&self, device_id: &str) -> anyhow::Result<Option<Container>> {
        let row = sqlx::query_as::<_, ContainerRow>(
            r#"
            SELECT device_id, selected_food_type, threshold_overrides, last_seen, last_modified, source
            FROM containers WHERE device_id = ?
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Container::from))
    }

    #[instrument(skip(self, overrides), fields(device_id = %device_id))]
    async fn update_config(
        &self,
        device_id: &str,
        overrides: &ThresholdOverrides,
        food_type: Option<&str>,
        source: &str,
    ) -> anyhow::Result<Option<ContainerConfig>> {
        let now = now_timestamp();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE containers
            SET threshold_overrides = ?,
                selected_food_type = COALESCE(?, selected_food_type),
                last_modified = ?,
                source = ?
            WHERE device_id = ?
            "#,
        )
        .bind(serde_json::to_string(overrides)?)
        .bind(food_type)
        .bind(&now)
        .bind(source)
        .bind(device_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }

        let (selected_food_type,): (String,) =
            sqlx::query_as("SELECT selected_food_type FROM containers WHERE device_id = ?")
                .bind(device_id)
                .fetch_one(&mut *tx)
                .await?;

        let config = ContainerConfig {
            device_id: device_id.to_string(),
            selected_food_type,
            threshold_overrides: overrides.clone(),
            last_modified: now,
            source: source.to_string(),
        };
        insert_outbox_item(&mut tx, &NewOutboxItem::config(&config)).await?;
        tx.commit().await?;

        Ok(Some(config))
    }
}

#[async_trait]
impl AlertRepository for SqliteRepository {
    async fn active_alert_keys(&self, device_id: &str) -> anyhow::Result<HashSet<AlertKey>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT alert_type, level FROM alerts WHERE device_id = ? AND resolved = 0",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(alert_type, level)| AlertKey { alert_type, level })
            .collect())
    }

    #[instrument(skip(self, create, resolve), fields(device_id = %device_id, create = create.len(), resolve = resolve.len()))]
    async fn apply_alert_changes(
        &self,
        device_id: &str,
        create: &[AlertCondition],
        resolve: &[AlertKey],
    ) -> anyhow::Result<Vec<Alert>> {
        let mut tx = self.pool.begin().await?;

        for key in resolve {
            sqlx::query(
                r#"
                UPDATE alerts SET resolved = 1
                WHERE device_id = ? AND alert_type = ? AND level = ? AND resolved = 0
                "#,
            )
            .bind(device_id)
            .bind(&key.alert_type)
            .bind(&key.level)
            .execute(&mut *tx)
            .await?;
        }

        let mut created = Vec::with_capacity(create.len());
        for condition in create {
            let created_at = now_timestamp();
            let result = sqlx::query(
                r#"
                INSERT INTO alerts (device_id, alert_type, level, message, created_at, resolved)
                VALUES (?, ?, ?, ?, ?, 0)
                ON CONFLICT (device_id, alert_type, level) WHERE resolved = 0 DO NOTHING
                "#,
            )
            .bind(device_id)
            .bind(condition.alert_type.as_str())
            .bind(condition.level.as_str())
            .bind(&condition.message)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                warn!(alert_type = condition.alert_type.as_str(), level = condition.level.as_str(), "alert already active, not duplicated");
                continue;
            }

            let alert = Alert {
                id: result.last_insert_rowid(),
                device_id: device_id.to_string(),
                alert_type: condition.alert_type.as_str().to_string(),
                level: condition.level.as_str().to_string(),
                message: condition.message.clone(),
                created_at,
                resolved: false,
            };
            insert_outbox_item(&mut tx, &NewOutboxItem::alert(&alert)).await?;
            created.push(alert);
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn recent_alerts(&self, device_id: &str, limit: i64) -> anyhow::Result<Vec<Alert>> {
        let alerts = sqlx::query_as::<_, Alert>(
            r#"
            SELECT id, device_id, alert_type, level, message, created_at, resolved
            FROM alerts WHERE device_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(alerts)
    }

    async fn clear_alerts(&self, device_id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM alerts WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await?;

        info!(device_id, "cleared {} alerts", result.rows_affected());
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OutboxRepository for SqliteRepository {
    async fn enqueue(&self, item: &NewOutboxItem) -> anyhow::Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_outbox_item(&mut conn, item).await
    }

    async fn drain_candidates(&self, max_attempts: i64) -> anyhow::Result<Vec<OutboxItem>> {
        let items = sqlx::query_as::<_, OutboxItem>(
            r#"
            SELECT id, kind, target_path, payload, attempts, last_error, created_at
            FROM outbox
            WHERE attempts < ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn ack(&self, item_id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM outbox WHERE id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, item_id: i64, error: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = ? WHERE id = ?")
            .bind(error)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_count(&self) -> anyhow::Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn exhausted(&self, max_attempts: i64) -> anyhow::Result<Vec<OutboxItem>> {
        let items = sqlx::query_as::<_, OutboxItem>(
            r#"
            SELECT id, kind, target_path, payload, attempts, last_error, created_at
            FROM outbox
            WHERE attempts >= ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }
}
