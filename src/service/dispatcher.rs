use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DispatcherConfig;
use crate::domain::{OutboxItem, OutboxKind};
use crate::error::RemoteError;
use crate::ports::{DocumentStore, OutboxRepository};

/// Fields of a `config` snapshot written to the per-device document.
const CONFIG_FIELDS: [&str; 4] = ["selected_food_type", "threshold_overrides", "last_modified", "source"];

/// Result of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub delivered: usize,
    pub failed: usize,
    pub discarded: usize,
    /// The remote store was unreachable; the rest of the cycle was skipped.
    pub offline: bool,
}

/// Drains the outbox into the remote document store on a fixed interval.
pub struct SyncDispatcher {
    outbox: Arc<dyn OutboxRepository>,
    remote: Arc<dyn DocumentStore>,
    config: DispatcherConfig,
}

impl SyncDispatcher {
    pub fn new(outbox: Arc<dyn OutboxRepository>, remote: Arc<dyn DocumentStore>, config: DispatcherConfig) -> Self {
        Self { outbox, remote, config }
    }

    /// Runs cycles until `cancel` fires. The wait between cycles is the normal
    /// interval, or the offline interval after the remote store was found
    /// unreachable.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_attempts = self.config.max_attempts,
            "sync dispatcher started"
        );

        loop {
            let wait = match self.run_cycle().await {
                Ok(report) if report.offline => {
                    warn!(
                        retry_in_secs = self.config.offline_interval().as_secs(),
                        "remote store unreachable, backing off"
                    );
                    self.config.offline_interval()
                }
                Ok(report) => {
                    if report != CycleReport::default() {
                        info!(
                            delivered = report.delivered,
                            failed = report.failed,
                            discarded = report.discarded,
                            "sync cycle finished"
                        );
                    }
                    self.config.interval
                }
                Err(e) => {
                    error!("sync cycle aborted: {:#}", e);
                    self.config.interval
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("sync dispatcher stopped");
    }

    /// Probes the remote store, then delivers every drain candidate in order.
    ///
    /// Errors are local-store errors only; remote failures are recorded on the
    /// items themselves.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::default();

        if let Err(e) = self.remote.probe().await {
            debug!("probe failed: {}", e);
            report.offline = true;
            self.record_pending().await;
            return Ok(report);
        }

        let items = self.outbox.drain_candidates(self.config.max_attempts).await?;

        for item in items {
            let kind = match item.parsed_kind() {
                Ok(kind) => kind,
                Err(reason) => {
                    warn!(outbox_id = item.id, kind = %item.kind, "discarding undeliverable item: {}", reason);
                    self.outbox.ack(item.id).await?;
                    metrics::counter!("outbox_discarded_total", 1, "kind" => item.kind.clone());
                    report.discarded += 1;
                    continue;
                }
            };

            match self.deliver(kind, &item).await {
                Ok(()) => {
                    self.outbox.ack(item.id).await?;
                    metrics::counter!("outbox_delivered_total", 1, "kind" => kind.as_str());
                    report.delivered += 1;
                }
                Err(e) => {
                    let attempt = item.attempts + 1;
                    self.outbox.fail(item.id, &e.to_string()).await?;
                    metrics::counter!("outbox_failed_total", 1, "kind" => kind.as_str());
                    report.failed += 1;

                    if attempt >= self.config.max_attempts {
                        error!(outbox_id = item.id, %kind, attempts = attempt, "giving up on item: {}", e);
                    } else {
                        warn!(outbox_id = item.id, %kind, attempts = attempt, "delivery failed: {}", e);
                    }

                    if matches!(e, RemoteError::Unreachable(_)) {
                        report.offline = true;
                        break;
                    }
                }
            }
        }

        self.record_pending().await;
        metrics::histogram!("sync_cycle_duration_seconds", started.elapsed().as_secs_f64());
        Ok(report)
    }

    #[instrument(skip(self, item), fields(outbox_id = item.id, kind = %kind, target = %item.target_path))]
    async fn deliver(&self, kind: OutboxKind, item: &OutboxItem) -> Result<(), RemoteError> {
        let payload: Value = serde_json::from_str(&item.payload)
            .map_err(|e| RemoteError::InvalidPayload(format!("payload is not JSON: {}", e)))?;

        match kind {
            OutboxKind::Telemetry | OutboxKind::Alert => {
                // event time is the document id; same timestamp overwrites
                let document_id = payload
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .filter(|ts| !ts.is_empty())
                    .ok_or_else(|| RemoteError::InvalidPayload("missing timestamp".into()))?
                    .to_string();
                self.remote.put(&item.target_path, &document_id, &payload).await
            }
            OutboxKind::Config => {
                let (collection, document_id) = item
                    .target_path
                    .rsplit_once('/')
                    .filter(|(c, d)| !c.is_empty() && !d.is_empty())
                    .ok_or_else(|| RemoteError::InvalidPayload(format!("bad config path '{}'", item.target_path)))?;

                match payload.get("device_id").and_then(Value::as_str) {
                    Some(id) if id == document_id => {}
                    _ => {
                        return Err(RemoteError::InvalidPayload(format!(
                            "config payload does not belong to '{}'",
                            document_id
                        )))
                    }
                }

                let fields: Map<String, Value> = CONFIG_FIELDS
                    .iter()
                    .filter_map(|name| payload.get(*name).map(|v| (name.to_string(), v.clone())))
                    .collect();
                self.remote.merge(collection, document_id, &Value::Object(fields)).await
            }
            OutboxKind::ContainerSummary => self.remote.update(&item.target_path, &payload).await,
        }
    }

    async fn record_pending(&self) {
        match self.outbox.pending_count().await {
            Ok(pending) => metrics::gauge!("outbox_pending", pending as f64),
            Err(e) => debug!("could not count pending items: {:#}", e),
        }
    }
}
