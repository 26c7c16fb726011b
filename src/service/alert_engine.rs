//! Stateful alert evaluation.
//!
//! Desired state is recomputed from scratch for every sample and diffed
//! against the unresolved alerts in the store. Nothing is remembered between
//! invocations, so re-running after a crash (or replaying a sample) cannot
//! double-fire an alert.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{info, instrument};

use crate::domain::{Alert, AlertCondition, AlertKey, AlertLevel, AlertType, TelemetrySample, ThresholdOverrides};
use crate::ports::AlertRepository;

/// Conditions that should be active for `sample` under `thresholds`.
///
/// A missing bound or a missing reading never counts as a violation.
pub fn evaluate(sample: &TelemetrySample, thresholds: &ThresholdOverrides) -> Vec<AlertCondition> {
    let mut conditions = Vec::new();

    if let Some(temp) = sample.get_value("temperature") {
        // critical takes precedence; at most one temperature condition per pass
        if thresholds.bound("temperature", "critical").map_or(false, |b| temp > b) {
            conditions.push(AlertCondition {
                alert_type: AlertType::Temperature,
                level: AlertLevel::Critical,
                message: format!("Critical temperature: {}°C", temp),
            });
        } else if thresholds.bound("temperature", "warn").map_or(false, |b| temp > b) {
            conditions.push(AlertCondition {
                alert_type: AlertType::Temperature,
                level: AlertLevel::Warn,
                message: format!("High temperature: {}°C", temp),
            });
        }
    }

    if let Some(humidity) = sample.get_value("humidity") {
        if thresholds.bound("humidity", "warn_high").map_or(false, |b| humidity > b) {
            conditions.push(AlertCondition {
                alert_type: AlertType::HumidityHigh,
                level: AlertLevel::Warn,
                message: format!("High humidity: {}%", humidity),
            });
        }
        if thresholds.bound("humidity", "warn_low").map_or(false, |b| humidity < b) {
            conditions.push(AlertCondition {
                alert_type: AlertType::HumidityLow,
                level: AlertLevel::Warn,
                message: format!("Low humidity: {}%", humidity),
            });
        }
    }

    conditions
}

/// Alerts to create and to resolve for one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertPlan {
    pub create: Vec<AlertCondition>,
    pub resolve: Vec<AlertKey>,
}

impl AlertPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.resolve.is_empty()
    }
}

/// `create = evaluated - active`, `resolve = active - evaluated`, over the
/// (type, level) key.
pub fn plan(evaluated: &[AlertCondition], active: &HashSet<AlertKey>) -> AlertPlan {
    let evaluated_keys: HashSet<AlertKey> = evaluated.iter().map(AlertCondition::key).collect();

    let mut seen = HashSet::new();
    let create = evaluated
        .iter()
        .filter(|c| {
            let key = c.key();
            !active.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect();

    let resolve: BTreeSet<AlertKey> = active.difference(&evaluated_keys).cloned().collect();

    AlertPlan {
        create,
        resolve: resolve.into_iter().collect(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlertOutcome {
    pub created: Vec<Alert>,
    pub resolved: Vec<AlertKey>,
    /// Unresolved alerts for the device after applying the plan.
    pub active: usize,
}

pub struct AlertEngine {
    alerts: Arc<dyn AlertRepository>,
}

impl AlertEngine {
    pub fn new(alerts: Arc<dyn AlertRepository>) -> Self {
        Self { alerts }
    }

    /// Reads the active set, diffs it against the evaluation and writes the
    /// result (new alerts are enqueued for forwarding by the repository).
    #[instrument(skip(self, sample, thresholds), fields(device_id = %sample.device_id))]
    pub async fn evaluate_device(
        &self,
        sample: &TelemetrySample,
        thresholds: &ThresholdOverrides,
    ) -> anyhow::Result<AlertOutcome> {
        let device_id = sample.device_id.as_str();
        let active = self.alerts.active_alert_keys(device_id).await?;
        let evaluated = evaluate(sample, thresholds);
        let plan = plan(&evaluated, &active);

        if plan.is_empty() {
            return Ok(AlertOutcome {
                active: active.len(),
                ..Default::default()
            });
        }

        let created = self
            .alerts
            .apply_alert_changes(device_id, &plan.create, &plan.resolve)
            .await?;

        for key in &plan.resolve {
            info!(alert_type = %key.alert_type, level = %key.level, "alert resolved");
            metrics::counter!("alerts_resolved_total", 1);
        }
        for alert in &created {
            info!(alert_id = alert.id, alert_type = %alert.alert_type, level = %alert.level, "alert raised: {}", alert.message);
            metrics::counter!("alerts_created_total", 1, "type" => alert.alert_type.clone(), "level" => alert.level.clone());
        }

        let still_active = active.len().saturating_sub(plan.resolve.len());
        Ok(AlertOutcome {
            active: still_active + created.len(),
            created,
            resolved: plan.resolve,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    fn reading(temperature_c: Option<f64>, humidity_pct: Option<f64>) -> TelemetrySample {
        TelemetrySample {
            device_id: "c1".into(),
            timestamp: "2024-05-01T12:00:00.000000Z".into(),
            received_at: "2024-05-01T12:00:00.100000Z".into(),
            temperature_c,
            humidity_pct,
            mq4_ppm: None,
            gps: None,
        }
    }

    fn thresholds(value: serde_json::Value) -> ThresholdOverrides {
        ThresholdOverrides::from_value(value).unwrap()
    }

    fn keys(conditions: &[AlertCondition]) -> Vec<AlertKey> {
        conditions.iter().map(AlertCondition::key).collect()
    }

    #[test]
    fn critical_temperature_wins_over_warn() {
        let t = thresholds(json!({"temperature": {"critical": 20, "warn": 13}}));
        let found = evaluate(&reading(Some(25.0), Some(70.0)), &t);

        assert_eq!(keys(&found), vec![AlertKey::new("temperature", "critical")]);
        assert_eq!(found[0].message, "Critical temperature: 25°C");
    }

    #[test]
    fn warn_temperature_between_bounds() {
        let t = thresholds(json!({"temperature": {"critical": 20, "warn": 13}}));
        let found = evaluate(&reading(Some(15.5), None), &t);
        assert_eq!(keys(&found), vec![AlertKey::new("temperature", "warn")]);
    }

    #[test]
    fn humidity_directions_are_independent() {
        // inverted bounds make both directions fire at once
        let t = thresholds(json!({"humidity": {"warn_high": 40, "warn_low": 60}}));
        let found = evaluate(&reading(None, Some(50.0)), &t);

        assert_eq!(
            keys(&found),
            vec![AlertKey::new("humidity_high", "warn"), AlertKey::new("humidity_low", "warn")]
        );
    }

    #[test]
    fn absence_is_not_a_violation() {
        let t = thresholds(json!({"temperature": {"warn": 5}}));
        assert!(evaluate(&reading(None, Some(99.0)), &t).is_empty());
        assert!(evaluate(&reading(Some(99.0), None), &ThresholdOverrides::default()).is_empty());
    }

    #[test]
    fn bounds_are_exclusive() {
        let t = thresholds(json!({"temperature": {"warn": 5}, "humidity": {"warn_low": 50}}));
        assert!(evaluate(&reading(Some(5.0), Some(50.0)), &t).is_empty());
    }

    #[test]
    fn plan_is_a_set_difference() {
        let t = thresholds(json!({"temperature": {"critical": 20}, "humidity": {"warn_high": 95}}));
        let evaluated = evaluate(&reading(Some(25.0), Some(40.0)), &t);
        let active: HashSet<_> = [
            AlertKey::new("temperature", "critical"),
            AlertKey::new("humidity_high", "warn"),
        ]
        .into_iter()
        .collect();

        let plan = plan(&evaluated, &active);
        assert!(plan.create.is_empty());
        assert_eq!(plan.resolve, vec![AlertKey::new("humidity_high", "warn")]);
    }

    #[test]
    fn replaying_a_sample_plans_nothing() {
        let t = thresholds(json!({"temperature": {"critical": 20, "warn": 13}}));
        let sample = reading(Some(25.0), None);

        let first = plan(&evaluate(&sample, &t), &HashSet::new());
        assert_eq!(first.create.len(), 1);

        let active: HashSet<_> = keys(&first.create).into_iter().collect();
        let second = plan(&evaluate(&sample, &t), &active);
        assert!(second.is_empty());
    }

    #[test]
    fn unknown_persisted_types_are_resolved() {
        let active: HashSet<_> = [AlertKey::new("test", "info")].into_iter().collect();
        let plan = plan(&[], &active);
        assert_eq!(plan.resolve, vec![AlertKey::new("test", "info")]);
    }

    /// In-memory alert table keyed the same way as the store.
    struct MockAlerts {
        rows: Mutex<Vec<Alert>>,
    }

    impl MockAlerts {
        fn new() -> Self {
            Self { rows: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl AlertRepository for MockAlerts {
        async fn active_alert_keys(&self, device_id: &str) -> anyhow::Result<HashSet<AlertKey>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|a| a.device_id == device_id && !a.resolved)
                .map(Alert::key)
                .collect())
        }

        async fn apply_alert_changes(
            &self,
            device_id: &str,
            create: &[AlertCondition],
            resolve: &[AlertKey],
        ) -> anyhow::Result<Vec<Alert>> {
            let mut rows = self.rows.lock().unwrap();
            for row in rows.iter_mut() {
                if row.device_id == device_id && resolve.contains(&row.key()) {
                    row.resolved = true;
                }
            }
            let mut created = Vec::new();
            for c in create {
                let alert = Alert {
                    id: rows.len() as i64 + 1,
                    device_id: device_id.to_string(),
                    alert_type: c.alert_type.as_str().into(),
                    level: c.level.as_str().into(),
                    message: c.message.clone(),
                    created_at: "2024-05-01T12:00:00.000000Z".into(),
                    resolved: false,
                };
                rows.push(alert.clone());
                created.push(alert);
            }
            Ok(created)
        }

        async fn recent_alerts(&self, _device_id: &str, _limit: i64) -> anyhow::Result<Vec<Alert>> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn clear_alerts(&self, _device_id: &str) -> anyhow::Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn temperature_alert_raises_then_clears() {
        let repo = Arc::new(MockAlerts::new());
        let engine = AlertEngine::new(repo.clone());
        let t = thresholds(json!({"temperature": {"critical": 20, "warn": 13}}));

        let raised = engine.evaluate_device(&reading(Some(25.0), Some(70.0)), &t).await.unwrap();
        assert_eq!(raised.created.len(), 1);
        assert_eq!(raised.created[0].key(), AlertKey::new("temperature", "critical"));
        assert_eq!(raised.active, 1);

        let cleared = engine.evaluate_device(&reading(Some(10.0), None), &t).await.unwrap();
        assert!(cleared.created.is_empty());
        assert_eq!(cleared.resolved, vec![AlertKey::new("temperature", "critical")]);
        assert_eq!(cleared.active, 0);
    }

    #[tokio::test]
    async fn humidity_high_then_low_are_distinct_alerts() {
        let repo = Arc::new(MockAlerts::new());
        let engine = AlertEngine::new(repo.clone());

        let high_only = thresholds(json!({"humidity": {"warn_high": 95}}));
        let first = engine.evaluate_device(&reading(None, Some(96.0)), &high_only).await.unwrap();
        assert_eq!(first.created[0].key(), AlertKey::new("humidity_high", "warn"));

        let both = thresholds(json!({"humidity": {"warn_high": 95, "warn_low": 50}}));
        let second = engine.evaluate_device(&reading(None, Some(40.0)), &both).await.unwrap();
        assert_eq!(second.resolved, vec![AlertKey::new("humidity_high", "warn")]);
        assert_eq!(second.created.len(), 1);
        assert_eq!(second.created[0].key(), AlertKey::new("humidity_low", "warn"));
        assert_ne!(first.created[0].id, second.created[0].id);
    }

    #[tokio::test]
    async fn empty_overrides_resolve_everything() {
        let repo = Arc::new(MockAlerts::new());
        let engine = AlertEngine::new(repo.clone());
        let t = thresholds(json!({"temperature": {"warn": 0}, "humidity": {"warn_high": 0}}));
        engine.evaluate_device(&reading(Some(30.0), Some(80.0)), &t).await.unwrap();

        let outcome = engine
            .evaluate_device(&reading(Some(30.0), Some(80.0)), &ThresholdOverrides::default())
            .await
            .unwrap();
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.resolved.len(), 2);
        assert_eq!(outcome.active, 0);
    }
}
