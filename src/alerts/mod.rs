//! Threshold alert evaluation
//!
//! Runs synchronously on the owning connection's read loop whenever a
//! `metrics` or `watchlist-metrics` event arrives. Rules are loaded per
//! agent from the store, evaluated by target type, and gated by a
//! database-backed cooldown: a rule may fire again once
//! `now >= last alert for (rule, agent) + cooldown` - reading the last
//! alert row instead of in-memory state keeps cooldowns correct across hub
//! restarts.
//!
//! One rule failing to evaluate never stops the remaining rules.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, error, instrument, warn};

use crate::hub::{events, UiHub};
use crate::notify::Notifier;
use crate::protocol::payloads::{
    MetricsPayload, ProcessStatus, ServiceStatus, WatchlistEntry, WatchlistMetricsPayload,
};
use crate::store::{Alert, AlertRule, AlertTargetType, NewAlert, Store, StoreResult};

/// Outcome of evaluating one rule against one snapshot.
struct Exceeded {
    message: String,
    value: f64,
}

pub struct AlertEvaluator {
    store: Arc<dyn Store>,
    hub: UiHub,
    notifier: Arc<dyn Notifier>,
}

impl AlertEvaluator {
    pub fn new(store: Arc<dyn Store>, hub: UiHub, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            hub,
            notifier,
        }
    }

    /// Evaluate all active server/disk/network rules against a metrics
    /// snapshot.
    #[instrument(skip(self, payload))]
    pub async fn evaluate_metrics(&self, agent_id: i64, payload: &MetricsPayload) {
        let rules = match self.store.active_rules(agent_id).await {
            Ok(rules) => rules,
            Err(e) => {
                error!("failed to load rules for agent {agent_id}: {e}");
                return;
            }
        };

        for rule in rules {
            let exceeded = match rule.target_type {
                AlertTargetType::Server => Self::evaluate_server(&rule, payload),
                AlertTargetType::Disk => Self::evaluate_disk(&rule, payload),
                AlertTargetType::Network => Self::evaluate_network(&rule, payload),
                // evaluated from watchlist snapshots, not here
                AlertTargetType::Process | AlertTargetType::Service => continue,
            };

            if let Some(exceeded) = exceeded {
                if let Err(e) = self.fire_if_cooled_down(&rule, agent_id, exceeded).await {
                    error!("error triggering alert for rule {}: {e}", rule.id);
                }
            }
        }
    }

    /// Evaluate process/service rules against a watchlist snapshot.
    #[instrument(skip(self, payload))]
    pub async fn evaluate_watchlist(&self, agent_id: i64, payload: &WatchlistMetricsPayload) {
        let rules = match self.store.active_rules(agent_id).await {
            Ok(rules) => rules,
            Err(e) => {
                error!("failed to load rules for agent {agent_id}: {e}");
                return;
            }
        };

        for rule in rules {
            let exceeded = match rule.target_type {
                AlertTargetType::Process => Self::evaluate_process(&rule, &payload.processes),
                AlertTargetType::Service => Self::evaluate_service(&rule, &payload.services),
                _ => continue,
            };

            if let Some(exceeded) = exceeded {
                if let Err(e) = self.fire_if_cooled_down(&rule, agent_id, exceeded).await {
                    error!("error triggering alert for rule {}: {e}", rule.id);
                }
            }
        }
    }

    fn evaluate_server(rule: &AlertRule, metrics: &MetricsPayload) -> Option<Exceeded> {
        let actual = match rule.metric.to_ascii_uppercase().as_str() {
            "CPU" => metrics.cpu_usage_percent,
            "RAM" => metrics.ram_usage_percent,
            "LOAD1M" => metrics.normalized_load.one_minute,
            "LOAD5M" => metrics.normalized_load.five_minute,
            "LOAD15M" => metrics.normalized_load.fifteen_minute,
            other => {
                warn!("unknown server metric in rule {}: {other}", rule.id);
                return None;
            }
        };

        rule.comparison
            .matches(actual, rule.threshold_value)
            .then(|| Exceeded {
                message: format!(
                    "{} is {:.2} (threshold: {} {})",
                    rule.metric,
                    actual,
                    rule.comparison.as_str(),
                    rule.threshold_value
                ),
                value: actual,
            })
    }

    /// Disk rules: with a target device only that partition counts; without
    /// one the partition with the worst usage decides ("any partition
    /// exceeds"). A missing target device means not exceeded.
    fn evaluate_disk(rule: &AlertRule, metrics: &MetricsPayload) -> Option<Exceeded> {
        if rule.metric.to_ascii_uppercase() != "DISKUSAGE" {
            return None;
        }

        let partition = match &rule.target_id {
            Some(device) => metrics.disk_usage.iter().find(|d| &d.device == device),
            None => metrics
                .disk_usage
                .iter()
                .max_by(|a, b| a.usage_percent.total_cmp(&b.usage_percent)),
        }?;

        rule.comparison
            .matches(partition.usage_percent, rule.threshold_value)
            .then(|| Exceeded {
                message: format!(
                    "Disk {} ({}) usage is {:.2}% (threshold: {} {})",
                    partition.device,
                    partition.mountpoint,
                    partition.usage_percent,
                    rule.comparison.as_str(),
                    rule.threshold_value
                ),
                value: partition.usage_percent,
            })
    }

    /// Network rules: worst case across matching interfaces (all interfaces
    /// when no target is set), separately for upload and download.
    fn evaluate_network(rule: &AlertRule, metrics: &MetricsPayload) -> Option<Exceeded> {
        let metric = rule.metric.to_ascii_uppercase();
        let upload = match metric.as_str() {
            "NETWORKUPLOAD" => true,
            "NETWORKDOWNLOAD" => false,
            _ => return None,
        };

        let speed_of = |iface: &crate::protocol::payloads::NetworkInterface| {
            if upload {
                iface.upload_speed_mbps
            } else {
                iface.download_speed_mbps
            }
        };

        let worst = metrics
            .network_interfaces
            .iter()
            .filter(|iface| match &rule.target_id {
                Some(name) => &iface.name == name,
                None => true,
            })
            .max_by(|a, b| speed_of(a).total_cmp(&speed_of(b)))?;

        let actual = speed_of(worst);
        rule.comparison
            .matches(actual, rule.threshold_value)
            .then(|| Exceeded {
                message: format!(
                    "Network {} {} is {:.2} Mbps (threshold: {} {})",
                    worst.name,
                    if upload { "upload" } else { "download" },
                    actual,
                    rule.comparison.as_str(),
                    rule.threshold_value
                ),
                value: actual,
            })
    }

    fn evaluate_process(
        rule: &AlertRule,
        processes: &[WatchlistEntry<ProcessStatus>],
    ) -> Option<Exceeded> {
        let Some(target) = rule.target_id.as_deref() else {
            warn!("process rule {} has no target id, skipping", rule.id);
            return None;
        };

        let found = processes.iter().find(|entry| {
            entry.status == "ok"
                && entry.data.as_ref().is_some_and(|p| {
                    contains_ignore_case(p.name.as_deref(), target)
                        || contains_ignore_case(p.cmdline.as_deref(), target)
                })
        });

        let Some(process) = found.and_then(|entry| entry.data.as_ref()) else {
            // absent from the snapshot: an error entry mentioning the target
            // means "not running", which is itself an alert condition
            return Self::not_running(rule, target, processes.iter().map(|e| (&e.status, &e.message)));
        };

        if process.pid.is_none() || process.name.is_none() {
            warn!("process '{target}' reported incomplete data");
            return None;
        }

        let (actual, metric_name) = match rule.metric.to_ascii_uppercase().as_str() {
            "PROCESSCPU" | "CPU" => (process.cpu_percent.unwrap_or(0.0), "CPU"),
            "PROCESSMEMORY" | "PROCESSRAM" | "RAM" | "MEMORY" => {
                (process.memory_mb.unwrap_or(0.0), "Memory")
            }
            other => {
                warn!("unknown process metric in rule {}: {other}", rule.id);
                return None;
            }
        };

        rule.comparison
            .matches(actual, rule.threshold_value)
            .then(|| Exceeded {
                message: format!(
                    "Process '{}' (PID: {}) {} is {:.2} (threshold: {} {})",
                    process.name.as_deref().unwrap_or(target),
                    process.pid.unwrap_or_default(),
                    metric_name,
                    actual,
                    rule.comparison.as_str(),
                    rule.threshold_value
                ),
                value: actual,
            })
    }

    fn evaluate_service(
        rule: &AlertRule,
        services: &[WatchlistEntry<ServiceStatus>],
    ) -> Option<Exceeded> {
        let Some(target) = rule.target_id.as_deref() else {
            warn!("service rule {} has no target id, skipping", rule.id);
            return None;
        };

        let found = services.iter().find(|entry| {
            entry.status == "ok"
                && entry
                    .data
                    .as_ref()
                    .is_some_and(|s| contains_ignore_case(Some(s.name.as_str()), target))
        });

        let Some(service) = found.and_then(|entry| entry.data.as_ref()) else {
            return Self::not_running(rule, target, services.iter().map(|e| (&e.status, &e.message)));
        };

        let (actual, metric_name) = match rule.metric.to_ascii_uppercase().as_str() {
            "SERVICECPU" | "CPU" => (service.cpu_usage_percent.unwrap_or(0.0), "CPU"),
            "SERVICEMEMORY" | "SERVICERAM" | "RAM" | "MEMORY" => {
                (service.memory_usage.unwrap_or(0.0), "Memory")
            }
            other => {
                warn!("unknown service metric in rule {}: {other}", rule.id);
                return None;
            }
        };

        rule.comparison
            .matches(actual, rule.threshold_value)
            .then(|| Exceeded {
                message: format!(
                    "Service '{}' {} is {:.2} (threshold: {} {})",
                    service.name,
                    metric_name,
                    actual,
                    rule.comparison.as_str(),
                    rule.threshold_value
                ),
                value: actual,
            })
    }

    /// "Target absent but an error entry mentions it" evaluates as exceeded
    /// with value 0.
    fn not_running<'a>(
        rule: &AlertRule,
        target: &str,
        entries: impl Iterator<Item = (&'a String, &'a Option<String>)>,
    ) -> Option<Exceeded> {
        for (status, message) in entries {
            if status == "error" {
                if let Some(message) = message {
                    if contains_ignore_case(Some(message.as_str()), target) {
                        return Some(Exceeded {
                            message: format!(
                                "'{target}' not found or not running: {message}"
                            ),
                            value: 0.0,
                        });
                    }
                }
            }
        }
        debug!("'{target}' not present in snapshot for rule {}", rule.id);
        None
    }

    async fn fire_if_cooled_down(
        &self,
        rule: &AlertRule,
        agent_id: i64,
        exceeded: Exceeded,
    ) -> StoreResult<()> {
        let now = Utc::now();
        if !self.can_trigger(rule, agent_id, now).await? {
            debug!("alert for rule {} suppressed by cooldown", rule.id);
            return Ok(());
        }
        self.trigger(rule, agent_id, exceeded, now).await
    }

    /// Cooldown gate, boundary inclusive: the rule may fire once
    /// `now >= last alert + cooldown`, or when no prior alert exists.
    async fn can_trigger(
        &self,
        rule: &AlertRule,
        agent_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        match self.store.latest_alert_time(rule.id, agent_id).await? {
            None => Ok(true),
            Some(last) => Ok(now >= last + Duration::minutes(rule.cooldown_minutes)),
        }
    }

    async fn trigger(
        &self,
        rule: &AlertRule,
        agent_id: i64,
        exceeded: Exceeded,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let new_alert = NewAlert {
            created_at_utc: now,
            title: format!("Alert: {} threshold exceeded", rule.metric),
            message: exceeded.message,
            severity: rule.severity.clone(),
            agent_id,
            rule_id: Some(rule.id),
        };

        let alert_id = self.store.insert_alert(new_alert.clone()).await?;
        warn!(
            "alert triggered: {} (agent {agent_id}, rule {})",
            new_alert.message, rule.id
        );

        self.hub.send_to_server(
            agent_id,
            events::ALERT_TRIGGERED,
            json!({
                "alertId": alert_id,
                "serverId": agent_id,
                "title": new_alert.title,
                "message": new_alert.message,
                "severity": new_alert.severity,
                "timestamp": now.timestamp_millis(),
                "ruleId": rule.id,
                "metric": rule.metric,
                "actualValue": exceeded.value,
                "thresholdValue": rule.threshold_value,
            }),
        );

        self.notifier
            .send_alert(&Alert {
                id: alert_id,
                created_at_utc: now,
                title: new_alert.title,
                message: new_alert.message,
                severity: new_alert.severity,
                agent_id,
                rule_id: Some(rule.id),
                is_acknowledged: false,
            })
            .await;

        Ok(())
    }
}

fn contains_ignore_case(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(&needle.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;
    use crate::protocol::payloads::{DiskUsage, NetworkInterface, NormalizedLoad};
    use crate::store::memory::MemoryStore;
    use crate::store::Comparator;

    fn rule(
        id: i64,
        target_type: AlertTargetType,
        metric: &str,
        comparison: Comparator,
        threshold: f64,
        target_id: Option<&str>,
        cooldown_minutes: i64,
    ) -> AlertRule {
        AlertRule {
            id,
            agent_id: 1,
            target_type,
            metric: metric.into(),
            comparison,
            threshold_value: threshold,
            severity: "Warning".into(),
            target_id: target_id.map(Into::into),
            cooldown_minutes,
            is_active: true,
        }
    }

    fn metrics(cpu: f64) -> MetricsPayload {
        MetricsPayload {
            cpu_usage_percent: cpu,
            ram_usage_percent: 30.0,
            ram_used_gb: 4.0,
            disk_usage: vec![],
            network_interfaces: vec![],
            uptime_seconds: 100,
            normalized_load: NormalizedLoad::default(),
            disk_read_speed_mbps: 0.0,
            disk_write_speed_mbps: 0.0,
        }
    }

    fn disk(device: &str, usage: f64) -> DiskUsage {
        DiskUsage {
            device: device.into(),
            mountpoint: "/".into(),
            fstype: "ext4".into(),
            total_gb: 100.0,
            used_gb: usage,
            usage_percent: usage,
        }
    }

    async fn evaluator_with(rules: Vec<AlertRule>) -> (AlertEvaluator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for rule in rules {
            store.add_rule(rule).await;
        }
        let evaluator = AlertEvaluator::new(
            store.clone(),
            UiHub::new(8),
            Arc::new(NullNotifier),
        );
        (evaluator, store)
    }

    #[tokio::test]
    async fn server_rule_fires_on_exceeded_cpu() {
        let (evaluator, store) = evaluator_with(vec![rule(
            1,
            AlertTargetType::Server,
            "CPU",
            Comparator::Gt,
            80.0,
            None,
            15,
        )])
        .await;

        evaluator.evaluate_metrics(1, &metrics(92.5)).await;

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, Some(1));
        assert!(alerts[0].message.contains("92.50"));
    }

    #[tokio::test]
    async fn cooldown_suppresses_refire_within_window() {
        let (evaluator, store) = evaluator_with(vec![rule(
            1,
            AlertTargetType::Server,
            "CPU",
            Comparator::Gt,
            80.0,
            None,
            15,
        )])
        .await;

        evaluator.evaluate_metrics(1, &metrics(95.0)).await;
        evaluator.evaluate_metrics(1, &metrics(95.0)).await;

        assert_eq!(store.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn cooldown_boundary_is_inclusive() {
        let (evaluator, store) = evaluator_with(vec![rule(
            1,
            AlertTargetType::Server,
            "CPU",
            Comparator::Gt,
            80.0,
            None,
            15,
        )])
        .await;

        // seed a prior alert exactly 15 minutes old
        store
            .insert_alert(NewAlert {
                created_at_utc: Utc::now() - Duration::minutes(15),
                title: "t".into(),
                message: "m".into(),
                severity: "Warning".into(),
                agent_id: 1,
                rule_id: Some(1),
            })
            .await
            .unwrap();

        evaluator.evaluate_metrics(1, &metrics(95.0)).await;
        assert_eq!(store.alerts().await.len(), 2);
    }

    #[tokio::test]
    async fn disk_rule_without_target_picks_worst_partition() {
        let (evaluator, store) = evaluator_with(vec![rule(
            1,
            AlertTargetType::Disk,
            "DISKUSAGE",
            Comparator::Gt,
            80.0,
            None,
            0,
        )])
        .await;

        let mut payload = metrics(10.0);
        payload.disk_usage = vec![disk("/dev/sda1", 40.0), disk("/dev/sdb1", 91.0)];
        evaluator.evaluate_metrics(1, &payload).await;

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains("/dev/sdb1"));
    }

    #[tokio::test]
    async fn disk_rule_with_missing_target_device_does_not_fire() {
        let (evaluator, store) = evaluator_with(vec![rule(
            1,
            AlertTargetType::Disk,
            "DISKUSAGE",
            Comparator::Gt,
            80.0,
            Some("/dev/sdz9"),
            0,
        )])
        .await;

        let mut payload = metrics(10.0);
        payload.disk_usage = vec![disk("/dev/sda1", 95.0)];
        evaluator.evaluate_metrics(1, &payload).await;

        assert!(store.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn network_rule_takes_worst_matching_interface() {
        let (evaluator, store) = evaluator_with(vec![rule(
            1,
            AlertTargetType::Network,
            "NETWORKDOWNLOAD",
            Comparator::Gt,
            100.0,
            None,
            0,
        )])
        .await;

        let mut payload = metrics(10.0);
        payload.network_interfaces = vec![
            NetworkInterface {
                name: "eth0".into(),
                download_speed_mbps: 50.0,
                ..Default::default()
            },
            NetworkInterface {
                name: "eth1".into(),
                download_speed_mbps: 130.0,
                ..Default::default()
            },
        ];
        evaluator.evaluate_metrics(1, &payload).await;

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains("eth1"));
    }

    #[tokio::test]
    async fn absent_process_with_error_entry_counts_as_not_running() {
        let (evaluator, store) = evaluator_with(vec![rule(
            1,
            AlertTargetType::Process,
            "CPU",
            Comparator::Ge,
            0.0,
            Some("postgres"),
            0,
        )])
        .await;

        let payload = WatchlistMetricsPayload {
            services: vec![],
            processes: vec![WatchlistEntry::error("process postgres not found")],
        };
        evaluator.evaluate_watchlist(1, &payload).await;

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains("not found or not running"));
    }

    #[tokio::test]
    async fn process_matched_case_insensitively_by_cmdline() {
        let (evaluator, store) = evaluator_with(vec![rule(
            1,
            AlertTargetType::Process,
            "MEMORY",
            Comparator::Gt,
            512.0,
            Some("PostgreSQL"),
            0,
        )])
        .await;

        let payload = WatchlistMetricsPayload {
            services: vec![],
            processes: vec![WatchlistEntry::ok(ProcessStatus {
                pid: Some(77),
                name: Some("postgres".into()),
                cmdline: Some("/usr/lib/postgresql/16/bin/postgres".into()),
                memory_mb: Some(700.0),
                ..Default::default()
            })],
        };
        evaluator.evaluate_watchlist(1, &payload).await;

        assert_eq!(store.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn bad_rule_does_not_stop_remaining_rules() {
        let (evaluator, store) = evaluator_with(vec![
            // process rule without target id: skipped with a warning
            rule(1, AlertTargetType::Process, "CPU", Comparator::Gt, 0.0, None, 0),
            rule(2, AlertTargetType::Server, "CPU", Comparator::Gt, 80.0, None, 0),
        ])
        .await;

        evaluator.evaluate_metrics(1, &metrics(95.0)).await;
        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, Some(2));
    }
}
