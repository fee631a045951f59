//! Inbound frame routing
//!
//! Every frame from an authenticated agent passes through here. Decoding is
//! two-phase: the envelope first, then - once `type` and `action` are known -
//! the payload into its concrete type. Dispatch:
//!
//! - `event` frames feed persistence, the broadcast hub, and the control
//!   loops (alerts, watchdog, backup completion)
//! - `response` frames resolve pending requests in the correlation engine;
//!   an unmatched id is an expected race with a timeout, logged and dropped
//! - `request` frames from agents are unsupported, logged and ignored
//! - unknown types and malformed frames are logged and dropped; one bad
//!   frame never takes down an otherwise healthy link
//!
//! The handlers run on the calling connection's read loop, so a slow
//! handler delays that agent's next frame but never other agents.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::alerts::AlertEvaluator;
use crate::commands::CorrelationEngine;
use crate::hub::{events, UiHub};
use crate::protocol::payloads::{BackupCompletedEvent, MetricsPayload, WatchlistMetricsPayload};
use crate::protocol::{actions, Envelope, MessageKind};
use crate::store::{BackupOutcome, MetricSample, Store};
use crate::watchdog::WatchlistSupervisor;

pub struct MessageRouter {
    store: Arc<dyn Store>,
    hub: UiHub,
    engine: Arc<CorrelationEngine>,
    alerts: Arc<AlertEvaluator>,
    watchdog: Arc<WatchlistSupervisor>,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn Store>,
        hub: UiHub,
        engine: Arc<CorrelationEngine>,
        alerts: Arc<AlertEvaluator>,
        watchdog: Arc<WatchlistSupervisor>,
    ) -> Self {
        Self {
            store,
            hub,
            engine,
            alerts,
            watchdog,
        }
    }

    /// Decode and dispatch one raw frame from `agent_id`.
    #[instrument(skip(self, raw))]
    pub async fn handle_frame(&self, agent_id: i64, raw: &str) {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping malformed frame from agent {agent_id}: {e}");
                return;
            }
        };

        debug!(
            "received {:?} frame, action '{}', id {} from agent {agent_id}",
            envelope.kind, envelope.action, envelope.id
        );

        match envelope.kind {
            MessageKind::Event => self.handle_event(agent_id, envelope).await,
            MessageKind::Response => self.handle_response(agent_id, envelope),
            MessageKind::Request => {
                info!(
                    "unsupported request '{}' from agent {agent_id}, ignoring",
                    envelope.action
                );
            }
            MessageKind::Unknown => {
                warn!("unknown message type from agent {agent_id}, ignoring");
            }
        }
    }

    async fn handle_event(&self, agent_id: i64, envelope: Envelope) {
        match envelope.action.as_str() {
            actions::METRICS => {
                if let Some(payload) = decode_payload::<MetricsPayload>(agent_id, &envelope) {
                    self.process_metrics(agent_id, payload).await;
                }
            }
            actions::WATCHLIST_METRICS => {
                if let Some(payload) = decode_payload::<WatchlistMetricsPayload>(agent_id, &envelope)
                {
                    self.process_watchlist_metrics(agent_id, payload).await;
                }
            }
            actions::BACKUP_COMPLETED => {
                if let Some(payload) = decode_payload::<BackupCompletedEvent>(agent_id, &envelope) {
                    self.process_backup_completed(agent_id, payload).await;
                }
            }
            other => {
                warn!("unknown event action '{other}' from agent {agent_id}");
            }
        }
    }

    /// Hand a reply to the correlation engine. No match means the request
    /// already timed out or the id is unknown - expected, not fatal.
    fn handle_response(&self, agent_id: i64, envelope: Envelope) {
        let id = envelope.id;
        let action = envelope.action.clone();

        if self.engine.complete(id, envelope) {
            debug!("matched response {id} ('{action}') from agent {agent_id}");
            self.hub.send_to_server(
                agent_id,
                events::COMMAND_SUCCESS,
                json!({
                    "serverId": agent_id,
                    "action": action,
                    "messageId": id,
                    "message": format!("Command '{action}' executed successfully"),
                    "timestamp": Utc::now().timestamp_millis(),
                }),
            );
        } else {
            warn!(
                "response for unknown request id {id} from agent {agent_id} \
                 (request may have timed out)"
            );
        }
    }

    async fn process_metrics(&self, agent_id: i64, payload: MetricsPayload) {
        let now = Utc::now();

        let sample = MetricSample::from_payload(agent_id, now, &payload);
        match self.store.insert_metric_sample(sample).await {
            Ok(sample_id) => debug!("stored metric sample {sample_id} for agent {agent_id}"),
            Err(e) => error!("failed to store metrics for agent {agent_id}: {e}"),
        }

        self.hub.send_to_server(
            agent_id,
            events::METRICS_UPDATED,
            json!({
                "serverId": agent_id,
                "timestampUtc": now.timestamp_millis(),
                "metrics": payload,
            }),
        );

        self.alerts.evaluate_metrics(agent_id, &payload).await;
    }

    async fn process_watchlist_metrics(&self, agent_id: i64, payload: WatchlistMetricsPayload) {
        debug!(
            "watchlist metrics for agent {agent_id}: {} services, {} processes",
            payload.services.len(),
            payload.processes.len()
        );

        self.hub.send_to_server(
            agent_id,
            events::WATCHLIST_METRICS_UPDATED,
            json!({
                "serverId": agent_id,
                "timestampUtc": Utc::now().timestamp_millis(),
                "services": payload.services,
                "processes": payload.processes,
            }),
        );

        self.watchdog.process_watchlist(agent_id, &payload).await;
        self.alerts.evaluate_watchlist(agent_id, &payload).await;
    }

    async fn process_backup_completed(&self, agent_id: i64, event: BackupCompletedEvent) {
        info!(
            "backup completed on agent {agent_id}: task {}, status '{}'",
            event.task_id, event.result.status
        );

        let Ok(task_id) = Uuid::parse_str(&event.task_id) else {
            error!("invalid task id in backup-completed event: '{}'", event.task_id);
            return;
        };

        let log = match self.store.backup_log(task_id).await {
            Ok(Some(log)) => log,
            Ok(None) => {
                warn!("no backup log found for task {task_id}");
                return;
            }
            Err(e) => {
                error!("failed to load backup log {task_id}: {e}");
                return;
            }
        };

        let status = if event.result.status == "ok" {
            "success"
        } else {
            "error"
        };

        let outcome = BackupOutcome {
            status: status.to_string(),
            snapshot_id: event.result.snapshot_id.clone(),
            files_new: event.result.files_new,
            data_added: event.result.data_added,
            duration_seconds: event.result.duration,
            error_message: event.result.error_message.clone(),
        };

        if let Err(e) = self.store.update_backup_log(task_id, outcome).await {
            error!("failed to update backup log {task_id}: {e}");
            return;
        }

        let now = Utc::now();
        if let Err(e) = self.store.update_job_last_run(log.job_id, status, now).await {
            error!("failed to update backup job {}: {e}", log.job_id);
        }

        self.hub.send_to_server(
            agent_id,
            events::BACKUP_COMPLETED,
            json!({
                "serverId": agent_id,
                "jobId": log.job_id,
                "taskId": task_id,
                "status": status,
                "snapshotId": event.result.snapshot_id,
                "filesNew": event.result.files_new,
                "dataAdded": event.result.data_added,
                "durationSeconds": event.result.duration,
                "errorMessage": event.result.error_message,
                "timestamp": now.timestamp_millis(),
            }),
        );
    }
}

fn decode_payload<T: DeserializeOwned>(agent_id: i64, envelope: &Envelope) -> Option<T> {
    let payload = envelope.payload.clone().unwrap_or(serde_json::Value::Null);
    match serde_json::from_value(payload) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(
                "failed to decode '{}' payload from agent {agent_id}: {e}",
                envelope.action
            );
            None
        }
    }
}
