//! Watchlist supervision: auto-restart for services, offline alerting for
//! processes
//!
//! Driven synchronously from the router on every `watchlist-metrics` event.
//! Per (agent, service) the state machine is
//!
//! ```text
//! Healthy -> Failing(attempt 1..3) -> CooldownWait -> Exhausted(alert sent)
//! ```
//!
//! with re-entry to Healthy from any state the moment the entity is
//! observed active again. Guarantees per failure episode: at most 3 restart
//! commands, at most one failure alert, at most one recovery alert.
//! Processes go through the same bookkeeping but are never restarted -
//! observed and alerted only.
//!
//! One deliberate asymmetry: recovery resets tracking whenever attempts>0
//! *or* an alert was sent, but emits a recovery alert only when the failure
//! alert actually went out. An attempt that never became operator-visible
//! recovers silently.

pub mod tracker;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::commands::CommandClient;
use crate::hub::{events, UiHub};
use crate::notify::Notifier;
use crate::protocol::actions;
use crate::protocol::payloads::{
    ProcessStatus, RestartServicePayload, ServiceStatus, WatchlistEntry, WatchlistMetricsPayload,
};
use crate::store::{Alert, NewAlert, Store, StoreResult};

pub use tracker::{EntityKind, RestartTracker, TrackKey, COOLDOWN_SECONDS, MAX_ATTEMPTS};

pub struct WatchlistSupervisor {
    tracker: RestartTracker,
    commands: CommandClient,
    store: Arc<dyn Store>,
    hub: UiHub,
    notifier: Arc<dyn Notifier>,
}

impl WatchlistSupervisor {
    pub fn new(
        commands: CommandClient,
        store: Arc<dyn Store>,
        hub: UiHub,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            tracker: RestartTracker::new(),
            commands,
            store,
            hub,
            notifier,
        }
    }

    /// Process one watchlist snapshot. Errors for one entity never stop the
    /// remaining entities in the same snapshot.
    pub async fn process_watchlist(&self, agent_id: i64, payload: &WatchlistMetricsPayload) {
        self.process_watchlist_at(agent_id, payload, Utc::now())
            .await;
    }

    /// [`Self::process_watchlist`] with an explicit clock, for callers (and
    /// tests) that need deterministic cooldown arithmetic.
    #[instrument(skip(self, payload, now))]
    pub async fn process_watchlist_at(
        &self,
        agent_id: i64,
        payload: &WatchlistMetricsPayload,
        now: DateTime<Utc>,
    ) {
        for entry in &payload.services {
            if let Some(service) = &entry.data {
                if let Err(e) = self.process_service(agent_id, service, now).await {
                    error!("error supervising service on agent {agent_id}: {e}");
                }
            }
        }

        for entry in &payload.processes {
            if entry.data.is_some() || entry.message.is_some() {
                if let Err(e) = self.process_process(agent_id, entry, now).await {
                    error!("error supervising process on agent {agent_id}: {e}");
                }
            }
        }
    }

    async fn process_service(
        &self,
        agent_id: i64,
        service: &ServiceStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let name = service.name.clone();
        let key = TrackKey::service(agent_id, &name);
        let is_active = service.active_state.eq_ignore_ascii_case("active");

        if is_active {
            let previous_attempts = self.tracker.attempt_count(&key);
            let alert_was_sent = self.tracker.alert_sent(&key);

            if previous_attempts > 0 || alert_was_sent {
                info!(
                    "service '{name}' on agent {agent_id} is back online \
                     (previous attempts: {previous_attempts}, alert sent: {alert_was_sent})"
                );
                self.tracker.reset(&key);

                // recovery alert only when the failure was operator-visible
                if alert_was_sent {
                    self.send_alert(
                        agent_id,
                        format!("Service Recovered: {name}"),
                        format!(
                            "Service '{name}' is back online after {previous_attempts} restart attempts."
                        ),
                        "Info",
                        json!({ "serviceName": name, "type": "ServiceRecovered" }),
                        now,
                    )
                    .await?;
                }

                self.hub.send_to_server(
                    agent_id,
                    events::SERVICE_RECOVERED,
                    json!({
                        "serverId": agent_id,
                        "serviceName": name,
                        "timestamp": now.timestamp_millis(),
                        "previousAttempts": previous_attempts,
                    }),
                );
            }

            return Ok(());
        }

        warn!(
            "service '{name}' on agent {agent_id} is offline (state: {})",
            service.active_state
        );

        if self.tracker.reached_max_attempts(&key) {
            if !self.tracker.alert_sent(&key) {
                error!(
                    "service '{name}' on agent {agent_id} failed after {MAX_ATTEMPTS} restart attempts"
                );
                self.send_alert(
                    agent_id,
                    format!("Service Offline: {name}"),
                    format!(
                        "Service '{name}' failed to restart after {MAX_ATTEMPTS} attempts. \
                         Manual intervention required."
                    ),
                    "Critical",
                    json!({ "serviceName": name, "type": "ServiceRestartFailure" }),
                    now,
                )
                .await?;
                self.tracker.mark_alert_sent(&key);
            } else {
                debug!("service '{name}' still offline, alert already sent");
            }
            return Ok(());
        }

        if self.tracker.in_cooldown(&key, now) {
            debug!("service '{name}' in restart cooldown, skipping attempt");
            return Ok(());
        }

        self.attempt_restart(agent_id, &name, &key, now);
        Ok(())
    }

    fn attempt_restart(&self, agent_id: i64, name: &str, key: &TrackKey, now: DateTime<Utc>) {
        let attempt = self.tracker.record_attempt(key, now);
        info!(
            "restarting service '{name}' on agent {agent_id} (attempt {attempt}/{MAX_ATTEMPTS})"
        );

        let payload = serde_json::to_value(RestartServicePayload {
            name: name.to_string(),
        })
        .ok();

        // fire-and-forget: the outcome shows up in the next watchlist event
        if let Err(e) =
            self.commands
                .send_fire_and_forget(agent_id, actions::RESTART_SERVICE, payload)
        {
            error!("failed to send restart for '{name}' on agent {agent_id}: {e}");
            return;
        }

        self.tracker.start_cooldown(key, now);

        self.hub.send_to_server(
            agent_id,
            events::SERVICE_RESTART_ATTEMPTED,
            json!({
                "serverId": agent_id,
                "serviceName": name,
                "attemptNumber": attempt,
                "maxAttempts": MAX_ATTEMPTS,
                "timestamp": now.timestamp_millis(),
            }),
        );
    }

    async fn process_process(
        &self,
        agent_id: i64,
        entry: &WatchlistEntry<ProcessStatus>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let name = entry
            .data
            .as_ref()
            .and_then(|p| p.name.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let key = TrackKey::process(agent_id, &name);
        let is_online = entry.status == "ok" && entry.data.is_some();

        if is_online {
            if self.tracker.alert_sent(&key) {
                info!("process '{name}' on agent {agent_id} is back online");
                self.tracker.reset(&key);

                self.send_alert(
                    agent_id,
                    format!("Process Recovered: {name}"),
                    format!("Process '{name}' is back online and running normally."),
                    "Info",
                    json!({ "processName": name, "type": "ProcessRecovered" }),
                    now,
                )
                .await?;
            }
            return Ok(());
        }

        warn!("process '{name}' on agent {agent_id} is offline or not found");

        if self.tracker.alert_sent(&key) {
            debug!("process '{name}' still offline, alert already sent");
            return Ok(());
        }

        let detail = entry.message.clone().unwrap_or_default();
        self.send_alert(
            agent_id,
            format!("Process Offline: {name}"),
            format!("Process '{name}' is not running or not found. {detail}"),
            "Warning",
            json!({ "processName": name, "type": "ProcessOffline" }),
            now,
        )
        .await?;
        self.tracker.mark_alert_sent(&key);

        Ok(())
    }

    /// Persist an alert, broadcast it, and forward it to the notifier.
    async fn send_alert(
        &self,
        agent_id: i64,
        title: String,
        message: String,
        severity: &str,
        extra: serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let alert_id = self
            .store
            .insert_alert(NewAlert {
                created_at_utc: now,
                title: title.clone(),
                message: message.clone(),
                severity: severity.to_string(),
                agent_id,
                rule_id: None,
            })
            .await?;

        let mut payload = json!({
            "alertId": alert_id,
            "serverId": agent_id,
            "title": title,
            "message": message,
            "severity": severity,
            "timestamp": now.timestamp_millis(),
        });
        if let (Some(obj), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.hub
            .send_to_server(agent_id, events::ALERT_TRIGGERED, payload);

        self.notifier
            .send_alert(&Alert {
                id: alert_id,
                created_at_utc: now,
                title,
                message,
                severity: severity.to_string(),
                agent_id,
                rule_id: None,
                is_acknowledged: false,
            })
            .await;

        Ok(())
    }
}
