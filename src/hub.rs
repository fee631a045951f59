//! Real-time broadcast hub for operator-facing clients
//!
//! Control loops publish group-tagged JSON events; the operator stream
//! WebSocket subscribes and forwards events whose group matches its
//! subscription. Groups are keyed `server-{id}`. The channel may drop
//! events for lagging subscribers - UI updates are continuously
//! regenerated, so gaps are acceptable.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Events pushed to operator clients.
pub mod events {
    pub const METRICS_UPDATED: &str = "MetricsUpdated";
    pub const WATCHLIST_METRICS_UPDATED: &str = "WatchlistMetricsUpdated";
    pub const COMMAND_SUCCESS: &str = "CommandSuccess";
    pub const COMMAND_FAILED: &str = "CommandFailed";
    pub const ALERT_TRIGGERED: &str = "AlertTriggered";
    pub const SERVICE_RESTART_ATTEMPTED: &str = "ServiceRestartAttempted";
    pub const SERVICE_RECOVERED: &str = "ServiceRecovered";
    pub const BACKUP_COMPLETED: &str = "BackupCompleted";
}

/// One broadcast event.
#[derive(Debug, Clone, Serialize)]
pub struct UiEvent {
    pub group: String,
    pub event: String,
    pub payload: Value,
}

/// Broadcast group for one agent.
pub fn server_group(agent_id: i64) -> String {
    format!("server-{agent_id}")
}

/// Cloneable handle onto the broadcast channel.
#[derive(Debug, Clone)]
pub struct UiHub {
    tx: broadcast::Sender<UiEvent>,
}

impl UiHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to one group. Having no subscribers is normal.
    pub fn send_to_group(&self, group: String, event: &str, payload: Value) {
        let receivers = self
            .tx
            .send(UiEvent {
                group,
                event: event.to_string(),
                payload,
            })
            .unwrap_or(0);
        trace!("broadcast {event} to {receivers} subscriber(s)");
    }

    /// Publish an event to an agent's `server-{id}` group.
    pub fn send_to_server(&self, agent_id: i64, event: &str, payload: Value) {
        self.send_to_group(server_group(agent_id), event, payload);
    }
}

impl Default for UiHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_group_tagged_events() {
        let hub = UiHub::new(8);
        let mut rx = hub.subscribe();

        hub.send_to_server(3, events::ALERT_TRIGGERED, json!({"alertId": 1}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.group, "server-3");
        assert_eq!(event.event, "AlertTriggered");
        assert_eq!(event.payload["alertId"], 1);
    }

    #[test]
    fn sending_without_subscribers_does_not_panic() {
        let hub = UiHub::new(8);
        hub.send_to_server(1, events::METRICS_UPDATED, json!({}));
    }
}
