//! Concrete payload types, decoded after `type`+`action` dispatch
//!
//! Field names follow the agent protocol (camelCase). Agents report
//! watchlist entries wrapped in a `{status, data, message}` envelope so a
//! single snapshot can mix healthy entries with lookup failures.

use serde::{Deserialize, Serialize};

/// First-frame payload on a new connection, action `authenticate`.
///
/// `agent_id` is whatever the agent claims to be and is untrusted until the
/// token has been verified against a stored hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    pub agent_id: String,
    pub token: String,
}

/// Handshake reply. Sent as a bare object, not wrapped in an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthReply {
    pub status: String,
    pub message: String,
    pub server_id: Option<i64>,
    pub server_name: Option<String>,
}

impl AuthReply {
    pub fn ok(message: &str, server_id: i64, server_name: &str) -> Self {
        Self {
            status: "ok".into(),
            message: message.into(),
            server_id: Some(server_id),
            server_name: Some(server_name.into()),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            status: "error".into(),
            message: message.into(),
            server_id: None,
            server_name: None,
        }
    }
}

/// Server-wide metrics snapshot, event `metrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    pub cpu_usage_percent: f64,
    pub ram_usage_percent: f64,
    #[serde(rename = "ramUsedGB")]
    pub ram_used_gb: f64,
    #[serde(default)]
    pub disk_usage: Vec<DiskUsage>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    pub uptime_seconds: i64,
    pub normalized_load: NormalizedLoad,
    #[serde(rename = "diskReadSpeedMBps")]
    pub disk_read_speed_mbps: f64,
    #[serde(rename = "diskWriteSpeedMBps")]
    pub disk_write_speed_mbps: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    #[serde(rename = "totalGB")]
    pub total_gb: f64,
    #[serde(rename = "usedGB")]
    pub used_gb: f64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,
    pub mac: Option<String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub upload_speed_mbps: f64,
    pub download_speed_mbps: f64,
}

/// Load averages normalized by core count, keyed `1m`/`5m`/`15m` on the wire.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NormalizedLoad {
    #[serde(rename = "1m")]
    pub one_minute: f64,
    #[serde(rename = "5m")]
    pub five_minute: f64,
    #[serde(rename = "15m")]
    pub fifteen_minute: f64,
}

/// Per-watched-entity snapshot, event `watchlist-metrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchlistMetricsPayload {
    #[serde(default)]
    pub services: Vec<WatchlistEntry<ServiceStatus>>,
    #[serde(default)]
    pub processes: Vec<WatchlistEntry<ProcessStatus>>,
}

/// One watchlist result: `status` is `"ok"` with `data` set, or `"error"`
/// with a human-readable `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry<T> {
    pub status: String,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> WatchlistEntry<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: "ok".into(),
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            status: "error".into(),
            data: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub name: String,
    pub active_state: String,
    pub sub_state: String,
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage: Option<f64>,
    #[serde(rename = "mainPID")]
    pub main_pid: Option<i64>,
    pub start_time: Option<String>,
    pub restart_policy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub pid: Option<i64>,
    pub name: Option<String>,
    pub cmdline: Option<String>,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub memory_percent: Option<f64>,
    pub user: Option<String>,
    pub status: Option<String>,
    pub uptime_seconds: Option<i64>,
    pub num_threads: Option<i64>,
}

/// Command payload for `restart-service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartServicePayload {
    pub name: String,
}

/// Command payload for `trigger-backup`. Credentials are decrypted just
/// before sending and never persisted in the clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerBackupPayload {
    pub task_id: String,
    pub source: String,
    pub repo: String,
    pub password: String,
    pub ssh_key: String,
}

/// Event payload for `backup-completed`, matched to the pending log row by
/// `task_id` (the id handed to the agent at trigger time).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCompletedEvent {
    pub task_id: String,
    pub result: BackupResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    /// `"ok"` or `"error"`.
    pub status: String,
    pub snapshot_id: Option<String>,
    pub files_new: Option<i64>,
    pub data_added: Option<i64>,
    pub duration: Option<f64>,
    pub error_message: Option<String>,
}
