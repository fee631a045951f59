//! Rows exchanged with the persistence collaborator
//!
//! ## Design Philosophy
//!
//! Metric samples use a hybrid shape: the handful of values the alert loop
//! and dashboards query constantly are typed fields, the complete agent
//! payload rides along as JSON. New agent-side fields then need no schema
//! change to be retained.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::payloads::MetricsPayload;

/// One registered agent (a monitored server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: i64,
    pub name: String,
    /// Salted hash of the agent's bearer token; None while enrollment is
    /// incomplete (such agents can never authenticate).
    pub token_hash: Option<String>,
    pub is_online: bool,
    pub last_seen_utc: Option<DateTime<Utc>>,
}

/// A persisted metrics sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub agent_id: i64,
    pub timestamp_utc: DateTime<Utc>,
    pub cpu_usage_percent: f64,
    pub ram_usage_percent: f64,
    pub ram_used_gb: f64,
    pub load_1m: f64,
    pub load_5m: f64,
    pub load_15m: f64,
    /// Full agent payload, for detail views and late-added fields.
    pub payload: MetricsPayload,
}

impl MetricSample {
    pub fn from_payload(agent_id: i64, at: DateTime<Utc>, payload: &MetricsPayload) -> Self {
        Self {
            agent_id,
            timestamp_utc: at,
            cpu_usage_percent: payload.cpu_usage_percent,
            ram_usage_percent: payload.ram_usage_percent,
            ram_used_gb: payload.ram_used_gb,
            load_1m: payload.normalized_load.one_minute,
            load_5m: payload.normalized_load.five_minute,
            load_15m: payload.normalized_load.fifteen_minute,
            payload: payload.clone(),
        }
    }
}

/// What a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertTargetType {
    Server,
    Disk,
    Network,
    Process,
    Service,
}

/// Threshold comparison operator. `Eq` tolerates floating-point noise with
/// an epsilon of 0.01.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

const EQ_EPSILON: f64 = 0.01;

impl Comparator {
    pub fn matches(&self, actual: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => actual > threshold,
            Comparator::Ge => actual >= threshold,
            Comparator::Lt => actual < threshold,
            Comparator::Le => actual <= threshold,
            Comparator::Eq => (actual - threshold).abs() < EQ_EPSILON,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
        }
    }
}

impl std::str::FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" => Ok(Comparator::Gt),
            ">=" => Ok(Comparator::Ge),
            "<" => Ok(Comparator::Lt),
            "<=" => Ok(Comparator::Le),
            "==" => Ok(Comparator::Eq),
            other => Err(format!("unknown comparator: {other}")),
        }
    }
}

/// Operator-configured alert rule. Owned by configuration; the evaluation
/// loop only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub agent_id: i64,
    pub target_type: AlertTargetType,
    /// Metric name, matched case-insensitively (`CPU`, `RAM`, `LOAD5M`,
    /// `DISKUSAGE`, `NETWORKUPLOAD`, ...).
    pub metric: String,
    pub comparison: Comparator,
    pub threshold_value: f64,
    pub severity: String,
    /// Disk device, interface name, or process/service name. Required for
    /// process and service rules.
    pub target_id: Option<String>,
    pub cooldown_minutes: i64,
    pub is_active: bool,
}

/// An alert about to be persisted.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub created_at_utc: DateTime<Utc>,
    pub title: String,
    pub message: String,
    pub severity: String,
    pub agent_id: i64,
    /// Absent for alerts not caused by a rule (restart exhaustion, recovery).
    pub rule_id: Option<i64>,
}

/// A persisted alert row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub created_at_utc: DateTime<Utc>,
    pub title: String,
    pub message: String,
    pub severity: String,
    pub agent_id: i64,
    pub rule_id: Option<i64>,
    pub is_acknowledged: bool,
}

/// Scheduled backup job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: Uuid,
    pub agent_id: i64,
    pub name: String,
    /// Standard 5-field cron expression.
    pub schedule_cron: String,
    pub source_path: String,
    pub repo_url: String,
    /// AES-GCM ciphertext, see [`crate::crypto::CredentialCipher`].
    pub encrypted_password: String,
    pub encrypted_ssh_key: String,
    pub is_active: bool,
    pub created_at_utc: DateTime<Utc>,
    pub last_run_at_utc: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
}

/// One backup execution, keyed by the task id handed to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupLog {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub started_at_utc: DateTime<Utc>,
    /// `pending`, `success`, or `error`.
    pub status: String,
    pub snapshot_id: Option<String>,
    pub files_new: Option<i64>,
    pub data_added: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
}

impl BackupLog {
    /// Fresh row at trigger time.
    pub fn pending(task_id: Uuid, job_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            job_id,
            started_at_utc: at,
            status: "pending".into(),
            snapshot_id: None,
            files_new: None,
            data_added: None,
            duration_seconds: None,
            error_message: None,
        }
    }
}

/// Outcome applied to a pending backup log once the agent reports back.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub status: String,
    pub snapshot_id: Option<String>,
    pub files_new: Option<i64>,
    pub data_added: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
}
