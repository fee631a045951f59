//! Persistence collaborator interface
//!
//! The core never owns a database handle directly; everything flows through
//! the [`Store`] trait. Two implementations exist:
//!
//! - [`sqlite::SqliteStore`] - the production backend (WAL mode, pooled,
//!   migrated on startup)
//! - [`memory::MemoryStore`] - in-process maps, used by tests and by the
//!   `memory` storage config for throwaway deployments
//!
//! All timestamps are UTC. Implementations must be `Send + Sync`; they are
//! called concurrently from every agent's connection loop and from the
//! periodic control loops.

pub mod error;
pub mod memory;
pub mod model;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use error::{StoreError, StoreResult};
pub use model::{
    AgentRecord, Alert, AlertRule, AlertTargetType, BackupJob, BackupLog, BackupOutcome,
    Comparator, MetricSample, NewAlert,
};

/// Operations the core needs from the relational store.
#[async_trait]
pub trait Store: Send + Sync {
    // === agents ===

    /// All registered agents. The handshake scans this list to verify a
    /// presented token against every stored hash.
    async fn list_agents(&self) -> StoreResult<Vec<AgentRecord>>;

    async fn agent(&self, id: i64) -> StoreResult<Option<AgentRecord>>;

    async fn set_agent_online(&self, id: i64, online: bool) -> StoreResult<()>;

    /// Stamp last-seen; called after every processed frame.
    async fn touch_agent(&self, id: i64, seen_at: DateTime<Utc>) -> StoreResult<()>;

    // === metrics ===

    async fn insert_metric_sample(&self, sample: MetricSample) -> StoreResult<i64>;

    // === alert rules and alerts ===

    /// Active rules for one agent, in configuration order.
    async fn active_rules(&self, agent_id: i64) -> StoreResult<Vec<AlertRule>>;

    async fn insert_alert(&self, alert: NewAlert) -> StoreResult<i64>;

    /// Creation time of the most recent alert for a (rule, agent) pair.
    /// Cooldown is computed from this row, not from in-memory state, so it
    /// survives hub restarts.
    async fn latest_alert_time(
        &self,
        rule_id: i64,
        agent_id: i64,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    // === backups ===

    async fn active_backup_jobs(&self) -> StoreResult<Vec<BackupJob>>;

    async fn backup_job(&self, id: Uuid) -> StoreResult<Option<BackupJob>>;

    async fn insert_backup_log(&self, log: BackupLog) -> StoreResult<()>;

    async fn backup_log(&self, task_id: Uuid) -> StoreResult<Option<BackupLog>>;

    /// Apply the agent-reported outcome to a log row.
    async fn update_backup_log(&self, task_id: Uuid, outcome: BackupOutcome) -> StoreResult<()>;

    /// Mirror the latest run's status onto the job row.
    async fn update_job_last_run(
        &self,
        job_id: Uuid,
        status: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}
