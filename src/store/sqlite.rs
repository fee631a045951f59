//! SQLite store implementation
//!
//! WAL mode with a small connection pool; schema versioning through
//! `sqlx::migrate!`. Suitable for fleets up to a few hundred agents - the
//! hot paths (rule loads, alert inserts, metric inserts) are all indexed
//! single-table operations.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::model::{
    AgentRecord, AlertRule, AlertTargetType, BackupJob, BackupLog, BackupOutcome, MetricSample,
    NewAlert,
};
use super::Store;

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) and migrate the database at `db_path`.
    #[instrument(skip_all)]
    pub async fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();
        info!("opening SQLite store at {}", db_path);

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self { pool })
    }

    fn to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn from_millis(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn parse_target_type(s: &str) -> StoreResult<AlertTargetType> {
        match s {
            "server" => Ok(AlertTargetType::Server),
            "disk" => Ok(AlertTargetType::Disk),
            "network" => Ok(AlertTargetType::Network),
            "process" => Ok(AlertTargetType::Process),
            "service" => Ok(AlertTargetType::Service),
            other => Err(StoreError::SerializationError(format!(
                "unknown alert target type: {other}"
            ))),
        }
    }

    fn target_type_str(t: AlertTargetType) -> &'static str {
        match t {
            AlertTargetType::Server => "server",
            AlertTargetType::Disk => "disk",
            AlertTargetType::Network => "network",
            AlertTargetType::Process => "process",
            AlertTargetType::Service => "service",
        }
    }

    fn parse_uuid(s: &str) -> StoreResult<Uuid> {
        Uuid::parse_str(s).map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> AgentRecord {
        AgentRecord {
            id: row.get("id"),
            name: row.get("name"),
            token_hash: row.get("token_hash"),
            is_online: row.get::<i64, _>("is_online") != 0,
            last_seen_utc: row.get::<Option<i64>, _>("last_seen").map(Self::from_millis),
        }
    }

    fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<BackupJob> {
        Ok(BackupJob {
            id: Self::parse_uuid(row.get("id"))?,
            agent_id: row.get("agent_id"),
            name: row.get("name"),
            schedule_cron: row.get("schedule_cron"),
            source_path: row.get("source_path"),
            repo_url: row.get("repo_url"),
            encrypted_password: row.get("encrypted_password"),
            encrypted_ssh_key: row.get("encrypted_ssh_key"),
            is_active: row.get::<i64, _>("is_active") != 0,
            created_at_utc: Self::from_millis(row.get("created_at")),
            last_run_at_utc: row
                .get::<Option<i64>, _>("last_run_at")
                .map(Self::from_millis),
            last_run_status: row.get("last_run_status"),
        })
    }

    fn log_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<BackupLog> {
        Ok(BackupLog {
            task_id: Self::parse_uuid(row.get("task_id"))?,
            job_id: Self::parse_uuid(row.get("job_id"))?,
            started_at_utc: Self::from_millis(row.get("started_at")),
            status: row.get("status"),
            snapshot_id: row.get("snapshot_id"),
            files_new: row.get("files_new"),
            data_added: row.get("data_added"),
            duration_seconds: row.get("duration_seconds"),
            error_message: row.get("error_message"),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_agents(&self) -> StoreResult<Vec<AgentRecord>> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::agent_from_row).collect())
    }

    async fn agent(&self, id: i64) -> StoreResult<Option<AgentRecord>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::agent_from_row))
    }

    async fn set_agent_online(&self, id: i64, online: bool) -> StoreResult<()> {
        sqlx::query("UPDATE agents SET is_online = ? WHERE id = ?")
            .bind(online as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_agent(&self, id: i64, seen_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE agents SET last_seen = ? WHERE id = ?")
            .bind(Self::to_millis(&seen_at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_metric_sample(&self, sample: MetricSample) -> StoreResult<i64> {
        let payload_json = serde_json::to_string(&sample.payload)?;
        let result = sqlx::query(
            r#"
            INSERT INTO metric_samples (
                agent_id, timestamp, cpu_usage_percent, ram_usage_percent,
                ram_used_gb, load_1m, load_5m, load_15m, payload
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sample.agent_id)
        .bind(Self::to_millis(&sample.timestamp_utc))
        .bind(sample.cpu_usage_percent)
        .bind(sample.ram_usage_percent)
        .bind(sample.ram_used_gb)
        .bind(sample.load_1m)
        .bind(sample.load_5m)
        .bind(sample.load_15m)
        .bind(payload_json)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn active_rules(&self, agent_id: i64) -> StoreResult<Vec<AlertRule>> {
        let rows =
            sqlx::query("SELECT * FROM alert_rules WHERE agent_id = ? AND is_active = 1 ORDER BY id")
                .bind(agent_id)
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|row| {
                Ok(AlertRule {
                    id: row.get("id"),
                    agent_id: row.get("agent_id"),
                    target_type: Self::parse_target_type(row.get("target_type"))?,
                    metric: row.get("metric"),
                    comparison: row
                        .get::<String, _>("comparison")
                        .parse()
                        .map_err(StoreError::SerializationError)?,
                    threshold_value: row.get("threshold_value"),
                    severity: row.get("severity"),
                    target_id: row.get("target_id"),
                    cooldown_minutes: row.get("cooldown_minutes"),
                    is_active: true,
                })
            })
            .collect()
    }

    async fn insert_alert(&self, alert: NewAlert) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO alerts (created_at, title, message, severity, agent_id, rule_id, is_acknowledged)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(Self::to_millis(&alert.created_at_utc))
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&alert.severity)
        .bind(alert.agent_id)
        .bind(alert.rule_id)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn latest_alert_time(
        &self,
        rule_id: i64,
        agent_id: i64,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT created_at FROM alerts
            WHERE rule_id = ? AND agent_id = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(rule_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Self::from_millis(r.get("created_at"))))
    }

    async fn active_backup_jobs(&self) -> StoreResult<Vec<BackupJob>> {
        let rows = sqlx::query("SELECT * FROM backup_jobs WHERE is_active = 1 ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn backup_job(&self, id: Uuid) -> StoreResult<Option<BackupJob>> {
        let row = sqlx::query("SELECT * FROM backup_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn insert_backup_log(&self, log: BackupLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_logs (
                task_id, job_id, started_at, status, snapshot_id,
                files_new, data_added, duration_seconds, error_message
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.task_id.to_string())
        .bind(log.job_id.to_string())
        .bind(Self::to_millis(&log.started_at_utc))
        .bind(&log.status)
        .bind(&log.snapshot_id)
        .bind(log.files_new)
        .bind(log.data_added)
        .bind(log.duration_seconds)
        .bind(&log.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn backup_log(&self, task_id: Uuid) -> StoreResult<Option<BackupLog>> {
        let row = sqlx::query("SELECT * FROM backup_logs WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::log_from_row).transpose()
    }

    async fn update_backup_log(&self, task_id: Uuid, outcome: BackupOutcome) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE backup_logs
            SET status = ?, snapshot_id = ?, files_new = ?, data_added = ?,
                duration_seconds = ?, error_message = ?
            WHERE task_id = ?
            "#,
        )
        .bind(&outcome.status)
        .bind(&outcome.snapshot_id)
        .bind(outcome.files_new)
        .bind(outcome.data_added)
        .bind(outcome.duration_seconds)
        .bind(&outcome.error_message)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("backup log {task_id}")));
        }
        Ok(())
    }

    async fn update_job_last_run(
        &self,
        job_id: Uuid,
        status: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE backup_jobs SET last_run_status = ?, last_run_at = ? WHERE id = ?")
                .bind(status)
                .bind(Self::to_millis(&at))
                .bind(job_id.to_string())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("backup job {job_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payloads::MetricsPayload;

    async fn open_temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("hub.db")).await.unwrap();
        (store, dir)
    }

    async fn seed_agent(store: &SqliteStore, id: i64, name: &str) {
        sqlx::query("INSERT INTO agents (id, name, token_hash, is_online) VALUES (?, ?, NULL, 0)")
            .bind(id)
            .bind(name)
            .execute(&store.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn migrations_create_schema_and_agents_round_trip() {
        let (store, _dir) = open_temp_store().await;
        seed_agent(&store, 1, "web-1").await;

        store.set_agent_online(1, true).await.unwrap();
        let now = Utc::now();
        store.touch_agent(1, now).await.unwrap();

        let agents = store.list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].is_online);
        // millisecond precision on the wire
        assert_eq!(
            agents[0].last_seen_utc.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn metric_sample_insert_returns_row_id() {
        let (store, _dir) = open_temp_store().await;
        seed_agent(&store, 1, "web-1").await;

        let sample = MetricSample::from_payload(1, Utc::now(), &MetricsPayload::default());
        let first = store.insert_metric_sample(sample.clone()).await.unwrap();
        let second = store.insert_metric_sample(sample).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn backup_job_and_log_round_trip() {
        let (store, _dir) = open_temp_store().await;
        let job_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let created = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO backup_jobs (
                id, agent_id, name, schedule_cron, source_path, repo_url,
                encrypted_password, encrypted_ssh_key, is_active, created_at
            )
            VALUES (?, 1, 'nightly', '0 2 * * *', '/srv', 'rest:https://backups', 'ENCv1:x', 'ENCv1:y', 1, ?)
            "#,
        )
        .bind(job_id.to_string())
        .bind(created.timestamp_millis())
        .execute(&store.pool)
        .await
        .unwrap();

        let jobs = store.active_backup_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].schedule_cron, "0 2 * * *");
        assert!(jobs[0].last_run_at_utc.is_none());

        store
            .insert_backup_log(BackupLog::pending(task_id, job_id, Utc::now()))
            .await
            .unwrap();
        store
            .update_backup_log(
                task_id,
                BackupOutcome {
                    status: "success".into(),
                    snapshot_id: Some("snap".into()),
                    files_new: Some(3),
                    data_added: Some(1024),
                    duration_seconds: Some(1.2),
                    error_message: None,
                },
            )
            .await
            .unwrap();
        store
            .update_job_last_run(job_id, "success", Utc::now())
            .await
            .unwrap();

        let log = store.backup_log(task_id).await.unwrap().unwrap();
        assert_eq!(log.status, "success");
        let job = store.backup_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.last_run_status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn updating_unknown_log_is_not_found() {
        let (store, _dir) = open_temp_store().await;
        let err = store
            .update_backup_log(
                Uuid::new_v4(),
                BackupOutcome {
                    status: "success".into(),
                    snapshot_id: None,
                    files_new: None,
                    data_added: None,
                    duration_seconds: None,
                    error_message: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
