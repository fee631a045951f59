//! Cron-driven backup triggering
//!
//! A fixed 1-minute tick walks every active backup job, parses its 5-field
//! cron expression, and computes the next occurrence after
//! `max(lastRun, createdAt)` (UTC). A due job is triggered:
//!
//! - agent offline: an `error` log row ("agent offline") is written and no
//!   command is sent
//! - agent online: credentials are decrypted, a fresh task id is generated,
//!   a `pending` log row is written, and a fire-and-forget `trigger-backup`
//!   goes out carrying the task id
//!
//! The outcome arrives later as an unsolicited `backup-completed` event
//! handled by the router; the task id is the only correlation between
//! trigger and completion. A failure for one job never stops the rest of
//! the tick.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::commands::CommandClient;
use crate::crypto::CredentialCipher;
use crate::gateway::registry::ConnectionRegistry;
use crate::protocol::actions;
use crate::protocol::payloads::TriggerBackupPayload;
use crate::store::{BackupJob, BackupLog, Store};

/// Tick interval of the scheduler loop.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub struct BackupScheduler {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    commands: CommandClient,
    cipher: CredentialCipher,
}

impl BackupScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        commands: CommandClient,
        cipher: CredentialCipher,
    ) -> Self {
        Self {
            store,
            registry,
            commands,
            cipher,
        }
    }

    /// Spawn the periodic loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("backup scheduler running");
            let mut tick = tokio::time::interval(CHECK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tick.tick().await;
                self.check_due_jobs(Utc::now()).await;
            }
        })
    }

    /// One scheduler tick: trigger every job whose next occurrence is due.
    #[instrument(skip(self))]
    pub async fn check_due_jobs(&self, now: DateTime<Utc>) {
        let jobs = match self.store.active_backup_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("failed to load backup jobs: {e}");
                return;
            }
        };

        for job in jobs {
            match Self::next_occurrence(&job) {
                Ok(Some(next)) if next <= now => {
                    info!(
                        "triggering scheduled backup job {} ('{}') for agent {}",
                        job.id, job.name, job.agent_id
                    );
                    if let Err(e) = self.trigger_job(&job, now).await {
                        error!("failed to trigger backup job {}: {e}", job.id);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        "failed to evaluate schedule '{}' for job {}: {e}",
                        job.schedule_cron, job.id
                    );
                }
            }
        }
    }

    /// Next occurrence strictly after `max(lastRun, createdAt)`, in UTC.
    /// None means the schedule has no future occurrence.
    pub fn next_occurrence(job: &BackupJob) -> anyhow::Result<Option<DateTime<Utc>>> {
        let schedule = parse_cron(&job.schedule_cron)?;
        let from = job
            .last_run_at_utc
            .map_or(job.created_at_utc, |last| last.max(job.created_at_utc));
        Ok(schedule.after(&from).next())
    }

    /// Trigger one job now. Returns the task id written to the log.
    pub async fn trigger_job(&self, job: &BackupJob, now: DateTime<Utc>) -> anyhow::Result<Uuid> {
        if !self.registry.is_online(job.agent_id) {
            warn!(
                "cannot trigger backup job {}: agent {} is offline",
                job.id, job.agent_id
            );

            let task_id = Uuid::new_v4();
            let mut log = BackupLog::pending(task_id, job.id, now);
            log.status = "error".into();
            log.error_message = Some("Agent is offline".into());
            self.store.insert_backup_log(log).await?;
            self.store.update_job_last_run(job.id, "error", now).await?;

            return Ok(task_id);
        }

        let password = self
            .cipher
            .decrypt(&job.encrypted_password)
            .with_context(|| format!("credentials of job {}", job.id))?;
        let ssh_key = self
            .cipher
            .decrypt(&job.encrypted_ssh_key)
            .with_context(|| format!("credentials of job {}", job.id))?;

        let task_id = Uuid::new_v4();
        self.store
            .insert_backup_log(BackupLog::pending(task_id, job.id, now))
            .await?;
        self.store.update_job_last_run(job.id, "pending", now).await?;

        let payload = TriggerBackupPayload {
            task_id: task_id.to_string(),
            source: job.source_path.clone(),
            repo: job.repo_url.clone(),
            password,
            ssh_key,
        };

        self.commands.send_fire_and_forget(
            job.agent_id,
            actions::TRIGGER_BACKUP,
            Some(serde_json::to_value(&payload)?),
        )?;

        debug!(
            "backup job {} triggered with task id {task_id} for agent {}",
            job.id, job.agent_id
        );
        Ok(task_id)
    }
}

/// Parse a standard 5-field cron expression. The `cron` crate expects a
/// seconds field, so 5-field expressions get `0 ` prefixed.
pub fn parse_cron(expression: &str) -> anyhow::Result<Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expression}"),
        6 | 7 => expression.to_string(),
        _ => return Err(anyhow!("cron expression must have 5 fields: '{expression}'")),
    };
    Schedule::from_str(&normalized)
        .map_err(|e| anyhow!("invalid cron expression '{expression}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::commands::CorrelationEngine;
    use crate::gateway::registry::AgentLink;
    use crate::store::memory::MemoryStore;
    use crate::store::BackupJob;

    fn job(agent_id: i64, cron_expr: &str, created: DateTime<Utc>, cipher: &CredentialCipher) -> BackupJob {
        BackupJob {
            id: Uuid::new_v4(),
            agent_id,
            name: "nightly".into(),
            schedule_cron: cron_expr.into(),
            source_path: "/srv/data".into(),
            repo_url: "rest:https://backups.example".into(),
            encrypted_password: cipher.encrypt("repo-pass"),
            encrypted_ssh_key: cipher.encrypt("ssh-key"),
            is_active: true,
            created_at_utc: created,
            last_run_at_utc: None,
            last_run_status: None,
        }
    }

    fn cipher() -> CredentialCipher {
        use base64::Engine;
        let key = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        CredentialCipher::from_base64(&key).unwrap()
    }

    struct Fixture {
        scheduler: BackupScheduler,
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        wire_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, wire_rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register(1, AgentLink::new(registry.allocate_connection_id(), tx));

        let (engine, _retry_rx, _failed_rx) = CorrelationEngine::new(3);
        let commands = CommandClient::new(Arc::clone(&registry), engine);
        let store = Arc::new(MemoryStore::new());

        Fixture {
            scheduler: BackupScheduler::new(
                store.clone(),
                Arc::clone(&registry),
                commands,
                cipher(),
            ),
            store,
            registry,
            wire_rx,
        }
    }

    #[test]
    fn five_field_cron_parses_and_six_field_passes_through() {
        assert!(parse_cron("0 2 * * *").is_ok());
        assert!(parse_cron("0 0 2 * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("* *").is_err());
    }

    #[test]
    fn daily_job_created_morning_first_due_next_day() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let job = job(1, "0 2 * * *", created, &cipher());

        let next = BackupScheduler::next_occurrence(&job).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap());

        // not due before 02:00 the next day
        let evening = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();
        assert!(next > evening);
    }

    #[test]
    fn next_occurrence_counts_from_last_run_when_present() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let mut j = job(1, "0 2 * * *", created, &cipher());
        j.last_run_at_utc = Some(Utc.with_ymd_and_hms(2024, 3, 5, 2, 0, 0).unwrap());

        let next = BackupScheduler::next_occurrence(&j).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 6, 2, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn due_job_writes_pending_log_and_sends_trigger() {
        let mut fx = fixture();
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let j = job(1, "0 2 * * *", created, &cipher());
        fx.store.add_backup_job(j.clone()).await;

        let now = Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 30).unwrap();
        fx.scheduler.check_due_jobs(now).await;

        let logs = fx.store.logs_for_job(j.id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "pending");

        let frame = fx.wire_rx.try_recv().unwrap();
        let envelope: crate::protocol::Envelope = serde_json::from_str(&frame).unwrap();
        assert_eq!(envelope.action, actions::TRIGGER_BACKUP);

        let payload: TriggerBackupPayload =
            serde_json::from_value(envelope.payload.unwrap()).unwrap();
        assert_eq!(payload.task_id, logs[0].task_id.to_string());
        // credentials travel decrypted
        assert_eq!(payload.password, "repo-pass");

        let job_row = fx.store.backup_job(j.id).await.unwrap().unwrap();
        assert_eq!(job_row.last_run_status.as_deref(), Some("pending"));
    }

    #[tokio::test]
    async fn job_not_due_yet_is_skipped() {
        let mut fx = fixture();
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let j = job(1, "0 2 * * *", created, &cipher());
        fx.store.add_backup_job(j.clone()).await;

        // day0 evening: the 02:00 slot has not come around yet
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 0).unwrap();
        fx.scheduler.check_due_jobs(now).await;

        assert!(fx.store.logs_for_job(j.id).await.is_empty());
        assert!(fx.wire_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_agent_writes_error_log_without_sending() {
        let mut fx = fixture();
        fx.registry.remove(1);

        let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let j = job(1, "0 2 * * *", created, &cipher());
        fx.store.add_backup_job(j.clone()).await;

        let now = Utc.with_ymd_and_hms(2024, 3, 2, 2, 1, 0).unwrap();
        fx.scheduler.check_due_jobs(now).await;

        let logs = fx.store.logs_for_job(j.id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "error");
        assert_eq!(logs[0].error_message.as_deref(), Some("Agent is offline"));
        assert!(fx.wire_rx.try_recv().is_err());

        let job_row = fx.store.backup_job(j.id).await.unwrap().unwrap();
        assert_eq!(job_row.last_run_status.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn bad_cron_on_one_job_does_not_stop_others() {
        let mut fx = fixture();
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

        let broken = job(1, "definitely not cron", created, &cipher());
        let good = job(1, "0 2 * * *", created, &cipher());
        fx.store.add_backup_job(broken).await;
        fx.store.add_backup_job(good.clone()).await;

        let now = Utc.with_ymd_and_hms(2024, 3, 2, 2, 1, 0).unwrap();
        fx.scheduler.check_due_jobs(now).await;

        assert_eq!(fx.store.logs_for_job(good.id).await.len(), 1);
    }
}
