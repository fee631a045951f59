//! In-memory store
//!
//! Backs tests and throwaway deployments. State lives in plain maps behind
//! one async RwLock; nothing survives a restart. The extra `add_*` /
//! `alerts` helpers are not part of the [`Store`] trait - they exist so
//! tests can seed and inspect state directly.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::model::{
    AgentRecord, Alert, AlertRule, BackupJob, BackupLog, BackupOutcome, MetricSample, NewAlert,
};
use super::Store;

#[derive(Default)]
struct Inner {
    agents: HashMap<i64, AgentRecord>,
    rules: Vec<AlertRule>,
    alerts: Vec<Alert>,
    samples: Vec<MetricSample>,
    jobs: HashMap<Uuid, BackupJob>,
    logs: HashMap<Uuid, BackupLog>,
    next_alert_id: i64,
    next_sample_id: i64,
}

/// Map-backed [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_agent(&self, agent: AgentRecord) {
        self.inner.write().await.agents.insert(agent.id, agent);
    }

    pub async fn add_rule(&self, rule: AlertRule) {
        self.inner.write().await.rules.push(rule);
    }

    pub async fn add_backup_job(&self, job: BackupJob) {
        self.inner.write().await.jobs.insert(job.id, job);
    }

    /// Snapshot of every alert created so far, oldest first.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.inner.read().await.alerts.clone()
    }

    /// Snapshot of every stored metric sample, oldest first.
    pub async fn samples(&self) -> Vec<MetricSample> {
        self.inner.read().await.samples.clone()
    }

    pub async fn logs_for_job(&self, job_id: Uuid) -> Vec<BackupLog> {
        let inner = self.inner.read().await;
        let mut logs: Vec<BackupLog> = inner
            .logs
            .values()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.started_at_utc);
        logs
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_agents(&self) -> StoreResult<Vec<AgentRecord>> {
        let inner = self.inner.read().await;
        let mut agents: Vec<AgentRecord> = inner.agents.values().cloned().collect();
        agents.sort_by_key(|a| a.id);
        Ok(agents)
    }

    async fn agent(&self, id: i64) -> StoreResult<Option<AgentRecord>> {
        Ok(self.inner.read().await.agents.get(&id).cloned())
    }

    async fn set_agent_online(&self, id: i64, online: bool) -> StoreResult<()> {
        if let Some(agent) = self.inner.write().await.agents.get_mut(&id) {
            agent.is_online = online;
        }
        Ok(())
    }

    async fn touch_agent(&self, id: i64, seen_at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(agent) = self.inner.write().await.agents.get_mut(&id) {
            agent.last_seen_utc = Some(seen_at);
        }
        Ok(())
    }

    async fn insert_metric_sample(&self, sample: MetricSample) -> StoreResult<i64> {
        let mut inner = self.inner.write().await;
        inner.next_sample_id += 1;
        let id = inner.next_sample_id;
        inner.samples.push(sample);
        Ok(id)
    }

    async fn active_rules(&self, agent_id: i64) -> StoreResult<Vec<AlertRule>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rules
            .iter()
            .filter(|r| r.agent_id == agent_id && r.is_active)
            .cloned()
            .collect())
    }

    async fn insert_alert(&self, alert: NewAlert) -> StoreResult<i64> {
        let mut inner = self.inner.write().await;
        inner.next_alert_id += 1;
        let id = inner.next_alert_id;
        inner.alerts.push(Alert {
            id,
            created_at_utc: alert.created_at_utc,
            title: alert.title,
            message: alert.message,
            severity: alert.severity,
            agent_id: alert.agent_id,
            rule_id: alert.rule_id,
            is_acknowledged: false,
        });
        Ok(id)
    }

    async fn latest_alert_time(
        &self,
        rule_id: i64,
        agent_id: i64,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .alerts
            .iter()
            .filter(|a| a.rule_id == Some(rule_id) && a.agent_id == agent_id)
            .map(|a| a.created_at_utc)
            .max())
    }

    async fn active_backup_jobs(&self) -> StoreResult<Vec<BackupJob>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<BackupJob> = inner.jobs.values().filter(|j| j.is_active).cloned().collect();
        jobs.sort_by_key(|j| j.created_at_utc);
        Ok(jobs)
    }

    async fn backup_job(&self, id: Uuid) -> StoreResult<Option<BackupJob>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn insert_backup_log(&self, log: BackupLog) -> StoreResult<()> {
        self.inner.write().await.logs.insert(log.task_id, log);
        Ok(())
    }

    async fn backup_log(&self, task_id: Uuid) -> StoreResult<Option<BackupLog>> {
        Ok(self.inner.read().await.logs.get(&task_id).cloned())
    }

    async fn update_backup_log(&self, task_id: Uuid, outcome: BackupOutcome) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let log = inner
            .logs
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("backup log {task_id}")))?;
        log.status = outcome.status;
        log.snapshot_id = outcome.snapshot_id;
        log.files_new = outcome.files_new;
        log.data_added = outcome.data_added;
        log.duration_seconds = outcome.duration_seconds;
        log.error_message = outcome.error_message;
        Ok(())
    }

    async fn update_job_last_run(
        &self,
        job_id: Uuid,
        status: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("backup job {job_id}")))?;
        job.last_run_status = Some(status.to_string());
        job.last_run_at_utc = Some(at);
        Ok(())
    }
}
