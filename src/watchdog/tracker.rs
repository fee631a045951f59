//! Per-entity restart attempt tracking
//!
//! Keyed by (agent, kind, name). Entries are created lazily on the first
//! observed failure and removed entirely when the entity is seen healthy
//! again, so a recovered service starts its next failure episode from a
//! clean slate. All methods take `now` explicitly; the supervisor passes
//! wall-clock time and tests pass fixed instants.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

/// Restart attempts per failure episode before giving up.
pub const MAX_ATTEMPTS: u32 = 3;

/// Wait after a restart command before the next attempt may go out.
pub const COOLDOWN_SECONDS: i64 = 20;

/// Services are restarted; processes are only observed and alerted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Service,
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub agent_id: i64,
    pub kind: EntityKind,
    pub name: String,
}

impl TrackKey {
    pub fn service(agent_id: i64, name: &str) -> Self {
        Self {
            agent_id,
            kind: EntityKind::Service,
            name: name.to_string(),
        }
    }

    pub fn process(agent_id: i64, name: &str) -> Self {
        Self {
            agent_id,
            kind: EntityKind::Process,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct TrackState {
    attempts: u32,
    last_attempt_utc: Option<DateTime<Utc>>,
    cooldown_until_utc: Option<DateTime<Utc>>,
    alert_sent: bool,
}

/// Concurrent restart/alert bookkeeping for all agents.
#[derive(Debug, Default)]
pub struct RestartTracker {
    entries: DashMap<TrackKey, TrackState>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one restart attempt; returns the new attempt count.
    pub fn record_attempt(&self, key: &TrackKey, now: DateTime<Utc>) -> u32 {
        let mut entry = self.entries.entry(key.clone()).or_default();
        entry.attempts += 1;
        entry.last_attempt_utc = Some(now);
        debug!(
            "restart attempt {}/{} for '{}' on agent {}",
            entry.attempts, MAX_ATTEMPTS, key.name, key.agent_id
        );
        entry.attempts
    }

    pub fn attempt_count(&self, key: &TrackKey) -> u32 {
        self.entries.get(key).map(|e| e.attempts).unwrap_or(0)
    }

    pub fn reached_max_attempts(&self, key: &TrackKey) -> bool {
        self.attempt_count(key) >= MAX_ATTEMPTS
    }

    /// Clear all tracked state for an entity (observed healthy).
    pub fn reset(&self, key: &TrackKey) {
        if self.entries.remove(key).is_some() {
            debug!("reset tracking for '{}' on agent {}", key.name, key.agent_id);
        }
    }

    pub fn in_cooldown(&self, key: &TrackKey, now: DateTime<Utc>) -> bool {
        self.entries
            .get(key)
            .and_then(|e| e.cooldown_until_utc)
            .is_some_and(|until| now < until)
    }

    pub fn start_cooldown(&self, key: &TrackKey, now: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.cooldown_until_utc = Some(now + Duration::seconds(COOLDOWN_SECONDS));
        }
    }

    /// One-shot flag: has the failure (or offline) alert for the current
    /// episode already gone out?
    pub fn alert_sent(&self, key: &TrackKey) -> bool {
        self.entries.get(key).map(|e| e.alert_sent).unwrap_or(false)
    }

    pub fn mark_alert_sent(&self, key: &TrackKey) {
        let mut entry = self.entries.entry(key.clone()).or_default();
        entry.alert_sent = true;
    }
}
