//! Request/response correlation with timeout-driven retry
//!
//! Every command sent to an agent gets a process-unique, monotonically
//! increasing id. The engine stores a pending record per id and resolves it
//! when the router hands in a reply with the same id. A per-request timer
//! drives retries: when an attempt's window elapses without a reply, the
//! engine emits a retry notice (the transport layer performs the actual
//! resend) and re-arms the window. After the configured number of retries
//! the request is failed terminally.
//!
//! Two invariants matter more than anything else here:
//!
//! - a retried request keeps its original id, so the agent treats the retry
//!   as the same logical request, and a late reply to an early attempt still
//!   resolves it
//! - resolution is idempotent: the first matching reply wins, every later
//!   one reports "no match" and is merely logged by the caller
//!
//! Retry and failure notifications travel over explicit channels handed out
//! at construction time; nothing subscribes ambiently.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::Envelope;

/// Default window per attempt for tracked commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Registration window for fire-and-forget commands. The entry only exists
/// so a late reply does not log as an unknown id.
pub const FIRE_AND_FORGET_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub type RequestId = i64;

/// Terminal outcomes a command caller can observe. The three variants that
/// reach operators (not-connected, timeout, cancelled) stay distinguishable
/// so an HTTP-facing collaborator can map them to status codes.
#[derive(Debug)]
pub enum CommandError {
    /// The target agent has no open connection. Fails immediately and never
    /// consumes the retry budget.
    NotConnected(i64),

    /// No reply within the window across all retries.
    TimedOut {
        agent_id: i64,
        action: String,
        retries: u32,
    },

    /// The caller (or shutdown) cancelled the wait.
    Cancelled(String),

    /// The reply arrived but its payload did not decode as expected.
    BadReply(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::NotConnected(agent_id) => {
                write!(f, "agent {} is not connected", agent_id)
            }
            CommandError::TimedOut {
                agent_id,
                action,
                retries,
            } => write!(
                f,
                "'{}' on agent {} timed out after {} retries",
                action, agent_id, retries
            ),
            CommandError::Cancelled(reason) => write!(f, "request cancelled: {}", reason),
            CommandError::BadReply(msg) => write!(f, "malformed reply: {}", msg),
        }
    }
}

impl std::error::Error for CommandError {}

/// Emitted when an attempt's window elapsed and the request should be
/// re-sent with its original id.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub id: RequestId,
    pub agent_id: i64,
    pub action: String,
    pub payload: Option<Value>,
    /// 1-based retry attempt number.
    pub attempt: u32,
}

/// Emitted exactly once when a request exhausts its retries.
#[derive(Debug, Clone)]
pub struct FailureNotice {
    pub id: RequestId,
    pub agent_id: i64,
    pub action: String,
    pub retries: u32,
}

struct Pending {
    agent_id: i64,
    action: String,
    payload: Option<Value>,
    retry_count: u32,
    respond_to: Option<oneshot::Sender<Result<Envelope, CommandError>>>,
}

enum TimeoutVerdict {
    /// Retry emitted; keep the timer armed.
    Rearm,
    /// Entry resolved or failed; timer can stop.
    Done,
}

pub struct CorrelationEngine {
    pending: DashMap<RequestId, Pending>,
    next_id: AtomicI64,
    max_retries: u32,
    retry_tx: mpsc::UnboundedSender<RetryNotice>,
    failed_tx: mpsc::UnboundedSender<FailureNotice>,
}

impl CorrelationEngine {
    /// Build an engine plus the receiving ends of its notification
    /// channels. The transport layer consumes retries, observers consume
    /// failures; both are wired once at startup.
    pub fn new(
        max_retries: u32,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<RetryNotice>,
        mpsc::UnboundedReceiver<FailureNotice>,
    ) {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            pending: DashMap::new(),
            next_id: AtomicI64::new(1),
            max_retries,
            retry_tx,
            failed_tx,
        });

        (engine, retry_rx, failed_rx)
    }

    /// Store a pending request, arm its timeout timer, and hand back the id
    /// together with the completion slot.
    pub fn register(
        self: &Arc<Self>,
        agent_id: i64,
        action: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> (RequestId, oneshot::Receiver<Result<Envelope, CommandError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            id,
            Pending {
                agent_id,
                action: action.to_string(),
                payload,
                retry_count: 0,
                respond_to: Some(tx),
            },
        );

        debug!("registered request {id} ('{action}') for agent {agent_id}");

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;
                match engine.on_timeout(id) {
                    TimeoutVerdict::Rearm => continue,
                    TimeoutVerdict::Done => break,
                }
            }
        });

        (id, rx)
    }

    /// Resolve a pending request with a reply frame.
    ///
    /// Returns whether a pending request existed for the id. A false result
    /// is an expected race (the request just timed out, or a duplicate
    /// reply arrived) - callers log it and move on.
    pub fn complete(&self, id: RequestId, reply: Envelope) -> bool {
        match self.pending.remove(&id) {
            Some((_, mut pending)) => {
                if let Some(tx) = pending.respond_to.take() {
                    let _ = tx.send(Ok(reply));
                }
                true
            }
            None => false,
        }
    }

    /// Resolve a pending request with an error. The wait is released
    /// immediately; an already-sent wire request is unaffected and any late
    /// reply will log as unmatched.
    pub fn cancel(&self, id: RequestId, reason: &str) -> bool {
        match self.pending.remove(&id) {
            Some((_, mut pending)) => {
                debug!("cancelled request {id}: {reason}");
                if let Some(tx) = pending.respond_to.take() {
                    let _ = tx.send(Err(CommandError::Cancelled(reason.to_string())));
                }
                true
            }
            None => false,
        }
    }

    /// Number of requests currently awaiting a reply (diagnostics).
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn on_timeout(&self, id: RequestId) -> TimeoutVerdict {
        // Fast path: resolved while the timer slept.
        let Some(mut entry) = self.pending.get_mut(&id) else {
            return TimeoutVerdict::Done;
        };

        if entry.retry_count < self.max_retries {
            entry.retry_count += 1;
            let notice = RetryNotice {
                id,
                agent_id: entry.agent_id,
                action: entry.action.clone(),
                payload: entry.payload.clone(),
                attempt: entry.retry_count,
            };
            drop(entry);

            warn!(
                "request {} ('{}') timed out, retry {}/{}",
                notice.id, notice.action, notice.attempt, self.max_retries
            );
            let _ = self.retry_tx.send(notice);
            return TimeoutVerdict::Rearm;
        }
        drop(entry);

        // Retries exhausted: remove, fail the waiter, notify observers.
        if let Some((_, mut pending)) = self.pending.remove(&id) {
            warn!(
                "request {} ('{}') on agent {} failed after {} retries",
                id, pending.action, pending.agent_id, pending.retry_count
            );

            if let Some(tx) = pending.respond_to.take() {
                let _ = tx.send(Err(CommandError::TimedOut {
                    agent_id: pending.agent_id,
                    action: pending.action.clone(),
                    retries: pending.retry_count,
                }));
            }

            let _ = self.failed_tx.send(FailureNotice {
                id,
                agent_id: pending.agent_id,
                action: pending.action,
                retries: pending.retry_count,
            });
        }

        TimeoutVerdict::Done
    }
}
