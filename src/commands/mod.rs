//! Command path to agents
//!
//! [`CommandClient`] composes the wire envelope, writes it to the target
//! agent's registered link, and couples the send to the correlation engine:
//!
//! - [`CommandClient::send_and_wait`] suspends the caller until the reply,
//!   retry-exhaustion failure, or cancellation
//! - [`CommandClient::send_fire_and_forget`] registers the request (so the
//!   eventual reply does not log as an unknown id) and returns immediately
//!
//! The retry worker owns the resend side of the retry contract: the engine
//! decides *when* to retry, the worker (holding the registry) decides
//! *whether* a send is currently possible. A retry with no open link is
//! skipped with a warning; the original wait keeps running until the retry
//! budget is spent.

pub mod correlation;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::gateway::registry::ConnectionRegistry;
use crate::hub::{events, UiHub};
use crate::protocol::{actions, Envelope};

pub use correlation::{
    CommandError, CorrelationEngine, FailureNotice, RequestId, RetryNotice, DEFAULT_MAX_RETRIES,
    DEFAULT_TIMEOUT, FIRE_AND_FORGET_TIMEOUT,
};

#[derive(Clone)]
pub struct CommandClient {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<CorrelationEngine>,
}

impl CommandClient {
    pub fn new(registry: Arc<ConnectionRegistry>, engine: Arc<CorrelationEngine>) -> Self {
        Self { registry, engine }
    }

    /// Send a command and suspend until its reply arrives or the request
    /// fails terminally. Fails fast with [`CommandError::NotConnected`]
    /// before consuming any retry budget.
    #[instrument(skip(self, payload))]
    pub async fn send_and_wait(
        &self,
        agent_id: i64,
        action: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<Envelope, CommandError> {
        if !self.registry.is_online(agent_id) {
            return Err(CommandError::NotConnected(agent_id));
        }

        let (id, rx) = self.engine.register(agent_id, action, payload.clone(), timeout);
        let envelope = Envelope::request(id, action, payload);
        let frame = serde_json::to_string(&envelope)
            .map_err(|e| CommandError::BadReply(format!("failed to encode request: {e}")))?;

        debug!("sending request {id} ('{action}') to agent {agent_id}");

        if !self.registry.send_to(agent_id, frame) {
            self.engine.cancel(id, "link closed before send");
            return Err(CommandError::NotConnected(agent_id));
        }

        match rx.await {
            Ok(outcome) => outcome,
            // the engine was torn down mid-wait (shutdown)
            Err(_) => Err(CommandError::Cancelled("engine dropped".into())),
        }
    }

    /// [`Self::send_and_wait`] with a caller-supplied cancellation signal.
    ///
    /// Cancellation releases the pending request immediately; it cannot
    /// recall an already-sent wire request, and a late reply will log as
    /// unmatched.
    pub async fn send_and_wait_cancellable(
        &self,
        agent_id: i64,
        action: &str,
        payload: Option<Value>,
        timeout: Duration,
        cancel: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<Envelope, CommandError> {
        if !self.registry.is_online(agent_id) {
            return Err(CommandError::NotConnected(agent_id));
        }

        let (id, rx) = self.engine.register(agent_id, action, payload.clone(), timeout);
        let envelope = Envelope::request(id, action, payload);
        let frame = serde_json::to_string(&envelope)
            .map_err(|e| CommandError::BadReply(format!("failed to encode request: {e}")))?;

        if !self.registry.send_to(agent_id, frame) {
            self.engine.cancel(id, "link closed before send");
            return Err(CommandError::NotConnected(agent_id));
        }

        tokio::select! {
            outcome = rx => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(CommandError::Cancelled("engine dropped".into())),
            },
            _ = cancel => {
                self.engine.cancel(id, "cancelled by caller");
                Err(CommandError::Cancelled("cancelled by caller".into()))
            }
        }
    }

    /// [`Self::send_and_wait`] plus typed decoding of the reply payload.
    pub async fn send_command<R: DeserializeOwned>(
        &self,
        agent_id: i64,
        action: &str,
        payload: Option<Value>,
    ) -> Result<R, CommandError> {
        let reply = self
            .send_and_wait(agent_id, action, payload, DEFAULT_TIMEOUT)
            .await?;
        let body = reply.payload.unwrap_or(Value::Null);
        serde_json::from_value(body).map_err(|e| CommandError::BadReply(e.to_string()))
    }

    /// Send a command without waiting. The completion (if any) arrives later
    /// as an independent event; the registration only exists so the agent's
    /// reply resolves cleanly instead of logging as an unknown id.
    pub fn send_fire_and_forget(
        &self,
        agent_id: i64,
        action: &str,
        payload: Option<Value>,
    ) -> Result<RequestId, CommandError> {
        if !self.registry.is_online(agent_id) {
            return Err(CommandError::NotConnected(agent_id));
        }

        let (id, _discarded) =
            self.engine
                .register(agent_id, action, payload.clone(), FIRE_AND_FORGET_TIMEOUT);
        let envelope = Envelope::request(id, action, payload);
        let frame = serde_json::to_string(&envelope)
            .map_err(|e| CommandError::BadReply(format!("failed to encode request: {e}")))?;

        debug!("sending fire-and-forget {id} ('{action}') to agent {agent_id}");

        if !self.registry.send_to(agent_id, frame) {
            self.engine.cancel(id, "link closed before send");
            return Err(CommandError::NotConnected(agent_id));
        }

        Ok(id)
    }

    // Convenience wrappers for the actions the hub issues. The typed ones
    // are the surface the HTTP-facing collaborator calls through.

    pub async fn get_server_info<R: DeserializeOwned>(&self, agent_id: i64) -> Result<R, CommandError> {
        self.send_command(agent_id, actions::GET_SERVER_INFO, None).await
    }

    pub async fn get_services<R: DeserializeOwned>(&self, agent_id: i64) -> Result<R, CommandError> {
        self.send_command(agent_id, actions::GET_SERVICES, None).await
    }

    pub async fn get_service<R: DeserializeOwned>(
        &self,
        agent_id: i64,
        name: &str,
    ) -> Result<R, CommandError> {
        self.send_command(agent_id, actions::GET_SERVICE, Some(json!({ "name": name })))
            .await
    }

    pub async fn get_service_log<R: DeserializeOwned>(
        &self,
        agent_id: i64,
        name: &str,
        lines: u32,
    ) -> Result<R, CommandError> {
        self.send_command(
            agent_id,
            actions::GET_SERVICE_LOG,
            Some(json!({ "name": name, "lines": lines })),
        )
        .await
    }

    pub async fn get_processes<R: DeserializeOwned>(&self, agent_id: i64) -> Result<R, CommandError> {
        self.send_command(agent_id, actions::GET_PROCESSES, None).await
    }

    pub async fn get_process<R: DeserializeOwned>(
        &self,
        agent_id: i64,
        pid: i64,
    ) -> Result<R, CommandError> {
        self.send_command(agent_id, actions::GET_PROCESS, Some(json!({ "pid": pid })))
            .await
    }

    pub async fn update_agent_config<R: DeserializeOwned>(
        &self,
        agent_id: i64,
        config: Value,
    ) -> Result<R, CommandError> {
        self.send_command(agent_id, actions::UPDATE_AGENT_CONFIG, Some(config))
            .await
    }

    /// Spawn the worker that re-sends timed-out requests. The identical id
    /// and payload go back on the wire with only a fresh timestamp.
    pub fn spawn_retry_worker(
        &self,
        mut retry_rx: mpsc::UnboundedReceiver<RetryNotice>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            while let Some(notice) = retry_rx.recv().await {
                let envelope = Envelope::request(notice.id, &notice.action, notice.payload.clone());
                let frame = match serde_json::to_string(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("failed to encode retry for request {}: {e}", notice.id);
                        continue;
                    }
                };

                if registry.send_to(notice.agent_id, frame) {
                    debug!(
                        "re-sent request {} ('{}') to agent {}, attempt {}",
                        notice.id, notice.action, notice.agent_id, notice.attempt
                    );
                } else {
                    warn!(
                        "cannot retry request {}: agent {} not connected, skipping",
                        notice.id, notice.agent_id
                    );
                }
            }
        })
    }
}

/// Spawn the observer that turns terminal request failures into
/// `CommandFailed` broadcasts for operator clients.
pub fn spawn_failure_listener(
    hub: UiHub,
    mut failed_rx: mpsc::UnboundedReceiver<FailureNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failure) = failed_rx.recv().await {
            error!(
                "broadcasting CommandFailed for '{}' on agent {}",
                failure.action, failure.agent_id
            );
            hub.send_to_server(
                failure.agent_id,
                events::COMMAND_FAILED,
                json!({
                    "serverId": failure.agent_id,
                    "action": failure.action,
                    "messageId": failure.id,
                    "message": format!(
                        "Command '{}' failed after {} retries",
                        failure.action, failure.retries
                    ),
                    "timestamp": chrono::Utc::now().timestamp_millis(),
                }),
            );
        }
    })
}
