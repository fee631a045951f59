//! Authentication handshake
//!
//! The first frame on a new connection must be an `authenticate` action
//! carrying `{agentId, token}`. The wire agent id is untrusted until the
//! token has been verified, so the presented token is checked against the
//! stored hash of *every* registered agent instead of being looked up by
//! id. That scan is O(fleet size) per handshake - fine at current scale; if
//! fleets grow into the thousands, a public non-secret agent id alongside
//! the token would make the lookup O(1).
//!
//! Anything other than a well-formed authenticate frame is a failure: the
//! caller replies with an error envelope and closes the connection.

use chrono::Utc;
use tracing::{info, warn};

use crate::crypto;
use crate::protocol::payloads::{AuthReply, AuthenticatePayload};
use crate::protocol::{actions, Envelope};
use crate::store::Store;

/// Handshake result. `reply` is the serialized frame to send either way.
#[derive(Debug)]
pub enum AuthOutcome {
    Granted {
        agent_id: i64,
        agent_name: String,
        reply: String,
    },
    Denied {
        reply: String,
    },
}

impl AuthOutcome {
    fn denied(message: &str) -> Self {
        let reply = serde_json::to_string(&AuthReply::error(message))
            .expect("auth reply serialization");
        AuthOutcome::Denied { reply }
    }
}

/// Validate the first frame of a connection and, on success, mark the agent
/// online and stamp last-seen.
pub async fn authenticate_first_frame(store: &dyn Store, raw: &str) -> AuthOutcome {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("authentication failed: malformed frame: {e}");
            return AuthOutcome::denied("Invalid message format");
        }
    };

    if envelope.action != actions::AUTHENTICATE {
        warn!(
            "authentication failed: first frame has action '{}'",
            envelope.action
        );
        return AuthOutcome::denied("First message must be authentication");
    }

    let payload: AuthenticatePayload = match envelope
        .payload
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(payload)) => payload,
        _ => {
            warn!("authentication failed: invalid payload");
            return AuthOutcome::denied("Invalid authentication payload");
        }
    };

    if payload.agent_id.is_empty() || payload.token.is_empty() {
        warn!("authentication failed: missing fields");
        return AuthOutcome::denied("Invalid authentication payload");
    }

    let agents = match store.list_agents().await {
        Ok(agents) => agents,
        Err(e) => {
            warn!("authentication failed: cannot load agents: {e}");
            return AuthOutcome::denied("Internal error");
        }
    };

    // identifiers are untrusted pre-auth: scan every stored hash
    let matched = agents.iter().find(|agent| {
        agent
            .token_hash
            .as_deref()
            .is_some_and(|hash| crypto::verify_token(&payload.token, hash))
    });

    let Some(agent) = matched else {
        warn!("authentication failed: no matching token");
        return AuthOutcome::denied("Invalid credentials");
    };

    info!("agent {} ('{}') authenticated", agent.id, agent.name);

    if let Err(e) = store.set_agent_online(agent.id, true).await {
        warn!("failed to mark agent {} online: {e}", agent.id);
    }
    if let Err(e) = store.touch_agent(agent.id, Utc::now()).await {
        warn!("failed to stamp last-seen for agent {}: {e}", agent.id);
    }

    let reply = serde_json::to_string(&AuthReply::ok(
        "Authentication successful",
        agent.id,
        &agent.name,
    ))
    .expect("auth reply serialization");

    AuthOutcome::Granted {
        agent_id: agent.id,
        agent_name: agent.name.clone(),
        reply,
    }
}
