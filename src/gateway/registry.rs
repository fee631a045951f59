//! Connection registry - the one live link per authenticated agent
//!
//! The registry holds no business logic. It maps agent ids to outbound
//! frame senders and is the single source of truth for "is this agent
//! reachable right now". It is hit concurrently by every connection loop
//! and by the control loops issuing commands; a sharded concurrent map
//! keeps those paths lock-light.
//!
//! Replacement semantics are last-writer-wins: a re-authenticating agent
//! displaces its stale link. The reverse lookup (connection -> agent) is a
//! full scan and only runs on disconnect; acceptable at current fleet
//! sizes.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, warn};

/// Identifies one physical connection, so a disconnecting loop can tell
/// whether the registered link is still its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Outbound half of one agent link. Frames are serialized JSON; the
/// connection's writer task owns the actual socket sink.
#[derive(Debug, Clone)]
pub struct AgentLink {
    pub conn: ConnectionId,
    outbound: tokio::sync::mpsc::UnboundedSender<String>,
}

impl AgentLink {
    pub fn new(conn: ConnectionId, outbound: tokio::sync::mpsc::UnboundedSender<String>) -> Self {
        Self { conn, outbound }
    }

    /// Queue a frame for sending. Returns false if the writer task is gone.
    pub fn send(&self, frame: String) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    links: DashMap<i64, AgentLink>,
    next_conn: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a freshly accepted connection.
    pub fn allocate_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Register the link for an agent, replacing any prior entry.
    pub fn register(&self, agent_id: i64, link: AgentLink) {
        if self.links.insert(agent_id, link).is_some() {
            debug!("replaced existing link for agent {agent_id}");
        }
    }

    pub fn lookup(&self, agent_id: i64) -> Option<AgentLink> {
        self.links.get(&agent_id).map(|entry| entry.clone())
    }

    pub fn is_online(&self, agent_id: i64) -> bool {
        self.links.contains_key(&agent_id)
    }

    pub fn remove(&self, agent_id: i64) {
        self.links.remove(&agent_id);
    }

    /// Reverse lookup: which agent does this connection belong to?
    ///
    /// Full scan; only used at disconnect time when the loop has nothing
    /// but its own connection id. Returns None when the link was already
    /// replaced by a newer connection.
    pub fn identity_of(&self, conn: ConnectionId) -> Option<i64> {
        self.links
            .iter()
            .find(|entry| entry.value().conn == conn)
            .map(|entry| *entry.key())
    }

    /// Remove the registration for `conn` only if it is still current.
    /// Returns the agent id that was deregistered.
    pub fn remove_connection(&self, conn: ConnectionId) -> Option<i64> {
        let agent_id = self.identity_of(conn)?;
        // re-check under the entry lock - a replacement may have raced us
        self.links
            .remove_if(&agent_id, |_, link| link.conn == conn)
            .map(|(id, _)| id)
    }

    /// Serialize-and-send helper for control loops. Returns false when the
    /// agent has no live link.
    pub fn send_to(&self, agent_id: i64, frame: String) -> bool {
        match self.lookup(agent_id) {
            Some(link) => {
                if link.send(frame) {
                    true
                } else {
                    warn!("link for agent {agent_id} is closed, dropping frame");
                    false
                }
            }
            None => false,
        }
    }
}
