//! Wire protocol shared with agents
//!
//! Every frame exchanged with an agent is one JSON envelope:
//!
//! ```json
//! { "type": "request", "id": 42, "action": "get-services",
//!   "payload": null, "timestamp": 1720000000000 }
//! ```
//!
//! The payload stays an untyped [`serde_json::Value`] until `type` and
//! `action` have been inspected; concrete payload structs live in
//! [`payloads`] and are decoded in a second phase by whichever component
//! owns the action. A reply echoes the `id` of the request that caused it.

pub mod payloads;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification carried in the envelope's `type` field.
///
/// Agents may send types this hub does not know about; those decode to
/// [`MessageKind::Unknown`] and are dropped by the router instead of
/// failing the whole frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
    #[serde(other)]
    Unknown,
}

/// One decoded frame.
///
/// `payload` serializes as `null` (never `{}`) when a command carries no
/// arguments - agents reject empty objects where they expect null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub id: i64,
    pub action: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Build an outbound request frame, stamped with the current time.
    pub fn request(id: i64, action: &str, payload: Option<Value>) -> Self {
        Self {
            kind: MessageKind::Request,
            id,
            action: action.to_string(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Action names understood by either side of the link.
pub mod actions {
    // Handshake
    pub const AUTHENTICATE: &str = "authenticate";

    // Events from agents
    pub const METRICS: &str = "metrics";
    pub const WATCHLIST_METRICS: &str = "watchlist-metrics";
    pub const BACKUP_COMPLETED: &str = "backup-completed";

    // Commands to agents
    pub const GET_SERVER_INFO: &str = "get-server-info";
    pub const GET_SERVICES: &str = "get-services";
    pub const GET_SERVICE: &str = "get-service";
    pub const GET_SERVICE_LOG: &str = "get-service-log";
    pub const RESTART_SERVICE: &str = "restart-service";
    pub const GET_PROCESSES: &str = "get-processes";
    pub const GET_PROCESS: &str = "get-process";
    pub const UPDATE_AGENT_CONFIG: &str = "update-agent-config";
    pub const TRIGGER_BACKUP: &str = "trigger-backup";
}
