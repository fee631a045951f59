//! Per-agent connection loop
//!
//! One independent read loop per socket: frames from one slow agent never
//! block another agent's loop. The state machine per connection is
//! `AwaitingAuth -> Authenticated -> Closed`; only the first frame may
//! authenticate, everything after flows through the router on this same
//! loop.
//!
//! Outbound frames go through an unbounded channel drained by a writer
//! task; the channel's sender is what the connection registry hands to the
//! control loops.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::auth::{authenticate_first_frame, AuthOutcome};
use super::registry::AgentLink;
use super::GatewayState;

pub async fn handle_agent_socket(socket: WebSocket, state: GatewayState) {
    let conn_id = state.registry.allocate_connection_id();
    info!("agent connection accepted, awaiting authentication");

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                debug!("writer: socket closed");
                break;
            }
        }
    });

    let mut authenticated: Option<i64> = None;

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = &mut writer => {
                debug!("writer task ended, closing connection");
                break;
            }
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            // axum answers pings automatically
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("socket error: {e}");
                break;
            }
        };

        if text.is_empty() {
            continue;
        }

        match authenticated {
            None => match authenticate_first_frame(state.store.as_ref(), &text).await {
                AuthOutcome::Granted {
                    agent_id,
                    agent_name,
                    reply,
                } => {
                    let _ = outbound_tx.send(reply);
                    state
                        .registry
                        .register(agent_id, AgentLink::new(conn_id, outbound_tx.clone()));
                    authenticated = Some(agent_id);
                    info!("agent {agent_id} ('{agent_name}') online");
                }
                AuthOutcome::Denied { reply } => {
                    warn!("authentication failed, closing connection");
                    let _ = outbound_tx.send(reply);
                    break;
                }
            },
            Some(agent_id) => {
                state.router.handle_frame(agent_id, &text).await;

                if let Err(e) = state.store.touch_agent(agent_id, Utc::now()).await {
                    error!("failed to stamp last-seen for agent {agent_id}: {e}");
                }
            }
        }
    }

    if let Some(agent_id) = authenticated {
        // only deregister if this connection still owns the link - a newer
        // connection for the same agent must stay registered and online
        if state.registry.remove_connection(conn_id) == Some(agent_id) {
            if let Err(e) = state.store.set_agent_online(agent_id, false).await {
                error!("failed to mark agent {agent_id} offline: {e}");
            }
            info!("agent {agent_id} disconnected");
        } else {
            debug!("agent {agent_id} link was already replaced, leaving state as-is");
        }
    } else {
        debug!("unauthenticated connection closed");
    }

    // dropping the last sender ends the writer once queued frames (the
    // auth denial in particular) have been flushed
    drop(outbound_tx);
    let _ = writer.await;
}
