//! WebSocket gateway
//!
//! Two endpoints on one Axum server:
//!
//! - `WS /ws/agent` - the persistent agent link (authenticate-first)
//! - `WS /api/v1/stream` - operator-facing event stream fed by the
//!   broadcast hub, optionally filtered with `?group=server-{id}`
//! - `GET /api/v1/health` - liveness probe
//!
//! The gateway owns no business logic; it accepts sockets, runs the
//! per-connection loops, and forwards hub events.

pub mod auth;
pub mod connection;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::hub::UiHub;
use crate::router::MessageRouter;
use crate::store::Store;

pub use registry::{AgentLink, ConnectionId, ConnectionRegistry};

/// Shared state for all gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub hub: UiHub,
}

/// Spawn the gateway server in a background task. Returns the bound
/// address.
pub async fn spawn_gateway(
    bind_addr: SocketAddr,
    state: GatewayState,
) -> anyhow::Result<SocketAddr> {
    info!("starting gateway on {bind_addr}");

    let app = Router::new()
        .route("/ws/agent", get(agent_ws_handler))
        .route("/api/v1/stream", get(stream_ws_handler))
        .route("/api/v1/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("gateway listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("gateway server error: {e}");
        }
    });

    Ok(addr)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn agent_ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    ws.on_upgrade(|socket| connection::handle_agent_socket(socket, state))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    /// Restrict the stream to one group (e.g. `server-3`). Absent means
    /// all groups.
    group: Option<String>,
}

async fn stream_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    State(state): State<GatewayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state.hub, params.group))
}

/// Forward hub events to one operator client.
async fn handle_stream_socket(
    socket: axum::extract::ws::WebSocket,
    hub: UiHub,
    group: Option<String>,
) {
    info!("stream client connected (group filter: {group:?})");

    let (mut sender, mut receiver) = socket.split();
    let mut events = hub.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if group.as_ref().is_some_and(|g| g != &event.group) {
                        continue;
                    }
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        debug!("stream send failed, client disconnected");
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("stream client lagged, skipped {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("stream client disconnected");
}
