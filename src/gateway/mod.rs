//! WebSocket gateway for agentloop
//!
//! Serves the JSON command/event protocol over a single `/ws` endpoint,
//! plus a `/healthz` probe for supervisors and load balancers.  Every
//! connected client receives the full broadcast event stream; rejected
//! commands are answered with an `error` event on the offending
//! connection only.

use crate::config::AgentloopConfig;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::protocol::{parse_command, ServerEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for gateway handlers
#[derive(Clone)]
pub struct GatewayState {
    pub engine: Arc<Engine>,
}

/// Create the gateway router with the WebSocket and probe endpoints
pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(health_check))
        .with_state(state)
        .layer(build_cors())
        .layer(TraceLayer::new_for_http())
}

/// Bind the configured address and serve the gateway until a shutdown
/// signal arrives
///
/// A bind failure is fatal; there is no point running the engine without
/// its control surface.
pub async fn serve(config: &AgentloopConfig, engine: Arc<Engine>) -> Result<()> {
    let app = gateway_router(GatewayState { engine });
    let bind = format!("{}:{}", config.server.host, config.server.port);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| Error::Gateway(format!("failed to bind {}: {}", bind, e)))?;

    tracing::info!(%bind, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Gateway(format!("server error: {}", e)))?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

// =============================================================================
// WebSocket handling
// =============================================================================

/// Upgrade an HTTP request to a protocol WebSocket connection
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one WebSocket connection for its whole lifetime
async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let client_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(client_id = %client_id, "WebSocket client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for engine → client outbound frames
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Forward broadcast events to this client
    let mut events = state.engine.subscribe();
    let event_tx = tx.clone();
    let event_client_id = client_id.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if event_tx.send(event.to_json()).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        client_id = %event_client_id,
                        skipped,
                        "client lagged behind the event stream"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Pump outbound frames to the socket
    let send_client_id = client_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg)).await.is_err() {
                tracing::debug!(client_id = %send_client_id, "WebSocket send failed");
                break;
            }
        }
    });

    // Receive client commands (JSON)
    let recv_engine = state.engine.clone();
    let recv_client_id = client_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let command = match parse_command(&text) {
                        Ok(command) => command,
                        Err(e) => {
                            let preview: String = text.chars().take(200).collect();
                            tracing::warn!(
                                client_id = %recv_client_id,
                                "Invalid command frame: {} (raw: {})",
                                e,
                                preview
                            );
                            let _ = tx.send(ServerEvent::error(e.to_string()).to_json());
                            continue;
                        }
                    };
                    if let Err(e) = recv_engine.handle_command(command).await {
                        let _ = tx.send(ServerEvent::error(e.to_string()).to_json());
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    event_task.abort();

    tracing::info!(client_id = %client_id, "WebSocket client disconnected");
}

// =============================================================================
// Probe and middleware
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .allow_origin(Any)
}
