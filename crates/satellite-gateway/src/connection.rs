//! WebSocket connection lifecycle: handshake, auth, read and write loops.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use satellite_core::config::Config;
use satellite_core::protocol::{
    AuthParams, ConnectParams, GatewayFrame, Hello, ServerInfo, PROTOCOL_VERSION,
    SUBSCRIPTION_EVENT, UPDATE_EVENT,
};

use crate::methods::{dispatch_method, METHODS};
use crate::state::{AudioRoutes, ConnectionContext, ConnectionState, GatewayState};

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Authenticate a client connection using ConnectParams.
/// Returns Ok(()) on success, Err(message) on failure.
fn authenticate(config: &Config, params: &ConnectParams) -> Result<(), String> {
    let auth_config = config.auth();

    match config.auth_mode() {
        "none" => Ok(()),
        "token" => {
            let expected = auth_config
                .and_then(|a| a.resolve_token())
                .ok_or_else(|| "Server token not configured".to_string())?;

            match &params.auth {
                Some(AuthParams::Token { token }) => {
                    if constant_time_eq(token, &expected) {
                        Ok(())
                    } else {
                        Err("Invalid token".to_string())
                    }
                }
                _ => Err("Token authentication required".to_string()),
            }
        }
        "password" => {
            let expected = auth_config
                .and_then(|a| a.resolve_password())
                .ok_or_else(|| "Server password not configured".to_string())?;

            match &params.auth {
                Some(AuthParams::Password { password }) => {
                    // Compare SHA-256 hashes
                    let expected_hash = format!("{:x}", Sha256::digest(expected.as_bytes()));
                    let provided_hash = format!("{:x}", Sha256::digest(password.as_bytes()));
                    if constant_time_eq(&provided_hash, &expected_hash) {
                        Ok(())
                    } else {
                        Err("Invalid password".to_string())
                    }
                }
                _ => Err("Password authentication required".to_string()),
            }
        }
        other => Err(format!("Unknown auth mode: {other}")),
    }
}

fn hello(conn_id: &str, auth_mode: &str) -> Hello {
    Hello {
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            conn_id: conn_id.to_string(),
        },
        methods: METHODS.iter().map(|m| m.to_string()).collect(),
        events: vec![SUBSCRIPTION_EVENT.into(), UPDATE_EVENT.into()],
        auth_mode: auth_mode.to_string(),
    }
}

fn event_frame(event: &str, payload: Option<serde_json::Value>) -> Option<String> {
    let frame = GatewayFrame::Event {
        event: event.into(),
        payload,
        subscription: None,
    };
    serde_json::to_string(&frame).ok()
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Create event channel for this connection
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();

    let mode = state.config.auth_mode().to_string();
    let needs_auth = mode != "none";

    // Register connection (not yet authenticated if auth required)
    {
        let mut connections = state.connections.write().await;
        connections.insert(
            conn_id.clone(),
            ConnectionState {
                conn_id: conn_id.clone(),
                event_tx: event_tx.clone(),
                authenticated: !needs_auth,
            },
        );
    }

    let hello_payload = serde_json::to_value(hello(&conn_id, &mode)).ok();
    if let Some(msg) = event_frame("hello", hello_payload) {
        if ws_tx.send(Message::Text(msg.into())).await.is_err() {
            cleanup_connection(&state, &conn_id, None).await;
            return;
        }
    }

    // If auth required, wait for ConnectParams as first message
    if needs_auth {
        let auth_result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            wait_for_auth(&state.config, &mut ws_rx, &conn_id),
        )
        .await;

        match auth_result {
            Ok(Ok(())) => {
                {
                    let mut connections = state.connections.write().await;
                    if let Some(conn) = connections.get_mut(&conn_id) {
                        conn.authenticated = true;
                    }
                }
                if let Some(msg) = event_frame("auth.ok", None) {
                    if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                        cleanup_connection(&state, &conn_id, None).await;
                        return;
                    }
                }
                info!(conn_id = %conn_id, "Client authenticated");
            }
            Ok(Err(reason)) => {
                warn!(conn_id = %conn_id, %reason, "Authentication failed");
                if let Some(msg) =
                    event_frame("auth.error", Some(serde_json::json!({"message": reason})))
                {
                    let _ = ws_tx.send(Message::Text(msg.into())).await;
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                cleanup_connection(&state, &conn_id, None).await;
                return;
            }
            Err(_) => {
                warn!(conn_id = %conn_id, "Authentication timeout");
                let _ = ws_tx.send(Message::Close(None)).await;
                cleanup_connection(&state, &conn_id, None).await;
                return;
            }
        }
    }

    // Spawn event sender task
    let send_task = tokio::spawn(async move {
        while let Some(msg) = event_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let ctx = ConnectionContext {
        conn_id: conn_id.clone(),
        event_tx: event_tx.clone(),
        audio: Arc::new(AudioRoutes::default()),
    };

    // Main read loop
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<GatewayFrame>(text.as_str()) {
                Ok(GatewayFrame::Request { id, method, params }) => {
                    // Announce and ask block until the client acks; never stall the read loop.
                    let state = Arc::clone(&state);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let response = dispatch_method(&state, &ctx, &id, &method, params).await;
                        if let Ok(response_json) = serde_json::to_string(&response) {
                            let _ = ctx.event_tx.send(response_json);
                        }
                    });
                }
                Ok(_) => {
                    debug!("Received non-request frame, ignoring");
                }
                Err(e) => {
                    warn!(%e, "Invalid frame received");
                    let error_frame =
                        GatewayFrame::error("unknown", "parse_error", &format!("Invalid frame: {e}"));
                    if let Ok(msg) = serde_json::to_string(&error_frame) {
                        let _ = event_tx.send(msg);
                    }
                }
            },
            Ok(Message::Binary(data)) => ctx.audio.route(&data),
            Ok(Message::Ping(_)) => {
                // Axum handles ping/pong automatically
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    send_task.abort();
    cleanup_connection(&state, &conn_id, Some(&ctx.audio)).await;
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

/// Wait for the client's ConnectParams message and authenticate.
async fn wait_for_auth(
    config: &Config,
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    conn_id: &str,
) -> Result<(), String> {
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let text = text.to_string();
                // Try to parse as a ConnectParams (wrapped in a request or raw)
                if let Ok(GatewayFrame::Request {
                    params: Some(params),
                    ..
                }) = serde_json::from_str::<GatewayFrame>(&text)
                {
                    if let Ok(connect) = serde_json::from_value::<ConnectParams>(params) {
                        return authenticate(config, &connect);
                    }
                }
                if let Ok(connect) = serde_json::from_str::<ConnectParams>(&text) {
                    return authenticate(config, &connect);
                }
                debug!(conn_id = %conn_id, "Received non-auth message during handshake");
                return Err("Expected ConnectParams for authentication".to_string());
            }
            Ok(Message::Close(_)) => return Err("Connection closed during auth".to_string()),
            Err(e) => return Err(format!("WebSocket error during auth: {e}")),
            _ => continue,
        }
    }
    Err("Connection dropped during auth".to_string())
}

/// Release everything the connection owned: its audio channels, its event
/// subscriptions and its pipeline runs.
async fn cleanup_connection(state: &Arc<GatewayState>, conn_id: &str, audio: Option<&AudioRoutes>) {
    {
        let mut connections = state.connections.write().await;
        connections.remove(conn_id);
    }
    if let Some(audio) = audio {
        audio.close_all();
    }
    state.registry.disconnect(conn_id).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();
}
