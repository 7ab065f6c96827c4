//! Event broadcasting to all connected WebSocket clients.

use std::sync::Arc;

use satellite_core::protocol::{GatewayFrame, UPDATE_EVENT};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state::GatewayState;

/// Broadcast an event to all authenticated clients.
pub async fn broadcast_event(state: &GatewayState, event: &str, payload: Option<serde_json::Value>) {
    let frame = GatewayFrame::Event {
        event: event.to_string(),
        payload,
        subscription: None,
    };

    let msg = match serde_json::to_string(&frame) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(%e, "Failed to serialize event");
            return;
        }
    };

    let connections = state.connections.read().await;
    let mut sent = 0;
    for conn in connections.values().filter(|c| c.authenticated) {
        if conn.event_tx.send(msg.clone()).is_ok() {
            sent += 1;
        }
    }
    debug!(event, sent, "Broadcast event");
}

/// Forward every registry update to connected clients as `satellite.updated`.
/// Ends when the registry's update channel closes.
pub fn spawn_update_forwarder(state: Arc<GatewayState>) -> JoinHandle<()> {
    let mut updates = state.registry.subscribe_updates();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    broadcast_event(&state, UPDATE_EVENT, serde_json::to_value(&update).ok()).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Update forwarder lagged, updates dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_core::config::{Config, SessionTimings};
    use satellite_core::keep_alive::LogKeepAlive;
    use satellite_core::matcher::TemplateMatcher;
    use satellite_core::pipeline::LoopbackPipeline;
    use satellite_session::{Collaborators, SessionRegistry};
    use tokio::sync::mpsc;

    use crate::state::ConnectionState;

    #[tokio::test]
    async fn test_updates_reach_authenticated_connections() {
        let registry = SessionRegistry::new(Collaborators {
            executor: Arc::new(LoopbackPipeline),
            matcher: Arc::new(TemplateMatcher),
            keep_alive: Arc::new(LogKeepAlive),
            timers: None,
            timings: SessionTimings::default(),
        });
        let state = Arc::new(GatewayState::new(Arc::new(Config::default()), Arc::new(registry)));

        let (open_tx, mut open_rx) = mpsc::unbounded_channel();
        let (pending_tx, mut pending_rx) = mpsc::unbounded_channel();
        {
            let mut connections = state.connections.write().await;
            connections.insert(
                "open".into(),
                ConnectionState { conn_id: "open".into(), event_tx: open_tx, authenticated: true },
            );
            connections.insert(
                "pending".into(),
                ConnectionState { conn_id: "pending".into(), event_tx: pending_tx, authenticated: false },
            );
        }

        let forwarder = spawn_update_forwarder(Arc::clone(&state));
        state.registry.pair("kitchen".into(), "Kitchen", None).await.unwrap();

        let text = open_rx.recv().await.unwrap();
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["event"], UPDATE_EVENT);
        assert_eq!(frame["payload"]["satellite"], "kitchen");
        assert!(pending_rx.try_recv().is_err());

        forwarder.abort();
    }
}
