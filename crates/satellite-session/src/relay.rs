//! Event relay: best-effort fan-out of satellite events to live connections.

use std::sync::{Mutex, PoisonError};

use satellite_core::protocol::{GatewayFrame, SatelliteEvent, SUBSCRIPTION_EVENT};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An addressable sink for one client connection.
///
/// Events are written as `satellite.event` frames tagged with the id of the
/// request that created the subscription (or pipeline run).
#[derive(Debug, Clone)]
pub struct RelayTarget {
    conn_id: String,
    subscription: String,
    tx: mpsc::UnboundedSender<String>,
}

impl RelayTarget {
    pub fn new(
        conn_id: impl Into<String>,
        subscription: impl Into<String>,
        tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            subscription: subscription.into(),
            tx,
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Whether both targets write to the same connection.
    pub fn same_connection(&self, other: &RelayTarget) -> bool {
        self.conn_id == other.conn_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send one event. Fails when the connection is gone.
    pub fn send(&self, event: &SatelliteEvent) -> anyhow::Result<()> {
        let frame = GatewayFrame::Event {
            event: SUBSCRIPTION_EVENT.to_string(),
            payload: Some(serde_json::to_value(event)?),
            subscription: Some(self.subscription.clone()),
        };
        let text = serde_json::to_string(&frame)?;
        self.tx
            .send(text)
            .map_err(|_| anyhow::anyhow!("connection {} is closed", self.conn_id))
    }
}

/// Result of a subscribe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribed {
    /// Subscription id to use for unsubscribing.
    pub token: String,
    /// True when this subscriber took the set from empty to non-empty.
    pub became_available: bool,
}

/// Subscriber set of one session.
///
/// Each connection holds at most one subscription. Every mutation that empties
/// the set reports it so the session can mark itself unavailable and release
/// pending handshakes.
#[derive(Debug, Default)]
pub struct EventRelay {
    subscribers: Mutex<Vec<RelayTarget>>,
}

impl EventRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `target`. Idempotent per connection: a second subscribe from
    /// the same connection returns the existing token.
    pub fn subscribe(&self, target: RelayTarget) -> Subscribed {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = subscribers.iter().find(|s| s.same_connection(&target)) {
            return Subscribed {
                token: existing.subscription.clone(),
                became_available: false,
            };
        }

        let became_available = subscribers.is_empty();
        let token = target.subscription.clone();
        debug!(conn_id = %target.conn_id, subscription = %token, "Subscriber added");
        subscribers.push(target);
        Subscribed {
            token,
            became_available,
        }
    }

    /// Remove the subscription with `token`. Returns true when the set became empty.
    pub fn unsubscribe(&self, token: &str) -> bool {
        self.remove_where(|s| s.subscription == token)
    }

    /// Remove every subscription held by `conn_id`. Returns true when the set became empty.
    pub fn unsubscribe_connection(&self, conn_id: &str) -> bool {
        self.remove_where(|s| s.conn_id == conn_id)
    }

    /// Deliver an event to every subscriber, in call order per subscriber.
    ///
    /// A subscriber whose send fails is dropped. Returns true when that left
    /// the set empty.
    pub fn push(&self, event_type: &str, data: Value) -> bool {
        let event = SatelliteEvent::new(event_type, data);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();

        subscribers.retain(|target| match target.send(&event) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn_id = %target.conn_id, error = %e, "Dropping subscriber");
                false
            }
        });

        before > 0 && subscribers.is_empty()
    }

    /// Drop every subscriber. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = subscribers.len();
        subscribers.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_where(&self, predicate: impl Fn(&RelayTarget) -> bool) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| !predicate(s));
        let removed = before - subscribers.len();
        if removed > 0 {
            debug!(removed, remaining = subscribers.len(), "Subscribers removed");
        }
        removed > 0 && subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(conn: &str, sub: &str) -> (RelayTarget, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RelayTarget::new(conn, sub, tx), rx)
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let text = rx.try_recv().unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_subscribe_transitions() {
        let relay = EventRelay::new();
        let (a, _rx_a) = target("c1", "req-1");
        let (b, _rx_b) = target("c2", "req-2");

        assert!(relay.subscribe(a).became_available);
        assert!(!relay.subscribe(b).became_available);
        assert_eq!(relay.len(), 2);

        assert!(!relay.unsubscribe("req-1"));
        assert!(relay.unsubscribe("req-2"));
        assert!(relay.is_empty());
        // Unknown token is a no-op
        assert!(!relay.unsubscribe("req-2"));
    }

    #[test]
    fn test_subscribe_is_idempotent_per_connection() {
        let relay = EventRelay::new();
        let (a, _rx) = target("c1", "req-1");
        let (again, _rx2) = target("c1", "req-9");
        assert_eq!(relay.subscribe(a).token, "req-1");
        let second = relay.subscribe(again);
        assert_eq!(second.token, "req-1");
        assert!(!second.became_available);
        assert_eq!(relay.len(), 1);
    }

    #[test]
    fn test_push_frames_are_tagged() {
        let relay = EventRelay::new();
        let (a, mut rx) = target("c1", "req-1");
        relay.subscribe(a);

        relay.push("announcement", json!({"id": 1}));
        let frame = next_event(&mut rx);
        assert_eq!(frame["type"], "event");
        assert_eq!(frame["event"], "satellite.event");
        assert_eq!(frame["subscription"], "req-1");
        assert_eq!(frame["payload"]["type"], "announcement");
        assert_eq!(frame["payload"]["data"]["id"], 1);
    }

    #[test]
    fn test_failed_send_drops_only_that_subscriber() {
        let relay = EventRelay::new();
        let (a, rx_a) = target("c1", "req-1");
        let (b, mut rx_b) = target("c2", "req-2");
        relay.subscribe(a);
        relay.subscribe(b);
        drop(rx_a);

        assert!(!relay.push("media_command", json!({"command": "stop"})));
        assert_eq!(relay.len(), 1);
        assert_eq!(next_event(&mut rx_b)["payload"]["type"], "media_command");

        drop(rx_b);
        assert!(relay.push("media_command", json!({"command": "stop"})));
        assert!(relay.is_empty());
    }

    #[test]
    fn test_unsubscribe_connection() {
        let relay = EventRelay::new();
        let (a, _rx) = target("c1", "req-1");
        relay.subscribe(a);
        assert!(!relay.unsubscribe_connection("c2"));
        assert!(relay.unsubscribe_connection("c1"));
    }

    #[test]
    fn test_clear_stops_delivery() {
        let relay = EventRelay::new();
        let (a, mut rx) = target("c1", "s1");
        relay.subscribe(a);
        assert_eq!(relay.clear(), 1);
        assert!(relay.is_empty());
        assert!(!relay.push("announcement", json!({})));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_push_to_empty_set_is_silent() {
        let relay = EventRelay::new();
        assert!(!relay.push("announcement", json!({})));
    }
}
