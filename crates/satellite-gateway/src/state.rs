//! Gateway shared state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use satellite_core::audio::AudioSink;
use satellite_core::config::Config;
use satellite_session::SessionRegistry;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Per-connection state.
pub struct ConnectionState {
    pub conn_id: String,
    pub event_tx: mpsc::UnboundedSender<String>,
    pub authenticated: bool,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            connections: RwLock::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }
}

/// What a request handler knows about the connection it came from.
#[derive(Clone)]
pub struct ConnectionContext {
    pub conn_id: String,
    pub event_tx: mpsc::UnboundedSender<String>,
    pub audio: Arc<AudioRoutes>,
}

/// Binary-frame channel ids of one connection, each bound to a run's audio sink.
#[derive(Default)]
pub struct AudioRoutes {
    inner: Mutex<RouteTable>,
}

#[derive(Default)]
struct RouteTable {
    next: u8,
    sinks: HashMap<u8, AudioSink>,
}

impl AudioRoutes {
    /// Bind `sink` to a free channel id. `None` when all 256 ids are in use.
    pub fn bind(&self, sink: AudioSink) -> Option<u8> {
        let mut table = self.lock();
        table.sinks.retain(|_, s| !s.is_closed());

        for _ in 0..=u8::MAX {
            let id = table.next;
            table.next = table.next.wrapping_add(1);
            if !table.sinks.contains_key(&id) {
                table.sinks.insert(id, sink);
                return Some(id);
            }
        }
        None
    }

    pub fn unbind(&self, channel_id: u8) {
        self.lock().sinks.remove(&channel_id);
    }

    /// Route one binary frame: first byte is the channel id, the rest is audio.
    /// An empty payload ends the channel.
    pub fn route(&self, frame: &[u8]) {
        let Some((&channel_id, payload)) = frame.split_first() else {
            return;
        };
        let mut table = self.lock();
        let Some(sink) = table.sinks.get(&channel_id) else {
            debug!(channel_id, "Audio for unknown channel dropped");
            return;
        };

        if payload.is_empty() {
            sink.close();
            table.sinks.remove(&channel_id);
        } else if !sink.push(Bytes::copy_from_slice(payload)) {
            table.sinks.remove(&channel_id);
        }
    }

    /// Send the end-of-stream sentinel on every channel.
    pub fn close_all(&self) {
        for (_, sink) in self.lock().sinks.drain() {
            sink.close();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, RouteTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
