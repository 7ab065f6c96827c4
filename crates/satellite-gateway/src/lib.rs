//! WebSocket gateway for voice satellites.
//!
//! Hosts the WebSocket server, authenticates clients, dispatches
//! `satellite.*` requests to their sessions, routes binary audio frames to
//! pipeline runs and broadcasts satellite updates to every connected client.

pub mod connection;
pub mod events;
pub mod methods;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{router, start_gateway, start_gateway_with_shutdown};
pub use state::GatewayState;
