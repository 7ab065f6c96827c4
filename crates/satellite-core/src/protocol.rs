//! Satellite gateway wire protocol.
//!
//! All text communication uses JSON-over-WebSocket with three frame types:
//! Request, Response, and Event. Audio travels in binary frames whose first
//! byte is the channel id handed out by `satellite.run_pipeline`.

use serde::{Deserialize, Serialize};

/// Protocol version implemented by this gateway.
pub const PROTOCOL_VERSION: u32 = 1;

/// Event name used for frames delivered to a subscription.
pub const SUBSCRIPTION_EVENT: &str = "satellite.event";

/// Event name used for registry-wide satellite updates.
pub const UPDATE_EVENT: &str = "satellite.updated";

/// A gateway wire frame: the top-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Client -> Server request.
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// Server -> Client response.
    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    /// Server -> Client event.
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        /// Id of the request whose subscription this event belongs to.
        #[serde(skip_serializing_if = "Option::is_none")]
        subscription: Option<String>,
    },
}

impl GatewayFrame {
    pub fn ok(id: &str, payload: serde_json::Value) -> Self {
        Self::Response {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: &str, code: &str, message: &str) -> Self {
        Self::Response {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// Error shape returned in response frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

/// Typed event pushed to a satellite client: `{type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl SatelliteEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// Client handshake parameters, sent first when auth is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthParams {
    #[serde(rename = "token")]
    Token { token: String },
    #[serde(rename = "password")]
    Password { password: String },
}

/// Server hello sent on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol: u32,
    pub server: ServerInfo,
    pub methods: Vec<String>,
    pub events: Vec<String>,
    pub auth_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub conn_id: String,
}
