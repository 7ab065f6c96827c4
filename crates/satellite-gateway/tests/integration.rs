//! Gateway integration tests: start a real gateway and interact via WS + HTTP.
//!
//! Run with: `cargo test -p satellite-gateway --test integration`

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use satellite_core::config::{Config, GatewayAuthConfig, GatewayConfig, SessionTimings};
use satellite_core::keep_alive::LogKeepAlive;
use satellite_core::matcher::TemplateMatcher;
use satellite_core::pipeline::LoopbackPipeline;
use satellite_gateway::GatewayState;
use satellite_session::{Collaborators, SessionRegistry};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Build a gateway with one paired satellite and return its state + port.
async fn start_test_gateway(config: Config) -> (Arc<GatewayState>, u16) {
    let port = find_free_port();

    let registry = Arc::new(SessionRegistry::new(Collaborators {
        executor: Arc::new(LoopbackPipeline),
        matcher: Arc::new(TemplateMatcher),
        keep_alive: Arc::new(LogKeepAlive),
        timers: None,
        timings: SessionTimings::default(),
    }));
    registry.pair("kitchen".into(), "Kitchen", None).await.unwrap();

    let state = Arc::new(GatewayState::new(Arc::new(config), registry));

    // Start gateway in background
    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = satellite_gateway::start_gateway_with_shutdown(
            state_clone,
            port,
            std::future::pending(),
        )
        .await;
    });

    // Wait for gateway to be ready
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
    }

    (state, port)
}

fn local_config() -> Config {
    Config {
        gateway: Some(GatewayConfig {
            port: 0,
            bind: Some("127.0.0.1".into()),
            auth: None,
        }),
        ..Default::default()
    }
}

async fn connect(port: u16) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/ws");
    let (mut ws, _) = connect_async(&url).await.expect("WS connect failed");
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["event"], "hello");
    ws
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn request(ws: &mut Ws, id: &str, method: &str, params: Value) {
    let req = json!({ "type": "req", "id": id, "method": method, "params": params });
    ws.send(Message::Text(req.to_string().into())).await.unwrap();
}

/// Read frames until the response to `id`, skipping broadcasts.
async fn response(ws: &mut Ws, id: &str) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == "res" && frame["id"] == id {
            return frame;
        }
    }
}

/// Read frames until a subscription event of `event_type` arrives.
async fn event_of(ws: &mut Ws, event_type: &str) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["event"] == "satellite.event" && frame["payload"]["type"] == event_type {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_state, port) = start_test_gateway(local_config()).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("Health request failed");

    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["satellites"], 1);
}

#[tokio::test]
async fn test_ws_hello_and_list() {
    let (_state, port) = start_test_gateway(local_config()).await;

    let url = format!("ws://127.0.0.1:{port}/ws");
    let (mut ws, _) = connect_async(&url).await.expect("WS connect failed");

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["event"], "hello");
    assert_eq!(hello["payload"]["protocol"], 1);
    assert_eq!(hello["payload"]["auth_mode"], "none");
    assert!(hello["payload"]["methods"].is_array());

    request(&mut ws, "list-1", "satellite.list", json!({})).await;
    let resp = response(&mut ws, "list-1").await;
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["payload"]["satellites"][0]["satellite"], "kitchen");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_ws_unknown_method() {
    let (_state, port) = start_test_gateway(local_config()).await;
    let mut ws = connect(port).await;

    request(&mut ws, "bad-1", "nonexistent.method", json!({})).await;
    let resp = response(&mut ws, "bad-1").await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "method_not_found");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_pipeline_run_over_binary_frames() {
    let (_state, port) = start_test_gateway(local_config()).await;
    let mut ws = connect(port).await;

    request(
        &mut ws,
        "run-1",
        "satellite.run_pipeline",
        json!({ "satellite": "kitchen", "start_stage": "stt", "end_stage": "tts" }),
    )
    .await;

    // init precedes the response and every pipeline event.
    let init = event_of(&mut ws, "init").await;
    assert_eq!(init["subscription"], "run-1");
    let channel_id = init["payload"]["data"]["channel_id"].as_u64().unwrap() as u8;

    // The response and run-start race each other.
    let (mut responded, mut started) = (false, false);
    while !(responded && started) {
        let frame = next_json(&mut ws).await;
        if frame["type"] == "res" && frame["id"] == "run-1" {
            assert_eq!(frame["payload"]["channel_id"], channel_id);
            responded = true;
        } else if frame["payload"]["type"] == "run-start" {
            started = true;
        }
    }

    let mut frame = vec![channel_id];
    frame.extend_from_slice(&[7u8; 320]);
    ws.send(Message::Binary(frame.into())).await.unwrap();
    ws.send(Message::Binary(vec![channel_id].into())).await.unwrap();

    let end = event_of(&mut ws, "stt-end").await;
    assert_eq!(end["payload"]["data"]["stt_output"]["frames"], 1);
    assert_eq!(end["payload"]["data"]["stt_output"]["bytes"], 320);
    event_of(&mut ws, "run-end").await;

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_announcement_acknowledged_by_subscriber() {
    let (_state, port) = start_test_gateway(local_config()).await;
    let mut satellite = connect(port).await;
    let mut service = connect(port).await;

    request(&mut satellite, "sub-1", "satellite.subscribe_events", json!({ "satellite": "kitchen" })).await;
    let resp = response(&mut satellite, "sub-1").await;
    assert_eq!(resp["payload"]["subscription"], "sub-1");

    request(
        &mut service,
        "ann-1",
        "satellite.announce",
        json!({ "satellite": "kitchen", "message": "Dinner is ready" }),
    )
    .await;

    let event = event_of(&mut satellite, "announcement").await;
    assert_eq!(event["subscription"], "sub-1");
    assert_eq!(event["payload"]["data"]["message"], "Dinner is ready");
    let announce_id = event["payload"]["data"]["id"].as_u64().unwrap();

    request(
        &mut satellite,
        "ack-1",
        "satellite.announce_finished",
        json!({ "satellite": "kitchen", "announce_id": announce_id }),
    )
    .await;
    assert_eq!(response(&mut satellite, "ack-1").await["payload"]["accepted"], true);

    let done = response(&mut service, "ann-1").await;
    assert_eq!(done["payload"]["outcome"], "acknowledged");
}

#[tokio::test]
async fn test_disconnect_makes_satellite_unavailable() {
    let (state, port) = start_test_gateway(local_config()).await;
    let mut satellite = connect(port).await;

    request(&mut satellite, "sub-1", "satellite.subscribe_events", json!({ "satellite": "kitchen" })).await;
    response(&mut satellite, "sub-1").await;
    let session = state.registry.get(&"kitchen".into()).await.unwrap();
    assert_eq!(session.subscriber_count(), 1);

    satellite.close(None).await.ok();
    drop(satellite);

    for _ in 0..50 {
        if session.subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(session.subscriber_count(), 0);
}

#[tokio::test]
async fn test_token_auth_required() {
    let config = Config {
        gateway: Some(GatewayConfig {
            port: 0,
            bind: Some("127.0.0.1".into()),
            auth: Some(GatewayAuthConfig {
                mode: Some("token".into()),
                token: Some("s3cret".into()),
                token_env: None,
                password: None,
                password_env: None,
            }),
        }),
        ..Default::default()
    };
    let (_state, port) = start_test_gateway(config).await;

    let mut ws = connect(port).await;
    ws.send(Message::Text(
        json!({ "auth": { "type": "token", "token": "wrong" } }).to_string().into(),
    ))
    .await
    .unwrap();
    let rejected = next_json(&mut ws).await;
    assert_eq!(rejected["event"], "auth.error");

    let mut ws = connect(port).await;
    ws.send(Message::Text(
        json!({ "auth": { "type": "token", "token": "s3cret" } }).to_string().into(),
    ))
    .await
    .unwrap();
    let accepted = next_json(&mut ws).await;
    assert_eq!(accepted["event"], "auth.ok");

    request(&mut ws, "list-1", "satellite.list", json!({})).await;
    assert_eq!(response(&mut ws, "list-1").await["ok"], true);
}
