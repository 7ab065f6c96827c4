//! Gateway method handlers.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use satellite_core::audio::audio_channel;
use satellite_core::error::{Result, SatelliteError};
use satellite_core::pipeline::PipelineRequest;
use satellite_core::protocol::{GatewayFrame, SatelliteEvent};
use satellite_core::types::{ClientStatus, MediaCommand, PipelineStage, SatelliteId};
use satellite_session::media::MediaAck;
use satellite_session::{Announcement, Question, RelayTarget, SatelliteEntity, Session};

use crate::state::{ConnectionContext, GatewayState};

/// Every method this gateway answers, advertised in the hello event.
pub const METHODS: &[&str] = &[
    "satellite.list",
    "satellite.pair",
    "satellite.unpair",
    "satellite.subscribe_events",
    "satellite.unsubscribe",
    "satellite.run_pipeline",
    "satellite.update_status",
    "satellite.announce",
    "satellite.start_conversation",
    "satellite.ask_question",
    "satellite.announce_finished",
    "satellite.question_answered",
    "satellite.cancel_timer",
    "satellite.media_command",
    "satellite.media_command_ack",
    "satellite.set_keep_alive",
];

/// Dispatch a method request and return the response frame.
pub async fn dispatch_method(
    state: &Arc<GatewayState>,
    ctx: &ConnectionContext,
    request_id: &str,
    method: &str,
    params: Option<Value>,
) -> GatewayFrame {
    debug!(method, conn_id = %ctx.conn_id, "Dispatching method");

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let response = match dispatch_method_inner(state, ctx, request_id, method, params).await {
        Some(Ok(payload)) => ok_response(request_id, payload),
        Some(Err(e)) => {
            #[cfg(feature = "metrics")]
            crate::metrics::record_error(e.code());
            debug!(method, code = e.code(), error = %e, "Method failed");
            error_response(request_id, e.code(), &e.to_string())
        }
        None => error_response(
            request_id,
            "method_not_found",
            &format!("Unknown method: {method}"),
        ),
    };

    #[cfg(feature = "metrics")]
    crate::metrics::record_request(method, start.elapsed().as_secs_f64());

    response
}

async fn dispatch_method_inner(
    state: &Arc<GatewayState>,
    ctx: &ConnectionContext,
    request_id: &str,
    method: &str,
    params: Option<Value>,
) -> Option<Result<Value>> {
    let result = match method {
        // Service side
        "satellite.list" => handle_list(state).await,
        "satellite.pair" => handle_pair(state, params).await,
        "satellite.unpair" => handle_unpair(state, params).await,
        "satellite.announce" => handle_announce(state, params, false).await,
        "satellite.start_conversation" => handle_announce(state, params, true).await,
        "satellite.ask_question" => handle_ask_question(state, params).await,
        "satellite.media_command" => handle_media_command(state, params).await,
        "satellite.set_keep_alive" => handle_set_keep_alive(state, params).await,

        // Client side
        "satellite.subscribe_events" => handle_subscribe(state, ctx, request_id, params).await,
        "satellite.unsubscribe" => handle_unsubscribe(state, params).await,
        "satellite.run_pipeline" => handle_run_pipeline(state, ctx, request_id, params).await,
        "satellite.update_status" => handle_update_status(state, params).await,
        "satellite.announce_finished" => handle_announce_finished(state, params).await,
        "satellite.question_answered" => handle_question_answered(state, params).await,
        "satellite.cancel_timer" => handle_cancel_timer(state, params).await,
        "satellite.media_command_ack" => handle_media_command_ack(state, params).await,
        _ => return None,
    };
    Some(result)
}

// ============================================================
// Param helpers
// ============================================================

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| SatelliteError::InvalidParams(e.to_string()))
}

#[derive(Deserialize)]
struct SatelliteParams {
    satellite: SatelliteId,
}

#[derive(Deserialize)]
struct With<T> {
    satellite: SatelliteId,
    #[serde(flatten)]
    inner: T,
}

async fn session_for(state: &GatewayState, id: &SatelliteId) -> Result<Arc<Session>> {
    state.registry.get(id).await
}

// ============================================================
// Registry methods
// ============================================================

async fn handle_list(state: &Arc<GatewayState>) -> Result<Value> {
    let satellites = state.registry.list().await;
    Ok(json!({ "satellites": satellites }))
}

#[derive(Deserialize)]
struct PairParams {
    satellite: SatelliteId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    keep_alive_target: Option<String>,
}

async fn handle_pair(state: &Arc<GatewayState>, params: Option<Value>) -> Result<Value> {
    let p: PairParams = parse_params(params)?;
    let name = p.name.unwrap_or_else(|| p.satellite.to_string());
    let session = state.registry.pair(p.satellite, name, p.keep_alive_target).await?;
    Ok(serde_json::to_value(session.snapshot())?)
}

async fn handle_unpair(state: &Arc<GatewayState>, params: Option<Value>) -> Result<Value> {
    let p: SatelliteParams = parse_params(params)?;
    state.registry.unpair(&p.satellite).await?;
    Ok(json!({ "satellite": p.satellite }))
}

// ============================================================
// Subscriptions
// ============================================================

async fn handle_subscribe(
    state: &Arc<GatewayState>,
    ctx: &ConnectionContext,
    request_id: &str,
    params: Option<Value>,
) -> Result<Value> {
    let p: SatelliteParams = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    let target = RelayTarget::new(&ctx.conn_id, request_id, ctx.event_tx.clone());
    let subscription = session.subscribe(target);
    info!(satellite = %p.satellite, conn_id = %ctx.conn_id, %subscription, "Client subscribed");
    Ok(json!({ "subscription": subscription }))
}

#[derive(Deserialize)]
struct UnsubscribeParams {
    subscription: String,
}

async fn handle_unsubscribe(state: &Arc<GatewayState>, params: Option<Value>) -> Result<Value> {
    let p: With<UnsubscribeParams> = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    session.unsubscribe(&p.inner.subscription);
    Ok(json!({ "available": session.available() }))
}

// ============================================================
// Pipeline runs
// ============================================================

#[derive(Deserialize)]
struct RunPipelineParams {
    start_stage: PipelineStage,
    end_stage: PipelineStage,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    extra_system_prompt: Option<String>,
}

async fn handle_run_pipeline(
    state: &Arc<GatewayState>,
    ctx: &ConnectionContext,
    request_id: &str,
    params: Option<Value>,
) -> Result<Value> {
    let p: With<RunPipelineParams> = parse_params(params)?;
    if p.inner.start_stage > p.inner.end_stage {
        return Err(SatelliteError::InvalidParams(format!(
            "start_stage {:?} is after end_stage {:?}",
            p.inner.start_stage, p.inner.end_stage
        )));
    }
    let session = session_for(state, &p.satellite).await?;

    let (sink, audio) = audio_channel();
    let channel_id = ctx
        .audio
        .bind(sink.clone())
        .ok_or_else(|| SatelliteError::NotReady("No free audio channel".into()))?;

    // The client must learn its channel id before any pipeline event arrives.
    let target = RelayTarget::new(&ctx.conn_id, request_id, ctx.event_tx.clone());
    if let Err(e) = target.send(&SatelliteEvent::new("init", json!({ "channel_id": channel_id }))) {
        ctx.audio.unbind(channel_id);
        return Err(e.into());
    }

    let request = PipelineRequest {
        satellite: p.satellite.clone(),
        start_stage: p.inner.start_stage,
        end_stage: p.inner.end_stage,
        conversation_id: p.inner.conversation_id,
        extra_system_prompt: p.inner.extra_system_prompt,
    };
    let handle = match session.start_run(request, target, sink, audio).await {
        Ok(handle) => handle,
        Err(e) => {
            ctx.audio.unbind(channel_id);
            return Err(e);
        }
    };

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_run_started();
        if let Some(outcome) = handle.replaced {
            crate::metrics::record_run_replaced(outcome);
        }
    }

    info!(
        satellite = %p.satellite,
        generation = handle.generation,
        channel_id,
        "Pipeline run started"
    );
    Ok(json!({ "channel_id": channel_id, "generation": handle.generation }))
}

// ============================================================
// Status
// ============================================================

#[derive(Deserialize)]
struct StatusParams {
    status: ClientStatus,
}

async fn handle_update_status(state: &Arc<GatewayState>, params: Option<Value>) -> Result<Value> {
    let p: With<StatusParams> = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    session.update_status(p.inner.status);
    Ok(json!({ "state": session.state() }))
}

#[derive(Deserialize)]
struct KeepAliveParams {
    #[serde(default)]
    target: Option<String>,
}

async fn handle_set_keep_alive(state: &Arc<GatewayState>, params: Option<Value>) -> Result<Value> {
    let p: With<KeepAliveParams> = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    session.set_keep_alive_target(p.inner.target);
    Ok(json!({ "target": session.keep_alive_target() }))
}

// ============================================================
// Announcements and questions
// ============================================================

async fn handle_announce(
    state: &Arc<GatewayState>,
    params: Option<Value>,
    start_conversation: bool,
) -> Result<Value> {
    let p: With<Announcement> = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    let mut announcement = p.inner;
    announcement.start_conversation = start_conversation;
    if !start_conversation {
        announcement.extra_system_prompt = None;
    }
    let outcome = session.announce(&announcement).await;
    Ok(json!({ "outcome": outcome }))
}

async fn handle_ask_question(state: &Arc<GatewayState>, params: Option<Value>) -> Result<Value> {
    let p: With<Question> = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    let answer = session.ask_question(&p.inner).await;
    Ok(serde_json::to_value(answer)?)
}

#[derive(Deserialize)]
struct AckParams {
    announce_id: u64,
}

async fn handle_announce_finished(
    state: &Arc<GatewayState>,
    params: Option<Value>,
) -> Result<Value> {
    let p: With<AckParams> = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    let accepted = session.announce_finished(p.inner.announce_id);
    Ok(json!({ "accepted": accepted }))
}

#[derive(Deserialize)]
struct AnswerParams {
    announce_id: u64,
    #[serde(default)]
    sentence: String,
}

async fn handle_question_answered(
    state: &Arc<GatewayState>,
    params: Option<Value>,
) -> Result<Value> {
    let p: With<AnswerParams> = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    match session
        .question_answered(p.inner.announce_id, p.inner.sentence)
        .await
    {
        Some(answer) => {
            let mut payload = serde_json::to_value(answer)?;
            payload["accepted"] = json!(true);
            Ok(payload)
        }
        None => Ok(json!({ "accepted": false })),
    }
}

// ============================================================
// Timers
// ============================================================

#[derive(Deserialize)]
struct CancelTimerParams {
    timer_id: String,
}

async fn handle_cancel_timer(state: &Arc<GatewayState>, params: Option<Value>) -> Result<Value> {
    let p: With<CancelTimerParams> = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    session.cancel_timer(&p.inner.timer_id).await?;
    Ok(json!({ "timer_id": p.inner.timer_id }))
}

// ============================================================
// Media player
// ============================================================

async fn handle_media_command(state: &Arc<GatewayState>, params: Option<Value>) -> Result<Value> {
    let p: With<MediaCommand> = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    let status = session.send_media_command(p.inner);
    Ok(serde_json::to_value(status)?)
}

async fn handle_media_command_ack(
    state: &Arc<GatewayState>,
    params: Option<Value>,
) -> Result<Value> {
    let p: With<MediaAck> = parse_params(params)?;
    let session = session_for(state, &p.satellite).await?;
    let status = session.media_ack(&p.inner);
    Ok(serde_json::to_value(status)?)
}

// ============================================================
// Helpers
// ============================================================

fn ok_response(request_id: &str, payload: Value) -> GatewayFrame {
    GatewayFrame::ok(request_id, payload)
}

fn error_response(request_id: &str, code: &str, message: &str) -> GatewayFrame {
    GatewayFrame::error(request_id, code, message)
}
