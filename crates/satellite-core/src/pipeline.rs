//! Pipeline execution capability.
//!
//! The bridge does not run wake-word, STT, intent or TTS itself. It hands an
//! [`AudioStream`] to a [`PipelineExecutor`] and relays the typed stage events
//! it produces. The first event of every run is `run-start`.

use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::audio::AudioStream;
use crate::protocol::SatelliteEvent;
use crate::types::{PipelineStage, SatelliteId};

pub const RUN_START: &str = "run-start";
pub const RUN_END: &str = "run-end";
pub const ERROR: &str = "error";

/// Parameters of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub satellite: SatelliteId,
    pub start_stage: PipelineStage,
    pub end_stage: PipelineStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_system_prompt: Option<String>,
}

/// Runs the voice pipeline over a stream of audio frames.
pub trait PipelineExecutor: Send + Sync {
    /// Start a run. The returned stream ends after the terminal event.
    fn run(&self, request: PipelineRequest, audio: AudioStream) -> BoxStream<'static, SatelliteEvent>;
}

pub fn is_run_start(event: &SatelliteEvent) -> bool {
    event.event_type == RUN_START
}

pub fn is_terminal(event: &SatelliteEvent) -> bool {
    event.event_type == RUN_END || event.event_type == ERROR
}

/// Reference executor that consumes audio without recognizing anything.
///
/// Emits `run-start`, `stt-vad-start` on the first frame, and on end of
/// stream `stt-end` with frame/byte counts followed by `run-end`. The audio
/// is consumed by a background task, like a real pipeline's stage workers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackPipeline;

impl PipelineExecutor for LoopbackPipeline {
    fn run(&self, request: PipelineRequest, mut audio: AudioStream) -> BoxStream<'static, SatelliteEvent> {
        use futures::StreamExt;

        let (tx, mut rx) = mpsc::unbounded_channel::<SatelliteEvent>();

        tokio::spawn(async move {
            let _ = tx.send(SatelliteEvent::new(
                RUN_START,
                json!({
                    "pipeline": "loopback",
                    "conversation_id": request.conversation_id,
                    "start_stage": request.start_stage,
                    "end_stage": request.end_stage,
                }),
            ));
            if request.start_stage == PipelineStage::WakeWord {
                let _ = tx.send(SatelliteEvent::new("wake_word-start", json!({})));
            }

            let mut frames = 0u64;
            let mut bytes = 0u64;
            while let Some(frame) = audio.next().await {
                if frames == 0 {
                    let _ = tx.send(SatelliteEvent::new("stt-vad-start", json!({})));
                }
                frames += 1;
                bytes += frame.len() as u64;
            }
            debug!(satellite = %request.satellite, frames, bytes, "Loopback audio drained");

            let _ = tx.send(SatelliteEvent::new(
                "stt-end",
                json!({ "stt_output": { "frames": frames, "bytes": bytes } }),
            ));
            let _ = tx.send(SatelliteEvent::new(RUN_END, json!({})));
        });

        stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::audio_channel;
    use bytes::Bytes;
    use futures::StreamExt;

    fn request() -> PipelineRequest {
        PipelineRequest {
            satellite: SatelliteId::new("kitchen"),
            start_stage: PipelineStage::WakeWord,
            end_stage: PipelineStage::Tts,
            conversation_id: None,
            extra_system_prompt: None,
        }
    }

    #[tokio::test]
    async fn test_loopback_event_sequence() {
        let (sink, audio) = audio_channel();
        let mut events = LoopbackPipeline.run(request(), audio);

        sink.push(Bytes::from_static(&[1, 2, 3, 4]));
        sink.push(Bytes::from_static(&[5, 6]));
        sink.close();

        let collected: Vec<SatelliteEvent> = events.by_ref().collect().await;
        let types: Vec<&str> = collected.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["run-start", "wake_word-start", "stt-vad-start", "stt-end", "run-end"]
        );
        assert!(is_run_start(&collected[0]));
        assert!(is_terminal(collected.last().unwrap()));
        assert_eq!(collected[3].data["stt_output"]["frames"], 2);
        assert_eq!(collected[3].data["stt_output"]["bytes"], 6);
    }

    #[tokio::test]
    async fn test_loopback_without_wake_word_stage() {
        let (sink, audio) = audio_channel();
        let mut req = request();
        req.start_stage = PipelineStage::Stt;
        let events = LoopbackPipeline.run(req, audio);
        sink.close();
        let types: Vec<String> = events.map(|e| e.event_type).collect().await;
        assert_eq!(types, vec!["run-start", "stt-end", "run-end"]);
    }
}
