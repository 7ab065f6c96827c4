use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of a paired satellite device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SatelliteId(String);

impl SatelliteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SatelliteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SatelliteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Canonical session state published for a satellite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SatelliteState {
    #[default]
    Idle,
    Listening,
    Processing,
    Responding,
}

impl SatelliteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Responding => "responding",
        }
    }
}

/// Status vocabulary reported by the satellite client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientStatus {
    Idle,
    Connecting,
    Listening,
    Paused,
    WakeWordDetected,
    Stt,
    Intent,
    Tts,
    Error,
}

/// Stage of the voice pipeline a run starts or ends at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    WakeWord,
    Stt,
    Intent,
    Tts,
}

// --- Timers ---

/// Lifecycle notification kinds from the timer capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerEventKind {
    Started,
    Updated,
    Cancelled,
    Finished,
}

/// Timer details as delivered by the timer capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_hours: Option<u32>,
    #[serde(default)]
    pub start_minutes: Option<u32>,
    #[serde(default)]
    pub start_seconds: Option<u32>,
}

impl TimerInfo {
    /// Total duration in seconds, treating missing components as zero.
    pub fn total_seconds(&self) -> u64 {
        let h = u64::from(self.start_hours.unwrap_or(0));
        let m = u64::from(self.start_minutes.unwrap_or(0));
        let s = u64::from(self.start_seconds.unwrap_or(0));
        h * 3600 + m * 60 + s
    }
}

/// A single notification delivered to a satellite's timer handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerNotification {
    pub kind: TimerEventKind,
    pub timer: TimerInfo,
}

/// An active timer as exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEntry {
    pub id: String,
    pub name: String,
    pub total_seconds: u64,
    pub started_at: DateTime<Utc>,
    pub start_hours: u32,
    pub start_minutes: u32,
    pub start_seconds: u32,
}

impl TimerEntry {
    pub fn from_info(info: &TimerInfo, started_at: DateTime<Utc>) -> Self {
        Self {
            id: info.id.clone(),
            name: info.name.clone().unwrap_or_default(),
            total_seconds: info.total_seconds(),
            started_at,
            start_hours: info.start_hours.unwrap_or(0),
            start_minutes: info.start_minutes.unwrap_or(0),
            start_seconds: info.start_seconds.unwrap_or(0),
        }
    }
}

// --- Media player ---

/// Playback state of the satellite's media player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
}

/// Commands pushed to the satellite's media player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum MediaCommand {
    Play {
        media_id: String,
        #[serde(default = "default_media_type")]
        media_type: String,
        #[serde(default)]
        announce: Option<bool>,
        #[serde(default)]
        volume: Option<f64>,
    },
    Pause,
    Resume,
    Stop,
    VolumeSet {
        volume: f64,
    },
    VolumeMute {
        mute: bool,
    },
}

fn default_media_type() -> String {
    "music".into()
}

/// Snapshot of the media player state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPlayerStatus {
    pub state: PlaybackState,
    pub volume: f64,
    pub muted: bool,
    pub media_id: Option<String>,
    pub media_type: Option<String>,
}

impl Default for MediaPlayerStatus {
    fn default() -> Self {
        Self {
            state: PlaybackState::Idle,
            volume: 0.5,
            muted: false,
            media_id: None,
            media_type: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_status_wire_names() {
        let status: ClientStatus = serde_json::from_str(r#""WAKE_WORD_DETECTED""#).unwrap();
        assert_eq!(status, ClientStatus::WakeWordDetected);
        let status: ClientStatus = serde_json::from_str(r#""STT""#).unwrap();
        assert_eq!(status, ClientStatus::Stt);
        assert!(serde_json::from_str::<ClientStatus>(r#""DANCING""#).is_err());
    }

    #[test]
    fn test_timer_total_seconds() {
        let info = TimerInfo {
            id: "t1".into(),
            name: None,
            start_hours: Some(1),
            start_minutes: Some(2),
            start_seconds: None,
        };
        assert_eq!(info.total_seconds(), 3720);
    }

    #[test]
    fn test_media_command_serialization() {
        let cmd = MediaCommand::VolumeSet { volume: 0.3 };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["command"], "volume_set");
        assert_eq!(json["volume"], 0.3);

        let cmd: MediaCommand =
            serde_json::from_value(serde_json::json!({"command": "play", "media_id": "http://x/a.mp3"}))
                .unwrap();
        assert!(matches!(cmd, MediaCommand::Play { ref media_type, .. } if media_type == "music"));
    }

    #[test]
    fn test_pipeline_stage_wire_names() {
        let stage: PipelineStage = serde_json::from_str(r#""wake_word""#).unwrap();
        assert_eq!(stage, PipelineStage::WakeWord);
    }
}
