//! Media player state mirrored from the satellite's audio output.

use std::sync::{Mutex, MutexGuard, PoisonError};

use satellite_core::types::{MediaCommand, MediaPlayerStatus, PlaybackState};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Playback report sent back by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAck {
    pub state: PlaybackState,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub media_id: Option<String>,
}

#[derive(Default)]
pub struct MediaPlayer {
    status: Mutex<MediaPlayerStatus>,
}

impl MediaPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> MediaPlayerStatus {
        self.lock().clone()
    }

    /// Fill in command defaults from the current state and apply the
    /// optimistic state change. Returns the command to push.
    pub fn prepare(&self, command: MediaCommand) -> (MediaCommand, MediaPlayerStatus) {
        let mut status = self.lock();
        let command = match command {
            MediaCommand::Play {
                media_id,
                media_type,
                announce,
                volume,
            } => {
                status.state = PlaybackState::Playing;
                status.media_id = Some(media_id.clone());
                status.media_type = Some(media_type.clone());
                MediaCommand::Play {
                    media_id,
                    media_type,
                    announce,
                    volume: Some(volume.map_or(status.volume, clamp_volume)),
                }
            }
            MediaCommand::Pause => {
                status.state = PlaybackState::Paused;
                MediaCommand::Pause
            }
            MediaCommand::Resume => {
                status.state = PlaybackState::Playing;
                MediaCommand::Resume
            }
            MediaCommand::Stop => {
                status.state = PlaybackState::Idle;
                status.media_id = None;
                status.media_type = None;
                MediaCommand::Stop
            }
            MediaCommand::VolumeSet { volume } => {
                let volume = clamp_volume(volume);
                status.volume = volume;
                MediaCommand::VolumeSet { volume }
            }
            MediaCommand::VolumeMute { mute } => {
                status.muted = mute;
                MediaCommand::VolumeMute { mute }
            }
        };
        (command, status.clone())
    }

    /// Apply a playback report from the client.
    pub fn apply_ack(&self, ack: &MediaAck) -> MediaPlayerStatus {
        let mut status = self.lock();
        status.state = ack.state;
        if let Some(volume) = ack.volume {
            status.volume = clamp_volume(volume);
        }
        match &ack.media_id {
            Some(media_id) => status.media_id = Some(media_id.clone()),
            None if ack.state == PlaybackState::Idle => {
                status.media_id = None;
                status.media_type = None;
            }
            None => {}
        }
        debug!(state = ?status.state, volume = status.volume, "Media player state updated");
        status.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MediaPlayerStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn clamp_volume(volume: f64) -> f64 {
    if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) }
}
