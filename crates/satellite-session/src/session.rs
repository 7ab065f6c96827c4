//! Per-satellite session: composes relay, handshakes, runs, status, timers
//! and media state for one device.

use std::sync::{Arc, Weak};

use chrono::Utc;
use satellite_core::audio::{AudioSink, AudioStream};
use satellite_core::config::SessionTimings;
use satellite_core::error::{Result, SatelliteError};
use satellite_core::keep_alive::KeepAlive;
use satellite_core::matcher::SentenceMatcher;
use satellite_core::pipeline::{PipelineExecutor, PipelineRequest};
use satellite_core::timer::TimerService;
use satellite_core::types::{
    ClientStatus, MediaCommand, MediaPlayerStatus, SatelliteId, SatelliteState, TimerEventKind,
    TimerNotification,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::entity::{SatelliteEntity, SatelliteUpdate};
use crate::handshake::{AnnounceOutcome, Announcement, AnswerMatch, HandshakeCoordinator, Question};
use crate::media::{MediaAck, MediaPlayer};
use crate::relay::{EventRelay, RelayTarget};
use crate::runs::{RunController, RunHandle, ShutdownOutcome};
use crate::status::StatusMapper;
use crate::timers::{TimerLedger, TimerSnapshot};

/// Capabilities shared by every session.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn PipelineExecutor>,
    pub matcher: Arc<dyn SentenceMatcher>,
    pub keep_alive: Arc<dyn KeepAlive>,
    pub timers: Option<Arc<dyn TimerService>>,
    pub timings: SessionTimings,
}

pub struct Session {
    id: SatelliteId,
    name: String,
    relay: EventRelay,
    handshake: HandshakeCoordinator,
    runs: RunController,
    status: StatusMapper,
    timers: TimerLedger,
    media: MediaPlayer,
    timer_service: Option<Arc<dyn TimerService>>,
    updates: broadcast::Sender<SatelliteUpdate>,
}

impl Session {
    pub fn new(
        id: SatelliteId,
        name: impl Into<String>,
        keep_alive_target: Option<String>,
        collaborators: &Collaborators,
        updates: broadcast::Sender<SatelliteUpdate>,
    ) -> Arc<Self> {
        let timings = collaborators.timings;
        Arc::new(Self {
            relay: EventRelay::new(),
            handshake: HandshakeCoordinator::new(
                id.clone(),
                Arc::clone(&collaborators.matcher),
                timings.announce,
            ),
            runs: RunController::new(
                id.clone(),
                Arc::clone(&collaborators.executor),
                timings.replace_grace,
                timings.teardown_grace,
            ),
            status: StatusMapper::new(
                id.clone(),
                Arc::clone(&collaborators.keep_alive),
                timings.keep_alive_interval,
                keep_alive_target,
            ),
            timers: TimerLedger::new(),
            media: MediaPlayer::new(),
            timer_service: collaborators.timers.clone(),
            updates,
            name: name.into(),
            id,
        })
    }

    // --- Subscribers ---

    /// Subscribe a client connection. Returns the subscription token.
    pub fn subscribe(&self, target: RelayTarget) -> String {
        let subscribed = self.relay.subscribe(target);
        if subscribed.became_available {
            info!(satellite = %self.id, "Satellite available");
            self.publish();
        }
        subscribed.token
    }

    pub fn unsubscribe(&self, token: &str) -> bool {
        let emptied = self.relay.unsubscribe(token);
        if emptied {
            self.on_unavailable();
        }
        emptied
    }

    /// Release everything bound to a closed connection.
    pub async fn disconnect(&self, conn_id: &str) -> Option<ShutdownOutcome> {
        if self.relay.unsubscribe_connection(conn_id) {
            self.on_unavailable();
        }
        self.runs.stop_connection(conn_id).await
    }

    pub fn subscriber_count(&self) -> usize {
        self.relay.len()
    }

    /// Push an event to every subscriber.
    pub fn push_event(&self, event_type: &str, data: Value) {
        if self.relay.push(event_type, data) {
            self.on_unavailable();
        }
    }

    fn on_unavailable(&self) {
        info!(satellite = %self.id, "Satellite unavailable, no subscribers left");
        self.handshake.release();
        self.publish();
    }

    // --- Handshakes ---

    pub async fn announce(&self, announcement: &Announcement) -> AnnounceOutcome {
        self.handshake
            .announce(announcement, |event_type, data| self.push_event(event_type, data))
            .await
    }

    pub async fn ask_question(&self, question: &Question) -> AnswerMatch {
        self.handshake
            .ask(
                question,
                |event_type, data| self.push_event(event_type, data),
                || self.set_state(SatelliteState::Listening),
            )
            .await
    }

    /// Playback ack. Returns false when `announce_id` is stale.
    pub fn announce_finished(&self, announce_id: u64) -> bool {
        self.handshake.ack(announce_id)
    }

    /// Transcribed answer. `None` when `announce_id` is stale.
    pub async fn question_answered(&self, announce_id: u64, sentence: String) -> Option<AnswerMatch> {
        self.handshake.answer(announce_id, sentence).await
    }

    pub fn pending_announcement(&self) -> Option<u64> {
        self.handshake.pending_id()
    }

    // --- Status ---

    pub fn update_status(&self, status: ClientStatus) {
        if self.status.apply(status).is_some() {
            self.publish();
        }
    }

    fn set_state(&self, state: SatelliteState) {
        if self.status.set_state(state).is_some() {
            self.publish();
        }
    }

    pub fn set_keep_alive_target(&self, target: Option<String>) {
        self.status.set_keep_alive_target(target);
    }

    pub fn keep_alive_target(&self) -> Option<String> {
        self.status.keep_alive_target()
    }

    // --- Pipeline runs ---

    pub async fn start_run(
        &self,
        request: PipelineRequest,
        target: RelayTarget,
        sink: AudioSink,
        audio: AudioStream,
    ) -> Result<RunHandle> {
        self.runs.start_run(request, target, sink, audio).await
    }

    pub fn run_generation(&self) -> u64 {
        self.runs.generation()
    }

    pub fn active_run(&self) -> Option<u64> {
        self.runs.active_generation()
    }

    // --- Timers ---

    /// Sender to register with the timer capability. Notifications are
    /// applied until the session is dropped or the sender goes away.
    pub fn timer_handler(self: &Arc<Self>) -> mpsc::UnboundedSender<TimerNotification> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerNotification>();
        let session: Weak<Session> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.handle_timer(&notification);
            }
        });
        tx
    }

    pub fn handle_timer(&self, notification: &TimerNotification) {
        if self.timers.apply(notification, Utc::now()).is_some() {
            self.publish();
        }
    }

    pub async fn cancel_timer(&self, timer_id: &str) -> Result<()> {
        let service = self
            .timer_service
            .as_ref()
            .ok_or_else(|| SatelliteError::NotReady("Timer service is not available".into()))?;
        service.cancel(timer_id).await.map_err(|e| {
            warn!(satellite = %self.id, timer_id, error = %e, "Timer cancel rejected");
            SatelliteError::CancelFailed(e.to_string())
        })
    }

    // --- Media player ---

    pub fn send_media_command(&self, command: MediaCommand) -> MediaPlayerStatus {
        let (command, status) = self.media.prepare(command);
        match serde_json::to_value(&command) {
            Ok(data) => self.push_event("media_command", data),
            Err(e) => warn!(satellite = %self.id, error = %e, "Media command not serializable"),
        }
        debug!(satellite = %self.id, ?command, "Media command pushed");
        self.publish();
        status
    }

    pub fn media_ack(&self, ack: &MediaAck) -> MediaPlayerStatus {
        let status = self.media.apply_ack(ack);
        self.publish();
        status
    }

    // --- Lifecycle ---

    /// Stop all background work, drop subscribers and resolve every handshake.
    pub async fn teardown(&self) {
        self.handshake.close();
        let dropped = self.relay.clear();
        self.status.shutdown();
        self.runs.teardown().await;
        debug!(satellite = %self.id, dropped, "Subscribers dropped");
        info!(satellite = %self.id, "Session torn down");
    }

    fn publish(&self) {
        // No receivers is fine.
        let _ = self.updates.send(self.snapshot());
    }
}

impl SatelliteEntity for Session {
    fn id(&self) -> &SatelliteId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> SatelliteState {
        self.status.state()
    }

    fn available(&self) -> bool {
        !self.relay.is_empty()
    }

    fn timers(&self) -> TimerSnapshot {
        self.timers.snapshot()
    }

    fn last_timer_event(&self) -> Option<TimerEventKind> {
        self.timers.last_event()
    }

    fn media(&self) -> MediaPlayerStatus {
        self.media.status()
    }
}
