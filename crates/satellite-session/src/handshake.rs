//! Handshake coordinator: announcements, conversation starts and questions
//! that the client acknowledges by id.
//!
//! One request is outstanding at a time. Every wait is bounded; timeouts and
//! forced releases resolve to values, never errors.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use satellite_core::matcher::{SentenceMatch, SentenceMatcher};
use satellite_core::types::SatelliteId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

fn default_true() -> bool {
    true
}

/// An announcement or conversation start to play on the satellite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub preannounce_media_id: Option<String>,
    #[serde(default = "default_true")]
    pub preannounce: bool,
    #[serde(default)]
    pub start_conversation: bool,
    #[serde(default)]
    pub extra_system_prompt: Option<String>,
}

impl Announcement {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            media_id: None,
            preannounce_media_id: None,
            preannounce: true,
            start_conversation: false,
            extra_system_prompt: None,
        }
    }

    fn event_type(&self) -> &'static str {
        if self.start_conversation {
            "start_conversation"
        } else {
            "announcement"
        }
    }

    fn payload(&self, id: u64, ask_question: bool) -> Value {
        let mut data = json!({
            "id": id,
            "message": self.message,
            "media_id": self.media_id.clone().unwrap_or_default(),
            "preannounce_media_id": self.preannounce_media_id.clone().unwrap_or_default(),
            "preannounce": self.preannounce,
            "start_conversation": self.start_conversation,
            "ask_question": ask_question,
        });
        if let Some(prompt) = &self.extra_system_prompt {
            data["extra_system_prompt"] = json!(prompt);
        }
        data
    }
}

/// A question whose spoken answer is matched against `answers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub preannounce_media_id: Option<String>,
    #[serde(default = "default_true")]
    pub preannounce: bool,
    /// Answer id -> sentence templates.
    #[serde(default)]
    pub answers: BTreeMap<String, Vec<String>>,
}

impl Question {
    fn payload(&self, id: u64) -> Value {
        Announcement {
            message: self.question.clone(),
            media_id: self.media_id.clone(),
            preannounce_media_id: self.preannounce_media_id.clone(),
            preannounce: self.preannounce,
            start_conversation: false,
            extra_system_prompt: None,
        }
        .payload(id, true)
    }
}

/// How an announcement wait resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceOutcome {
    Acknowledged,
    /// No ack within the timeout.
    Unacknowledged,
    /// Force-resolved because the session lost its subscribers or went away.
    Released,
}

/// Result of a question, handed to both the asker and the answering client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerMatch {
    pub matched: bool,
    pub id: Option<String>,
    /// Raw transcribed answer, absent when nothing was said.
    pub sentence: Option<String>,
    #[serde(default)]
    pub slots: BTreeMap<String, String>,
}

impl AnswerMatch {
    pub fn unanswered() -> Self {
        Self::default()
    }

    pub fn unmatched(sentence: impl Into<String>) -> Self {
        Self {
            sentence: Some(sentence.into()),
            ..Self::default()
        }
    }

    pub fn matched(sentence: impl Into<String>, found: SentenceMatch) -> Self {
        Self {
            matched: true,
            id: Some(found.id),
            sentence: Some(sentence.into()),
            slots: found.slots,
        }
    }
}

enum Signal {
    Acknowledged,
    Answered {
        text: String,
        reply: oneshot::Sender<AnswerMatch>,
    },
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Playback,
    AwaitingAnswer,
}

struct Pending {
    id: u64,
    phase: Phase,
    expects_answer: bool,
    signal: Option<oneshot::Sender<Signal>>,
    /// Answer that arrived after the playback ack but before the answer wait began.
    early_answer: Option<(String, oneshot::Sender<AnswerMatch>)>,
}

#[derive(Default)]
struct HandshakeState {
    last_id: u64,
    pending: Option<Pending>,
    /// Set once the session is gone; every later request resolves at once.
    closed: bool,
}

enum AnswerWait {
    Wait(oneshot::Receiver<Signal>),
    Early(String, oneshot::Sender<AnswerMatch>),
    Gone,
}

/// Clears the pending slot for `id` however the wait ends.
struct PendingGuard<'a> {
    state: &'a Mutex<HandshakeState>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.pending.as_ref().is_some_and(|p| p.id == self.id) {
            state.pending = None;
        }
    }
}

pub struct HandshakeCoordinator {
    satellite: SatelliteId,
    matcher: Arc<dyn SentenceMatcher>,
    timeout: Duration,
    /// Serializes requests so a new one starts only after the previous wait resolved.
    turn: tokio::sync::Mutex<()>,
    state: Mutex<HandshakeState>,
}

impl HandshakeCoordinator {
    pub fn new(satellite: SatelliteId, matcher: Arc<dyn SentenceMatcher>, timeout: Duration) -> Self {
        Self {
            satellite,
            matcher,
            timeout,
            turn: tokio::sync::Mutex::new(()),
            state: Mutex::new(HandshakeState::default()),
        }
    }

    /// Id of the request currently waiting for the client, if any.
    pub fn pending_id(&self) -> Option<u64> {
        self.lock().pending.as_ref().map(|p| p.id)
    }

    /// Publish an announcement via `publish` and wait for the playback ack.
    pub async fn announce(
        &self,
        announcement: &Announcement,
        publish: impl FnOnce(&str, Value),
    ) -> AnnounceOutcome {
        let _turn = self.turn.lock().await;
        let Some((id, rx)) = self.open(false) else {
            debug!(satellite = %self.satellite, "Announcement dropped, session closed");
            return AnnounceOutcome::Released;
        };
        let _guard = PendingGuard {
            state: &self.state,
            id,
        };

        publish(announcement.event_type(), announcement.payload(id, false));
        debug!(satellite = %self.satellite, announce_id = id, "Announcement sent");

        match timeout(self.timeout, rx).await {
            Ok(Ok(Signal::Acknowledged | Signal::Answered { .. })) => {
                debug!(satellite = %self.satellite, announce_id = id, "Announcement acknowledged");
                AnnounceOutcome::Acknowledged
            }
            Ok(Ok(Signal::Released) | Err(_)) => {
                debug!(satellite = %self.satellite, announce_id = id, "Announcement released");
                AnnounceOutcome::Released
            }
            Err(_) => {
                warn!(
                    satellite = %self.satellite,
                    announce_id = id,
                    "Announcement timed out after {}s",
                    self.timeout.as_secs()
                );
                AnnounceOutcome::Unacknowledged
            }
        }
    }

    /// Play a question, then wait for the transcribed answer and match it.
    ///
    /// `on_listening` runs once playback is over and the answer wait begins.
    pub async fn ask(
        &self,
        question: &Question,
        publish: impl FnOnce(&str, Value),
        on_listening: impl FnOnce(),
    ) -> AnswerMatch {
        let _turn = self.turn.lock().await;
        let Some((id, rx)) = self.open(true) else {
            debug!(satellite = %self.satellite, "Question dropped, session closed");
            return AnswerMatch::unanswered();
        };
        let _guard = PendingGuard {
            state: &self.state,
            id,
        };

        publish("announcement", question.payload(id));
        debug!(satellite = %self.satellite, announce_id = id, "Question sent");

        match timeout(self.timeout, rx).await {
            Ok(Ok(Signal::Answered { text, reply })) => {
                return self.resolve(id, text, &question.answers, reply);
            }
            Ok(Ok(Signal::Acknowledged)) => {}
            Ok(Ok(Signal::Released) | Err(_)) => {
                debug!(satellite = %self.satellite, announce_id = id, "Question released");
                return AnswerMatch::unanswered();
            }
            Err(_) => {
                warn!(
                    satellite = %self.satellite,
                    announce_id = id,
                    "Question playback not acknowledged after {}s",
                    self.timeout.as_secs()
                );
            }
        }

        let rx = match self.await_answer(id) {
            AnswerWait::Wait(rx) => rx,
            AnswerWait::Early(text, reply) => return self.resolve(id, text, &question.answers, reply),
            AnswerWait::Gone => return AnswerMatch::unanswered(),
        };
        on_listening();

        match timeout(self.timeout, rx).await {
            Ok(Ok(Signal::Answered { text, reply })) => self.resolve(id, text, &question.answers, reply),
            Ok(_) => {
                debug!(satellite = %self.satellite, announce_id = id, "Question released");
                AnswerMatch::unanswered()
            }
            Err(_) => {
                warn!(
                    satellite = %self.satellite,
                    announce_id = id,
                    "No answer after {}s",
                    self.timeout.as_secs()
                );
                AnswerMatch::unanswered()
            }
        }
    }

    /// Playback ack from the client. Returns false for a stale id.
    pub fn ack(&self, id: u64) -> bool {
        let mut state = self.lock();
        let current = state.last_id;
        let signal = state
            .pending
            .as_mut()
            .filter(|p| p.id == id && p.phase == Phase::Playback)
            .and_then(|p| p.signal.take());
        if let Some(signal) = signal {
            let _ = signal.send(Signal::Acknowledged);
            debug!(satellite = %self.satellite, announce_id = id, "Announce ack received");
            return true;
        }
        debug!(
            satellite = %self.satellite,
            announce_id = id,
            current,
            "Ignoring stale announce ack"
        );
        false
    }

    /// Transcribed answer from the client. Resolves to the match result, or
    /// `None` when `id` is not the current question.
    pub async fn answer(&self, id: u64, text: String) -> Option<AnswerMatch> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = self.lock();
            let current = state.last_id;
            let Some(pending) = state.pending.as_mut().filter(|p| p.id == id && p.expects_answer) else {
                debug!(
                    satellite = %self.satellite,
                    announce_id = id,
                    current,
                    "Ignoring stale answer"
                );
                return None;
            };

            match pending.signal.take() {
                Some(signal) => {
                    if signal.send(Signal::Answered { text, reply: reply_tx }).is_err() {
                        return None;
                    }
                }
                None if pending.phase == Phase::Playback && pending.early_answer.is_none() => {
                    pending.early_answer = Some((text, reply_tx));
                }
                None => {
                    debug!(satellite = %self.satellite, announce_id = id, "Ignoring duplicate answer");
                    return None;
                }
            }
        }
        reply_rx.await.ok()
    }

    /// Force-resolve any pending wait. Returns true when something was pending.
    pub fn release(&self) -> bool {
        let pending = self.lock().pending.take();
        match pending {
            Some(pending) => {
                if let Some(signal) = pending.signal {
                    let _ = signal.send(Signal::Released);
                }
                debug!(satellite = %self.satellite, announce_id = pending.id, "Pending handshake released");
                true
            }
            None => false,
        }
    }

    /// Release the pending wait and refuse every request queued behind it.
    pub fn close(&self) {
        self.lock().closed = true;
        self.release();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HandshakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, expects_answer: bool) -> Option<(u64, oneshot::Receiver<Signal>)> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.last_id += 1;
        let id = state.last_id;
        let (tx, rx) = oneshot::channel();
        state.pending = Some(Pending {
            id,
            phase: Phase::Playback,
            expects_answer,
            signal: Some(tx),
            early_answer: None,
        });
        Some((id, rx))
    }

    fn await_answer(&self, id: u64) -> AnswerWait {
        let mut state = self.lock();
        match state.pending.as_mut() {
            Some(pending) if pending.id == id => {
                if let Some((text, reply)) = pending.early_answer.take() {
                    return AnswerWait::Early(text, reply);
                }
                let (tx, rx) = oneshot::channel();
                pending.phase = Phase::AwaitingAnswer;
                pending.signal = Some(tx);
                AnswerWait::Wait(rx)
            }
            _ => AnswerWait::Gone,
        }
    }

    fn resolve(
        &self,
        id: u64,
        text: String,
        templates: &BTreeMap<String, Vec<String>>,
        reply: oneshot::Sender<AnswerMatch>,
    ) -> AnswerMatch {
        let result = if text.trim().is_empty() {
            AnswerMatch::unanswered()
        } else {
            match self.matcher.match_sentence(&text, templates) {
                Ok(Some(found)) => AnswerMatch::matched(text, found),
                Ok(None) => AnswerMatch::unmatched(text),
                Err(e) => {
                    warn!(satellite = %self.satellite, announce_id = id, error = %e, "Sentence matcher failed");
                    AnswerMatch::unmatched(text)
                }
            }
        };
        debug!(
            satellite = %self.satellite,
            announce_id = id,
            matched = result.matched,
            answer = ?result.id,
            "Question answered"
        );
        let _ = reply.send(result.clone());
        result
    }
}
