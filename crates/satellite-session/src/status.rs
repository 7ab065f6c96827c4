//! Status mapper: client-reported status -> canonical state, plus the
//! keep-alive loop that runs while the satellite is busy.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use satellite_core::keep_alive::KeepAlive;
use satellite_core::types::{ClientStatus, SatelliteId, SatelliteState};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Canonical state for a client status.
pub fn map_status(status: ClientStatus) -> SatelliteState {
    match status {
        ClientStatus::Idle
        | ClientStatus::Connecting
        | ClientStatus::Listening
        | ClientStatus::Paused
        | ClientStatus::Error => SatelliteState::Idle,
        ClientStatus::WakeWordDetected | ClientStatus::Stt => SatelliteState::Listening,
        ClientStatus::Intent => SatelliteState::Processing,
        ClientStatus::Tts => SatelliteState::Responding,
    }
}

struct StatusState {
    state: SatelliteState,
    target: Option<String>,
    ticker: Option<CancellationToken>,
}

pub struct StatusMapper {
    satellite: SatelliteId,
    keep_alive: Arc<dyn KeepAlive>,
    interval: Duration,
    state: Mutex<StatusState>,
}

impl StatusMapper {
    pub fn new(
        satellite: SatelliteId,
        keep_alive: Arc<dyn KeepAlive>,
        interval: Duration,
        target: Option<String>,
    ) -> Self {
        Self {
            satellite,
            keep_alive,
            interval,
            state: Mutex::new(StatusState {
                state: SatelliteState::Idle,
                target,
                ticker: None,
            }),
        }
    }

    pub fn state(&self) -> SatelliteState {
        self.lock().state
    }

    pub fn keep_alive_target(&self) -> Option<String> {
        self.lock().target.clone()
    }

    pub fn keep_alive_running(&self) -> bool {
        self.lock().ticker.is_some()
    }

    /// Apply a client status. Returns the new state on a transition.
    pub fn apply(&self, status: ClientStatus) -> Option<SatelliteState> {
        let mapped = map_status(status);
        let changed = self.set_state(mapped);
        if changed.is_some() {
            debug!(satellite = %self.satellite, ?status, state = mapped.as_str(), "Pipeline state changed");
        }
        changed
    }

    /// Set the canonical state directly. Returns the new state on a transition.
    pub fn set_state(&self, next: SatelliteState) -> Option<SatelliteState> {
        let mut state = self.lock();
        if state.state == next {
            return None;
        }
        state.state = next;
        self.reconcile(&mut state, false);
        Some(next)
    }

    /// Change (or clear) the device kept awake while busy.
    pub fn set_keep_alive_target(&self, target: Option<String>) {
        let mut state = self.lock();
        if state.target == target {
            return;
        }
        state.target = target;
        self.reconcile(&mut state, true);
    }

    /// Stop the keep-alive loop for good.
    pub fn shutdown(&self) {
        if let Some(ticker) = self.lock().ticker.take() {
            ticker.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reconcile(&self, state: &mut StatusState, target_changed: bool) {
        let wanted = match (&state.target, state.state) {
            (Some(target), s) if s != SatelliteState::Idle => Some(target.clone()),
            _ => None,
        };

        if target_changed || wanted.is_none() {
            if let Some(ticker) = state.ticker.take() {
                debug!(satellite = %self.satellite, "Keep-alive stopped");
                ticker.cancel();
            }
        }
        if let Some(target) = wanted {
            if state.ticker.is_none() {
                state.ticker = Some(self.spawn_ticker(target));
            }
        }
    }

    fn spawn_ticker(&self, target: String) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let keep_alive = Arc::clone(&self.keep_alive);
        let satellite = self.satellite.clone();
        let period = self.interval;
        debug!(satellite = %satellite, target = %target, "Keep-alive started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = keep_alive.keep_awake(&satellite, &target).await {
                            warn!(satellite = %satellite, target = %target, error = %e, "Keep-alive failed");
                        }
                    }
                }
            }
        });
        token
    }
}

impl Drop for StatusMapper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        pings: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.pings.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl KeepAlive for Recorder {
        async fn keep_awake(&self, _satellite: &SatelliteId, target: &str) -> anyhow::Result<()> {
            self.pings.lock().unwrap().push(target.to_string());
            Ok(())
        }
    }

    fn mapper(recorder: &Arc<Recorder>, target: Option<&str>) -> StatusMapper {
        StatusMapper::new(
            SatelliteId::new("kitchen"),
            Arc::clone(recorder) as Arc<dyn KeepAlive>,
            Duration::from_secs(5),
            target.map(str::to_string),
        )
    }

    #[test]
    fn test_status_vocabulary() {
        assert_eq!(map_status(ClientStatus::Connecting), SatelliteState::Idle);
        assert_eq!(map_status(ClientStatus::Listening), SatelliteState::Idle);
        assert_eq!(map_status(ClientStatus::Paused), SatelliteState::Idle);
        assert_eq!(map_status(ClientStatus::Error), SatelliteState::Idle);
        assert_eq!(map_status(ClientStatus::WakeWordDetected), SatelliteState::Listening);
        assert_eq!(map_status(ClientStatus::Stt), SatelliteState::Listening);
        assert_eq!(map_status(ClientStatus::Intent), SatelliteState::Processing);
        assert_eq!(map_status(ClientStatus::Tts), SatelliteState::Responding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_only_on_transition() {
        let recorder = Arc::new(Recorder::default());
        let status = mapper(&recorder, None);
        assert_eq!(status.apply(ClientStatus::Connecting), None);
        assert_eq!(status.apply(ClientStatus::Stt), Some(SatelliteState::Listening));
        assert_eq!(status.apply(ClientStatus::WakeWordDetected), None);
        assert_eq!(status.apply(ClientStatus::Tts), Some(SatelliteState::Responding));
        assert!(!status.keep_alive_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_runs_while_busy() {
        let recorder = Arc::new(Recorder::default());
        let status = mapper(&recorder, Some("media_player.tablet"));

        status.apply(ClientStatus::WakeWordDetected);
        assert!(status.keep_alive_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(recorder.count(), 3);

        // Non-idle to non-idle keeps the same loop
        status.apply(ClientStatus::Intent);
        status.apply(ClientStatus::Idle);
        assert!(!status.keep_alive_running());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(recorder.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_target_cancels_keep_alive() {
        let recorder = Arc::new(Recorder::default());
        let status = mapper(&recorder, Some("media_player.tablet"));
        status.apply(ClientStatus::Tts);
        tokio::time::sleep(Duration::from_millis(10)).await;

        status.set_keep_alive_target(None);
        assert!(!status.keep_alive_running());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(recorder.count(), 1);

        status.set_keep_alive_target(Some("media_player.hall".into()));
        assert!(status.keep_alive_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.pings.lock().unwrap().last().unwrap(), "media_player.hall");
    }
}
