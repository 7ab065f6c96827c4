//! Pipeline run controller.
//!
//! A session has at most one active run. Replacing or stopping a run is a
//! two-phase shutdown: drain (push the end-of-stream sentinel and wait a grace
//! window for the task to exit on its own), then cancel (abort the task and
//! absorb the join error). Every run carries a generation; events and cleanup
//! from a superseded generation are dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use satellite_core::audio::{AudioSink, AudioStream};
use satellite_core::error::{Result, SatelliteError};
use satellite_core::pipeline::{is_run_start, is_terminal, PipelineExecutor, PipelineRequest};
use satellite_core::protocol::SatelliteEvent;
use satellite_core::types::SatelliteId;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::relay::RelayTarget;

/// How a run was neutralized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// The run saw the sentinel and exited within the grace window.
    Drained,
    /// The run was aborted after the grace window.
    Cancelled,
}

/// Returned by [`RunController::start_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunHandle {
    pub generation: u64,
    /// How the previous run ended, when one was replaced.
    pub replaced: Option<ShutdownOutcome>,
}

struct ActiveRun {
    generation: u64,
    target: RelayTarget,
    sink: AudioSink,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RunState {
    generation: u64,
    active: Option<ActiveRun>,
    closed: bool,
}

pub struct RunController {
    satellite: SatelliteId,
    executor: Arc<dyn PipelineExecutor>,
    replace_grace: Duration,
    teardown_grace: Duration,
    /// Serializes start/stop so only one replacement is in flight.
    turn: tokio::sync::Mutex<()>,
    state: Arc<Mutex<RunState>>,
}

impl RunController {
    pub fn new(
        satellite: SatelliteId,
        executor: Arc<dyn PipelineExecutor>,
        replace_grace: Duration,
        teardown_grace: Duration,
    ) -> Self {
        Self {
            satellite,
            executor,
            replace_grace,
            teardown_grace,
            turn: tokio::sync::Mutex::new(()),
            state: Arc::new(Mutex::new(RunState::default())),
        }
    }

    /// Latest generation handed out.
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// Generation of the run currently bound to the session.
    pub fn active_generation(&self) -> Option<u64> {
        lock(&self.state).active.as_ref().map(|run| run.generation)
    }

    pub fn active_conn_id(&self) -> Option<String> {
        lock(&self.state)
            .active
            .as_ref()
            .map(|run| run.target.conn_id().to_string())
    }

    /// Start a run fed by `audio`, relaying its events to `target`.
    ///
    /// `sink` is the producer side of `audio`; the controller keeps a clone to
    /// push the sentinel when the run is replaced or stopped.
    pub async fn start_run(
        &self,
        request: PipelineRequest,
        target: RelayTarget,
        sink: AudioSink,
        audio: AudioStream,
    ) -> Result<RunHandle> {
        let _turn = self.turn.lock().await;

        let (generation, previous) = {
            let mut state = lock(&self.state);
            if state.closed {
                sink.close();
                return Err(self.removed());
            }
            state.generation += 1;
            (state.generation, state.active.take())
        };

        let replaced = match previous {
            Some(previous) => {
                if !previous.target.same_connection(&target) {
                    let displaced = SatelliteEvent::new("displaced", json!({}));
                    if let Err(e) = previous.target.send(&displaced) {
                        debug!(satellite = %self.satellite, error = %e, "Displaced notice not delivered");
                    }
                }
                Some(shutdown(&self.satellite, previous, self.replace_grace).await)
            }
            None => None,
        };

        let events = self.executor.run(request, audio);

        let mut state = lock(&self.state);
        if state.closed {
            sink.close();
            return Err(self.removed());
        }
        let task = tokio::spawn(drive_run(
            Arc::clone(&self.state),
            self.satellite.clone(),
            generation,
            events,
            target.clone(),
            sink.clone(),
        ));
        info!(
            satellite = %self.satellite,
            generation,
            conn_id = %target.conn_id(),
            "Pipeline run started"
        );
        state.active = Some(ActiveRun {
            generation,
            target,
            sink,
            task,
        });

        Ok(RunHandle {
            generation,
            replaced,
        })
    }

    /// Stop the active run if it is bound to `conn_id`.
    pub async fn stop_connection(&self, conn_id: &str) -> Option<ShutdownOutcome> {
        self.stop_where(self.replace_grace, |run| run.target.conn_id() == conn_id)
            .await
    }

    /// Stop the active run and refuse new ones.
    pub async fn teardown(&self) -> Option<ShutdownOutcome> {
        lock(&self.state).closed = true;
        self.stop_where(self.teardown_grace, |_| true).await
    }

    async fn stop_where(
        &self,
        grace: Duration,
        predicate: impl Fn(&ActiveRun) -> bool,
    ) -> Option<ShutdownOutcome> {
        let _turn = self.turn.lock().await;
        let run = {
            let mut state = lock(&self.state);
            if !state.active.as_ref().is_some_and(&predicate) {
                return None;
            }
            state.active.take()?
        };
        info!(satellite = %self.satellite, generation = run.generation, "Stopping pipeline run");
        Some(shutdown(&self.satellite, run, grace).await)
    }

    fn removed(&self) -> SatelliteError {
        SatelliteError::NotFound(format!("Satellite {} was removed", self.satellite))
    }
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn shutdown(satellite: &SatelliteId, run: ActiveRun, grace: Duration) -> ShutdownOutcome {
    let ActiveRun {
        generation,
        sink,
        mut task,
        ..
    } = run;

    // Draining: let the audio consumer see end-of-stream and exit by itself.
    sink.close();
    if timeout(grace, &mut task).await.is_ok() {
        debug!(satellite = %satellite, generation, "Run drained");
        return ShutdownOutcome::Drained;
    }

    // Cancelling
    warn!(
        satellite = %satellite,
        generation,
        "Run did not exit within {}ms, cancelling",
        grace.as_millis()
    );
    task.abort();
    match task.await {
        Err(e) if !e.is_cancelled() => {
            warn!(satellite = %satellite, generation, error = %e, "Run task failed");
        }
        _ => {}
    }
    ShutdownOutcome::Cancelled
}

/// Clears the session's run binding when the owning generation finishes.
struct RunCompletion {
    state: Arc<Mutex<RunState>>,
    satellite: SatelliteId,
    generation: u64,
}

impl Drop for RunCompletion {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        let owns_binding = state.generation == self.generation
            && state
                .active
                .as_ref()
                .is_some_and(|run| run.generation == self.generation);
        if owns_binding {
            state.active = None;
            debug!(satellite = %self.satellite, generation = self.generation, "Run finished");
        } else {
            debug!(
                satellite = %self.satellite,
                generation = self.generation,
                current = state.generation,
                "Superseded run finished"
            );
        }
    }
}

async fn drive_run(
    state: Arc<Mutex<RunState>>,
    satellite: SatelliteId,
    generation: u64,
    mut events: BoxStream<'static, SatelliteEvent>,
    target: RelayTarget,
    sink: AudioSink,
) {
    let _completion = RunCompletion {
        state: Arc::clone(&state),
        satellite: satellite.clone(),
        generation,
    };
    let mut started = false;
    let mut detached = false;

    while let Some(event) = events.next().await {
        let terminal = is_terminal(&event);
        let current = lock(&state).generation;
        if current != generation {
            debug!(satellite = %satellite, generation, current, event = %event.event_type, "Dropping stale event");
            if terminal {
                break;
            }
            continue;
        }
        if !started {
            if !is_run_start(&event) {
                debug!(satellite = %satellite, generation, event = %event.event_type, "Dropping event before run-start");
                continue;
            }
            started = true;
        }

        if !detached {
            if let Err(e) = target.send(&event) {
                // Nobody is listening; stop the audio so the run ends.
                debug!(satellite = %satellite, generation, error = %e, "Run target gone");
                sink.close();
                detached = true;
            }
        }
        if terminal {
            break;
        }
    }
}
