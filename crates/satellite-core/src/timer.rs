//! Timer capability.
//!
//! Timers are owned by an external service that notifies each satellite's
//! registered handler about started/updated/cancelled/finished timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::types::{SatelliteId, TimerEventKind, TimerInfo, TimerNotification};

#[async_trait]
pub trait TimerService: Send + Sync {
    /// Route notifications for timers started on `satellite` to `handler`.
    fn register(&self, satellite: &SatelliteId, handler: mpsc::UnboundedSender<TimerNotification>);

    fn unregister(&self, satellite: &SatelliteId);

    /// Cancel a running timer. Fails with a service-specific message.
    async fn cancel(&self, timer_id: &str) -> anyhow::Result<()>;
}

struct LocalTimer {
    satellite: SatelliteId,
    info: TimerInfo,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct LocalTimers {
    handlers: HashMap<SatelliteId, mpsc::UnboundedSender<TimerNotification>>,
    timers: HashMap<String, LocalTimer>,
    next_id: u64,
}

impl LocalTimers {
    fn notify(&self, satellite: &SatelliteId, kind: TimerEventKind, info: &TimerInfo) {
        if let Some(handler) = self.handlers.get(satellite) {
            let _ = handler.send(TimerNotification {
                kind,
                timer: info.clone(),
            });
        }
    }
}

/// In-process countdown timers, used when no external timer service exists.
#[derive(Clone, Default)]
pub struct LocalTimerService {
    inner: Arc<Mutex<LocalTimers>>,
}

impl LocalTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a countdown for `satellite`. Returns the new timer id.
    pub fn start(
        &self,
        satellite: &SatelliteId,
        name: Option<String>,
        hours: u32,
        minutes: u32,
        seconds: u32,
    ) -> String {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = format!("timer-{}", inner.next_id);
        let info = TimerInfo {
            id: id.clone(),
            name,
            start_hours: Some(hours),
            start_minutes: Some(minutes),
            start_seconds: Some(seconds),
        };

        let shared = Arc::clone(&self.inner);
        let timer_id = id.clone();
        let duration = Duration::from_secs(info.total_seconds());
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(timer) = inner.timers.remove(&timer_id) {
                debug!(timer_id = %timer_id, "Local timer finished");
                inner.notify(&timer.satellite, TimerEventKind::Finished, &timer.info);
            }
        });

        inner.notify(satellite, TimerEventKind::Started, &info);
        inner.timers.insert(
            id.clone(),
            LocalTimer {
                satellite: satellite.clone(),
                info,
                task,
            },
        );
        id
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .timers
            .len()
    }
}

#[async_trait]
impl TimerService for LocalTimerService {
    fn register(&self, satellite: &SatelliteId, handler: mpsc::UnboundedSender<TimerNotification>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.handlers.insert(satellite.clone(), handler);
    }

    fn unregister(&self, satellite: &SatelliteId) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.handlers.remove(satellite);
    }

    async fn cancel(&self, timer_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let timer = inner
            .timers
            .remove(timer_id)
            .ok_or_else(|| anyhow::anyhow!("Timer {timer_id} is not running"))?;
        timer.task.abort();
        inner.notify(&timer.satellite, TimerEventKind::Cancelled, &timer.info);
        Ok(())
    }
}
