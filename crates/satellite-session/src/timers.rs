//! Timer ledger driven by timer-capability notifications.
//!
//! The ledger is published as `Arc<[TimerEntry]>` snapshots. A mutation always
//! builds a new slice, so a snapshot handed out earlier never changes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use satellite_core::types::{TimerEntry, TimerEventKind, TimerNotification};
use tracing::debug;

pub type TimerSnapshot = Arc<[TimerEntry]>;

struct Ledger {
    entries: TimerSnapshot,
    last_event: Option<TimerEventKind>,
}

pub struct TimerLedger {
    ledger: Mutex<Ledger>,
}

impl Default for TimerLedger {
    fn default() -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                entries: Arc::from(Vec::new()),
                last_event: None,
            }),
        }
    }
}

impl TimerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        Arc::clone(&self.lock().entries)
    }

    pub fn last_event(&self) -> Option<TimerEventKind> {
        self.lock().last_event
    }

    /// Apply a notification received at `now`. Returns the new snapshot when
    /// the ledger changed.
    pub fn apply(&self, notification: &TimerNotification, now: DateTime<Utc>) -> Option<TimerSnapshot> {
        let info = &notification.timer;
        let mut ledger = self.lock();
        ledger.last_event = Some(notification.kind);

        let next: Vec<TimerEntry> = match notification.kind {
            TimerEventKind::Started => {
                let entry = TimerEntry::from_info(info, now);
                debug!(timer_id = %info.id, total_seconds = entry.total_seconds, "Timer started");
                ledger
                    .entries
                    .iter()
                    .filter(|t| t.id != info.id)
                    .cloned()
                    .chain(std::iter::once(entry))
                    .collect()
            }
            TimerEventKind::Updated => {
                if !ledger.entries.iter().any(|t| t.id == info.id) {
                    debug!(timer_id = %info.id, "Update for unknown timer ignored");
                    return None;
                }
                debug!(timer_id = %info.id, "Timer updated");
                ledger
                    .entries
                    .iter()
                    .map(|t| {
                        if t.id != info.id {
                            return t.clone();
                        }
                        let mut updated = TimerEntry::from_info(info, now);
                        if info.name.is_none() {
                            updated.name = t.name.clone();
                        }
                        updated
                    })
                    .collect()
            }
            TimerEventKind::Cancelled | TimerEventKind::Finished => {
                if !ledger.entries.iter().any(|t| t.id == info.id) {
                    return None;
                }
                debug!(timer_id = %info.id, kind = ?notification.kind, "Timer removed");
                ledger.entries.iter().filter(|t| t.id != info.id).cloned().collect()
            }
        };

        ledger.entries = Arc::from(next);
        Some(Arc::clone(&ledger.entries))
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use satellite_core::types::TimerInfo;

    fn note(kind: TimerEventKind, id: &str, seconds: u32) -> TimerNotification {
        TimerNotification {
            kind,
            timer: TimerInfo {
                id: id.into(),
                name: Some("pasta".into()),
                start_hours: Some(0),
                start_minutes: Some(0),
                start_seconds: Some(seconds),
            },
        }
    }

    #[test]
    fn test_lifecycle_produces_distinct_snapshots() {
        let ledger = TimerLedger::new();
        let t0 = Utc::now();
        let empty = ledger.snapshot();

        let started = ledger.apply(&note(TimerEventKind::Started, "T1", 60), t0).unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].total_seconds, 60);
        assert_eq!(started[0].started_at, t0);

        let t1 = t0 + Duration::seconds(15);
        let updated = ledger.apply(&note(TimerEventKind::Updated, "T1", 45), t1).unwrap();
        assert_eq!(updated[0].total_seconds, 45);
        assert_eq!(updated[0].started_at, t1);

        let finished = ledger.apply(&note(TimerEventKind::Finished, "T1", 0), t1).unwrap();
        assert!(finished.is_empty());

        // Earlier snapshots are untouched and never aliased.
        assert!(empty.is_empty());
        assert_eq!(started[0].total_seconds, 60);
        assert!(!Arc::ptr_eq(&empty, &started));
        assert!(!Arc::ptr_eq(&started, &updated));
        assert!(!Arc::ptr_eq(&updated, &finished));
        assert_eq!(ledger.last_event(), Some(TimerEventKind::Finished));
    }

    #[test]
    fn test_unknown_timer_is_noop() {
        let ledger = TimerLedger::new();
        let before = ledger.snapshot();
        assert!(ledger.apply(&note(TimerEventKind::Updated, "T9", 30), Utc::now()).is_none());
        assert!(ledger.apply(&note(TimerEventKind::Cancelled, "T9", 0), Utc::now()).is_none());
        assert!(Arc::ptr_eq(&before, &ledger.snapshot()));
    }

    #[test]
    fn test_cancel_keeps_other_timers() {
        let ledger = TimerLedger::new();
        let now = Utc::now();
        ledger.apply(&note(TimerEventKind::Started, "T1", 60), now);
        ledger.apply(&note(TimerEventKind::Started, "T2", 90), now);
        let left = ledger.apply(&note(TimerEventKind::Cancelled, "T1", 0), now).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "T2");
    }
}
