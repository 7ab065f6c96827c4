//! What a session exposes to the registry and to observers.

use satellite_core::types::{
    MediaPlayerStatus, SatelliteId, SatelliteState, TimerEntry, TimerEventKind,
};
use serde::Serialize;

use crate::timers::TimerSnapshot;

/// Published whenever a satellite's observable state changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SatelliteUpdate {
    pub satellite: SatelliteId,
    pub name: String,
    pub state: SatelliteState,
    pub available: bool,
    pub active_timers: Vec<TimerEntry>,
    pub last_timer_event: Option<TimerEventKind>,
    pub media: MediaPlayerStatus,
}

/// Read side of a paired satellite.
pub trait SatelliteEntity: Send + Sync {
    fn id(&self) -> &SatelliteId;
    fn name(&self) -> &str;
    fn state(&self) -> SatelliteState;
    /// True while at least one client is subscribed.
    fn available(&self) -> bool;
    fn timers(&self) -> TimerSnapshot;
    fn last_timer_event(&self) -> Option<TimerEventKind>;
    fn media(&self) -> MediaPlayerStatus;

    fn snapshot(&self) -> SatelliteUpdate {
        SatelliteUpdate {
            satellite: self.id().clone(),
            name: self.name().to_string(),
            state: self.state(),
            available: self.available(),
            active_timers: self.timers().to_vec(),
            last_timer_event: self.last_timer_event(),
            media: self.media(),
        }
    }
}
