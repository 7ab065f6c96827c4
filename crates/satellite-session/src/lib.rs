//! Session orchestration for voice satellites: event relay, announcement and
//! question handshakes, pipeline runs, status mapping, timers and media state.

pub mod entity;
pub mod handshake;
pub mod media;
pub mod registry;
pub mod relay;
pub mod runs;
pub mod session;
pub mod status;
pub mod timers;

pub use entity::{SatelliteEntity, SatelliteUpdate};
pub use handshake::{AnnounceOutcome, Announcement, AnswerMatch, Question};
pub use registry::SessionRegistry;
pub use relay::RelayTarget;
pub use runs::{RunHandle, ShutdownOutcome};
pub use session::{Collaborators, Session};
