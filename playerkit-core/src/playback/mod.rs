//! Playback control and sessions

mod control;
mod session;

pub use control::{PlaybackControl, PlaybackControlCapability, PlaybackControlService};
pub use session::{Session, SessionSnapshot};
