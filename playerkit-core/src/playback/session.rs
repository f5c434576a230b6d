//! Sessions: the live pairing of an engine and its playback control

use super::control::PlaybackControlService;
use playerkit_common::events::{LoadState, PlaybackState};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Handle to a live session
///
/// Cheap to clone. Identity (session id, engine id, generation) is fixed for
/// the session's lifetime; state is read through the owning control.
#[derive(Clone)]
pub struct Session {
    id: Uuid,
    engine_id: Uuid,
    generation: u64,
    control: Arc<dyn PlaybackControlService>,
}

impl Session {
    pub(crate) fn new(id: Uuid, engine_id: Uuid, generation: u64, control: Arc<dyn PlaybackControlService>) -> Self {
        Self {
            id,
            engine_id,
            generation,
            control,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn engine_id(&self) -> Uuid {
        self.engine_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn control(&self) -> &Arc<dyn PlaybackControlService> {
        &self.control
    }

    /// Current state, `None` once the session's engine has been detached
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.control.snapshot().filter(|s| s.session_id == self.id)
    }

    pub fn is_live(&self) -> bool {
        self.snapshot().is_some()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Session {}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("engine_id", &self.engine_id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub engine_id: Uuid,
    pub generation: u64,
    pub uri: Option<String>,
    pub load_state: LoadState,
    pub playback_state: PlaybackState,
    pub position_ms: u64,
    pub duration_ms: Option<u64>,
    pub rate: f32,
    pub volume: f32,
    pub looping: bool,
}
