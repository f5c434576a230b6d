//! Event types for the PlayerKit event system
//!
//! Provides the shared event definitions and the EventBus every Context owns.

mod state_types;

pub use state_types::{EvictionReason, LoadState, PlaybackState};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

/// PlayerKit event types
///
/// Events are broadcast via EventBus and can be serialized for logging or
/// forwarding to a host UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// Session playback state changed
    PlaybackStateChanged {
        session_id: Uuid,
        engine_id: Uuid,
        generation: u64,
        old_state: PlaybackState,
        new_state: PlaybackState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session load state changed
    LoadStateChanged {
        session_id: Uuid,
        engine_id: Uuid,
        generation: u64,
        old_state: LoadState,
        new_state: LoadState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Backend reported an error; load state is now `Failed`
    BackendFailure {
        session_id: Uuid,
        engine_id: Uuid,
        generation: u64,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Current seek request completed
    SeekCompleted {
        session_id: Uuid,
        engine_id: Uuid,
        position_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Engine handed out by the pool
    EngineAcquired {
        engine_id: Uuid,
        generation: u64,
        /// True when an idle instance was reused
        reused: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Engine returned to the pool as idle
    EngineReleased {
        engine_id: Uuid,
        generation: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Engine torn down by the pool
    EngineEvicted {
        engine_id: Uuid,
        reason: EvictionReason,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Component instantiated inside a Context
    ComponentLoaded {
        context: String,
        component: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Component torn down inside a Context
    ComponentUnloaded {
        context: String,
        component: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Scene added to the scene manager
    SceneRegistered {
        scene_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Scene removed from the scene manager
    SceneUnregistered {
        scene_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Active scene changed
    SceneActivated {
        scene_id: String,
        previous: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session attached to a scene
    SessionAttached {
        scene_id: String,
        session_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session detached from a scene
    SessionDetached {
        scene_id: String,
        session_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session is about to move between scenes
    EngineWillTransfer {
        session_id: Uuid,
        engine_id: Uuid,
        from_scene: String,
        to_scene: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session moved between scenes
    EngineDidTransfer {
        session_id: Uuid,
        engine_id: Uuid,
        generation: u64,
        from_scene: String,
        to_scene: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PlayerEvent {
    /// Stable event kind name (matches the serde tag)
    pub fn kind(&self) -> &'static str {
        match self {
            PlayerEvent::PlaybackStateChanged { .. } => "PlaybackStateChanged",
            PlayerEvent::LoadStateChanged { .. } => "LoadStateChanged",
            PlayerEvent::BackendFailure { .. } => "BackendFailure",
            PlayerEvent::SeekCompleted { .. } => "SeekCompleted",
            PlayerEvent::EngineAcquired { .. } => "EngineAcquired",
            PlayerEvent::EngineReleased { .. } => "EngineReleased",
            PlayerEvent::EngineEvicted { .. } => "EngineEvicted",
            PlayerEvent::ComponentLoaded { .. } => "ComponentLoaded",
            PlayerEvent::ComponentUnloaded { .. } => "ComponentUnloaded",
            PlayerEvent::SceneRegistered { .. } => "SceneRegistered",
            PlayerEvent::SceneUnregistered { .. } => "SceneUnregistered",
            PlayerEvent::SceneActivated { .. } => "SceneActivated",
            PlayerEvent::SessionAttached { .. } => "SessionAttached",
            PlayerEvent::SessionDetached { .. } => "SessionDetached",
            PlayerEvent::EngineWillTransfer { .. } => "EngineWillTransfer",
            PlayerEvent::EngineDidTransfer { .. } => "EngineDidTransfer",
        }
    }

    /// Key under which a sticky copy of this event is retained
    ///
    /// One sticky slot per kind and subject, so state events for two
    /// sessions do not overwrite each other.
    pub fn sticky_key(&self) -> String {
        let subject = match self {
            PlayerEvent::PlaybackStateChanged { session_id, .. }
            | PlayerEvent::LoadStateChanged { session_id, .. }
            | PlayerEvent::BackendFailure { session_id, .. }
            | PlayerEvent::SeekCompleted { session_id, .. }
            | PlayerEvent::EngineWillTransfer { session_id, .. }
            | PlayerEvent::EngineDidTransfer { session_id, .. } => session_id.to_string(),
            PlayerEvent::EngineAcquired { engine_id, .. }
            | PlayerEvent::EngineReleased { engine_id, .. }
            | PlayerEvent::EngineEvicted { engine_id, .. } => engine_id.to_string(),
            PlayerEvent::ComponentLoaded { component, .. }
            | PlayerEvent::ComponentUnloaded { component, .. } => component.clone(),
            PlayerEvent::SceneRegistered { scene_id, .. }
            | PlayerEvent::SceneUnregistered { scene_id, .. }
            | PlayerEvent::SessionAttached { scene_id, .. }
            | PlayerEvent::SessionDetached { scene_id, .. } => scene_id.clone(),
            PlayerEvent::SceneActivated { .. } => String::new(),
        };
        format!("{}:{}", self.kind(), subject)
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for one Context
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// Sticky events are additionally retained (latest per kind and subject) and
/// replayed to subscribers that ask for them, so a listener attached after a
/// state change still learns the current state.
///
/// # Examples
///
/// ```
/// use playerkit_common::events::{EventBus, PlayerEvent};
///
/// let event_bus = EventBus::new(64);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(PlayerEvent::SceneRegistered {
///     scene_id: "inline".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(PlayerEvent::SceneRegistered { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
    sticky: Arc<Mutex<HashMap<String, PlayerEvent>>>,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// `capacity` is the number of events buffered before the oldest are
    /// dropped for lagging receivers. Zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            capacity,
            sticky: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Subscribe and receive the currently retained sticky events
    ///
    /// The receiver is created before the snapshot is taken, so an event
    /// posted concurrently is seen at least once.
    pub fn subscribe_with_replay(&self) -> (Vec<PlayerEvent>, broadcast::Receiver<PlayerEvent>) {
        let rx = self.tx.subscribe();
        let replay = self
            .sticky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        (replay, rx)
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: PlayerEvent) -> Result<usize, broadcast::error::SendError<PlayerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    /// Retain the event as sticky, then emit it
    pub fn post_sticky(&self, event: PlayerEvent) {
        self.sticky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.sticky_key(), event.clone());
        self.emit_lossy(event);
    }

    /// Drop every retained sticky event
    pub fn clear_sticky(&self) {
        self.sticky.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_event(session_id: Uuid, new_state: PlaybackState) -> PlayerEvent {
        PlayerEvent::PlaybackStateChanged {
            session_id,
            engine_id: Uuid::nil(),
            generation: 1,
            old_state: PlaybackState::Stopped,
            new_state,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_err_but_lossy_is_fine() {
        let bus = EventBus::new(8);
        assert!(bus.emit(state_event(Uuid::new_v4(), PlaybackState::Playing)).is_err());
        bus.emit_lossy(state_event(Uuid::new_v4(), PlaybackState::Playing));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let session = Uuid::new_v4();
        assert_eq!(bus.emit(state_event(session, PlaybackState::Playing)).unwrap(), 1);

        match rx.try_recv().unwrap() {
            PlayerEvent::PlaybackStateChanged { session_id, new_state, .. } => {
                assert_eq!(session_id, session);
                assert_eq!(new_state, PlaybackState::Playing);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_sticky_keeps_latest_per_subject() {
        let bus = EventBus::new(8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        bus.post_sticky(state_event(a, PlaybackState::Playing));
        bus.post_sticky(state_event(a, PlaybackState::Paused));
        bus.post_sticky(state_event(b, PlaybackState::Playing));

        let (replay, _rx) = bus.subscribe_with_replay();
        assert_eq!(replay.len(), 2);
        let a_state = replay.iter().find_map(|e| match e {
            PlayerEvent::PlaybackStateChanged { session_id, new_state, .. } if *session_id == a => {
                Some(*new_state)
            }
            _ => None,
        });
        assert_eq!(a_state, Some(PlaybackState::Paused));

        bus.clear_sticky();
        assert!(bus.subscribe_with_replay().0.is_empty());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = PlayerEvent::SceneActivated {
            scene_id: "fullscreen".to_string(),
            previous: Some("inline".to_string()),
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SceneActivated");
        assert_eq!(json["previous"], "inline");
        assert_eq!(event.kind(), "SceneActivated");
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        assert_eq!(EventBus::new(0).capacity(), 1);
    }
}
