//! Scene Transfer
//!
//! Moves a live session from one scene to another without touching its
//! engine: same instance, same generation, playback state untouched (a
//! playing session keeps playing).

use super::manager::{SceneManagerCapability, SceneManagerService};
use crate::error::{Error, Result};
use crate::playback::{Session, SessionSnapshot};
use crate::registry::{Capability, CapabilityId, Component, Provides, Registration, RegistrationBuilder};
use playerkit_common::events::{EventBus, LoadState, PlaybackState, PlayerEvent};
use playerkit_common::time::now;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Session state captured at the start of a transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferState {
    pub playback_state: PlaybackState,
    pub load_state: LoadState,
    pub position_ms: u64,
    pub rate: f32,
    pub volume: f32,
    pub looping: bool,
}

impl From<&SessionSnapshot> for TransferState {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            playback_state: snapshot.playback_state,
            load_state: snapshot.load_state,
            position_ms: snapshot.position_ms,
            rate: snapshot.rate,
            volume: snapshot.volume,
            looping: snapshot.looping,
        }
    }
}

/// Outcome of a committed transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReceipt {
    pub session_id: Uuid,
    pub engine_id: Uuid,
    pub generation: u64,
    pub from_scene: String,
    pub to_scene: String,
    pub state: TransferState,
}

/// Scene transfer capability contract
pub trait SceneTransferService: Send + Sync {
    /// Move the session attached to `from` onto the empty scene `to`
    fn transfer(&self, from: &str, to: &str) -> Result<TransferReceipt>;
}

pub struct SceneTransferCapability;

impl Capability for SceneTransferCapability {
    type Service = dyn SceneTransferService;
    const ID: CapabilityId = CapabilityId::new("playerkit.scene_transfer");
}

pub struct SceneTransfer {
    scenes: Arc<dyn SceneManagerService>,
    events: EventBus,
}

impl SceneTransfer {
    pub fn new(scenes: Arc<dyn SceneManagerService>, events: EventBus) -> Self {
        Self { scenes, events }
    }

    pub fn registration() -> RegistrationBuilder<SceneTransfer> {
        Registration::lazy("scene-transfer", |resolver| {
            let scenes = resolver.resolve::<SceneManagerCapability>()?;
            Ok(SceneTransfer::new(scenes, resolver.events()))
        })
        .provides::<SceneTransferCapability>()
        .depends_on::<SceneManagerCapability>()
    }
}

impl SceneTransferService for SceneTransfer {
    fn transfer(&self, from: &str, to: &str) -> Result<TransferReceipt> {
        let mut captured = None;
        // Runs under the scene manager's lock, so the state captured and the
        // will-transfer event describe exactly the session that moves
        let moved = self.scenes.move_session_with(from, to, &mut |session: &Session| {
            let snapshot = session.snapshot().ok_or_else(|| {
                Error::TransferConflict(format!("session {} no longer has an engine", session.id()))
            })?;
            let state = TransferState::from(&snapshot);
            debug!(
                "Transferring session {} from '{}' to '{}' ({})",
                session.id(),
                from,
                to,
                state.playback_state
            );
            self.events.emit_lossy(PlayerEvent::EngineWillTransfer {
                session_id: session.id(),
                engine_id: session.engine_id(),
                from_scene: from.to_string(),
                to_scene: to.to_string(),
                timestamp: now(),
            });
            captured = Some(state);
            Ok(())
        })?;
        let state = captured.ok_or_else(|| Error::Internal("transfer committed without captured state".to_string()))?;

        info!(
            "Session {} transferred '{}' -> '{}' on engine {} (generation {})",
            moved.id(),
            from,
            to,
            moved.engine_id(),
            moved.generation()
        );
        self.events.emit_lossy(PlayerEvent::EngineDidTransfer {
            session_id: moved.id(),
            engine_id: moved.engine_id(),
            generation: moved.generation(),
            from_scene: from.to_string(),
            to_scene: to.to_string(),
            timestamp: now(),
        });

        Ok(TransferReceipt {
            session_id: moved.id(),
            engine_id: moved.engine_id(),
            generation: moved.generation(),
            from_scene: from.to_string(),
            to_scene: to.to_string(),
            state,
        })
    }
}

impl Component for SceneTransfer {
    fn name(&self) -> &str {
        "scene-transfer"
    }
}

impl Provides<SceneTransferCapability> for SceneTransfer {
    fn into_service(self: Arc<Self>) -> Arc<dyn SceneTransferService> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::PlaybackControlService;
    use crate::scene::fixtures::Sessions;
    use crate::scene::{SceneKind, SceneManager};

    fn setup() -> (Sessions, Arc<SceneManager>, SceneTransfer) {
        let sessions = Sessions::new();
        let manager = Arc::new(SceneManager::new(sessions.events.clone()));
        manager.register_scene("inline", SceneKind::Inline).unwrap();
        manager.register_scene("fullscreen", SceneKind::FullScreen).unwrap();
        let transfer = SceneTransfer::new(manager.clone(), sessions.events.clone());
        (sessions, manager, transfer)
    }

    #[test]
    fn test_round_trip_preserves_identity_and_state() {
        let (sessions, manager, transfer) = setup();
        let session = sessions.playing("clip.mp4");
        manager.attach_session("inline", session.clone()).unwrap();
        let mut rx = sessions.events.subscribe();

        let there = transfer.transfer("inline", "fullscreen").unwrap();
        assert_eq!(there.state.playback_state, PlaybackState::Playing);
        let back = transfer.transfer("fullscreen", "inline").unwrap();

        assert_eq!(there.engine_id, back.engine_id);
        assert_eq!(back.generation, session.generation());
        assert_eq!(back.state.playback_state, PlaybackState::Playing);
        assert_eq!(session.control().playback_state(), PlaybackState::Playing);

        while let Ok(event) = rx.try_recv() {
            if let PlayerEvent::PlaybackStateChanged { new_state, .. } = event {
                panic!("playback state changed during transfer: {}", new_state);
            }
        }
    }

    #[test]
    fn test_events_bracket_the_move() {
        let (sessions, manager, transfer) = setup();
        manager.attach_session("inline", sessions.playing("clip.mp4")).unwrap();
        let mut rx = sessions.events.subscribe();

        transfer.transfer("inline", "fullscreen").unwrap();
        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["EngineWillTransfer", "SessionDetached", "SessionAttached", "EngineDidTransfer"]
        );
    }

    #[test]
    fn test_conflict_leaves_both_scenes_unchanged() {
        let (sessions, manager, transfer) = setup();
        let a = sessions.playing("a.mp4");
        let b = sessions.playing("b.mp4");
        manager.attach_session("inline", a.clone()).unwrap();
        manager.attach_session("fullscreen", b.clone()).unwrap();

        assert!(matches!(
            transfer.transfer("inline", "fullscreen"),
            Err(Error::TransferConflict(_))
        ));
        assert_eq!(manager.session_in("inline").unwrap(), Some(a));
        assert_eq!(manager.session_in("fullscreen").unwrap(), Some(b));
    }

    #[test]
    fn test_transfer_does_not_force_pause() {
        let (sessions, manager, transfer) = setup();
        let session = sessions.playing("clip.mp4");
        session.control().pause().unwrap();
        manager.attach_session("inline", session.clone()).unwrap();

        let receipt = transfer.transfer("inline", "fullscreen").unwrap();
        assert_eq!(receipt.state.playback_state, PlaybackState::Paused);
        assert!(session.control().is_paused());
    }

    #[test]
    fn test_rejected_transfer_posts_no_will_event() {
        let (sessions, manager, transfer) = setup();
        manager.attach_session("inline", sessions.playing("a.mp4")).unwrap();
        manager.attach_session("fullscreen", sessions.playing("b.mp4")).unwrap();
        let mut rx = sessions.events.subscribe();

        assert!(transfer.transfer("inline", "fullscreen").is_err());
        assert!(transfer.transfer("inline", "missing").is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_session_without_engine_stays_put() {
        let (sessions, manager, transfer) = setup();
        let session = sessions.playing("clip.mp4");
        manager.attach_session("inline", session.clone()).unwrap();
        session.control().detach().unwrap();
        let mut rx = sessions.events.subscribe();

        assert!(matches!(
            transfer.transfer("inline", "fullscreen"),
            Err(Error::TransferConflict(_))
        ));
        assert_eq!(manager.session_in("inline").unwrap(), Some(session));
        assert_eq!(manager.session_in("fullscreen").unwrap(), None);
        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind()).collect();
        assert!(!kinds.contains(&"EngineWillTransfer"));
    }

    #[test]
    fn test_receipt_captures_rate_volume_and_looping() {
        let (sessions, manager, transfer) = setup();
        let session = sessions.playing("clip.mp4");
        let control = session.control();
        control.set_rate(1.5).unwrap();
        control.set_volume(0.25).unwrap();
        control.set_looping(true).unwrap();
        manager.attach_session("inline", session.clone()).unwrap();

        let receipt = transfer.transfer("inline", "fullscreen").unwrap();
        assert_eq!(receipt.session_id, session.id());
        assert_eq!(receipt.state.rate, 1.5);
        assert_eq!(receipt.state.volume, 0.25);
        assert!(receipt.state.looping);

        let after = session.snapshot().unwrap();
        assert_eq!((after.rate, after.volume, after.looping), (1.5, 0.25, true));
    }
}
