//! Scene Manager
//!
//! **Responsibilities:**
//! - Track registered scenes and which one is active
//! - Attach/detach sessions (a session is attached to at most one scene)
//! - Move a session between scenes in one critical section
//!
//! Observer callbacks and event posts for attach/detach happen after the
//! lock is released; a failing observer is logged and does not undo the
//! change.

use super::types::{Scene, SceneId, SceneInfo, SceneKind, SceneObserver};
use crate::error::{Error, Result};
use crate::playback::Session;
use crate::registry::{Capability, CapabilityId, Component, Provides, Registration, RegistrationBuilder};
use playerkit_common::events::{EventBus, PlayerEvent};
use playerkit_common::time::now;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Scene manager capability contract
pub trait SceneManagerService: Send + Sync {
    fn register_scene(&self, id: &str, kind: SceneKind) -> Result<()>;

    /// Remove a scene, returning the session it held
    fn unregister_scene(&self, id: &str) -> Result<Option<Session>>;

    fn add_observer(&self, id: &str, observer: Arc<dyn SceneObserver>) -> Result<()>;

    /// Make `id` the active scene, deactivating the previous one
    fn activate(&self, id: &str) -> Result<()>;

    fn active_scene(&self) -> Option<SceneId>;

    fn scene(&self, id: &str) -> Option<SceneInfo>;

    /// Every scene, ordered by id
    fn scenes(&self) -> Vec<SceneInfo>;

    /// Session attached to `id`, if any
    fn session_in(&self, id: &str) -> Result<Option<Session>>;

    /// Attach a session to an empty scene
    ///
    /// Fails with `TransferConflict` if the scene already holds a session or
    /// the session is attached elsewhere.
    fn attach_session(&self, id: &str, session: Session) -> Result<()>;

    fn detach_session(&self, id: &str) -> Result<Option<Session>>;

    /// Move the session in `from` to the empty scene `to`
    ///
    /// Detach and attach happen under one lock; on error neither scene
    /// changes.
    fn move_session(&self, from: &str, to: &str) -> Result<Session> {
        self.move_session_with(from, to, &mut |_: &Session| Ok(()))
    }

    /// `move_session` with a step that runs under the same lock, after both
    /// scenes validate and before the move commits
    ///
    /// An error from `before_commit` aborts the move with neither scene
    /// changed. It must not call back into the scene manager.
    fn move_session_with(
        &self,
        from: &str,
        to: &str,
        before_commit: &mut dyn FnMut(&Session) -> Result<()>,
    ) -> Result<Session>;
}

pub struct SceneManagerCapability;

impl Capability for SceneManagerCapability {
    type Service = dyn SceneManagerService;
    const ID: CapabilityId = CapabilityId::new("playerkit.scene_manager");
}

#[derive(Default)]
struct SceneTable {
    scenes: BTreeMap<SceneId, Scene>,
    active: Option<SceneId>,
}

impl SceneTable {
    fn get(&self, id: &str) -> Result<&Scene> {
        self.scenes.get(id).ok_or_else(|| Error::SceneNotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Scene> {
        self.scenes.get_mut(id).ok_or_else(|| Error::SceneNotFound(id.to_string()))
    }

    fn holder_of(&self, session: &Session) -> Option<&str> {
        self.scenes
            .iter()
            .find(|(_, scene)| scene.session.as_ref() == Some(session))
            .map(|(id, _)| id.as_str())
    }
}

enum Change {
    Attached(SceneId, Session, Vec<Arc<dyn SceneObserver>>),
    Detached(SceneId, Session, Vec<Arc<dyn SceneObserver>>),
}

/// Scene registry and session placement
pub struct SceneManager {
    events: EventBus,
    table: Mutex<SceneTable>,
}

impl SceneManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            table: Mutex::new(SceneTable::default()),
        }
    }

    pub fn registration() -> RegistrationBuilder<SceneManager> {
        Registration::lazy("scene-manager", |resolver| Ok(SceneManager::new(resolver.events())))
            .provides::<SceneManagerCapability>()
    }

    fn lock(&self) -> MutexGuard<'_, SceneTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn info(id: &str, scene: &Scene) -> SceneInfo {
        SceneInfo {
            id: id.to_string(),
            kind: scene.kind.clone(),
            active: scene.active,
            session_id: scene.session.as_ref().map(Session::id),
        }
    }

    /// Post events and run observers for committed changes
    fn notify(&self, changes: Vec<Change>) {
        for change in changes {
            match change {
                Change::Detached(scene_id, session, observers) => {
                    debug!("Session {} detached from scene '{}'", session.id(), scene_id);
                    for observer in &observers {
                        if let Err(e) = observer.session_detached(&scene_id, &session) {
                            warn!("Scene '{}' observer failed on detach: {:#}", scene_id, e);
                        }
                    }
                    self.events.emit_lossy(PlayerEvent::SessionDetached {
                        scene_id,
                        session_id: session.id(),
                        timestamp: now(),
                    });
                }
                Change::Attached(scene_id, session, observers) => {
                    debug!("Session {} attached to scene '{}'", session.id(), scene_id);
                    for observer in &observers {
                        if let Err(e) = observer.session_attached(&scene_id, &session) {
                            warn!("Scene '{}' observer failed on attach: {:#}", scene_id, e);
                        }
                    }
                    self.events.emit_lossy(PlayerEvent::SessionAttached {
                        scene_id,
                        session_id: session.id(),
                        timestamp: now(),
                    });
                }
            }
        }
    }
}

impl SceneManagerService for SceneManager {
    fn register_scene(&self, id: &str, kind: SceneKind) -> Result<()> {
        {
            let mut table = self.lock();
            if table.scenes.contains_key(id) {
                return Err(Error::SceneExists(id.to_string()));
            }
            info!("Registering {} scene '{}'", kind, id);
            table.scenes.insert(id.to_string(), Scene::new(kind));
        }
        self.events.emit_lossy(PlayerEvent::SceneRegistered {
            scene_id: id.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    fn unregister_scene(&self, id: &str) -> Result<Option<Session>> {
        let scene = {
            let mut table = self.lock();
            let scene = table
                .scenes
                .remove(id)
                .ok_or_else(|| Error::SceneNotFound(id.to_string()))?;
            if table.active.as_deref() == Some(id) {
                table.active = None;
            }
            scene
        };
        info!("Unregistered scene '{}'", id);

        let session = scene.session.clone();
        if let Some(session) = &scene.session {
            self.notify(vec![Change::Detached(id.to_string(), session.clone(), scene.observers)]);
        }
        self.events.emit_lossy(PlayerEvent::SceneUnregistered {
            scene_id: id.to_string(),
            timestamp: now(),
        });
        Ok(session)
    }

    fn add_observer(&self, id: &str, observer: Arc<dyn SceneObserver>) -> Result<()> {
        self.lock().get_mut(id)?.observers.push(observer);
        Ok(())
    }

    fn activate(&self, id: &str) -> Result<()> {
        let previous = {
            let mut table = self.lock();
            table.get(id)?;
            if table.active.as_deref() == Some(id) {
                debug!("Scene '{}' already active", id);
                return Ok(());
            }
            let previous = table.active.replace(id.to_string());
            if let Some(previous) = &previous {
                if let Some(scene) = table.scenes.get_mut(previous) {
                    scene.active = false;
                }
            }
            table.get_mut(id)?.active = true;
            previous
        };

        info!("Activated scene '{}' (previous: {:?})", id, previous);
        self.events.emit_lossy(PlayerEvent::SceneActivated {
            scene_id: id.to_string(),
            previous,
            timestamp: now(),
        });
        Ok(())
    }

    fn active_scene(&self) -> Option<SceneId> {
        self.lock().active.clone()
    }

    fn scene(&self, id: &str) -> Option<SceneInfo> {
        let table = self.lock();
        table.scenes.get(id).map(|scene| Self::info(id, scene))
    }

    fn scenes(&self) -> Vec<SceneInfo> {
        let table = self.lock();
        table.scenes.iter().map(|(id, scene)| Self::info(id, scene)).collect()
    }

    fn session_in(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.lock().get(id)?.session.clone())
    }

    fn attach_session(&self, id: &str, session: Session) -> Result<()> {
        let observers = {
            let mut table = self.lock();
            let scene = table.get(id)?;
            if let Some(existing) = &scene.session {
                return Err(Error::TransferConflict(format!(
                    "scene '{}' already holds session {}",
                    id,
                    existing.id()
                )));
            }
            if let Some(holder) = table.holder_of(&session) {
                return Err(Error::TransferConflict(format!(
                    "session {} is already attached to scene '{}'",
                    session.id(),
                    holder
                )));
            }
            let scene = table.get_mut(id)?;
            scene.session = Some(session.clone());
            scene.observers.clone()
        };
        self.notify(vec![Change::Attached(id.to_string(), session, observers)]);
        Ok(())
    }

    fn detach_session(&self, id: &str) -> Result<Option<Session>> {
        let (session, observers) = {
            let mut table = self.lock();
            let scene = table.get_mut(id)?;
            (scene.session.take(), scene.observers.clone())
        };
        if let Some(session) = &session {
            self.notify(vec![Change::Detached(id.to_string(), session.clone(), observers)]);
        }
        Ok(session)
    }

    fn move_session_with(
        &self,
        from: &str,
        to: &str,
        before_commit: &mut dyn FnMut(&Session) -> Result<()>,
    ) -> Result<Session> {
        let changes = {
            let mut table = self.lock();
            if from == to {
                return Err(Error::TransferConflict(format!("scene '{}' is both source and target", from)));
            }
            let target = table.get(to)?;
            if let Some(existing) = &target.session {
                return Err(Error::TransferConflict(format!(
                    "target scene '{}' already holds session {}",
                    to,
                    existing.id()
                )));
            }
            let target_observers = target.observers.clone();

            let source = table.get_mut(from)?;
            let Some(session) = source.session.clone() else {
                return Err(Error::TransferConflict(format!("source scene '{}' has no session", from)));
            };
            before_commit(&session)?;
            source.session = None;
            let source_observers = source.observers.clone();

            table.get_mut(to)?.session = Some(session.clone());
            vec![
                Change::Detached(from.to_string(), session.clone(), source_observers),
                Change::Attached(to.to_string(), session, target_observers),
            ]
        };

        let session = match changes.last() {
            Some(Change::Attached(_, session, _)) => session.clone(),
            _ => return Err(Error::Internal("move produced no attach".to_string())),
        };
        self.notify(changes);
        Ok(session)
    }
}

impl Component for SceneManager {
    fn name(&self) -> &str {
        "scene-manager"
    }
}

impl Provides<SceneManagerCapability> for SceneManager {
    fn into_service(self: Arc<Self>) -> Arc<dyn SceneManagerService> {
        self
    }
}
