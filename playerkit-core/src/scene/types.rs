//! Scenes and scene observers

use crate::playback::Session;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Scene identifier chosen by the host ("inline", "fullscreen", ...)
pub type SceneId = String;

/// Where a scene surfaces playback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    FullScreen,
    Inline,
    Background,
    Custom(String),
}

impl std::fmt::Display for SceneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneKind::FullScreen => write!(f, "fullscreen"),
            SceneKind::Inline => write!(f, "inline"),
            SceneKind::Background => write!(f, "background"),
            SceneKind::Custom(label) => write!(f, "{}", label),
        }
    }
}

/// Per-scene notifications
///
/// Called after the scene manager's lock is released. Errors are logged by
/// the manager and otherwise ignored.
pub trait SceneObserver: Send + Sync {
    fn session_attached(&self, _scene: &str, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    fn session_detached(&self, _scene: &str, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logical playback slot
pub(crate) struct Scene {
    pub(crate) kind: SceneKind,
    pub(crate) active: bool,
    pub(crate) session: Option<Session>,
    pub(crate) observers: Vec<Arc<dyn SceneObserver>>,
}

impl Scene {
    pub(crate) fn new(kind: SceneKind) -> Self {
        Self {
            kind,
            active: false,
            session: None,
            observers: Vec::new(),
        }
    }
}

/// Read-only view of a scene
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SceneInfo {
    pub id: SceneId,
    pub kind: SceneKind,
    pub active: bool,
    pub session_id: Option<Uuid>,
}
