//! # PlayerKit Core (playerkit-core)
//!
//! Component composition runtime for video playback.
//!
//! **Purpose:** Let a host assemble a playback stack from components that
//! find each other only through capabilities, and manage the two stateful
//! protocols on top: engine pooling and scene transfer.
//!
//! **Architecture:**
//! - `registry`: capabilities, components, the Context
//! - `engine`: engine core state machines over a pluggable backend
//! - `pool`: reuse of engines under a size limit
//! - `playback`: playback control and sessions
//! - `scene`: scenes, scene manager, atomic scene transfer

pub mod engine;
pub mod error;
pub mod playback;
pub mod pool;
pub mod registry;
pub mod scene;

pub use error::{Error, Result};
pub use registry::{Capability, CapabilityId, Component, Context, Registration};

use engine::BackendFactory;
use playerkit_common::config::PlayerKitConfig;
use playerkit_common::events::EventBus;
use std::sync::Arc;

/// Context with the engine pool, playback control, scene manager and scene
/// transfer registered (all lazy)
pub fn standard_context(name: &str, config: &PlayerKitConfig, factory: Arc<dyn BackendFactory>) -> Result<Context> {
    config.pool.validate()?;
    let context = Context::with_event_bus(name, EventBus::new(config.events.capacity));
    context.register(pool::EnginePool::registration(config.pool.clone(), factory))?;
    context.register(playback::PlaybackControl::registration())?;
    context.register(scene::SceneManager::registration())?;
    context.register(scene::SceneTransfer::registration())?;
    Ok(context)
}
