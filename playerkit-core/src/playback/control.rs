//! Playback Control
//!
//! **Responsibilities:**
//! - Acquire an engine from the pool and open a session on it
//! - Validate play/pause/seek intents against the playback state machine
//! - Marshal backend signals onto this control before they touch state
//! - Publish engine state changes on the Context's event bus
//! - Return the engine to the pool on `detach`
//!
//! Backend signals arrive on a per-control channel. They are applied either
//! by `process_pending` (synchronous drain) or by the task started with
//! `spawn_signal_pump`; both take the control's lock, so state transitions
//! are single-threaded from the control's point of view.

use super::session::{Session, SessionSnapshot};
use crate::engine::{BackendSignal, Engine, EngineCore, EngineNotice, MediaDescriptor};
use crate::error::{Error, Result};
use crate::pool::{EnginePoolCapability, EnginePoolService};
use crate::registry::{Capability, CapabilityId, Component, Provides, Registration, RegistrationBuilder};
use playerkit_common::events::{EventBus, LoadState, PlaybackState, PlayerEvent};
use playerkit_common::time::{duration_to_millis, now};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Playback control capability contract
pub trait PlaybackControlService: Send + Sync {
    /// Acquire an engine for `descriptor` and open a session on it
    fn acquire(self: Arc<Self>, descriptor: MediaDescriptor) -> Result<Session>;

    /// Start loading the session's source
    fn prepare(&self) -> Result<LoadState>;

    fn play(&self) -> Result<()>;

    fn pause(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn seek(&self, position: Duration) -> Result<()>;

    fn toggle_play_pause(&self) -> Result<()>;

    /// Seek to the start and play
    fn replay(&self) -> Result<()>;

    /// End the session and return the engine to the pool
    fn detach(&self) -> Result<()>;

    fn set_rate(&self, rate: f32) -> Result<()>;

    fn set_volume(&self, volume: f32) -> Result<()>;

    fn set_looping(&self, looping: bool) -> Result<()>;

    fn playback_state(&self) -> PlaybackState;

    fn load_state(&self) -> LoadState;

    fn current_position(&self) -> Duration;

    fn is_playing(&self) -> bool {
        self.playback_state() == PlaybackState::Playing
    }

    fn is_paused(&self) -> bool {
        self.playback_state() == PlaybackState::Paused
    }

    fn can_play(&self) -> bool;

    fn can_pause(&self) -> bool {
        self.is_playing()
    }

    fn snapshot(&self) -> Option<SessionSnapshot>;

    /// Apply every queued backend signal; returns how many were applied
    fn process_pending(&self) -> usize;

    /// Apply backend signals on a tokio task as they arrive
    ///
    /// Returns `None` if a pump is already running.
    fn spawn_signal_pump(self: Arc<Self>) -> Option<JoinHandle<()>>;
}

pub struct PlaybackControlCapability;

impl Capability for PlaybackControlCapability {
    type Service = dyn PlaybackControlService;
    const ID: CapabilityId = CapabilityId::new("playerkit.playback_control");
}

struct Attached {
    session_id: Uuid,
    engine: Engine,
}

/// Engine-driving component behind [`PlaybackControlCapability`]
pub struct PlaybackControl {
    pool: Arc<dyn EnginePoolService>,
    events: EventBus,
    inner: Mutex<Option<Attached>>,
    signal_tx: mpsc::UnboundedSender<BackendSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<BackendSignal>>>,
}

impl PlaybackControl {
    pub fn new(pool: Arc<dyn EnginePoolService>, events: EventBus) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            pool,
            events,
            inner: Mutex::new(None),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }

    /// Lazy registration resolving the pool from the Context
    pub fn registration() -> RegistrationBuilder<PlaybackControl> {
        Registration::lazy("playback-control", |resolver| {
            let pool = resolver.resolve::<EnginePoolCapability>()?;
            Ok(PlaybackControl::new(pool, resolver.events()))
        })
        .provides::<PlaybackControlCapability>()
        .depends_on::<EnginePoolCapability>()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Attached>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` against the attached engine and publish what it changed
    fn with_engine<T>(&self, operation: &'static str, op: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        let mut inner = self.lock();
        let Some(attached) = inner.as_mut() else {
            return Err(Error::invalid_transition(operation, "detached"));
        };
        let result = op(&mut attached.engine);
        self.publish(attached);
        result
    }

    fn publish(&self, attached: &mut Attached) {
        let engine_id = attached.engine.id();
        let generation = attached.engine.generation();
        let session_id = attached.session_id;
        for notice in attached.engine.take_notices() {
            let timestamp = now();
            match notice {
                EngineNotice::LoadStateChanged { old, new } => {
                    self.events.post_sticky(PlayerEvent::LoadStateChanged {
                        session_id,
                        engine_id,
                        generation,
                        old_state: old,
                        new_state: new,
                        timestamp,
                    })
                }
                EngineNotice::PlaybackStateChanged { old, new } => {
                    self.events.post_sticky(PlayerEvent::PlaybackStateChanged {
                        session_id,
                        engine_id,
                        generation,
                        old_state: old,
                        new_state: new,
                        timestamp,
                    })
                }
                EngineNotice::BackendFailure { message } => {
                    self.events.post_sticky(PlayerEvent::BackendFailure {
                        session_id,
                        engine_id,
                        generation,
                        message,
                        timestamp,
                    })
                }
                EngineNotice::SeekCompleted { position } => {
                    self.events.emit_lossy(PlayerEvent::SeekCompleted {
                        session_id,
                        engine_id,
                        position_ms: duration_to_millis(position),
                        timestamp,
                    })
                }
            }
        }
    }

    fn apply_signal(&self, signal: BackendSignal) -> bool {
        let mut inner = self.lock();
        let Some(attached) = inner.as_mut() else {
            debug!("Dropping backend signal with no engine attached");
            return false;
        };
        let applied = attached.engine.apply_signal(signal);
        self.publish(attached);
        applied
    }
}

impl PlaybackControlService for PlaybackControl {
    fn acquire(self: Arc<Self>, descriptor: MediaDescriptor) -> Result<Session> {
        let mut inner = self.lock();
        if inner.is_some() {
            return Err(Error::invalid_transition("acquire", "attached"));
        }

        let mut engine = self.pool.acquire(&descriptor.fingerprint())?;
        engine.bind_signals(self.signal_tx.clone());
        if let Err(e) = engine.configure(descriptor) {
            if let Err(rejected) = self.pool.release(engine) {
                warn!("Could not return engine after failed configure: {}", rejected);
            }
            return Err(e);
        }

        let session_id = Uuid::new_v4();
        let engine_id = engine.id();
        let generation = engine.generation();
        let mut attached = Attached { session_id, engine };
        self.publish(&mut attached);
        *inner = Some(attached);
        drop(inner);

        info!(
            "Session {} opened on engine {} (generation {})",
            session_id, engine_id, generation
        );
        let control: Arc<dyn PlaybackControlService> = self;
        Ok(Session::new(session_id, engine_id, generation, control))
    }

    fn prepare(&self) -> Result<LoadState> {
        self.with_engine("prepare", |engine| engine.prepare())
    }

    fn play(&self) -> Result<()> {
        self.with_engine("play", |engine| engine.start())
    }

    fn pause(&self) -> Result<()> {
        self.with_engine("pause", |engine| engine.pause())
    }

    fn stop(&self) -> Result<()> {
        self.with_engine("stop", |engine| engine.stop())
    }

    fn seek(&self, position: Duration) -> Result<()> {
        self.with_engine("seek", |engine| engine.seek(position))
    }

    fn toggle_play_pause(&self) -> Result<()> {
        self.with_engine("toggle", |engine| {
            if engine.playback_state() == PlaybackState::Playing {
                engine.pause()
            } else {
                engine.start()
            }
        })
    }

    fn replay(&self) -> Result<()> {
        self.with_engine("replay", |engine| {
            if engine.playback_state() != PlaybackState::Playing {
                engine.start()?;
            }
            engine.seek(Duration::ZERO)
        })
    }

    fn detach(&self) -> Result<()> {
        let mut inner = self.lock();
        let Some(mut attached) = inner.take() else {
            return Err(Error::invalid_transition("detach", "detached"));
        };

        if let Err(e) = attached.engine.stop() {
            warn!("Stopping engine before detach failed: {}", e);
        }
        self.publish(&mut attached);

        let Attached { session_id, engine } = attached;
        let engine_id = engine.id();
        match self.pool.release(engine) {
            Ok(()) => {
                info!("Session {} closed, engine {} returned to pool", session_id, engine_id);
                Ok(())
            }
            Err(rejected) => {
                warn!("Pool refused engine {}: {}", engine_id, rejected.error);
                *inner = Some(Attached {
                    session_id,
                    engine: rejected.engine,
                });
                Err(rejected.error)
            }
        }
    }

    fn set_rate(&self, rate: f32) -> Result<()> {
        self.with_engine("set rate", |engine| engine.set_rate(rate))
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        self.with_engine("set volume", |engine| engine.set_volume(volume))
    }

    fn set_looping(&self, looping: bool) -> Result<()> {
        self.with_engine("set looping", |engine| engine.set_looping(looping))
    }

    fn playback_state(&self) -> PlaybackState {
        self.lock()
            .as_ref()
            .map(|a| a.engine.playback_state())
            .unwrap_or(PlaybackState::Stopped)
    }

    fn load_state(&self) -> LoadState {
        self.lock()
            .as_ref()
            .map(|a| a.engine.load_state())
            .unwrap_or(LoadState::Idle)
    }

    fn current_position(&self) -> Duration {
        self.lock()
            .as_ref()
            .map(|a| a.engine.current_position())
            .unwrap_or(Duration::ZERO)
    }

    fn can_play(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|a| {
                a.engine.load_state() == LoadState::Ready && a.engine.playback_state() != PlaybackState::Playing
            })
            .unwrap_or(false)
    }

    fn snapshot(&self) -> Option<SessionSnapshot> {
        self.lock().as_ref().map(|a| {
            let engine = &a.engine;
            SessionSnapshot {
                session_id: a.session_id,
                engine_id: engine.id(),
                generation: engine.generation(),
                uri: engine.descriptor().map(|d| d.uri.clone()),
                load_state: engine.load_state(),
                playback_state: engine.playback_state(),
                position_ms: duration_to_millis(engine.current_position()),
                duration_ms: engine.duration().map(duration_to_millis),
                rate: engine.rate(),
                volume: engine.volume(),
                looping: engine.looping(),
            }
        })
    }

    fn process_pending(&self) -> usize {
        let mut rx_slot = self.signal_rx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(rx) = rx_slot.as_mut() else {
            return 0;
        };
        let mut applied = 0;
        while let Ok(signal) = rx.try_recv() {
            if self.apply_signal(signal) {
                applied += 1;
            }
        }
        applied
    }

    fn spawn_signal_pump(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.signal_rx.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        let control = Arc::downgrade(&self);
        drop(self);
        Some(tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let Some(control) = control.upgrade() else {
                    break;
                };
                control.apply_signal(signal);
            }
            debug!("Signal pump stopped");
        }))
    }
}

impl Component for PlaybackControl {
    fn name(&self) -> &str {
        "playback-control"
    }

    fn will_unload(&self) -> Result<()> {
        if self.lock().is_none() {
            return Ok(());
        }
        self.detach()
    }
}

impl Provides<PlaybackControlCapability> for PlaybackControl {
    fn into_service(self: Arc<Self>) -> Arc<dyn PlaybackControlService> {
        self
    }
}
