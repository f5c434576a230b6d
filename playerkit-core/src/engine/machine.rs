//! Engine core: load and playback state machines over a backend
//!
//! **Responsibilities:**
//! - Enforce the load state machine (`Idle → Preparing → Ready`, any backend
//!   error → `Failed` until the next `configure`)
//! - Enforce the playback state machine (`Stopped → Playing ⇄ Paused → Stopped`)
//! - Tag every asynchronous request with a ticket and drop stale answers
//! - Record state changes as notices for the current owner to publish
//!
//! Backend errors never escape as `Err`: they move the engine to `Failed`
//! and produce a `BackendFailure` notice.

use super::backend::{BackendSignal, EngineBackend, SignalKind, SignalSink, Ticket};
use super::descriptor::MediaDescriptor;
use crate::error::{Error, Result};
use playerkit_common::events::{LoadState, PlaybackState};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine Core contract
///
/// Implemented by [`Engine`]; the pool hands engines out, playback control
/// drives them through this contract.
pub trait EngineCore {
    /// Set the source; resets load state to `Idle` and playback to `Stopped`
    fn configure(&mut self, descriptor: MediaDescriptor) -> Result<()>;

    /// Start loading the configured source, returning the new load state
    ///
    /// `Preparing` until the backend signals readiness. Calling again while
    /// `Preparing` supersedes the earlier request.
    fn prepare(&mut self) -> Result<LoadState>;

    fn start(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Valid only while `Playing` or `Paused`
    fn seek(&mut self, position: Duration) -> Result<()>;

    fn current_position(&self) -> Duration;

    /// Stop playback and detach the source, keeping the backend warm
    fn release(&mut self) -> Result<()>;
}

/// State change recorded by an engine, drained by its owner
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    LoadStateChanged { old: LoadState, new: LoadState },
    PlaybackStateChanged { old: PlaybackState, new: PlaybackState },
    BackendFailure { message: String },
    SeekCompleted { position: Duration },
}

/// One decode/render unit
///
/// Owned by exactly one party at a time: the pool while idle, a playback
/// control while in use. Not `Clone`; ownership moves.
pub struct Engine {
    id: Uuid,
    generation: u64,
    next_request: u64,
    descriptor: Option<MediaDescriptor>,
    load_state: LoadState,
    playback_state: PlaybackState,
    duration: Option<Duration>,
    pending_prepare: Option<u64>,
    pending_seek: Option<u64>,
    rate: f32,
    volume: f32,
    looping: bool,
    notices: Vec<EngineNotice>,
    backend: Box<dyn EngineBackend>,
    sink: SignalSink,
}

impl Engine {
    pub(crate) fn new(backend: Box<dyn EngineBackend>, sink: SignalSink) -> Self {
        Self {
            id: Uuid::new_v4(),
            generation: 0,
            next_request: 0,
            descriptor: None,
            load_state: LoadState::Idle,
            playback_state: PlaybackState::Stopped,
            duration: None,
            pending_prepare: None,
            pending_seek: None,
            rate: 1.0,
            volume: 1.0,
            looping: false,
            notices: Vec::new(),
            backend,
            sink,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Incremented on every pool acquire
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback_state
    }

    pub fn descriptor(&self) -> Option<&MediaDescriptor> {
        self.descriptor.as_ref()
    }

    /// Media duration, known once `Ready`
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn set_rate(&mut self, rate: f32) -> Result<()> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(Error::Internal(format!("invalid playback rate {}", rate)));
        }
        match self.backend.set_rate(rate) {
            Ok(()) => self.rate = rate,
            Err(e) => self.fail(e),
        }
        Ok(())
    }

    /// Set the output volume, clamped to `0.0..=1.0`
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        if !volume.is_finite() {
            return Err(Error::Internal(format!("invalid volume {}", volume)));
        }
        let volume = volume.clamp(0.0, 1.0);
        match self.backend.set_volume(volume) {
            Ok(()) => self.volume = volume,
            Err(e) => self.fail(e),
        }
        Ok(())
    }

    pub fn set_looping(&mut self, looping: bool) -> Result<()> {
        match self.backend.set_looping(looping) {
            Ok(()) => self.looping = looping,
            Err(e) => self.fail(e),
        }
        Ok(())
    }

    /// Drain recorded state changes
    pub fn take_notices(&mut self) -> Vec<EngineNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Apply a backend signal, returning false if it was stale
    pub fn apply_signal(&mut self, signal: BackendSignal) -> bool {
        let ticket = signal.ticket;
        if ticket.engine != self.id || ticket.generation != self.generation {
            debug!(
                "Engine {}: dropping stale signal {:?} (generation {} != {})",
                self.id, signal.kind, ticket.generation, self.generation
            );
            return false;
        }

        match signal.kind {
            SignalKind::Ready { duration } => {
                if self.pending_prepare.is_none() || ticket.request != self.pending_prepare {
                    debug!("Engine {}: dropping superseded ready signal", self.id);
                    return false;
                }
                self.pending_prepare = None;
                self.duration = duration;
                self.set_load_state(LoadState::Ready);
                true
            }
            SignalKind::SeekCompleted { position } => {
                if self.pending_seek.is_none() || ticket.request != self.pending_seek {
                    debug!("Engine {}: dropping superseded seek completion", self.id);
                    return false;
                }
                self.pending_seek = None;
                self.notices.push(EngineNotice::SeekCompleted { position });
                true
            }
            SignalKind::Failed { message } => {
                if let Some(request) = ticket.request {
                    if Some(request) != self.pending_prepare && Some(request) != self.pending_seek {
                        debug!("Engine {}: dropping failure of superseded request {}", self.id, request);
                        return false;
                    }
                }
                self.fail(anyhow::anyhow!(message));
                true
            }
            SignalKind::Ended => {
                if self.playback_state == PlaybackState::Playing && !self.looping {
                    self.set_playback_state(PlaybackState::Stopped);
                }
                true
            }
        }
    }

    /// Start a new ownership period and route signals to `tx`
    pub(crate) fn begin_generation(&mut self, tx: Option<mpsc::UnboundedSender<BackendSignal>>) -> u64 {
        self.generation += 1;
        self.pending_prepare = None;
        self.pending_seek = None;
        match tx {
            Some(tx) => self.sink.bind(tx),
            None => self.sink.unbind(),
        }
        self.generation
    }

    pub fn bind_signals(&mut self, tx: mpsc::UnboundedSender<BackendSignal>) {
        self.sink.bind(tx);
    }

    pub(crate) fn unbind_signals(&mut self) {
        self.sink.unbind();
    }

    pub(crate) fn supports_warm_reuse(&self) -> bool {
        self.backend.supports_warm_reuse()
    }

    /// Return to `Idle`/`Stopped` for reuse by the pool
    ///
    /// Unlike the `release` operation this reports backend errors, so the
    /// pool can evict an engine that did not reset cleanly.
    pub(crate) fn reset_to_idle(&mut self) -> anyhow::Result<()> {
        self.pending_prepare = None;
        self.pending_seek = None;
        self.descriptor = None;
        self.duration = None;
        self.set_playback_state(PlaybackState::Stopped);
        self.set_load_state(LoadState::Idle);
        self.notices.clear();
        self.backend.reset_to_idle()
    }

    pub(crate) fn shutdown(mut self) -> anyhow::Result<()> {
        self.sink.unbind();
        self.backend.shutdown()
    }

    fn ticket(&mut self) -> Ticket {
        self.next_request += 1;
        Ticket {
            engine: self.id,
            generation: self.generation,
            request: Some(self.next_request),
        }
    }

    fn fail(&mut self, err: anyhow::Error) {
        let message = format!("{:#}", err);
        warn!("Engine {} backend failure: {}", self.id, message);
        self.pending_prepare = None;
        self.pending_seek = None;
        self.set_load_state(LoadState::Failed);
        self.set_playback_state(PlaybackState::Stopped);
        self.notices.push(EngineNotice::BackendFailure { message });
    }

    fn set_load_state(&mut self, new: LoadState) {
        let old = self.load_state;
        if old != new {
            debug!("Engine {}: load {} -> {}", self.id, old, new);
            self.load_state = new;
            self.notices.push(EngineNotice::LoadStateChanged { old, new });
        }
    }

    fn set_playback_state(&mut self, new: PlaybackState) {
        let old = self.playback_state;
        if old != new {
            debug!("Engine {}: playback {} -> {}", self.id, old, new);
            self.playback_state = new;
            self.notices.push(EngineNotice::PlaybackStateChanged { old, new });
        }
    }

    fn require_ready(&self, operation: &'static str) -> Result<()> {
        if self.load_state == LoadState::Ready {
            Ok(())
        } else {
            Err(Error::invalid_transition(operation, self.load_state))
        }
    }
}

impl EngineCore for Engine {
    fn configure(&mut self, descriptor: MediaDescriptor) -> Result<()> {
        if self.playback_state != PlaybackState::Stopped {
            if let Err(e) = self.backend.stop() {
                warn!("Engine {}: stop before reconfigure failed: {:#}", self.id, e);
            }
        }
        self.pending_prepare = None;
        self.pending_seek = None;
        self.duration = None;
        info!("Engine {}: configured with {}", self.id, descriptor.uri);
        self.descriptor = Some(descriptor);
        self.set_playback_state(PlaybackState::Stopped);
        self.set_load_state(LoadState::Idle);
        Ok(())
    }

    fn prepare(&mut self) -> Result<LoadState> {
        match self.load_state {
            LoadState::Ready => return Ok(LoadState::Ready),
            LoadState::Failed => return Err(Error::invalid_transition("prepare", LoadState::Failed)),
            LoadState::Idle | LoadState::Preparing => {}
        }
        let descriptor = match &self.descriptor {
            Some(d) => d.clone(),
            None => return Err(Error::invalid_transition("prepare", "unconfigured")),
        };

        let ticket = self.ticket();
        self.pending_prepare = ticket.request;
        self.set_load_state(LoadState::Preparing);
        if let Err(e) = self.backend.load(&descriptor, ticket) {
            self.fail(e.context("load"));
        }
        Ok(self.load_state)
    }

    fn start(&mut self) -> Result<()> {
        self.require_ready("play")?;
        if self.playback_state == PlaybackState::Playing {
            return Err(Error::invalid_transition("play", self.playback_state));
        }
        match self.backend.start() {
            Ok(()) => self.set_playback_state(PlaybackState::Playing),
            Err(e) => self.fail(e.context("start")),
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if self.playback_state != PlaybackState::Playing {
            return Err(Error::invalid_transition("pause", self.playback_state));
        }
        match self.backend.pause() {
            Ok(()) => self.set_playback_state(PlaybackState::Paused),
            Err(e) => self.fail(e.context("pause")),
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.playback_state == PlaybackState::Stopped {
            return Ok(());
        }
        self.pending_seek = None;
        match self.backend.stop() {
            Ok(()) => self.set_playback_state(PlaybackState::Stopped),
            Err(e) => self.fail(e.context("stop")),
        }
        Ok(())
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        self.require_ready("seek")?;
        if self.playback_state == PlaybackState::Stopped {
            return Err(Error::invalid_transition("seek", self.playback_state));
        }
        let ticket = self.ticket();
        self.pending_seek = ticket.request;
        if let Err(e) = self.backend.seek(position, ticket) {
            self.fail(e.context("seek"));
        }
        Ok(())
    }

    fn current_position(&self) -> Duration {
        if self.descriptor.is_none() {
            return Duration::ZERO;
        }
        self.backend.position()
    }

    fn release(&mut self) -> Result<()> {
        if let Err(e) = self.reset_to_idle() {
            self.fail(e.context("reset"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("load_state", &self.load_state)
            .field("playback_state", &self.playback_state)
            .field("uri", &self.descriptor.as_ref().map(|d| d.uri.as_str()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::{SimHandle, SimulatedBackend};

    fn engine() -> (Engine, SimHandle, mpsc::UnboundedReceiver<BackendSignal>) {
        let sink = SignalSink::default();
        let (backend, handle) = SimulatedBackend::new(sink.clone(), false);
        let mut engine = Engine::new(Box::new(backend), sink);
        let (tx, rx) = mpsc::unbounded_channel();
        engine.begin_generation(Some(tx));
        (engine, handle, rx)
    }

    fn pump(engine: &mut Engine, rx: &mut mpsc::UnboundedReceiver<BackendSignal>) -> usize {
        let mut applied = 0;
        while let Ok(signal) = rx.try_recv() {
            if engine.apply_signal(signal) {
                applied += 1;
            }
        }
        applied
    }

    fn ready_engine() -> (Engine, SimHandle, mpsc::UnboundedReceiver<BackendSignal>) {
        let (mut engine, handle, mut rx) = engine();
        engine.configure(MediaDescriptor::new("clip.mp4")).unwrap();
        engine.prepare().unwrap();
        handle.signal_ready();
        pump(&mut engine, &mut rx);
        (engine, handle, rx)
    }

    #[test]
    fn test_prepare_waits_for_ready_signal() {
        let (mut engine, handle, mut rx) = engine();
        engine.configure(MediaDescriptor::new("clip.mp4")).unwrap();
        assert_eq!(engine.prepare().unwrap(), LoadState::Preparing);
        assert_eq!(engine.load_state(), LoadState::Preparing);

        assert!(handle.signal_ready());
        assert_eq!(pump(&mut engine, &mut rx), 1);
        assert_eq!(engine.load_state(), LoadState::Ready);
        assert_eq!(engine.duration(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_prepare_without_source_is_rejected() {
        let (mut engine, _handle, _rx) = engine();
        assert!(matches!(engine.prepare(), Err(Error::InvalidStateTransition { .. })));
    }

    #[test]
    fn test_playback_transitions() {
        let (mut engine, _handle, _rx) = ready_engine();
        assert!(engine.pause().is_err());
        engine.start().unwrap();
        assert_eq!(engine.playback_state(), PlaybackState::Playing);
        assert!(engine.start().is_err());
        engine.pause().unwrap();
        assert_eq!(engine.playback_state(), PlaybackState::Paused);
        engine.start().unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.playback_state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_seek_rejected_unless_playing_or_paused() {
        let (mut engine, _handle, _rx) = engine();
        let err = engine.seek(Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("idle"), "{}", err);

        let (mut engine, _handle, _rx) = ready_engine();
        assert!(matches!(
            engine.seek(Duration::from_secs(1)),
            Err(Error::InvalidStateTransition { operation: "seek", .. })
        ));
        engine.start().unwrap();
        engine.seek(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_superseded_seek_completion_is_dropped() {
        let (mut engine, handle, mut rx) = ready_engine();
        engine.start().unwrap();

        engine.seek(Duration::from_secs(10)).unwrap();
        let first = handle.last_seek_ticket().unwrap();
        engine.seek(Duration::from_secs(30)).unwrap();
        engine.take_notices();

        assert!(!engine.apply_signal(BackendSignal {
            ticket: first,
            kind: SignalKind::SeekCompleted {
                position: Duration::from_secs(10)
            },
        }));
        handle.signal_seek_completed();
        assert_eq!(pump(&mut engine, &mut rx), 1);
        assert_eq!(
            engine.take_notices(),
            vec![EngineNotice::SeekCompleted {
                position: Duration::from_secs(30)
            }]
        );
        assert_eq!(engine.current_position(), Duration::from_secs(30));
    }

    #[test]
    fn test_previous_generation_signal_is_dropped() {
        let (mut engine, handle, _rx) = engine();
        engine.configure(MediaDescriptor::new("clip.mp4")).unwrap();
        engine.prepare().unwrap();
        let stale = handle.last_load_ticket().unwrap();

        let (tx, _rx2) = mpsc::unbounded_channel();
        engine.begin_generation(Some(tx));
        engine.prepare().unwrap();

        assert!(!engine.apply_signal(BackendSignal {
            ticket: stale,
            kind: SignalKind::Ready { duration: None },
        }));
        assert_eq!(engine.load_state(), LoadState::Preparing);
    }

    #[test]
    fn test_backend_error_fails_until_reconfigured() {
        let (mut engine, handle, _rx) = engine();
        engine.configure(MediaDescriptor::new("broken.mp4")).unwrap();
        handle.fail_next("demuxer exploded");

        assert_eq!(engine.prepare().unwrap(), LoadState::Failed);
        assert!(engine.take_notices().iter().any(|n| matches!(
            n,
            EngineNotice::BackendFailure { message } if message == "load: demuxer exploded"
        )));
        assert!(engine.prepare().is_err());

        engine.configure(MediaDescriptor::new("clip.mp4")).unwrap();
        assert_eq!(engine.load_state(), LoadState::Idle);
        assert_eq!(engine.prepare().unwrap(), LoadState::Preparing);
    }

    #[test]
    fn test_failed_signal_stops_playback() {
        let (mut engine, handle, mut rx) = ready_engine();
        engine.start().unwrap();
        let ticket = Ticket {
            engine: engine.id(),
            generation: engine.generation(),
            request: None,
        };
        handle.signal_failure(ticket, "renderer lost");
        pump(&mut engine, &mut rx);
        assert_eq!(engine.load_state(), LoadState::Failed);
        assert_eq!(engine.playback_state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_release_resets_to_idle() {
        let (mut engine, handle, _rx) = ready_engine();
        engine.start().unwrap();
        engine.release().unwrap();
        assert_eq!(engine.load_state(), LoadState::Idle);
        assert_eq!(engine.playback_state(), PlaybackState::Stopped);
        assert!(engine.descriptor().is_none());
        assert!(handle.calls().contains(&"reset_to_idle".to_string()));
    }

    #[test]
    fn test_ended_stops_playback_unless_looping() {
        let (mut engine, handle, mut rx) = ready_engine();
        engine.start().unwrap();
        let ticket = Ticket {
            engine: engine.id(),
            generation: engine.generation(),
            request: None,
        };

        engine.set_looping(true).unwrap();
        handle.signal_ended(ticket);
        assert_eq!(pump(&mut engine, &mut rx), 1);
        assert_eq!(engine.playback_state(), PlaybackState::Playing);

        engine.set_looping(false).unwrap();
        engine.take_notices();
        handle.signal_ended(ticket);
        assert_eq!(pump(&mut engine, &mut rx), 1);
        assert_eq!(engine.playback_state(), PlaybackState::Stopped);
        assert!(matches!(
            engine.take_notices().as_slice(),
            [EngineNotice::PlaybackStateChanged {
                old: PlaybackState::Playing,
                new: PlaybackState::Stopped
            }]
        ));
    }

    #[test]
    fn test_rate_volume_and_looping() {
        let (mut engine, handle, _rx) = ready_engine();
        assert_eq!((engine.rate(), engine.volume(), engine.looping()), (1.0, 1.0, false));

        engine.set_rate(2.0).unwrap();
        engine.set_volume(1.7).unwrap();
        engine.set_looping(true).unwrap();
        assert_eq!((engine.rate(), engine.volume(), engine.looping()), (2.0, 1.0, true));

        engine.set_volume(-0.5).unwrap();
        assert_eq!(engine.volume(), 0.0);

        assert!(engine.set_rate(0.0).is_err());
        assert!(engine.set_rate(f32::INFINITY).is_err());
        assert!(engine.set_volume(f32::NAN).is_err());
        assert!(engine.set_volume(f32::INFINITY).is_err());
        assert_eq!((engine.rate(), engine.volume()), (2.0, 0.0));

        let calls = handle.calls();
        assert_eq!(calls.iter().filter(|c| c.as_str() == "set_volume").count(), 2);
        assert_eq!(engine.load_state(), LoadState::Ready);
    }

    #[test]
    fn test_position_follows_the_backend_playhead() {
        let (mut engine, handle, _rx) = ready_engine();
        handle.advance(Duration::from_secs(5));
        assert_eq!(engine.current_position(), Duration::ZERO);

        engine.start().unwrap();
        handle.advance(Duration::from_secs(5));
        assert_eq!(engine.current_position(), Duration::from_secs(5));
        handle.advance(Duration::from_secs(600));
        assert_eq!(engine.current_position(), Duration::from_secs(120));
    }
}
