//! Simulated backend
//!
//! Deterministic stand-in for a decoder/renderer. Every call is recorded.
//! With `auto_signal` on, `load` and `seek` answer immediately through the
//! signal sink; with it off, the test fires answers through a [`SimHandle`]
//! (including deliberately stale ones).

use super::backend::{BackendFactory, BackendSignal, EngineBackend, SignalKind, SignalSink, Ticket};
use super::descriptor::MediaDescriptor;
use anyhow::{anyhow, bail};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_DURATION: Duration = Duration::from_secs(120);

#[derive(Debug, Default)]
struct SimState {
    calls: Vec<String>,
    auto_signal: bool,
    duration: Duration,
    position: Duration,
    playing: bool,
    last_load: Option<Ticket>,
    last_seek: Option<(Ticket, Duration)>,
    fail_next: Option<String>,
    fail_reset: bool,
    fail_shutdown: bool,
    warm_reuse: bool,
    shut_down: bool,
}

/// Test-side view of one simulated backend
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
    sink: SignalSink,
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of backend calls so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Make the next backend call fail with `message`
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state().fail_next = Some(message.into());
    }

    pub fn set_fail_on_reset(&self, fail: bool) {
        self.state().fail_reset = fail;
    }

    pub fn set_fail_on_shutdown(&self, fail: bool) {
        self.state().fail_shutdown = fail;
    }

    /// Whether the backend claims it can be reset and reused
    pub fn set_warm_reuse(&self, warm: bool) {
        self.state().warm_reuse = warm;
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    pub fn last_load_ticket(&self) -> Option<Ticket> {
        self.state().last_load
    }

    pub fn last_seek_ticket(&self) -> Option<Ticket> {
        self.state().last_seek.map(|(ticket, _)| ticket)
    }

    /// Answer the most recent `load` with `Ready`
    pub fn signal_ready(&self) -> bool {
        let (ticket, duration) = {
            let state = self.state();
            match state.last_load {
                Some(ticket) => (ticket, state.duration),
                None => return false,
            }
        };
        self.send(ticket, SignalKind::Ready { duration: Some(duration) })
    }

    /// Answer the most recent `seek`, moving the playhead
    pub fn signal_seek_completed(&self) -> bool {
        let (ticket, position) = {
            let mut state = self.state();
            match state.last_seek {
                Some((ticket, position)) => {
                    state.position = position;
                    (ticket, position)
                }
                None => return false,
            }
        };
        self.send(ticket, SignalKind::SeekCompleted { position })
    }

    /// Report a spontaneous backend error
    pub fn signal_failure(&self, ticket: Ticket, message: impl Into<String>) -> bool {
        self.send(ticket, SignalKind::Failed { message: message.into() })
    }

    pub fn signal_ended(&self, ticket: Ticket) -> bool {
        self.send(ticket, SignalKind::Ended)
    }

    /// Send an arbitrary signal through the sink
    pub fn send(&self, ticket: Ticket, kind: SignalKind) -> bool {
        self.sink.send(BackendSignal { ticket, kind })
    }

    /// Advance the playhead as if `elapsed` had been played
    pub fn advance(&self, elapsed: Duration) {
        let mut state = self.state();
        if state.playing {
            state.position = (state.position + elapsed).min(state.duration);
        }
    }
}

/// Simulated decoder/renderer
pub struct SimulatedBackend {
    handle: SimHandle,
}

impl SimulatedBackend {
    pub fn new(sink: SignalSink, auto_signal: bool) -> (Self, SimHandle) {
        let handle = SimHandle {
            state: Arc::new(Mutex::new(SimState {
                auto_signal,
                duration: DEFAULT_DURATION,
                warm_reuse: true,
                ..SimState::default()
            })),
            sink,
        };
        (Self { handle: handle.clone() }, handle)
    }

    /// Record the call and consume an injected failure, if any
    fn call(&self, name: &str) -> anyhow::Result<MutexGuard<'_, SimState>> {
        let mut state = self.handle.state();
        state.calls.push(name.to_string());
        if state.shut_down {
            bail!("{} after shutdown", name);
        }
        if let Some(message) = state.fail_next.take() {
            return Err(anyhow!(message));
        }
        Ok(state)
    }
}

impl EngineBackend for SimulatedBackend {
    fn load(&mut self, _descriptor: &MediaDescriptor, ticket: Ticket) -> anyhow::Result<()> {
        let auto = {
            let mut state = self.call("load")?;
            state.last_load = Some(ticket);
            state.position = Duration::ZERO;
            state.auto_signal
        };
        if auto {
            self.handle.signal_ready();
        }
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.call("start")?.playing = true;
        Ok(())
    }

    fn pause(&mut self) -> anyhow::Result<()> {
        self.call("pause")?.playing = false;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        let mut state = self.call("stop")?;
        state.playing = false;
        state.position = Duration::ZERO;
        Ok(())
    }

    fn seek(&mut self, position: Duration, ticket: Ticket) -> anyhow::Result<()> {
        let auto = {
            let mut state = self.call("seek")?;
            let position = position.min(state.duration);
            state.last_seek = Some((ticket, position));
            state.auto_signal
        };
        if auto {
            self.handle.signal_seek_completed();
        }
        Ok(())
    }

    fn position(&self) -> Duration {
        self.handle.state().position
    }

    fn set_rate(&mut self, _rate: f32) -> anyhow::Result<()> {
        self.call("set_rate").map(|_| ())
    }

    fn set_volume(&mut self, _volume: f32) -> anyhow::Result<()> {
        self.call("set_volume").map(|_| ())
    }

    fn set_looping(&mut self, _looping: bool) -> anyhow::Result<()> {
        self.call("set_looping").map(|_| ())
    }

    fn reset_to_idle(&mut self) -> anyhow::Result<()> {
        let mut state = self.call("reset_to_idle")?;
        state.playing = false;
        state.position = Duration::ZERO;
        state.last_load = None;
        state.last_seek = None;
        if state.fail_reset {
            bail!("reset refused");
        }
        Ok(())
    }

    fn supports_warm_reuse(&self) -> bool {
        self.handle.state().warm_reuse
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        let mut state = self.call("shutdown")?;
        state.shut_down = true;
        if state.fail_shutdown {
            bail!("shutdown refused");
        }
        Ok(())
    }
}

/// Factory handing out simulated backends and keeping their handles
pub struct SimulatedBackendFactory {
    auto_signal: bool,
    handles: Mutex<Vec<SimHandle>>,
    fail_create: Mutex<Option<String>>,
}

impl SimulatedBackendFactory {
    /// Backends that answer `load`/`seek` immediately
    pub fn auto() -> Self {
        Self::new(true)
    }

    /// Backends whose answers the test fires by hand
    pub fn manual() -> Self {
        Self::new(false)
    }

    fn new(auto_signal: bool) -> Self {
        Self {
            auto_signal,
            handles: Mutex::new(Vec::new()),
            fail_create: Mutex::new(None),
        }
    }

    /// Handles of every backend created so far, in creation order
    pub fn handles(&self) -> Vec<SimHandle> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn handle(&self, index: usize) -> Option<SimHandle> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).get(index).cloned()
    }

    pub fn created(&self) -> usize {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Make the next `create` fail
    pub fn fail_next_create(&self, message: impl Into<String>) {
        *self.fail_create.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }
}

impl BackendFactory for SimulatedBackendFactory {
    fn create(&self, sink: SignalSink) -> anyhow::Result<Box<dyn EngineBackend>> {
        if let Some(message) = self.fail_create.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(anyhow!(message));
        }
        let (backend, handle) = SimulatedBackend::new(sink, self.auto_signal);
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
        Ok(Box::new(backend))
    }
}
