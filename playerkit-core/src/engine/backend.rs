//! Concrete backend contract
//!
//! **Responsibilities:**
//! - `EngineBackend`: what a decoder/renderer implementation must provide
//! - `BackendSignal`: asynchronous completions, tagged with the ticket of
//!   the request that caused them
//! - `SignalSink`: the route signals take back to whoever currently owns
//!   the engine
//!
//! Backends report errors as `anyhow::Error`; the engine core wraps them
//! without interpreting them.

use super::descriptor::MediaDescriptor;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies the request a signal answers
///
/// `generation` changes on every pool acquire; `request` changes on every
/// prepare/seek. A signal whose ticket is not current is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub engine: Uuid,
    pub generation: u64,
    /// `None` for signals not tied to a request (end of stream, spontaneous errors)
    pub request: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    /// Source loaded; playback may start
    Ready { duration: Option<Duration> },
    /// Seek request finished at `position`
    SeekCompleted { position: Duration },
    /// Backend error
    Failed { message: String },
    /// Reached end of stream
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendSignal {
    pub ticket: Ticket,
    pub kind: SignalKind,
}

/// Route from a backend to the engine's current owner
///
/// Cloned into the backend at creation. The pool unbinds it on release and
/// the next owner binds its own channel on acquire, so signals emitted while
/// idle go nowhere.
#[derive(Clone, Default)]
pub struct SignalSink {
    route: Arc<Mutex<Option<mpsc::UnboundedSender<BackendSignal>>>>,
}

impl SignalSink {
    /// Deliver a signal; returns false when nobody is listening
    pub fn send(&self, signal: BackendSignal) -> bool {
        let route = self.route.lock().unwrap_or_else(PoisonError::into_inner);
        match route.as_ref() {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.route
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub(crate) fn bind(&self, tx: mpsc::UnboundedSender<BackendSignal>) {
        *self.route.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    pub(crate) fn unbind(&self) {
        *self.route.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl std::fmt::Debug for SignalSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSink").field("bound", &self.is_bound()).finish()
    }
}

/// Concrete decode/render implementation behind an engine
///
/// Calls are synchronous requests. `load` and `seek` complete later through
/// a `BackendSignal` carrying the ticket they were issued with.
pub trait EngineBackend: Send {
    /// Begin loading a source; answer with `Ready` or `Failed`
    fn load(&mut self, descriptor: &MediaDescriptor, ticket: Ticket) -> anyhow::Result<()>;

    fn start(&mut self) -> anyhow::Result<()>;

    fn pause(&mut self) -> anyhow::Result<()>;

    fn stop(&mut self) -> anyhow::Result<()>;

    /// Begin seeking; answer with `SeekCompleted` or `Failed`
    fn seek(&mut self, position: Duration, ticket: Ticket) -> anyhow::Result<()>;

    /// Current media position
    fn position(&self) -> Duration;

    fn set_rate(&mut self, _rate: f32) -> anyhow::Result<()> {
        Ok(())
    }

    fn set_volume(&mut self, _volume: f32) -> anyhow::Result<()> {
        Ok(())
    }

    fn set_looping(&mut self, _looping: bool) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stop playback and detach the source, keeping decoder/renderer warm
    fn reset_to_idle(&mut self) -> anyhow::Result<()>;

    /// Whether `reset_to_idle` leaves the backend fit for another source
    fn supports_warm_reuse(&self) -> bool {
        true
    }

    /// Release every resource; the backend is dropped afterwards
    fn shutdown(&mut self) -> anyhow::Result<()>;
}

/// Creates backends for the pool
pub trait BackendFactory: Send + Sync {
    fn create(&self, sink: SignalSink) -> anyhow::Result<Box<dyn EngineBackend>>;
}
