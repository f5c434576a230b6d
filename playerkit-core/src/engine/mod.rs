//! Engine core abstraction
//!
//! An [`Engine`] wraps one concrete backend behind the [`EngineCore`]
//! contract. Engines are created and recycled by the pool and driven by
//! playback control.

mod backend;
mod descriptor;
mod machine;
pub mod sim;

pub use backend::{BackendFactory, BackendSignal, EngineBackend, SignalKind, SignalSink, Ticket};
pub use descriptor::{ConfigFingerprint, MediaDescriptor};
pub use machine::{Engine, EngineCore, EngineNotice};
