//! Error types for playerkit-core
//!
//! Registry, pool and state-machine violations are contract errors: they are
//! returned to the caller synchronously. Backend failures are only returned
//! where an engine could not be created at all; once an engine exists they
//! move it to `Failed` and are reported to listeners instead.

use crate::registry::CapabilityId;
use thiserror::Error;

/// Main error type for playerkit-core
#[derive(Error, Debug)]
pub enum Error {
    /// Capability already bound in this Context
    #[error("Capability conflict: {capability} is already provided by {existing}")]
    CapabilityConflict {
        capability: CapabilityId,
        existing: String,
    },

    /// No component provides the capability
    #[error("Capability not found: {0}")]
    CapabilityNotFound(CapabilityId),

    /// Resolution chain revisited a component already being resolved
    #[error("Cyclic dependency: {}", format_chain(.chain))]
    CyclicDependency { chain: Vec<CapabilityId> },

    /// Context called back into from inside its own critical section
    #[error("Reentrant access to context '{0}' from inside a component factory")]
    ReentrantAccess(String),

    /// Bound component does not expose the requested service type
    #[error("Capability {0} resolved to a component of an unexpected type")]
    CapabilityTypeMismatch(CapabilityId),

    /// Pool is at its maximum and every entry is busy
    #[error("Engine pool exhausted: all {max} engines are busy")]
    PoolExhausted { max: usize },

    /// Engine was not handed out by this pool, or is not currently busy
    #[error("Engine {0} is not owned by this pool")]
    NotOwned(uuid::Uuid),

    /// Operation not valid in the current playback/load state
    #[error("Invalid state transition: cannot {operation} while {state}")]
    InvalidStateTransition {
        operation: &'static str,
        state: String,
    },

    /// Scene transfer or attach rejected
    #[error("Transfer conflict: {0}")]
    TransferConflict(String),

    /// Scene id not registered with the manager
    #[error("Scene not found: {0}")]
    SceneNotFound(String),

    /// Scene id already registered with the manager
    #[error("Scene already registered: {0}")]
    SceneExists(String),

    /// Opaque error surfaced by a concrete engine backend
    #[error("Backend failure: {0}")]
    BackendFailure(String),

    /// One or more components/engines failed to tear down
    #[error("Teardown failed for {} item(s): {}", .failures.len(), .failures.join("; "))]
    Teardown { failures: Vec<String> },

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] playerkit_common::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn invalid_transition(operation: &'static str, state: impl std::fmt::Display) -> Self {
        Error::InvalidStateTransition {
            operation,
            state: state.to_string(),
        }
    }

    pub(crate) fn backend(err: anyhow::Error) -> Self {
        Error::BackendFailure(format!("{:#}", err))
    }
}

fn format_chain(chain: &[CapabilityId]) -> String {
    chain
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Convenience Result type using playerkit-core Error
pub type Result<T> = std::result::Result<T, Error>;
