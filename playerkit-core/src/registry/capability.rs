//! Capability identifiers and service contracts
//!
//! A capability is a stable identifier plus a service trait. Components never
//! look each other up by concrete type: they ask the Context for a capability
//! and receive an `Arc` of the capability's service trait object.

use super::component::Component;
use std::sync::Arc;

/// Stable identifier of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityId(&'static str);

impl CapabilityId {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// A capability: identifier plus the service trait its providers expose
///
/// # Examples
///
/// ```
/// use playerkit_core::registry::{Capability, CapabilityId};
///
/// pub trait Clock: Send + Sync {
///     fn now_ms(&self) -> u64;
/// }
///
/// pub struct ClockCapability;
///
/// impl Capability for ClockCapability {
///     type Service = dyn Clock;
///     const ID: CapabilityId = CapabilityId::new("example.clock");
/// }
/// ```
pub trait Capability: 'static {
    /// Service trait object handed out on resolution
    type Service: ?Sized + Send + Sync + 'static;

    /// Identifier the Context binds providers under
    const ID: CapabilityId;
}

/// Declares that a component can be viewed as the service of capability `C`
///
/// Implementations are one-liners returning `self`; the unsizing coercion to
/// the service trait object happens in the return position.
pub trait Provides<C: Capability>: Component {
    fn into_service(self: Arc<Self>) -> Arc<C::Service>;
}
