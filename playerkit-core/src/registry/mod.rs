//! Service registry
//!
//! Capabilities, components and the Context that binds them.

mod capability;
mod component;
mod context;

pub use capability::{Capability, CapabilityId, Provides};
pub use component::{Component, CreatePolicy, Registration, RegistrationBuilder};
pub use context::{Context, Resolver, WeakContext};
