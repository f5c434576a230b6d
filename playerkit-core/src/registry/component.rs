//! Components and their registrations
//!
//! **Responsibilities:**
//! - `Component` lifecycle hooks (load/unload)
//! - `Registration` builder: which capabilities a component provides, which
//!   it depends on, and when it is created (lazily, eagerly, or pre-built)
//! - Type erasure glue that lets the Context hand out typed service objects

use super::capability::{Capability, CapabilityId, Provides};
use super::context::{Resolver, WeakContext};
use crate::error::Result;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

/// A unit implementing one or more capabilities, attached to one Context
pub trait Component: Any + Send + Sync {
    /// Human-readable component name, used in logs and errors
    fn name(&self) -> &str;

    /// Called once after the component is instantiated
    ///
    /// Runs outside the Context's critical section, so it may resolve other
    /// capabilities through `context.upgrade()`.
    fn did_load(&self, _context: &WeakContext) {}

    /// Called when the component is unregistered or its Context torn down
    fn will_unload(&self) -> Result<()> {
        Ok(())
    }
}

/// When a lazily-registered component is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePolicy {
    /// On first resolution of any of its capabilities
    Lazy,
    /// During `register`; a failing factory rolls the registration back
    Eager,
}

/// A live component, viewed both as `Any` (for service casts) and as a
/// `Component` (for lifecycle hooks)
#[derive(Clone)]
pub(crate) struct Instance {
    pub(crate) any: Arc<dyn Any + Send + Sync>,
    pub(crate) lifecycle: Arc<dyn Component>,
}

impl Instance {
    pub(crate) fn new<T: Component>(component: Arc<T>) -> Self {
        Self {
            any: component.clone(),
            lifecycle: component,
        }
    }
}

/// Boxed `Arc<C::Service>` for some capability `C`
pub(crate) type ServiceBox = Box<dyn Any + Send + Sync>;

/// Converts an instance into the boxed service of one capability
pub(crate) type Caster = fn(&Instance) -> Option<ServiceBox>;

fn cast_service<T, C>(instance: &Instance) -> Option<ServiceBox>
where
    T: Provides<C>,
    C: Capability,
{
    let concrete = Arc::clone(&instance.any).downcast::<T>().ok()?;
    let service: Arc<C::Service> = concrete.into_service();
    Some(Box::new(service))
}

pub(crate) trait ErasedFactory: Send + Sync {
    fn create(&self, resolver: &mut Resolver<'_>) -> Result<Instance>;
}

struct TypedFactory<T, F> {
    factory: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> ErasedFactory for TypedFactory<T, F>
where
    T: Component,
    F: Fn(&mut Resolver<'_>) -> Result<T> + Send + Sync,
{
    fn create(&self, resolver: &mut Resolver<'_>) -> Result<Instance> {
        (self.factory)(resolver).map(|component| Instance::new(Arc::new(component)))
    }
}

pub(crate) type Factory = Arc<dyn ErasedFactory>;

pub(crate) enum Source {
    Factory(Factory, CreatePolicy),
    Instance(Instance),
}

/// Everything the Context needs to bind a component
pub struct Registration {
    pub(crate) name: String,
    pub(crate) provides: Vec<(CapabilityId, Caster)>,
    pub(crate) dependencies: Vec<CapabilityId>,
    pub(crate) source: Source,
}

impl Registration {
    /// Component created on first resolution
    ///
    /// The factory receives a `Resolver` for pulling in other capabilities;
    /// declared dependencies are resolved before the factory runs.
    pub fn lazy<T, F>(name: impl Into<String>, factory: F) -> RegistrationBuilder<T>
    where
        T: Component,
        F: Fn(&mut Resolver<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_factory(name, factory, CreatePolicy::Lazy)
    }

    /// Component created while registering
    pub fn eager<T, F>(name: impl Into<String>, factory: F) -> RegistrationBuilder<T>
    where
        T: Component,
        F: Fn(&mut Resolver<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_factory(name, factory, CreatePolicy::Eager)
    }

    /// Pre-built component instance
    pub fn instance<T: Component>(name: impl Into<String>, component: Arc<T>) -> RegistrationBuilder<T> {
        RegistrationBuilder::new(name.into(), Source::Instance(Instance::new(component)))
    }

    fn with_factory<T, F>(name: impl Into<String>, factory: F, policy: CreatePolicy) -> RegistrationBuilder<T>
    where
        T: Component,
        F: Fn(&mut Resolver<'_>) -> Result<T> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(TypedFactory {
            factory,
            _marker: PhantomData,
        });
        RegistrationBuilder::new(name.into(), Source::Factory(factory, policy))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capabilities this registration would bind
    pub fn capabilities(&self) -> Vec<CapabilityId> {
        self.provides.iter().map(|(id, _)| *id).collect()
    }
}

/// Typed builder; `provides` is only callable for capabilities `T` implements
pub struct RegistrationBuilder<T> {
    registration: Registration,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Component> RegistrationBuilder<T> {
    fn new(name: String, source: Source) -> Self {
        Self {
            registration: Registration {
                name,
                provides: Vec::new(),
                dependencies: Vec::new(),
                source,
            },
            _marker: PhantomData,
        }
    }

    pub fn provides<C>(mut self) -> Self
    where
        C: Capability,
        T: Provides<C>,
    {
        self.registration
            .provides
            .push((C::ID, cast_service::<T, C> as Caster));
        self
    }

    pub fn depends_on<C: Capability>(self) -> Self {
        self.depends_on_id(C::ID)
    }

    pub fn depends_on_id(mut self, capability: CapabilityId) -> Self {
        if !self.registration.dependencies.contains(&capability) {
            self.registration.dependencies.push(capability);
        }
        self
    }

    pub fn build(self) -> Registration {
        self.registration
    }
}

impl<T: Component> From<RegistrationBuilder<T>> for Registration {
    fn from(builder: RegistrationBuilder<T>) -> Self {
        builder.build()
    }
}
