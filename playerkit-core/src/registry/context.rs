//! Context: capability registry and component owner
//!
//! **Responsibilities:**
//! - Bind capabilities to components (one provider per capability)
//! - Resolve capabilities lazily with cycle detection
//! - Tear components down in reverse registration order
//!
//! All mutations (register, resolve, unregister, teardown) run inside one
//! mutex-guarded critical section. Component hooks (`did_load`,
//! `will_unload`) run after the lock is released, so they may call back into
//! the Context. Factories run inside it; a factory that reaches the Context
//! through a captured handle gets `ReentrantAccess` instead of a deadlock.

use super::capability::{Capability, CapabilityId};
use super::component::{Caster, Factory, Instance, Registration, ServiceBox, Source};
use crate::error::{Error, Result};
use playerkit_common::events::{EventBus, PlayerEvent};
use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, warn};

type ComponentKey = u64;

enum SlotState {
    Pending(Factory),
    Ready(Instance),
}

struct ComponentSlot {
    name: String,
    capabilities: Vec<CapabilityId>,
    dependencies: Vec<CapabilityId>,
    state: SlotState,
}

struct Binding {
    component: ComponentKey,
    cast: Caster,
}

/// Registry state guarded by the Context mutex
#[derive(Default)]
pub(crate) struct ComponentTable {
    next_key: ComponentKey,
    bindings: HashMap<CapabilityId, Binding>,
    /// Keyed by registration order
    components: BTreeMap<ComponentKey, ComponentSlot>,
}

impl ComponentTable {
    /// Remove every component, newest first, returning the live instances
    fn drain_for_teardown(&mut self) -> Vec<(String, Instance)> {
        self.bindings.clear();
        let components = std::mem::take(&mut self.components);
        components
            .into_values()
            .rev()
            .filter_map(|slot| match slot.state {
                SlotState::Ready(instance) => Some((slot.name, instance)),
                SlotState::Pending(_) => None,
            })
            .collect()
    }
}

/// Resolves capabilities while the Context's critical section is held
///
/// Handed to component factories so they can pull in their dependencies.
/// The in-progress chain travels with the resolver; revisiting a component
/// that is already on the chain fails with `CyclicDependency`.
pub struct Resolver<'a> {
    table: &'a mut ComponentTable,
    in_progress: Vec<(ComponentKey, CapabilityId)>,
    loaded: Vec<(String, Instance)>,
    events: &'a EventBus,
}

impl<'a> Resolver<'a> {
    fn new(table: &'a mut ComponentTable, events: &'a EventBus) -> Self {
        Self {
            table,
            in_progress: Vec::new(),
            loaded: Vec::new(),
            events,
        }
    }

    /// Resolve a capability to its service object
    pub fn resolve<C: Capability>(&mut self) -> Result<Arc<C::Service>> {
        let service = self.resolve_boxed(C::ID)?;
        service
            .downcast::<Arc<C::Service>>()
            .map(|boxed| *boxed)
            .map_err(|_| Error::CapabilityTypeMismatch(C::ID))
    }

    /// Event bus of the Context being resolved against
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    fn resolve_boxed(&mut self, capability: CapabilityId) -> Result<ServiceBox> {
        let (key, cast) = self.binding(capability)?;
        let instance = self.instantiate(key, capability)?;
        cast(&instance).ok_or(Error::CapabilityTypeMismatch(capability))
    }

    fn binding(&self, capability: CapabilityId) -> Result<(ComponentKey, Caster)> {
        self.table
            .bindings
            .get(&capability)
            .map(|b| (b.component, b.cast))
            .ok_or(Error::CapabilityNotFound(capability))
    }

    fn instantiate(&mut self, key: ComponentKey, capability: CapabilityId) -> Result<Instance> {
        let (factory, dependencies, name) = match self.table.components.get(&key) {
            None => {
                return Err(Error::Internal(format!(
                    "binding for {} points at a removed component",
                    capability
                )))
            }
            Some(slot) => match &slot.state {
                SlotState::Ready(instance) => return Ok(instance.clone()),
                SlotState::Pending(factory) => {
                    (Arc::clone(factory), slot.dependencies.clone(), slot.name.clone())
                }
            },
        };

        if self.in_progress.iter().any(|(k, _)| *k == key) {
            let mut chain: Vec<CapabilityId> = self.in_progress.iter().map(|(_, c)| *c).collect();
            chain.push(capability);
            warn!("Cyclic dependency while resolving {}: {:?}", capability, chain);
            return Err(Error::CyclicDependency { chain });
        }

        self.in_progress.push((key, capability));
        let created = self.create(&factory, &dependencies);
        self.in_progress.pop();

        let instance = created?;
        if let Some(slot) = self.table.components.get_mut(&key) {
            slot.state = SlotState::Ready(instance.clone());
        }
        debug!("Instantiated component '{}' for {}", name, capability);
        self.loaded.push((name, instance.clone()));
        Ok(instance)
    }

    fn create(&mut self, factory: &Factory, dependencies: &[CapabilityId]) -> Result<Instance> {
        for dependency in dependencies {
            self.resolve_boxed(*dependency)?;
        }
        factory.create(self)
    }
}

struct ContextShared {
    name: String,
    table: Mutex<ComponentTable>,
    /// Thread currently inside the critical section
    owner: Mutex<Option<ThreadId>>,
    events: EventBus,
}

impl ContextShared {
    fn lock(&self) -> Result<TableGuard<'_>> {
        let current = thread::current().id();
        if *self.owner() == Some(current) {
            warn!("Context '{}': reentrant access from a component factory", self.name);
            return Err(Error::ReentrantAccess(self.name.clone()));
        }
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        *self.owner() = Some(current);
        Ok(TableGuard {
            table,
            owner: &self.owner,
        })
    }

    fn owner(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Table lock that remembers its holding thread until dropped
struct TableGuard<'a> {
    table: MutexGuard<'a, ComponentTable>,
    owner: &'a Mutex<Option<ThreadId>>,
}

impl Deref for TableGuard<'_> {
    type Target = ComponentTable;

    fn deref(&self) -> &ComponentTable {
        &self.table
    }
}

impl DerefMut for TableGuard<'_> {
    fn deref_mut(&mut self) -> &mut ComponentTable {
        &mut self.table
    }
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        let instances = table.drain_for_teardown();
        if instances.is_empty() {
            return;
        }
        if let Err(e) = unload_all(&self.name, &self.events, instances) {
            error!("Context '{}' dropped with teardown failures: {}", self.name, e);
        }
    }
}

/// Owner and resolver of the components of one playback composition
///
/// Cloning yields another handle to the same Context. Components are torn
/// down when the last handle is dropped (or on an explicit `teardown`).
#[derive(Clone)]
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    /// Create a Context with a default-capacity event bus
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_event_bus(name, EventBus::default())
    }

    pub fn with_event_bus(name: impl Into<String>, events: EventBus) -> Self {
        let name = name.into();
        debug!("Context '{}' created", name);
        Self {
            shared: Arc::new(ContextShared {
                name,
                table: Mutex::new(ComponentTable::default()),
                owner: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Non-owning back-reference handed to components
    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Arc::downgrade(&self.shared),
            name: Arc::from(self.shared.name.as_str()),
            events: self.shared.events.clone(),
        }
    }

    /// Bind a component to its capabilities
    ///
    /// Fails with `CapabilityConflict` if any capability is already bound (or
    /// listed twice); nothing is registered in that case. An eager component
    /// whose creation fails is rolled back and the error returned.
    pub fn register(&self, registration: impl Into<Registration>) -> Result<()> {
        let registration = registration.into();

        let loaded = {
            let mut table = self.shared.lock()?;

            if registration.provides.is_empty() {
                return Err(Error::Internal(format!(
                    "component '{}' provides no capabilities",
                    registration.name
                )));
            }

            for (index, (capability, _)) in registration.provides.iter().enumerate() {
                if registration.provides[..index].iter().any(|(c, _)| c == capability) {
                    return Err(Error::CapabilityConflict {
                        capability: *capability,
                        existing: registration.name.clone(),
                    });
                }
                if let Some(binding) = table.bindings.get(capability) {
                    let existing = table
                        .components
                        .get(&binding.component)
                        .map(|slot| slot.name.clone())
                        .unwrap_or_default();
                    warn!(
                        "Rejecting '{}': {} already provided by '{}'",
                        registration.name, capability, existing
                    );
                    return Err(Error::CapabilityConflict {
                        capability: *capability,
                        existing,
                    });
                }
            }

            let key = table.next_key;
            table.next_key += 1;

            let capabilities = registration.capabilities();
            let mut loaded = Vec::new();
            let (state, eager) = match registration.source {
                Source::Instance(instance) => {
                    loaded.push((registration.name.clone(), instance.clone()));
                    (SlotState::Ready(instance), false)
                }
                Source::Factory(factory, policy) => (
                    SlotState::Pending(factory),
                    policy == super::component::CreatePolicy::Eager,
                ),
            };

            table.components.insert(
                key,
                ComponentSlot {
                    name: registration.name.clone(),
                    capabilities: capabilities.clone(),
                    dependencies: registration.dependencies,
                    state,
                },
            );
            for (capability, cast) in registration.provides {
                table.bindings.insert(capability, Binding { component: key, cast });
            }

            if eager {
                let mut resolver = Resolver::new(&mut table, &self.shared.events);
                let created = resolver.instantiate(key, capabilities[0]);
                let newly_loaded = std::mem::take(&mut resolver.loaded);
                if let Err(e) = created {
                    table.components.remove(&key);
                    for capability in &capabilities {
                        table.bindings.remove(capability);
                    }
                    warn!(
                        "Eager creation of '{}' failed, registration rolled back: {}",
                        registration.name, e
                    );
                    // Dependencies created on the way stay registered and loaded
                    drop(table);
                    self.finish_loading(newly_loaded);
                    return Err(e);
                }
                loaded.extend(newly_loaded);
            }

            info!(
                "Context '{}': registered '{}' for {:?}",
                self.shared.name, registration.name, capabilities
            );
            loaded
        };

        self.finish_loading(loaded);
        Ok(())
    }

    /// Resolve a capability to its service object
    ///
    /// Returns the same instance on every call for the Context's lifetime.
    pub fn resolve<C: Capability>(&self) -> Result<Arc<C::Service>> {
        let (result, loaded) = {
            let mut table = self.shared.lock()?;
            let mut resolver = Resolver::new(&mut table, &self.shared.events);
            let result = resolver.resolve::<C>();
            (result, std::mem::take(&mut resolver.loaded))
        };
        self.finish_loading(loaded);
        result
    }

    /// Whether the capability is bound (without instantiating it)
    ///
    /// False when called from inside a factory of this Context.
    pub fn contains(&self, capability: CapabilityId) -> bool {
        match self.shared.lock() {
            Ok(table) => table.bindings.contains_key(&capability),
            Err(_) => false,
        }
    }

    /// Whether the capability's component has been created
    pub fn is_instantiated(&self, capability: CapabilityId) -> bool {
        let Ok(table) = self.shared.lock() else {
            return false;
        };
        table
            .bindings
            .get(&capability)
            .and_then(|b| table.components.get(&b.component))
            .map(|slot| matches!(slot.state, SlotState::Ready(_)))
            .unwrap_or(false)
    }

    /// Every bound capability, sorted
    pub fn capabilities(&self) -> Vec<CapabilityId> {
        let Ok(table) = self.shared.lock() else {
            return Vec::new();
        };
        let mut capabilities: Vec<_> = table.bindings.keys().copied().collect();
        capabilities.sort();
        capabilities
    }

    /// Unbind a capability
    ///
    /// The owning component is torn down once none of its capabilities
    /// remain bound. Unbinding an unknown capability is a no-op.
    pub fn unregister(&self, capability: CapabilityId) -> Result<()> {
        let removed = {
            let mut table = self.shared.lock()?;
            let Some(binding) = table.bindings.remove(&capability) else {
                debug!("unregister({}): not bound, ignoring", capability);
                return Ok(());
            };

            let orphaned = match table.components.get_mut(&binding.component) {
                Some(slot) => {
                    slot.capabilities.retain(|c| *c != capability);
                    slot.capabilities.is_empty()
                }
                None => false,
            };

            if orphaned {
                table
                    .components
                    .remove(&binding.component)
                    .and_then(|slot| match slot.state {
                        SlotState::Ready(instance) => Some((slot.name, instance)),
                        SlotState::Pending(_) => None,
                    })
            } else {
                None
            }
        };

        info!("Context '{}': unregistered {}", self.shared.name, capability);
        match removed {
            Some(entry) => unload_all(&self.shared.name, &self.shared.events, vec![entry]),
            None => Ok(()),
        }
    }

    /// Release every component in reverse registration order
    ///
    /// Idempotent. Unload failures do not stop the sweep; they are collected
    /// into a single `Error::Teardown`. Sticky events are cleared so late
    /// subscribers see nothing from the torn-down composition.
    pub fn teardown(&self) -> Result<()> {
        let instances = self.shared.lock()?.drain_for_teardown();
        self.shared.events.clear_sticky();
        if instances.is_empty() {
            return Ok(());
        }
        info!(
            "Context '{}': tearing down {} component(s)",
            self.shared.name,
            instances.len()
        );
        unload_all(&self.shared.name, &self.shared.events, instances)
    }

    fn finish_loading(&self, loaded: Vec<(String, Instance)>) {
        if loaded.is_empty() {
            return;
        }
        let weak = self.downgrade();
        for (name, instance) in loaded {
            instance.lifecycle.did_load(&weak);
            self.shared.events.emit_lossy(PlayerEvent::ComponentLoaded {
                context: self.shared.name.clone(),
                component: name,
                timestamp: playerkit_common::time::now(),
            });
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.shared.name)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

fn unload_all(context: &str, events: &EventBus, instances: Vec<(String, Instance)>) -> Result<()> {
    let mut failures = Vec::new();
    for (name, instance) in instances {
        match instance.lifecycle.will_unload() {
            Ok(()) => debug!("Component '{}' unloaded", name),
            Err(e) => {
                warn!("Component '{}' failed to unload: {}", name, e);
                failures.push(format!("{}: {}", name, e));
            }
        }
        events.emit_lossy(PlayerEvent::ComponentUnloaded {
            context: context.to_string(),
            component: name,
            timestamp: playerkit_common::time::now(),
        });
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Teardown { failures })
    }
}

/// Non-owning back-reference from a component to its Context
#[derive(Clone)]
pub struct WeakContext {
    inner: Weak<ContextShared>,
    name: Arc<str>,
    events: EventBus,
}

impl WeakContext {
    /// Upgrade to a Context handle, `None` once the Context is gone
    pub fn upgrade(&self) -> Option<Context> {
        self.inner.upgrade().map(|shared| Context { shared })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

impl std::fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakContext").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Component, Provides, Registration};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    trait Counter: Send + Sync {
        fn count(&self) -> usize;
    }

    struct GreeterCap;
    impl Capability for GreeterCap {
        type Service = dyn Greeter;
        const ID: CapabilityId = CapabilityId::new("test.greeter");
    }

    struct CounterCap;
    impl Capability for CounterCap {
        type Service = dyn Counter;
        const ID: CapabilityId = CapabilityId::new("test.counter");
    }

    struct Hello {
        name: String,
        unloads: Arc<Mutex<Vec<String>>>,
        fail_unload: bool,
    }

    impl Hello {
        fn new(name: &str, unloads: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                unloads: Arc::clone(unloads),
                fail_unload: false,
            }
        }
    }

    impl Component for Hello {
        fn name(&self) -> &str {
            &self.name
        }

        fn will_unload(&self) -> Result<()> {
            self.unloads.lock().unwrap().push(self.name.clone());
            if self.fail_unload {
                Err(Error::Internal(format!("{} refused", self.name)))
            } else {
                Ok(())
            }
        }
    }

    impl Greeter for Hello {
        fn greet(&self) -> String {
            format!("hello from {}", self.name)
        }
    }

    impl Counter for Hello {
        fn count(&self) -> usize {
            self.name.len()
        }
    }

    impl Provides<GreeterCap> for Hello {
        fn into_service(self: Arc<Self>) -> Arc<dyn Greeter> {
            self
        }
    }

    impl Provides<CounterCap> for Hello {
        fn into_service(self: Arc<Self>) -> Arc<dyn Counter> {
            self
        }
    }

    fn unload_log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_resolve_returns_same_instance() {
        let ctx = Context::new("test");
        let created = Arc::new(AtomicUsize::new(0));
        let log = unload_log();
        let counter = Arc::clone(&created);
        ctx.register(
            Registration::lazy("hello", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Hello::new("hello", &log))
            })
            .provides::<GreeterCap>(),
        )
        .unwrap();

        assert!(!ctx.is_instantiated(GreeterCap::ID));
        let first = ctx.resolve::<GreeterCap>().unwrap();
        let second = ctx.resolve::<GreeterCap>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(first.greet(), "hello from hello");
    }

    #[test]
    fn test_two_capabilities_share_one_instance() {
        let ctx = Context::new("test");
        let log = unload_log();
        ctx.register(
            Registration::instance("both", Arc::new(Hello::new("both", &log)))
                .provides::<GreeterCap>()
                .provides::<CounterCap>(),
        )
        .unwrap();

        assert_eq!(ctx.resolve::<CounterCap>().unwrap().count(), 4);
        assert_eq!(ctx.capabilities(), vec![CounterCap::ID, GreeterCap::ID]);
    }

    #[test]
    fn test_conflict_leaves_no_partial_registration() {
        let ctx = Context::new("test");
        let log = unload_log();
        ctx.register(Registration::instance("first", Arc::new(Hello::new("first", &log))).provides::<GreeterCap>())
            .unwrap();

        let err = ctx
            .register(
                Registration::instance("second", Arc::new(Hello::new("second", &log)))
                    .provides::<CounterCap>()
                    .provides::<GreeterCap>(),
            )
            .unwrap_err();

        match err {
            Error::CapabilityConflict { capability, existing } => {
                assert_eq!(capability, GreeterCap::ID);
                assert_eq!(existing, "first");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!ctx.contains(CounterCap::ID));
        assert_eq!(ctx.resolve::<GreeterCap>().unwrap().greet(), "hello from first");
    }

    #[test]
    fn test_not_found() {
        let ctx = Context::new("test");
        assert!(matches!(
            ctx.resolve::<GreeterCap>(),
            Err(Error::CapabilityNotFound(id)) if id == GreeterCap::ID
        ));
    }

    #[test]
    fn test_cycle_is_detected_and_nothing_is_resolved() {
        let ctx = Context::new("test");
        let log = unload_log();
        let log_a = Arc::clone(&log);
        let log_b = Arc::clone(&log);
        ctx.register(
            Registration::lazy("a", move |_| Ok(Hello::new("a", &log_a)))
                .provides::<GreeterCap>()
                .depends_on::<CounterCap>(),
        )
        .unwrap();
        ctx.register(
            Registration::lazy("b", move |r| {
                r.resolve::<GreeterCap>()?;
                Ok(Hello::new("b", &log_b))
            })
            .provides::<CounterCap>(),
        )
        .unwrap();

        match ctx.resolve::<GreeterCap>() {
            Err(Error::CyclicDependency { chain }) => {
                assert_eq!(chain, vec![GreeterCap::ID, CounterCap::ID, GreeterCap::ID]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|_| ())),
        }
        assert!(!ctx.is_instantiated(GreeterCap::ID));
        assert!(!ctx.is_instantiated(CounterCap::ID));
    }

    #[test]
    fn test_failed_eager_registration_is_rolled_back() {
        let ctx = Context::new("test");
        let err = ctx
            .register(
                Registration::eager("broken", |_| -> Result<Hello> {
                    Err(Error::Internal("no".to_string()))
                })
                .provides::<GreeterCap>(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(!ctx.contains(GreeterCap::ID));
    }

    #[test]
    fn test_unregister_tears_down_only_when_orphaned() {
        let ctx = Context::new("test");
        let log = unload_log();
        ctx.register(
            Registration::instance("both", Arc::new(Hello::new("both", &log)))
                .provides::<GreeterCap>()
                .provides::<CounterCap>(),
        )
        .unwrap();

        ctx.unregister(GreeterCap::ID).unwrap();
        assert!(log.lock().unwrap().is_empty());
        assert!(ctx.resolve::<CounterCap>().is_ok());

        ctx.unregister(CounterCap::ID).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["both".to_string()]);

        // Absent capability is a no-op
        ctx.unregister(CounterCap::ID).unwrap();
    }

    #[test]
    fn test_teardown_reverse_order_aggregates_and_is_idempotent() {
        let ctx = Context::new("test");
        let log = unload_log();
        let mut failing = Hello::new("first", &log);
        failing.fail_unload = true;
        ctx.register(Registration::instance("first", Arc::new(failing)).provides::<GreeterCap>())
            .unwrap();
        ctx.register(Registration::instance("second", Arc::new(Hello::new("second", &log))).provides::<CounterCap>())
            .unwrap();

        match ctx.teardown() {
            Err(Error::Teardown { failures }) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("first"));
            }
            other => panic!("expected aggregated teardown error, got {:?}", other),
        }
        assert_eq!(*log.lock().unwrap(), vec!["second".to_string(), "first".to_string()]);

        ctx.teardown().unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);
        assert!(ctx.capabilities().is_empty());
    }

    #[test]
    fn test_dropping_last_handle_tears_down() {
        let log = unload_log();
        {
            let ctx = Context::new("scoped");
            ctx.register(Registration::instance("hello", Arc::new(Hello::new("hello", &log))).provides::<GreeterCap>())
                .unwrap();
            let weak = ctx.downgrade();
            assert!(weak.upgrade().is_some());
        }
        assert_eq!(*log.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_loaded_event_posted_on_first_resolution() {
        let ctx = Context::new("events");
        let mut rx = ctx.events().subscribe();
        let log = unload_log();
        ctx.register(Registration::lazy("hello", move |_| Ok(Hello::new("hello", &log))).provides::<GreeterCap>())
            .unwrap();
        assert!(rx.try_recv().is_err());

        ctx.resolve::<GreeterCap>().unwrap();
        match rx.try_recv().unwrap() {
            PlayerEvent::ComponentLoaded { context, component, .. } => {
                assert_eq!(context, "events");
                assert_eq!(component, "hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_factory_calling_back_into_context_fails_instead_of_hanging() {
        let ctx = Context::new("reentrant");
        let log = unload_log();
        let weak = ctx.downgrade();
        let log_a = Arc::clone(&log);
        ctx.register(
            Registration::lazy("a", move |_| {
                let ctx = weak.upgrade().ok_or_else(|| Error::Internal("context gone".to_string()))?;
                assert!(!ctx.contains(CounterCap::ID));
                ctx.resolve::<CounterCap>()?;
                Ok(Hello::new("a", &log_a))
            })
            .provides::<GreeterCap>(),
        )
        .unwrap();
        ctx.register(Registration::instance("b", Arc::new(Hello::new("b", &log))).provides::<CounterCap>())
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = ctx.clone();
        std::thread::spawn(move || {
            let outcome = worker.resolve::<GreeterCap>().map(|_| ());
            let _ = tx.send(outcome);
        });

        let outcome = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("resolve did not return");
        assert!(matches!(outcome, Err(Error::ReentrantAccess(name)) if name == "reentrant"));
        assert!(!ctx.is_instantiated(GreeterCap::ID));

        // The critical section is free again afterwards
        assert!(ctx.contains(GreeterCap::ID));
        assert_eq!(ctx.resolve::<CounterCap>().unwrap().count(), 1);
    }

    struct Watcher {
        loaded_into: Mutex<Option<String>>,
    }

    impl Component for Watcher {
        fn name(&self) -> &str {
            "watcher"
        }

        fn did_load(&self, context: &WeakContext) {
            // Hooks run outside the critical section, so calling back is fine
            let bound = context
                .upgrade()
                .map(|ctx| ctx.contains(GreeterCap::ID))
                .unwrap_or(false);
            *self.loaded_into.lock().unwrap() = Some(format!("{}:{}", context.name(), bound));
        }
    }

    impl Greeter for Watcher {
        fn greet(&self) -> String {
            self.loaded_into.lock().unwrap().clone().unwrap_or_default()
        }
    }

    impl Provides<GreeterCap> for Watcher {
        fn into_service(self: Arc<Self>) -> Arc<dyn Greeter> {
            self
        }
    }

    #[test]
    fn test_eager_registration_creates_and_runs_did_load() {
        let ctx = Context::new("eager");
        let mut rx = ctx.events().subscribe();
        ctx.register(
            Registration::eager("watcher", |_| {
                Ok(Watcher {
                    loaded_into: Mutex::new(None),
                })
            })
            .provides::<GreeterCap>(),
        )
        .unwrap();

        assert!(ctx.is_instantiated(GreeterCap::ID));
        assert_eq!(ctx.resolve::<GreeterCap>().unwrap().greet(), "eager:true");
        assert!(matches!(
            rx.try_recv().unwrap(),
            PlayerEvent::ComponentLoaded { component, .. } if component == "watcher"
        ));
    }

    #[test]
    fn test_teardown_clears_sticky_events() {
        let ctx = Context::new("sticky");
        let log = unload_log();
        ctx.register(Registration::instance("hello", Arc::new(Hello::new("hello", &log))).provides::<GreeterCap>())
            .unwrap();
        ctx.events().post_sticky(PlayerEvent::ComponentLoaded {
            context: "sticky".to_string(),
            component: "hello".to_string(),
            timestamp: playerkit_common::time::now(),
        });
        assert_eq!(ctx.events().subscribe_with_replay().0.len(), 1);

        ctx.teardown().unwrap();
        assert!(ctx.events().subscribe_with_replay().0.is_empty());
    }
}
