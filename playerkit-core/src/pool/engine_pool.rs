//! Engine Pool
//!
//! Reuses expensive decode/render engines across sessions.
//!
//! **Responsibilities:**
//! - Hand out engines, preferring an idle instance with the same
//!   configuration fingerprint
//! - Create instances up to `max_pool_size`, evicting the least recently
//!   used idle instance when full
//! - Take engines back, resetting them to idle with the backend kept warm,
//!   and keep at most `max_per_fingerprint` idle per fingerprint
//! - Optionally top a fingerprint back up after an acquire drains it
//! - Tear down instances idle longer than `idle_timeout`
//!
//! Every mutation runs under one mutex. Backend shutdowns of retired
//! engines happen after the lock is released.

use super::statistics::PoolStatistics;
use crate::engine::{BackendFactory, ConfigFingerprint, Engine, SignalSink};
use crate::error::{Error, Result};
use crate::registry::{Capability, CapabilityId, Component, Provides, Registration, RegistrationBuilder};
use playerkit_common::config::{BusyMatchPolicy, PoolConfig};
use playerkit_common::events::{EventBus, EvictionReason, PlayerEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine handed back to the caller because the pool refused it
#[derive(Debug, thiserror::Error)]
#[error("release rejected: {error}")]
pub struct ReleaseRejected {
    pub engine: Engine,
    pub error: Error,
}

impl From<ReleaseRejected> for Error {
    fn from(rejected: ReleaseRejected) -> Self {
        rejected.error
    }
}

enum Slot {
    Idle(Engine),
    Busy,
}

struct PoolEntry {
    id: Uuid,
    /// `None` for prewarmed instances never configured for a fingerprint
    fingerprint: Option<ConfigFingerprint>,
    last_used: Instant,
    slot: Slot,
}

impl PoolEntry {
    fn is_idle(&self) -> bool {
        matches!(self.slot, Slot::Idle(_))
    }
}

#[derive(Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    stats: PoolStatistics,
}

impl PoolState {
    fn idle_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_idle()).count()
    }

    fn idle_count_for(&self, fingerprint: &ConfigFingerprint) -> usize {
        self.entries
            .iter()
            .filter(|e| e.is_idle() && e.fingerprint.as_ref() == Some(fingerprint))
            .count()
    }

    /// Most recently used idle entry matching `fingerprint`
    fn find_idle(&self, fingerprint: Option<&ConfigFingerprint>) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_idle() && e.fingerprint.as_ref() == fingerprint)
            .max_by_key(|(_, e)| e.last_used)
            .map(|(index, _)| index)
    }

    fn least_recently_used_idle(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_idle())
            .min_by_key(|(_, e)| e.last_used)
            .map(|(index, _)| index)
    }

    fn oldest_idle_for(&self, fingerprint: &ConfigFingerprint) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_idle() && e.fingerprint.as_ref() == Some(fingerprint))
            .min_by_key(|(_, e)| e.last_used)
            .map(|(index, _)| index)
    }

    /// Remove an idle entry, returning its engine
    fn take_idle(&mut self, index: usize) -> Option<Engine> {
        match self.entries.remove(index).slot {
            Slot::Idle(engine) => Some(engine),
            Slot::Busy => None,
        }
    }
}

/// Bounded set of reusable engines
pub struct EnginePool {
    config: PoolConfig,
    factory: Arc<dyn BackendFactory>,
    state: Mutex<PoolState>,
    events: EventBus,
}

impl EnginePool {
    /// Build a pool and create `prewarm_count` idle engines
    pub fn new(config: PoolConfig, factory: Arc<dyn BackendFactory>, events: EventBus) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            config,
            factory,
            state: Mutex::new(PoolState::default()),
            events,
        };
        if pool.config.prewarm_count > 0 {
            pool.prewarm(pool.config.prewarm_count)?;
        }
        info!(
            "Engine pool ready (max {}, prewarmed {})",
            pool.config.max_pool_size, pool.config.prewarm_count
        );
        Ok(pool)
    }

    /// Lazy registration building the pool on the resolving Context's event bus
    pub fn registration(config: PoolConfig, factory: Arc<dyn BackendFactory>) -> RegistrationBuilder<EnginePool> {
        Registration::lazy("engine-pool", move |resolver| {
            EnginePool::new(config.clone(), Arc::clone(&factory), resolver.events())
        })
        .provides::<EnginePoolCapability>()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out an engine for `fingerprint`
    ///
    /// Idle entries past the idle timeout are purged first. The returned
    /// engine is in a fresh generation with load state `Idle`. With
    /// auto-replenish on, the fingerprint is topped back up afterwards; a
    /// failure there is logged and does not fail the acquire.
    pub fn acquire(&self, fingerprint: &ConfigFingerprint) -> Result<Engine> {
        let mut retired = Vec::new();
        let result = self.acquire_locked(fingerprint, &mut retired);
        self.retire(retired);
        result
    }

    fn acquire_locked(
        &self,
        fingerprint: &ConfigFingerprint,
        retired: &mut Vec<(Engine, EvictionReason)>,
    ) -> Result<Engine> {
        let mut state = self.lock();
        state.stats.acquires += 1;
        self.expire_idle(&mut state, retired);
        let engine = self.checkout(&mut state, fingerprint, retired)?;
        if self.config.auto_replenish {
            self.replenish(&mut state, fingerprint);
        }
        Ok(engine)
    }

    fn checkout(
        &self,
        state: &mut PoolState,
        fingerprint: &ConfigFingerprint,
        retired: &mut Vec<(Engine, EvictionReason)>,
    ) -> Result<Engine> {
        let reusable = state.find_idle(Some(fingerprint)).or_else(|| state.find_idle(None));
        if let Some(index) = reusable {
            let Some(Slot::Idle(mut engine)) = state
                .entries
                .get_mut(index)
                .map(|entry| std::mem::replace(&mut entry.slot, Slot::Busy))
            else {
                return Err(Error::Internal("idle entry vanished during acquire".to_string()));
            };
            state.entries[index].fingerprint = Some(fingerprint.clone());
            state.stats.hits += 1;
            let generation = engine.begin_generation(None);
            debug!(
                "Reusing engine {} for {} (generation {})",
                engine.id(),
                fingerprint.short(),
                generation
            );
            self.events.emit_lossy(PlayerEvent::EngineAcquired {
                engine_id: engine.id(),
                generation,
                reused: true,
                timestamp: playerkit_common::time::now(),
            });
            return Ok(engine);
        }

        state.stats.misses += 1;
        let max = self.config.max_pool_size;

        if self.config.busy_match_policy == BusyMatchPolicy::Reject
            && state
                .entries
                .iter()
                .any(|e| !e.is_idle() && e.fingerprint.as_ref() == Some(fingerprint))
        {
            debug!("Fingerprint {} only matches busy engines, rejecting", fingerprint.short());
            return Err(Error::PoolExhausted { max });
        }

        let victim = if state.entries.len() >= max {
            let Some(index) = state.least_recently_used_idle() else {
                warn!("Engine pool exhausted ({} busy)", state.entries.len());
                return Err(Error::PoolExhausted { max });
            };
            Some(index)
        } else {
            None
        };

        // The victim stays pooled unless its replacement exists
        let mut engine = self.create_engine(state)?;
        if let Some(evicted) = victim.and_then(|index| state.take_idle(index)) {
            state.stats.evictions += 1;
            debug!("Evicting least recently used engine {}", evicted.id());
            retired.push((evicted, EvictionReason::LeastRecentlyUsed));
        }
        let generation = engine.begin_generation(None);
        state.entries.push(PoolEntry {
            id: engine.id(),
            fingerprint: Some(fingerprint.clone()),
            last_used: Instant::now(),
            slot: Slot::Busy,
        });
        debug!(
            "Created engine {} for {} ({} of {})",
            engine.id(),
            fingerprint.short(),
            state.entries.len(),
            max
        );
        self.events.emit_lossy(PlayerEvent::EngineAcquired {
            engine_id: engine.id(),
            generation,
            reused: false,
            timestamp: playerkit_common::time::now(),
        });
        Ok(engine)
    }

    /// Take an engine back
    ///
    /// Fails with `NotOwned` (handing the engine back) unless the engine is
    /// currently busy in this pool. An engine that cannot be reset cleanly
    /// is retired instead of kept.
    pub fn release(&self, mut engine: Engine) -> std::result::Result<(), ReleaseRejected> {
        let id = engine.id();
        let mut retired = Vec::new();
        {
            let mut state = self.lock();
            let Some(index) = state.entries.iter().position(|e| e.id == id && !e.is_idle()) else {
                warn!("Refusing release of engine {}: not busy in this pool", id);
                return Err(ReleaseRejected {
                    engine,
                    error: Error::NotOwned(id),
                });
            };

            engine.unbind_signals();
            let reset = if engine.supports_warm_reuse() {
                engine.reset_to_idle()
            } else {
                Err(anyhow::anyhow!("backend cannot be reused"))
            };

            let generation = engine.generation();
            match reset {
                Ok(()) => {
                    let entry = &mut state.entries[index];
                    entry.slot = Slot::Idle(engine);
                    entry.last_used = Instant::now();
                    let fingerprint = entry.fingerprint.clone();
                    state.stats.releases += 1;
                    debug!("Engine {} returned to pool", id);
                    self.events.emit_lossy(PlayerEvent::EngineReleased {
                        engine_id: id,
                        generation,
                        timestamp: playerkit_common::time::now(),
                    });
                    if let Some(fingerprint) = fingerprint {
                        self.enforce_fingerprint_limit(&mut state, &fingerprint, &mut retired);
                    }
                }
                Err(e) => {
                    warn!("Engine {} not reusable, retiring: {:#}", id, e);
                    state.entries.remove(index);
                    state.stats.releases += 1;
                    retired.push((engine, EvictionReason::ResetFailed));
                }
            }
        }
        self.retire(retired);
        Ok(())
    }

    /// Create up to `count` unconfigured idle engines, bounded by the max
    ///
    /// Returns how many were created.
    pub fn prewarm(&self, count: usize) -> Result<usize> {
        self.fill(None, count)
    }

    /// Create up to `count` idle engines reserved for `fingerprint`
    ///
    /// Bounded by both the pool maximum and `max_per_fingerprint`.
    pub fn prewarm_for(&self, fingerprint: &ConfigFingerprint, count: usize) -> Result<usize> {
        self.fill(Some(fingerprint), count)
    }

    fn fill(&self, fingerprint: Option<&ConfigFingerprint>, count: usize) -> Result<usize> {
        let mut state = self.lock();
        let target = count.min(self.room_for(&state, fingerprint));
        for created in 0..target {
            let engine = match self.create_engine(&mut state) {
                Ok(engine) => engine,
                Err(e) => {
                    warn!("Prewarm stopped after {} engine(s): {}", created, e);
                    return Err(e);
                }
            };
            state.entries.push(PoolEntry {
                id: engine.id(),
                fingerprint: fingerprint.cloned(),
                last_used: Instant::now(),
                slot: Slot::Idle(engine),
            });
        }
        if target > 0 {
            info!("Prewarmed {} engine(s)", target);
        }
        Ok(target)
    }

    /// Tear down idle engines older than the idle timeout
    ///
    /// Returns how many were removed. No-op when the timeout is disabled.
    pub fn purge_idle(&self) -> usize {
        let mut retired = Vec::new();
        {
            let mut state = self.lock();
            self.expire_idle(&mut state, &mut retired);
        }
        let purged = retired.len();
        self.retire(retired);
        purged
    }

    /// Tear down every idle engine; busy engines are left alone
    pub fn clear(&self) -> Result<()> {
        self.clear_where(|_| true)
    }

    /// Tear down the idle engines configured for `fingerprint`
    pub fn clear_fingerprint(&self, fingerprint: &ConfigFingerprint) -> Result<()> {
        self.clear_where(|entry| entry.fingerprint.as_ref() == Some(fingerprint))
    }

    fn clear_where(&self, matches: impl Fn(&PoolEntry) -> bool) -> Result<()> {
        let retired: Vec<_> = {
            let mut state = self.lock();
            let (cleared, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.entries)
                .into_iter()
                .partition(|entry| entry.is_idle() && matches(entry));
            state.entries = kept;
            cleared
                .into_iter()
                .filter_map(|entry| match entry.slot {
                    Slot::Idle(engine) => Some((engine, EvictionReason::Cleared)),
                    Slot::Busy => None,
                })
                .collect()
        };
        if !retired.is_empty() {
            info!("Clearing {} idle engine(s)", retired.len());
        }
        let failures = self.retire(retired);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown { failures })
        }
    }

    pub fn statistics(&self) -> PoolStatistics {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.size = state.entries.len();
        stats.idle = state.idle_count();
        stats.busy = stats.size - stats.idle;
        stats
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle_count()
    }

    /// Idle engines currently configured for `fingerprint`
    pub fn count_for(&self, fingerprint: &ConfigFingerprint) -> usize {
        self.lock().idle_count_for(fingerprint)
    }

    /// How many more idle engines fit, overall and for `fingerprint`
    fn room_for(&self, state: &PoolState, fingerprint: Option<&ConfigFingerprint>) -> usize {
        let room = self.config.max_pool_size.saturating_sub(state.entries.len());
        match fingerprint {
            Some(fingerprint) => room.min(
                self.config
                    .max_per_fingerprint
                    .saturating_sub(state.idle_count_for(fingerprint)),
            ),
            None => room,
        }
    }

    fn replenish(&self, state: &mut PoolState, fingerprint: &ConfigFingerprint) {
        if state.idle_count_for(fingerprint) >= self.config.replenish_floor() {
            return;
        }
        let target = self.room_for(state, Some(fingerprint));
        for created in 0..target {
            let engine = match self.create_engine(state) {
                Ok(engine) => engine,
                Err(e) => {
                    warn!(
                        "Replenishing {} stopped after {} engine(s): {}",
                        fingerprint.short(),
                        created,
                        e
                    );
                    return;
                }
            };
            state.stats.replenished += 1;
            state.entries.push(PoolEntry {
                id: engine.id(),
                fingerprint: Some(fingerprint.clone()),
                last_used: Instant::now(),
                slot: Slot::Idle(engine),
            });
        }
        if target > 0 {
            debug!("Replenished {} engine(s) for {}", target, fingerprint.short());
        }
    }

    /// Evict the oldest idle entries of `fingerprint` beyond the per-fingerprint max
    fn enforce_fingerprint_limit(
        &self,
        state: &mut PoolState,
        fingerprint: &ConfigFingerprint,
        retired: &mut Vec<(Engine, EvictionReason)>,
    ) {
        while state.idle_count_for(fingerprint) > self.config.max_per_fingerprint {
            let Some(engine) = state.oldest_idle_for(fingerprint).and_then(|index| state.take_idle(index)) else {
                break;
            };
            state.stats.evictions += 1;
            debug!("Engine {} over the limit for {}, evicting", engine.id(), fingerprint.short());
            retired.push((engine, EvictionReason::FingerprintLimit));
        }
    }

    fn create_engine(&self, state: &mut PoolState) -> Result<Engine> {
        let sink = SignalSink::default();
        let backend = self.factory.create(sink.clone()).map_err(|e| {
            warn!("Engine backend creation failed: {:#}", e);
            Error::backend(e)
        })?;
        state.stats.created += 1;
        Ok(Engine::new(backend, sink))
    }

    fn expire_idle(&self, state: &mut PoolState, retired: &mut Vec<(Engine, EvictionReason)>) {
        let Some(timeout) = self.config.idle_timeout() else {
            return;
        };
        let now = Instant::now();
        let mut index = 0;
        while index < state.entries.len() {
            let entry = &state.entries[index];
            if entry.is_idle() && now.duration_since(entry.last_used) >= timeout {
                if let Some(engine) = state.take_idle(index) {
                    state.stats.idle_cleanups += 1;
                    debug!("Engine {} idle past timeout", engine.id());
                    retired.push((engine, EvictionReason::IdleTimeout));
                }
            } else {
                index += 1;
            }
        }
    }

    /// Shut retired engines down; returns the failures
    fn retire(&self, retired: Vec<(Engine, EvictionReason)>) -> Vec<String> {
        let mut failures = Vec::new();
        for (engine, reason) in retired {
            let id = engine.id();
            if let Err(e) = engine.shutdown() {
                warn!("Engine {} shutdown failed: {:#}", id, e);
                failures.push(format!("engine {}: {:#}", id, e));
            }
            self.events.emit_lossy(PlayerEvent::EngineEvicted {
                engine_id: id,
                reason,
                timestamp: playerkit_common::time::now(),
            });
        }
        failures
    }
}

impl Component for EnginePool {
    fn name(&self) -> &str {
        "engine-pool"
    }

    fn will_unload(&self) -> Result<()> {
        self.clear()
    }
}

/// Engine pool capability contract
pub trait EnginePoolService: Send + Sync {
    fn acquire(&self, fingerprint: &ConfigFingerprint) -> Result<Engine>;

    fn release(&self, engine: Engine) -> std::result::Result<(), ReleaseRejected>;

    fn prewarm(&self, count: usize) -> Result<usize>;

    fn prewarm_for(&self, fingerprint: &ConfigFingerprint, count: usize) -> Result<usize>;

    fn count_for(&self, fingerprint: &ConfigFingerprint) -> usize;

    fn purge_idle(&self) -> usize;

    fn clear(&self) -> Result<()>;

    fn clear_fingerprint(&self, fingerprint: &ConfigFingerprint) -> Result<()>;

    fn statistics(&self) -> PoolStatistics;
}

impl EnginePoolService for EnginePool {
    fn acquire(&self, fingerprint: &ConfigFingerprint) -> Result<Engine> {
        EnginePool::acquire(self, fingerprint)
    }

    fn release(&self, engine: Engine) -> std::result::Result<(), ReleaseRejected> {
        EnginePool::release(self, engine)
    }

    fn prewarm(&self, count: usize) -> Result<usize> {
        EnginePool::prewarm(self, count)
    }

    fn prewarm_for(&self, fingerprint: &ConfigFingerprint, count: usize) -> Result<usize> {
        EnginePool::prewarm_for(self, fingerprint, count)
    }

    fn count_for(&self, fingerprint: &ConfigFingerprint) -> usize {
        EnginePool::count_for(self, fingerprint)
    }

    fn purge_idle(&self) -> usize {
        EnginePool::purge_idle(self)
    }

    fn clear(&self) -> Result<()> {
        EnginePool::clear(self)
    }

    fn clear_fingerprint(&self, fingerprint: &ConfigFingerprint) -> Result<()> {
        EnginePool::clear_fingerprint(self, fingerprint)
    }

    fn statistics(&self) -> PoolStatistics {
        EnginePool::statistics(self)
    }
}

pub struct EnginePoolCapability;

impl Capability for EnginePoolCapability {
    type Service = dyn EnginePoolService;
    const ID: CapabilityId = CapabilityId::new("playerkit.engine_pool");
}

impl Provides<EnginePoolCapability> for EnginePool {
    fn into_service(self: Arc<Self>) -> Arc<dyn EnginePoolService> {
        self
    }
}
