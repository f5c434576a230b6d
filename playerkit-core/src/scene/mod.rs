//! Scenes, scene manager and scene transfer

mod manager;
mod transfer;
mod types;

pub use manager::{SceneManager, SceneManagerCapability, SceneManagerService};
pub use transfer::{SceneTransfer, SceneTransferCapability, SceneTransferService, TransferReceipt, TransferState};
pub use types::{SceneId, SceneInfo, SceneKind, SceneObserver};

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::engine::sim::SimulatedBackendFactory;
    use crate::engine::MediaDescriptor;
    use crate::playback::{PlaybackControl, PlaybackControlService, Session};
    use crate::pool::EnginePool;
    use playerkit_common::config::PoolConfig;
    use playerkit_common::events::EventBus;
    use std::sync::Arc;

    /// Pool plus a playing session per call to `playing`
    pub(crate) struct Sessions {
        pub(crate) pool: Arc<EnginePool>,
        pub(crate) events: EventBus,
    }

    impl Sessions {
        pub(crate) fn new() -> Self {
            let events = EventBus::new(128);
            let factory = Arc::new(SimulatedBackendFactory::auto());
            let pool = Arc::new(EnginePool::new(PoolConfig::default(), factory, events.clone()).unwrap());
            Self { pool, events }
        }

        pub(crate) fn playing(&self, uri: &str) -> Session {
            let control = Arc::new(PlaybackControl::new(self.pool.clone(), self.events.clone()));
            let session = control.clone().acquire(MediaDescriptor::new(uri)).unwrap();
            control.prepare().unwrap();
            control.process_pending();
            control.play().unwrap();
            session
        }
    }
}
