//! Engine pool

mod engine_pool;
mod statistics;

pub use engine_pool::{EnginePool, EnginePoolCapability, EnginePoolService, ReleaseRejected};
pub use statistics::PoolStatistics;
