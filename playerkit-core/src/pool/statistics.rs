//! Pool counters

use serde::Serialize;

/// Snapshot of pool activity since creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    /// Successful and failed acquire calls
    pub acquires: u64,
    /// Acquires served by an idle instance
    pub hits: u64,
    /// Acquires that needed a new instance (or failed)
    pub misses: u64,
    /// Instances created, including prewarmed ones
    pub created: u64,
    /// Idle instances torn down to make room
    pub evictions: u64,
    /// Idle instances torn down by timeout
    pub idle_cleanups: u64,
    /// Instances created by auto-replenish
    pub replenished: u64,
    /// Successful releases
    pub releases: u64,
    /// Current entries (idle + busy)
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
}

impl PoolStatistics {
    /// Fraction of acquires served from the pool, 0.0 before any acquire
    pub fn hit_rate(&self) -> f64 {
        if self.acquires == 0 {
            0.0
        } else {
            self.hits as f64 / self.acquires as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let mut stats = PoolStatistics::default();
        assert_eq!(stats.hit_rate(), 0.0);
        stats.acquires = 4;
        stats.hits = 3;
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
