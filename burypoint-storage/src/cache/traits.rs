//! Cache tier trait and usage statistics.
//!
//! Every storage layer of the tiered store implements [`CacheTier`]. Tiers
//! see nothing but [`Fingerprint`]s and [`CacheEntry`] values, so all of them
//! agree on the key format by construction.

use async_trait::async_trait;
use burypoint_core::{CacheEntry, ClearScope, Fingerprint, TierError, TierKind};
use chrono::{DateTime, Utc};

/// One storage layer of the cache hierarchy.
///
/// Implementations must be safe to share between tasks. A `set` either
/// replaces the previous value for its fingerprint completely or fails
/// without touching it.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Which layer this is.
    fn kind(&self) -> TierKind;

    /// Read an entry.
    ///
    /// Returns the entry and when this tier stored it, or `None` if absent.
    async fn get(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<(CacheEntry, DateTime<Utc>)>, TierError>;

    /// Store an entry, replacing any previous value for the fingerprint.
    async fn set(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), TierError>;

    /// Check whether an entry exists.
    async fn has(&self, fingerprint: &Fingerprint) -> Result<bool, TierError> {
        Ok(self.get(fingerprint).await?.is_some())
    }

    /// Remove every entry selected by `scope`, returning how many were removed.
    async fn clear(&self, scope: &ClearScope) -> Result<u64, TierError>;

    /// Usage statistics.
    async fn stats(&self) -> CacheStats;

    /// Liveness check. Local tiers are always reachable.
    async fn ping(&self) -> Result<(), TierError> {
        Ok(())
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in the tier, where known.
    pub entry_count: u64,
    /// Approximate payload size in bytes.
    pub size_bytes: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Reads or writes that failed.
    pub errors: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
