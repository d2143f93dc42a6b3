//! BuryPoint Storage - Tiered Cache Store
//!
//! Memory, durable-local (LMDB) and backend (HTTP) cache tiers behind one
//! [`CacheTier`] trait, composed by [`TieredCacheStore`].

pub mod cache;

pub use cache::{
    CacheRead, CacheStats, CacheTier, Envelope, HttpBackendTier, KeyLockGuard, LmdbTier,
    LmdbTierError, MemoryTier, PreloadStatus, TierSnapshot, TierView, TieredCacheStore,
    TieredStats,
};
