//! Tiered cache for per-day bury-point records.
//!
//! Three tiers implement [`CacheTier`]:
//!
//! - [`MemoryTier`]: bounded in-process map
//! - [`LmdbTier`]: durable-local store that survives restarts
//! - [`HttpBackendTier`]: the authoritative backend store
//!
//! [`TieredCacheStore`] composes them with lazy promotion on read and
//! write-through on write. Reads return [`CacheRead`] so callers can see which
//! tier served them.
//!
//! # Example
//!
//! ```ignore
//! let store = TieredCacheStore::new(memory, local, backend);
//! store.set(&key.fingerprint(), &entry).await?;
//!
//! let read = store.get(&key.fingerprint()).await;
//! if let Some(read) = read {
//!     tracing::debug!(tier = %read.served_by(), "served from cache");
//! }
//! ```

pub mod freshness;
pub mod http_backend;
pub mod lmdb_backend;
pub mod memory;
pub mod tiered;
pub mod traits;

pub use freshness::CacheRead;
pub use http_backend::{Envelope, HttpBackendTier, PreloadStatus};
pub use lmdb_backend::{LmdbTier, LmdbTierError};
pub use memory::MemoryTier;
pub use tiered::{KeyLockGuard, TierSnapshot, TierView, TieredCacheStore, TieredStats};
pub use traits::{CacheStats, CacheTier};
