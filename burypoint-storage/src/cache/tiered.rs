//! Tiered cache store.
//!
//! Composes the memory, durable-local and backend tiers behind one
//! interface:
//!
//! - Reads try memory, then durable-local, then backend, and promote a hit
//!   into every faster tier.
//! - Writes go through backend, durable-local and memory in that order.
//!   Every tier is attempted even if an earlier one fails.
//! - A failing tier read is logged and treated as a miss, so one broken tier
//!   never hides data held by the others.
//!
//! The store is constructed once and shared by reference; tiers are injected
//! so tests can substitute their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use burypoint_core::{CacheEntry, ClearScope, Fingerprint, TierError, TierKind};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

use super::freshness::CacheRead;
use super::traits::{CacheStats, CacheTier};

/// Outcome of reading one tier directly.
pub type TierView = Result<Option<(CacheEntry, DateTime<Utc>)>, TierError>;

/// What each tier holds for one fingerprint, read without promotion.
#[derive(Debug)]
pub struct TierSnapshot {
    pub fingerprint: Fingerprint,
    pub memory: TierView,
    pub durable_local: TierView,
    pub backend: TierView,
}

impl TierSnapshot {
    /// The view of one tier. `Remote` is not a cache tier and reads as absent.
    pub fn view(&self, tier: TierKind) -> Option<&TierView> {
        match tier {
            TierKind::Memory => Some(&self.memory),
            TierKind::DurableLocal => Some(&self.durable_local),
            TierKind::Backend => Some(&self.backend),
            TierKind::Remote => None,
        }
    }

    /// The entry a tier holds, ignoring read errors.
    pub fn entry(&self, tier: TierKind) -> Option<&CacheEntry> {
        match self.view(tier)? {
            Ok(Some((entry, _))) => Some(entry),
            _ => None,
        }
    }

    /// Tiers whose read failed.
    pub fn unreadable(&self) -> Vec<TierKind> {
        TierKind::READ_ORDER
            .into_iter()
            .filter(|tier| matches!(self.view(*tier), Some(Err(_))))
            .collect()
    }
}

/// Usage of every tier plus store-level counters.
#[derive(Debug, Clone, Default)]
pub struct TieredStats {
    pub memory: CacheStats,
    pub durable_local: CacheStats,
    pub backend: CacheStats,
    /// Copies made into faster tiers after a slower tier hit.
    pub promotions: u64,
    /// Reads that missed every tier.
    pub full_misses: u64,
    /// Individual tier writes that failed during write-through.
    pub write_failures: u64,
}

type LockMap = Arc<Mutex<HashMap<Fingerprint, Arc<AsyncMutex<()>>>>>;

/// Exclusive hold on one fingerprint.
///
/// The lock entry is dropped from the store's map when the last holder or
/// waiter releases it.
pub struct KeyLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    fingerprint: Fingerprint,
    locks: LockMap,
}

impl KeyLockGuard {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let ours = Arc::as_ptr(OwnedMutexGuard::mutex(&guard));
        // Release first so the map holds the only reference once every
        // holder and waiter is gone.
        drop(guard);

        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks
            .get(&self.fingerprint)
            .is_some_and(|lock| Arc::as_ptr(lock) == ours && Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.fingerprint);
        }
    }
}

/// Memory, durable-local and backend tiers composed into one store.
pub struct TieredCacheStore {
    memory: Arc<dyn CacheTier>,
    durable_local: Arc<dyn CacheTier>,
    backend: Arc<dyn CacheTier>,
    locks: LockMap,
    promotions: AtomicU64,
    full_misses: AtomicU64,
    write_failures: AtomicU64,
}

impl std::fmt::Debug for TieredCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCacheStore")
            .field("promotions", &self.promotions.load(Ordering::Relaxed))
            .field("full_misses", &self.full_misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TieredCacheStore {
    pub fn new(
        memory: Arc<dyn CacheTier>,
        durable_local: Arc<dyn CacheTier>,
        backend: Arc<dyn CacheTier>,
    ) -> Self {
        Self {
            memory,
            durable_local,
            backend,
            locks: Arc::new(Mutex::new(HashMap::new())),
            promotions: AtomicU64::new(0),
            full_misses: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// The tier of the given kind. `Remote` is not a cache tier.
    pub fn tier(&self, kind: TierKind) -> Option<&Arc<dyn CacheTier>> {
        match kind {
            TierKind::Memory => Some(&self.memory),
            TierKind::DurableLocal => Some(&self.durable_local),
            TierKind::Backend => Some(&self.backend),
            TierKind::Remote => None,
        }
    }

    fn tiers_in(&self, order: [TierKind; 3]) -> [&Arc<dyn CacheTier>; 3] {
        order.map(|kind| match kind {
            TierKind::Memory => &self.memory,
            TierKind::DurableLocal => &self.durable_local,
            _ => &self.backend,
        })
    }

    /// Read through the tiers, promoting a hit into every faster tier.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheRead<CacheEntry>> {
        let tiers = self.tiers_in(TierKind::READ_ORDER);

        for (depth, tier) in tiers.iter().enumerate() {
            let kind = tier.kind();
            match tier.get(fingerprint).await {
                Ok(Some((entry, cached_at))) => {
                    trace!(%fingerprint, tier = %kind, "Cache hit");
                    for faster in &tiers[..depth] {
                        self.promote(faster, fingerprint, &entry).await;
                    }
                    return Some(CacheRead::from_tier(entry.held_by(kind), cached_at, kind));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%fingerprint, tier = %kind, error = %e, "Tier read failed, treating as miss");
                }
            }
        }

        self.full_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn promote(
        &self,
        tier: &Arc<dyn CacheTier>,
        fingerprint: &Fingerprint,
        entry: &CacheEntry,
    ) {
        let kind = tier.kind();
        match tier.set(fingerprint, &entry.held_by(kind)).await {
            Ok(()) => {
                self.promotions.fetch_add(1, Ordering::Relaxed);
                debug!(%fingerprint, tier = %kind, "Promoted entry into faster tier");
            }
            Err(e) => {
                warn!(%fingerprint, tier = %kind, error = %e, "Promotion failed");
            }
        }
    }

    /// Read a single tier without promotion. Errors are returned, not masked.
    pub async fn peek(&self, tier: TierKind, fingerprint: &Fingerprint) -> TierView {
        match self.tier(tier) {
            Some(t) => t.get(fingerprint).await,
            None => Ok(None),
        }
    }

    /// Read all three tiers concurrently without promotion.
    pub async fn snapshot(&self, fingerprint: &Fingerprint) -> TierSnapshot {
        let (memory, durable_local, backend) = tokio::join!(
            self.memory.get(fingerprint),
            self.durable_local.get(fingerprint),
            self.backend.get(fingerprint),
        );
        TierSnapshot {
            fingerprint: fingerprint.clone(),
            memory,
            durable_local,
            backend,
        }
    }

    /// Write through every tier: backend, durable-local, then memory.
    ///
    /// Each tier's write is atomic on its own. If any tier fails the others
    /// are still written and the failed tiers are reported together.
    pub async fn set(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), TierError> {
        let mut failed = Vec::new();
        for tier in self.tiers_in(TierKind::WRITE_ORDER) {
            let kind = tier.kind();
            if let Err(e) = tier.set(fingerprint, &entry.held_by(kind)).await {
                warn!(%fingerprint, tier = %kind, error = %e, "Write-through to tier failed");
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                failed.push(kind);
            }
        }

        if failed.is_empty() {
            debug!(%fingerprint, records = entry.record_count(), "Entry written through all tiers");
            Ok(())
        } else {
            Err(TierError::WriteThrough { failed })
        }
    }

    /// Whether any tier holds the fingerprint. Unreadable tiers count as absent.
    pub async fn has(&self, fingerprint: &Fingerprint) -> bool {
        for tier in self.tiers_in(TierKind::READ_ORDER) {
            if let Ok(true) = tier.has(fingerprint).await {
                return true;
            }
        }
        false
    }

    /// Remove entries selected by `scope` (everything when `None`).
    ///
    /// Returns the number of entries removed across tiers. A tier that fails
    /// to clear is logged and skipped.
    pub async fn clear(&self, scope: Option<&ClearScope>) -> u64 {
        let scope = scope.cloned().unwrap_or_default();
        let mut removed = 0;
        for tier in self.tiers_in(TierKind::READ_ORDER) {
            match tier.clear(&scope).await {
                Ok(n) => removed += n,
                Err(e) => {
                    warn!(tier = %tier.kind(), ?scope, error = %e, "Tier clear failed");
                }
            }
        }
        debug!(?scope, removed, "Cache cleared");
        removed
    }

    /// Acquire the write lock of one fingerprint.
    ///
    /// Holders of the same fingerprint are serialized; distinct fingerprints
    /// never contend.
    pub async fn lock_key(&self, fingerprint: &Fingerprint) -> KeyLockGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        KeyLockGuard {
            guard: Some(lock.lock_owned().await),
            fingerprint: fingerprint.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of fingerprints with an outstanding lock holder or waiter.
    pub fn locked_keys(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Ping the authoritative backend.
    pub async fn backend_ping(&self) -> Result<(), TierError> {
        self.backend.ping().await
    }

    pub async fn stats(&self) -> TieredStats {
        TieredStats {
            memory: self.memory.stats().await,
            durable_local: self.durable_local.stats().await,
            backend: self.backend.stats().await,
            promotions: self.promotions.load(Ordering::Relaxed),
            full_misses: self.full_misses.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}
