//! In-process memory tier.
//!
//! A bounded map from fingerprint to entry. When full, inserting a new key
//! evicts the entry with the oldest `fetched_at`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use burypoint_core::{CacheEntry, ClearScope, Fingerprint, TierError, TierKind};
use chrono::{DateTime, Utc};

use super::traits::{CacheStats, CacheTier};

#[derive(Debug, Clone)]
struct Slot {
    entry: CacheEntry,
    stored_at: DateTime<Utc>,
}

/// Memory cache tier.
#[derive(Debug)]
pub struct MemoryTier {
    entries: RwLock<HashMap<Fingerprint, Slot>>,
    max_entries: usize,
    stats: RwLock<CacheStats>,
}

impl MemoryTier {
    /// Create a tier holding at most `max_entries` entries (minimum 1).
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned(&self) -> TierError {
        TierError::Unavailable {
            tier: TierKind::Memory,
            reason: "memory tier lock poisoned".to_string(),
        }
    }

    fn record(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }
}

/// Pick the fingerprint whose entry was fetched longest ago.
fn oldest(entries: &HashMap<Fingerprint, Slot>) -> Option<Fingerprint> {
    entries
        .iter()
        .min_by_key(|(_, slot)| slot.entry.fetched_at)
        .map(|(fp, _)| fp.clone())
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    async fn get(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<(CacheEntry, DateTime<Utc>)>, TierError> {
        let found = {
            let entries = self.entries.read().map_err(|_| self.poisoned())?;
            entries
                .get(fingerprint)
                .map(|slot| (slot.entry.clone(), slot.stored_at))
        };
        match found {
            Some(hit) => {
                self.record(|s| s.hits += 1);
                Ok(Some(hit))
            }
            None => {
                self.record(|s| s.misses += 1);
                Ok(None)
            }
        }
    }

    async fn set(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), TierError> {
        let (evicted, len) = {
            let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
            let mut evicted = 0u64;
            if !entries.contains_key(fingerprint) && entries.len() >= self.max_entries {
                if let Some(victim) = oldest(&entries) {
                    entries.remove(&victim);
                    evicted = 1;
                }
            }
            entries.insert(
                fingerprint.clone(),
                Slot {
                    entry: entry.clone(),
                    stored_at: Utc::now(),
                },
            );
            (evicted, entries.len())
        };
        self.record(|s| {
            s.evictions += evicted;
            s.entry_count = len as u64;
        });
        Ok(())
    }

    async fn clear(&self, scope: &ClearScope) -> Result<u64, TierError> {
        let (removed, len) = {
            let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
            let before = entries.len();
            entries.retain(|_, slot| !scope.matches(&slot.entry.key));
            ((before - entries.len()) as u64, entries.len())
        };
        self.record(|s| s.entry_count = len as u64);
        Ok(removed)
    }

    async fn stats(&self) -> CacheStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burypoint_core::{CacheKey, DateRange, RawRecord};
    use chrono::{Duration, NaiveDate};

    fn entry_on(day: u32, tp: i64, fetched_at: DateTime<Utc>) -> CacheEntry {
        let key = CacheKey::new(NaiveDate::from_ymd_opt(2025, 3, day).unwrap(), tp, "p");
        let records = vec![RawRecord::new("click", "home", "c", "v", "t")];
        CacheEntry::new(key, records, fetched_at, false)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let tier = MemoryTier::new(8);
        let entry = entry_on(1, 7, Utc::now());
        let fp = entry.key.fingerprint();

        tier.set(&fp, &entry).await.unwrap();
        let (got, _) = tier.get(&fp).await.unwrap().unwrap();
        assert_eq!(got.record_count(), 1);
        assert!(tier.has(&fp).await.unwrap());

        let stats = tier.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_evicts_oldest_fetch() {
        let tier = MemoryTier::new(2);
        let now = Utc::now();
        let old = entry_on(1, 1, now - Duration::hours(2));
        let mid = entry_on(2, 1, now - Duration::hours(1));
        let new = entry_on(3, 1, now);

        tier.set(&old.key.fingerprint(), &old).await.unwrap();
        tier.set(&mid.key.fingerprint(), &mid).await.unwrap();
        tier.set(&new.key.fingerprint(), &new).await.unwrap();

        assert_eq!(tier.len(), 2);
        assert!(!tier.has(&old.key.fingerprint()).await.unwrap());
        assert!(tier.has(&mid.key.fingerprint()).await.unwrap());
        assert_eq!(tier.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let tier = MemoryTier::new(1);
        let entry = entry_on(1, 1, Utc::now());
        let fp = entry.key.fingerprint();
        tier.set(&fp, &entry).await.unwrap();
        tier.set(&fp, &entry).await.unwrap();
        assert_eq!(tier.stats().await.evictions, 0);
    }

    #[tokio::test]
    async fn test_scoped_clear() {
        let tier = MemoryTier::new(16);
        let now = Utc::now();
        for day in 1..=5 {
            let entry = entry_on(day, 1, now);
            tier.set(&entry.key.fingerprint(), &entry).await.unwrap();
        }
        let other_tp = entry_on(2, 9, now);
        tier.set(&other_tp.key.fingerprint(), &other_tp).await.unwrap();

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
        )
        .unwrap();
        let removed = tier.clear(&ClearScope::Dates(range)).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(tier.len(), 3);

        assert_eq!(tier.clear(&ClearScope::TrackingPoint(1)).await.unwrap(), 3);
        assert!(tier.is_empty());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_scoped_clear_removes_exactly_the_range(
                days in proptest::collection::btree_set(1u32..=28, 1..12),
                a in 1u32..=28,
                b in 1u32..=28,
            ) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let tier = MemoryTier::new(64);
                    let now = Utc::now();
                    for day in &days {
                        let entry = entry_on(*day, 1, now);
                        tier.set(&entry.key.fingerprint(), &entry).await.unwrap();
                    }

                    let (lo, hi) = (a.min(b), a.max(b));
                    let range = DateRange::new(
                        NaiveDate::from_ymd_opt(2025, 3, lo).unwrap(),
                        NaiveDate::from_ymd_opt(2025, 3, hi).unwrap(),
                    )
                    .unwrap();
                    tier.clear(&ClearScope::Dates(range)).await.unwrap();

                    for day in &days {
                        let fp = entry_on(*day, 1, now).key.fingerprint();
                        let inside = *day >= lo && *day <= hi;
                        prop_assert_eq!(tier.has(&fp).await.unwrap(), !inside);
                    }
                    Ok(())
                })?;
            }
        }
    }
}
