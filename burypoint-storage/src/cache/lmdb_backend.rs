//! LMDB-backed durable-local tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep cache entries across
//! process restarts.
//!
//! # Value Layout
//!
//! `[stored_at: 8 bytes, little-endian unix millis][json CacheEntry]`
//!
//! Keys are the fingerprint bytes. Every put and every scoped clear runs in a
//! single write transaction, so readers never observe a torn entry.

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use burypoint_core::{CacheEntry, ClearScope, Fingerprint, TierError, TierKind};
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::traits::{CacheStats, CacheTier};

const TIMESTAMP_LEN: usize = 8;

/// Error type for opening the LMDB tier.
#[derive(Debug, thiserror::Error)]
pub enum LmdbTierError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbTierError> for TierError {
    fn from(e: LmdbTierError) -> Self {
        TierError::Unavailable {
            tier: TierKind::DurableLocal,
            reason: e.to_string(),
        }
    }
}

fn read_err(e: heed::Error) -> TierError {
    TierError::Read {
        tier: TierKind::DurableLocal,
        reason: e.to_string(),
    }
}

fn write_err(e: heed::Error) -> TierError {
    TierError::Write {
        tier: TierKind::DurableLocal,
        reason: e.to_string(),
    }
}

/// Durable-local cache tier backed by LMDB.
pub struct LmdbTier {
    env: Env,
    db: Database<Bytes, Bytes>,
    stats: RwLock<CacheStats>,
}

impl std::fmt::Debug for LmdbTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbTier")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbTier {
    /// Open (or create) the tier.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbTierError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbTierError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbTierError::Transaction(e.to_string()))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbTierError::DbOpen(e.to_string()))?;
        let existing = db
            .len(&wtxn)
            .map_err(|e| LmdbTierError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbTierError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            stats: RwLock::new(CacheStats {
                entry_count: existing,
                ..Default::default()
            }),
        })
    }

    fn record(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    /// Store raw bytes under a fingerprint, bypassing encoding.
    #[cfg(test)]
    fn put_raw(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<(), TierError> {
        let mut wtxn = self.env.write_txn().map_err(write_err)?;
        self.db
            .put(&mut wtxn, fingerprint.as_bytes(), bytes)
            .map_err(write_err)?;
        wtxn.commit().map_err(write_err)
    }
}

/// Encode `[stored_at][json]`.
fn encode_value(entry: &CacheEntry, stored_at: DateTime<Utc>) -> Result<Vec<u8>, TierError> {
    let json = serde_json::to_vec(entry).map_err(|e| TierError::Serialization {
        tier: TierKind::DurableLocal,
        reason: e.to_string(),
    })?;
    let mut bytes = Vec::with_capacity(TIMESTAMP_LEN + json.len());
    bytes.extend_from_slice(&stored_at.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode `[stored_at][json]`, rejecting anything that fails verification.
fn decode_value(
    fingerprint: &Fingerprint,
    bytes: &[u8],
) -> Result<(CacheEntry, DateTime<Utc>), TierError> {
    let corrupt = || TierError::Corrupt {
        tier: TierKind::DurableLocal,
        fingerprint: fingerprint.to_string(),
    };
    if bytes.len() < TIMESTAMP_LEN {
        return Err(corrupt());
    }
    let (ts, json) = bytes.split_at(TIMESTAMP_LEN);
    let millis = i64::from_le_bytes(ts.try_into().map_err(|_| corrupt())?);
    let stored_at = DateTime::from_timestamp_millis(millis).ok_or_else(corrupt)?;
    let entry: CacheEntry = serde_json::from_slice(json).map_err(|_| corrupt())?;
    if !entry.verify() || entry.key.fingerprint() != *fingerprint {
        return Err(corrupt());
    }
    Ok((entry, stored_at))
}

#[async_trait]
impl CacheTier for LmdbTier {
    fn kind(&self) -> TierKind {
        TierKind::DurableLocal
    }

    async fn get(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<(CacheEntry, DateTime<Utc>)>, TierError> {
        let rtxn = self.env.read_txn().map_err(read_err)?;
        let found = self.db.get(&rtxn, fingerprint.as_bytes()).map_err(|e| {
            self.record(|s| s.errors += 1);
            read_err(e)
        })?;

        match found {
            Some(bytes) => match decode_value(fingerprint, bytes) {
                Ok(hit) => {
                    self.record(|s| s.hits += 1);
                    Ok(Some(hit))
                }
                Err(e) => {
                    self.record(|s| s.errors += 1);
                    Err(e)
                }
            },
            None => {
                self.record(|s| s.misses += 1);
                Ok(None)
            }
        }
    }

    async fn set(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), TierError> {
        let bytes = encode_value(entry, Utc::now())?;

        let mut wtxn = self.env.write_txn().map_err(write_err)?;
        let is_new = self
            .db
            .get(&wtxn, fingerprint.as_bytes())
            .map_err(write_err)?
            .is_none();
        self.db
            .put(&mut wtxn, fingerprint.as_bytes(), &bytes)
            .map_err(write_err)?;
        wtxn.commit().map_err(write_err)?;

        self.record(|s| {
            if is_new {
                s.entry_count += 1;
            }
            s.size_bytes += bytes.len() as u64;
        });
        Ok(())
    }

    async fn clear(&self, scope: &ClearScope) -> Result<u64, TierError> {
        let mut wtxn = self.env.write_txn().map_err(write_err)?;

        let deleted = if let ClearScope::All = scope {
            let count = self.db.len(&wtxn).map_err(write_err)?;
            self.db.clear(&mut wtxn).map_err(write_err)?;
            count
        } else {
            let prefix = scope.key_prefix();
            let mut doomed = Vec::new();
            for item in self
                .db
                .prefix_iter(&wtxn, prefix.as_bytes())
                .map_err(write_err)?
            {
                let (key, _) = item.map_err(write_err)?;
                if let Some(cache_key) = Fingerprint::decode_bytes(key) {
                    if scope.matches(&cache_key) {
                        doomed.push(key.to_vec());
                    }
                }
            }
            let mut deleted = 0u64;
            for key in &doomed {
                if self.db.delete(&mut wtxn, key).map_err(write_err)? {
                    deleted += 1;
                }
            }
            deleted
        };

        wtxn.commit().map_err(write_err)?;

        self.record(|s| {
            s.entry_count = s.entry_count.saturating_sub(deleted);
            if let ClearScope::All = scope {
                s.size_bytes = 0;
            }
        });
        Ok(deleted)
    }

    async fn stats(&self) -> CacheStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burypoint_core::{CacheKey, DateRange, RawRecord};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn create_test_tier() -> (LmdbTier, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let tier = LmdbTier::open(temp_dir.path(), 10).expect("tier creation should succeed");
        (tier, temp_dir)
    }

    fn make_entry(day: u32, tp: i64, project: &str, n: usize) -> CacheEntry {
        let key = CacheKey::new(NaiveDate::from_ymd_opt(2025, 3, day).unwrap(), tp, project);
        let records = (0..n)
            .map(|i| RawRecord::new("visit", "index", format!("c{i}"), format!("v{i}"), "t"))
            .collect();
        CacheEntry::new(key, records, Utc::now(), false)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (tier, _temp_dir) = create_test_tier();
        let entry = make_entry(1, 1, "p", 3);
        let fp = entry.key.fingerprint();

        tier.set(&fp, &entry).await.expect("set should succeed");
        let (value, stored_at) = tier
            .get(&fp)
            .await
            .expect("get should succeed")
            .expect("entry should exist");

        assert_eq!(value, entry);
        assert!((Utc::now() - stored_at).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (tier, _temp_dir) = create_test_tier();
        let fp = make_entry(1, 1, "p", 0).key.fingerprint();
        assert!(tier.get(&fp).await.expect("get should succeed").is_none());
        assert_eq!(tier.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let entry = make_entry(4, 2, "p", 2);
        let fp = entry.key.fingerprint();
        {
            let tier = LmdbTier::open(temp_dir.path(), 10).unwrap();
            tier.set(&fp, &entry).await.unwrap();
        }
        let tier = LmdbTier::open(temp_dir.path(), 10).unwrap();
        assert_eq!(tier.stats().await.entry_count, 1);
        assert!(tier.has(&fp).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_value_reported() {
        let (tier, _temp_dir) = create_test_tier();
        let fp = make_entry(1, 1, "p", 1).key.fingerprint();

        tier.put_raw(&fp, b"short").unwrap();
        assert!(matches!(tier.get(&fp).await, Err(TierError::Corrupt { .. })));

        let mut bytes = Utc::now().timestamp_millis().to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{not json");
        tier.put_raw(&fp, &bytes).unwrap();
        assert!(matches!(tier.get(&fp).await, Err(TierError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_reported() {
        let (tier, _temp_dir) = create_test_tier();
        let entry = make_entry(1, 1, "p", 2);
        let fp = entry.key.fingerprint();

        let mut json = serde_json::to_value(&entry).unwrap();
        json["records"][1]["content"] = serde_json::Value::String("edited".into());
        let mut bytes = Utc::now().timestamp_millis().to_le_bytes().to_vec();
        bytes.extend_from_slice(&serde_json::to_vec(&json).unwrap());
        tier.put_raw(&fp, &bytes).unwrap();

        assert!(matches!(tier.get(&fp).await, Err(TierError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_scoped_clear_by_dates() {
        let (tier, _temp_dir) = create_test_tier();
        for day in 1..=5 {
            let entry = make_entry(day, 1, "p", 1);
            tier.set(&entry.key.fingerprint(), &entry).await.unwrap();
        }

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 4).unwrap(),
        )
        .unwrap();
        assert_eq!(tier.clear(&ClearScope::Dates(range)).await.unwrap(), 3);

        for day in [1, 5] {
            let fp = make_entry(day, 1, "p", 1).key.fingerprint();
            assert!(tier.has(&fp).await.unwrap(), "day {day} should remain");
        }
        for day in 2..=4 {
            let fp = make_entry(day, 1, "p", 1).key.fingerprint();
            assert!(!tier.has(&fp).await.unwrap(), "day {day} should be gone");
        }
        assert_eq!(tier.stats().await.entry_count, 2);
    }

    #[tokio::test]
    async fn test_clear_by_project_and_all() {
        let (tier, _temp_dir) = create_test_tier();
        for (project, tp) in [("alpha", 1), ("alpha", 2), ("beta", 1)] {
            let entry = make_entry(1, tp, project, 1);
            tier.set(&entry.key.fingerprint(), &entry).await.unwrap();
        }

        let removed = tier
            .clear(&ClearScope::Project("alpha".into()))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(tier.clear(&ClearScope::All).await.unwrap(), 1);
        assert_eq!(tier.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn test_project_clear_spares_projects_sharing_the_prefix() {
        let (tier, _temp_dir) = create_test_tier();
        for project in ["alpha", "alpha:x", "alphabet"] {
            let entry = make_entry(1, 1, project, 1);
            tier.set(&entry.key.fingerprint(), &entry).await.unwrap();
        }

        let removed = tier
            .clear(&ClearScope::Project("alpha".into()))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        for project in ["alpha:x", "alphabet"] {
            let fp = make_entry(1, 1, project, 1).key.fingerprint();
            assert!(tier.has(&fp).await.unwrap(), "{project} should remain");
        }
    }
}
