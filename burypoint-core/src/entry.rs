//! Raw analytics records and the cache entry that owns them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::key::CacheKey;

/// One raw event record as returned by the vendor search endpoint.
///
/// Fields the engine does not interpret are preserved verbatim in `extra`
/// so a cached record re-serializes to what the vendor sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    /// Event type tag (page visit, button click, ...).
    #[serde(rename = "type", default)]
    pub event_type: String,
    /// Page identifier.
    #[serde(default)]
    pub page_name: String,
    /// Free-text content.
    #[serde(default)]
    pub content: String,
    /// Anonymized visitor identifier.
    #[serde(default)]
    pub visitor_id: String,
    /// Creation timestamp as reported by the vendor.
    #[serde(default)]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new(
        event_type: impl Into<String>,
        page_name: impl Into<String>,
        content: impl Into<String>,
        visitor_id: impl Into<String>,
        created_at: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            page_name: page_name.into(),
            content: content.into(),
            visitor_id: visitor_id.into(),
            created_at: created_at.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Data-quality tag attached to every cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    /// Fetch completed and returned records.
    Good,
    /// Fetch completed and the day genuinely has no records.
    NoData,
    /// Fetch stopped at the page cap; more records may exist.
    Partial,
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Good => "good",
            Self::NoData => "no_data",
            Self::Partial => "partial",
        };
        f.write_str(label)
    }
}

/// Storage layer an entry was read from or written by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// In-process memory cache.
    Memory,
    /// Durable key/value storage local to this process.
    DurableLocal,
    /// Authoritative backend-resident store.
    Backend,
    /// The vendor Remote Analytics Source (not a cache tier).
    Remote,
}

impl TierKind {
    /// Cache tiers in read order, fastest first.
    pub const READ_ORDER: [TierKind; 3] = [Self::Memory, Self::DurableLocal, Self::Backend];

    /// Cache tiers in write-through order, authoritative first.
    pub const WRITE_ORDER: [TierKind; 3] = [Self::Backend, Self::DurableLocal, Self::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::DurableLocal => "durable_local",
            Self::Backend => "backend",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One day's raw records for one tracking point, plus metadata.
///
/// Count, quality and checksum are derived from the records at construction
/// and cannot be set independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: CacheKey,
    records: Vec<RawRecord>,
    record_count: usize,
    /// When the records were fetched from the Remote Analytics Source.
    pub fetched_at: DateTime<Utc>,
    /// Last time the authoritative copy was (re)computed.
    pub updated_at: DateTime<Utc>,
    /// Tier that produced this copy.
    pub source: TierKind,
    quality: DataQuality,
    /// Hex SHA-256 of the serialized records.
    checksum: String,
}

impl CacheEntry {
    /// Build an entry from a completed fetch.
    ///
    /// `truncated` marks a fetch that stopped at the page cap.
    pub fn new(
        key: CacheKey,
        records: Vec<RawRecord>,
        fetched_at: DateTime<Utc>,
        truncated: bool,
    ) -> Self {
        let quality = if truncated {
            DataQuality::Partial
        } else if records.is_empty() {
            DataQuality::NoData
        } else {
            DataQuality::Good
        };
        let checksum = compute_checksum(&records);
        Self {
            key,
            record_count: records.len(),
            records,
            fetched_at,
            updated_at: fetched_at,
            source: TierKind::Remote,
            quality,
            checksum,
        }
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RawRecord> {
        self.records
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn quality(&self) -> DataQuality {
        self.quality
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Quality `good` and `no_data` are authoritative; `partial` is not.
    pub fn is_authoritative(&self) -> bool {
        matches!(self.quality, DataQuality::Good | DataQuality::NoData)
    }

    /// Check that the stored count and checksum still match the records.
    pub fn verify(&self) -> bool {
        self.record_count == self.records.len() && self.checksum == compute_checksum(&self.records)
    }

    /// Copy of this entry labelled as held by `tier`.
    pub fn held_by(&self, tier: TierKind) -> Self {
        let mut copy = self.clone();
        copy.source = tier;
        copy
    }
}

/// Compute the hex SHA-256 of a record sequence.
pub fn compute_checksum(records: &[RawRecord]) -> String {
    let mut hasher = Sha256::new();
    for record in records {
        // serde_json never fails on this type (string keys only)
        if let Ok(bytes) = serde_json::to_vec(record) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
