//! Provenance of cache reads.
//!
//! A [`CacheRead`] wraps a value together with the tier that served it and
//! when that tier stored it, so callers can tell a memory hit from a backend
//! hit without a second lookup.

use burypoint_core::TierKind;
use chrono::{DateTime, Utc};

/// Result of a cache read, carrying where and when the value was cached.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    /// When the serving tier stored this value.
    cached_at: DateTime<Utc>,
    /// Tier that served the read.
    served_by: TierKind,
}

impl<T> CacheRead<T> {
    /// A hit served by a cache tier.
    pub fn from_tier(value: T, cached_at: DateTime<Utc>, tier: TierKind) -> Self {
        Self {
            value,
            cached_at,
            served_by: tier,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    pub fn served_by(&self) -> TierKind {
        self.served_by
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_read_from_tier() {
        let cached_at = Utc::now();
        let read = CacheRead::from_tier("value", cached_at, TierKind::DurableLocal);

        assert_eq!(read.served_by(), TierKind::DurableLocal);
        assert_eq!(read.cached_at(), cached_at);
        assert_eq!(*read.value(), "value");
        assert_eq!(read.into_value(), "value");
    }
}
