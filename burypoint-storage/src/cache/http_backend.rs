//! HTTP client for the authoritative backend store.
//!
//! The backend owns the source of truth once populated. It is reached over
//! a small JSON API whose responses are wrapped as
//! `{ "success": bool, "data": ..., "message": ... }`.
//!
//! Backend writes are eventually consistent: a successful POST does not
//! guarantee that an immediate GET observes the new value.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use burypoint_core::constants::{
    BACKEND_HEALTH_PATH, BACKEND_PRELOAD_STATUS_PATH, BACKEND_RAW_DATA_PATH,
};
use burypoint_core::{
    BackendConfig, CacheEntry, CacheKey, ClearScope, Fingerprint, TierError, TierKind,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::traits::{CacheStats, CacheTier};

/// Response wrapper used by every backend endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

/// State of the backend's own preload subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadStatus {
    pub running: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cached_days: Option<u64>,
}

/// Backend authoritative store, exposed as a cache tier.
#[derive(Debug)]
pub struct HttpBackendTier {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    stats: RwLock<CacheStats>,
}

impl HttpBackendTier {
    pub fn new(config: &BackendConfig) -> Result<Self, TierError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| TierError::Unavailable {
                tier: TierKind::Backend,
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            stats: RwLock::new(CacheStats::default()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of one day's entry (the project travels as a query parameter).
    fn entry_url(&self, key: &CacheKey) -> String {
        format!(
            "{}{}/{}/{}",
            self.base_url,
            BACKEND_RAW_DATA_PATH,
            key.tracking_point_id,
            key.date_string()
        )
    }

    fn record(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    /// Query the backend preload subsystem.
    pub async fn preload_status(&self) -> Result<PreloadStatus, TierError> {
        let url = format!("{}{}", self.base_url, BACKEND_PRELOAD_STATUS_PATH);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e, false))?;
        if !response.status().is_success() {
            return Err(TierError::Read {
                tier: TierKind::Backend,
                reason: format!("preload status returned HTTP {}", response.status()),
            });
        }
        let envelope: Envelope<PreloadStatus> =
            response.json().await.map_err(|e| TierError::Serialization {
                tier: TierKind::Backend,
                reason: e.to_string(),
            })?;
        Ok(envelope.data.unwrap_or_default())
    }

    /// Map a reqwest failure: unreachable or slow backends are `Unavailable`.
    fn transport_error(&self, e: reqwest::Error, writing: bool) -> TierError {
        self.record(|s| s.errors += 1);
        if e.is_timeout() {
            return TierError::Unavailable {
                tier: TierKind::Backend,
                reason: format!("timed out after {:?}", self.timeout),
            };
        }
        if e.is_connect() {
            return TierError::Unavailable {
                tier: TierKind::Backend,
                reason: e.to_string(),
            };
        }
        if writing {
            TierError::Write {
                tier: TierKind::Backend,
                reason: e.to_string(),
            }
        } else {
            TierError::Read {
                tier: TierKind::Backend,
                reason: e.to_string(),
            }
        }
    }
}

fn decode_key(fingerprint: &Fingerprint) -> Result<CacheKey, TierError> {
    Fingerprint::decode(fingerprint.as_str()).ok_or_else(|| TierError::Read {
        tier: TierKind::Backend,
        reason: format!("undecodable fingerprint {fingerprint}"),
    })
}

/// Interpret a raw-data GET body. A successful envelope without data is absent.
fn parse_entry_body(body: &[u8]) -> Result<Option<CacheEntry>, TierError> {
    let envelope: Envelope<CacheEntry> =
        serde_json::from_slice(body).map_err(|e| TierError::Serialization {
            tier: TierKind::Backend,
            reason: e.to_string(),
        })?;
    if !envelope.success {
        return Err(TierError::Read {
            tier: TierKind::Backend,
            reason: envelope
                .message
                .unwrap_or_else(|| "backend reported failure".to_string()),
        });
    }
    Ok(envelope.data)
}

#[async_trait]
impl CacheTier for HttpBackendTier {
    fn kind(&self) -> TierKind {
        TierKind::Backend
    }

    async fn get(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<(CacheEntry, DateTime<Utc>)>, TierError> {
        let key = decode_key(fingerprint)?;
        let response = self
            .client
            .get(self.entry_url(&key))
            .query(&[("projectId", key.project_id.as_str())])
            .send()
            .await
            .map_err(|e| self.transport_error(e, false))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            self.record(|s| s.misses += 1);
            return Ok(None);
        }
        if !status.is_success() {
            self.record(|s| s.errors += 1);
            return Err(TierError::Read {
                tier: TierKind::Backend,
                reason: format!("HTTP {status}"),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e, false))?;
        match parse_entry_body(&body)? {
            Some(entry) if entry.key == key => {
                self.record(|s| s.hits += 1);
                let updated_at = entry.updated_at;
                Ok(Some((entry, updated_at)))
            }
            Some(_) => {
                self.record(|s| s.errors += 1);
                Err(TierError::Corrupt {
                    tier: TierKind::Backend,
                    fingerprint: fingerprint.to_string(),
                })
            }
            None => {
                self.record(|s| s.misses += 1);
                Ok(None)
            }
        }
    }

    async fn set(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), TierError> {
        let key = decode_key(fingerprint)?;
        let response = self
            .client
            .post(self.entry_url(&key))
            .query(&[("projectId", key.project_id.as_str())])
            .json(entry)
            .send()
            .await
            .map_err(|e| self.transport_error(e, true))?;

        let status = response.status();
        if !status.is_success() {
            self.record(|s| s.errors += 1);
            return Err(TierError::Write {
                tier: TierKind::Backend,
                reason: format!("HTTP {status}"),
            });
        }
        let envelope: Envelope<serde_json::Value> =
            response.json().await.map_err(|e| TierError::Serialization {
                tier: TierKind::Backend,
                reason: e.to_string(),
            })?;
        if !envelope.success {
            self.record(|s| s.errors += 1);
            return Err(TierError::Write {
                tier: TierKind::Backend,
                reason: envelope
                    .message
                    .unwrap_or_else(|| "backend rejected write".to_string()),
            });
        }
        Ok(())
    }

    /// The backend exposes no deletion endpoint; clearing leaves it untouched.
    async fn clear(&self, scope: &ClearScope) -> Result<u64, TierError> {
        tracing::debug!(?scope, "Backend tier keeps its data on clear");
        Ok(0)
    }

    async fn stats(&self) -> CacheStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    async fn ping(&self) -> Result<(), TierError> {
        let url = format!("{}{}", self.base_url, BACKEND_HEALTH_PATH);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e, false))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TierError::Unavailable {
                tier: TierKind::Backend,
                reason: format!("health check returned HTTP {}", response.status()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burypoint_core::RawRecord;
    use chrono::NaiveDate;

    fn tier(base_url: &str) -> HttpBackendTier {
        HttpBackendTier::new(&BackendConfig {
            base_url: base_url.to_string(),
            timeout_ms: 500,
        })
        .unwrap()
    }

    fn key() -> CacheKey {
        CacheKey::new(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(), 42, "proj")
    }

    #[test]
    fn test_entry_url() {
        let tier = tier("http://localhost:3001/");
        assert_eq!(
            tier.entry_url(&key()),
            "http://localhost:3001/api/cache/raw-data/42/2025-03-07"
        );
    }

    #[test]
    fn test_parse_entry_body() {
        let entry = CacheEntry::new(
            key(),
            vec![RawRecord::new("click", "home", "c", "v", "t")],
            Utc::now(),
            false,
        );
        let body = serde_json::to_vec(&serde_json::json!({
            "success": true,
            "data": entry,
        }))
        .unwrap();
        let parsed = parse_entry_body(&body).unwrap().unwrap();
        assert_eq!(parsed.record_count(), 1);

        let empty = br#"{"success": true, "data": null}"#;
        assert!(parse_entry_body(empty).unwrap().is_none());

        let no_data = br#"{"success": true}"#;
        assert!(parse_entry_body(no_data).unwrap().is_none());

        let failed = br#"{"success": false, "message": "db down"}"#;
        assert!(matches!(
            parse_entry_body(failed),
            Err(TierError::Read { reason, .. }) if reason == "db down"
        ));
    }

    #[test]
    fn test_preload_status_decoding() {
        let raw = r#"{"success": true, "data": {"running": true, "cachedDays": 6}}"#;
        let envelope: Envelope<PreloadStatus> = serde_json::from_str(raw).unwrap();
        let status = envelope.data.unwrap();
        assert!(status.running);
        assert_eq!(status.cached_days, Some(6));
        assert!(status.last_run_at.is_none());
    }

    #[tokio::test]
    async fn test_clear_is_noop() {
        let tier = tier("http://127.0.0.1:9");
        assert_eq!(tier.clear(&ClearScope::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let tier = tier("http://127.0.0.1:9");
        assert!(matches!(
            tier.ping().await,
            Err(TierError::Unavailable { .. })
        ));
        let fp = key().fingerprint();
        assert!(matches!(
            tier.get(&fp).await,
            Err(TierError::Unavailable { .. })
        ));
    }
}
