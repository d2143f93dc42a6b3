//! Vendor search API client with rate limiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use burypoint_core::constants::{SEARCH_PATH, SOURCE_SUCCESS_CODE};
use burypoint_core::{RawRecord, RemoteAnalyticsSource, SearchRequest, SourceConfig, SourceError};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Semaphore;

/// Searches allowed in flight at once.
const MAX_IN_FLIGHT: u32 = 4;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<SearchData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    #[serde(default)]
    data_list: Vec<RawRecord>,
}

/// HTTP client for `POST /tracker/buryPointTest/search`.
pub struct BuryPointClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    rate_limiter: Arc<Semaphore>,
    last_request: Arc<AtomicU64>,
    min_request_interval_ms: u64,
    start_time: Instant,
}

impl BuryPointClient {
    /// Create a client from the `[source]` configuration.
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let rpm = config.requests_per_minute.max(1);
        let min_interval_ms = (60_000 / rpm as u64).max(10);
        let timeout = config.timeout();

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Network {
                endpoint: SEARCH_PATH.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            timeout,
            rate_limiter: Arc::new(Semaphore::new(rpm.min(MAX_IN_FLIGHT) as usize)),
            last_request: Arc::new(AtomicU64::new(0)),
            min_request_interval_ms: min_interval_ms,
            start_time: Instant::now(),
        })
    }

    /// Wait for a permit and the minimum spacing between requests.
    async fn throttle(&self) -> Result<tokio::sync::SemaphorePermit<'_>, SourceError> {
        let permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| SourceError::Network {
                endpoint: SEARCH_PATH.to_string(),
                reason: format!("rate limiter closed: {e}"),
            })?;

        let now_ms = self.start_time.elapsed().as_millis() as u64;
        let last_ms = self.last_request.load(Ordering::Relaxed);
        let elapsed = now_ms.saturating_sub(last_ms);
        if last_ms != 0 && elapsed < self.min_request_interval_ms {
            tokio::time::sleep(Duration::from_millis(self.min_request_interval_ms - elapsed)).await;
        }
        self.last_request.store(
            self.start_time.elapsed().as_millis().max(1) as u64,
            Ordering::Relaxed,
        );
        Ok(permit)
    }

    fn transport_error(&self, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::Timeout {
                endpoint: SEARCH_PATH.to_string(),
                after: self.timeout,
            }
        } else {
            SourceError::Network {
                endpoint: SEARCH_PATH.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// Interpret a search response.
///
/// HTTP 401/403 and application codes 401/403 are authentication failures;
/// any other non-200 application code is an API error.
fn parse_search_response(status: StatusCode, body: &[u8]) -> Result<Vec<RawRecord>, SourceError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SourceError::Auth {
            endpoint: SEARCH_PATH.to_string(),
            reason: format!("HTTP {status}"),
        });
    }
    if !status.is_success() {
        return Err(SourceError::Api {
            endpoint: SEARCH_PATH.to_string(),
            code: i64::from(status.as_u16()),
            msg: String::from_utf8_lossy(body).chars().take(200).collect(),
        });
    }

    let response: SearchResponse =
        serde_json::from_slice(body).map_err(|e| SourceError::InvalidResponse {
            endpoint: SEARCH_PATH.to_string(),
            reason: e.to_string(),
        })?;

    match response.code {
        SOURCE_SUCCESS_CODE => Ok(response.data.map(|d| d.data_list).unwrap_or_default()),
        401 | 403 => Err(SourceError::Auth {
            endpoint: SEARCH_PATH.to_string(),
            reason: response.msg,
        }),
        code => Err(SourceError::Api {
            endpoint: SEARCH_PATH.to_string(),
            code,
            msg: response.msg,
        }),
    }
}

#[async_trait]
impl RemoteAnalyticsSource for BuryPointClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<RawRecord>, SourceError> {
        let _permit = self.throttle().await?;

        let url = format!("{}{}", self.base_url, SEARCH_PATH);
        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;

        let records = parse_search_response(status, &body)?;
        tracing::trace!(
            tracking_point_id = request.selected_point_id,
            date = %request.date,
            page = request.page,
            records = records.len(),
            "Search page fetched"
        );
        Ok(records)
    }
}

impl std::fmt::Debug for BuryPointClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuryPointClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("min_request_interval_ms", &self.min_request_interval_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json).unwrap()
    }

    #[test]
    fn test_success_returns_data_list() {
        let raw = body(serde_json::json!({
            "code": 200,
            "msg": "ok",
            "data": { "dataList": [
                { "type": "visit", "pageName": "index", "content": "a", "visitorId": "v1", "createdAt": "t" },
                { "type": "click", "pageName": "cart", "content": "b", "visitorId": "v2", "createdAt": "t" }
            ]}
        }));
        let records = parse_search_response(StatusCode::OK, &raw).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].page_name, "cart");
    }

    #[test]
    fn test_missing_data_is_empty() {
        let raw = body(serde_json::json!({ "code": 200, "msg": "ok" }));
        assert!(parse_search_response(StatusCode::OK, &raw).unwrap().is_empty());
    }

    #[test]
    fn test_auth_failures() {
        assert!(matches!(
            parse_search_response(StatusCode::UNAUTHORIZED, b""),
            Err(SourceError::Auth { .. })
        ));
        let raw = body(serde_json::json!({ "code": 403, "msg": "token expired" }));
        assert!(matches!(
            parse_search_response(StatusCode::OK, &raw),
            Err(SourceError::Auth { reason, .. }) if reason == "token expired"
        ));
    }

    #[test]
    fn test_application_error_code() {
        let raw = body(serde_json::json!({ "code": 500, "msg": "busy" }));
        assert!(matches!(
            parse_search_response(StatusCode::OK, &raw),
            Err(SourceError::Api { code: 500, .. })
        ));
    }

    #[test]
    fn test_malformed_body() {
        assert!(matches!(
            parse_search_response(StatusCode::OK, b"<html>"),
            Err(SourceError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_token() {
        let client = BuryPointClient::new(&SourceConfig {
            base_url: "https://tracker.example.com".into(),
            project_id: "p".into(),
            token: Some("super-secret".into()),
            ..Default::default()
        })
        .unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }
}
