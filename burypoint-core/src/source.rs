//! Remote Analytics Source contract.
//!
//! The vendor search endpoint is paginated by (project, tracking point, date,
//! page). This module defines the request body and the trait every source
//! implementation (HTTP client or test double) provides.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entry::RawRecord;
use crate::error::SourceError;
use crate::key::CacheKey;

/// Sort order requested from the vendor (newest first).
const DEFAULT_ORDER: &str = "desc";

/// Body of `POST /tracker/buryPointTest/search`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub project_id: String,
    pub selected_point_id: i64,
    pub data_type: String,
    pub filter_list: Vec<serde_json::Value>,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
    pub order: String,
    /// Calendar day, `YYYY-MM-DD`.
    pub date: String,
    pub calc_info: serde_json::Map<String, serde_json::Value>,
}

impl SearchRequest {
    /// Request one page of one day's records.
    pub fn for_day(key: &CacheKey, page: u32, page_size: u32, data_type: &str) -> Self {
        Self {
            project_id: key.project_id.clone(),
            selected_point_id: key.tracking_point_id,
            data_type: data_type.to_string(),
            filter_list: Vec::new(),
            page: page.max(1),
            page_size,
            order: DEFAULT_ORDER.to_string(),
            date: key.date_string(),
            calc_info: serde_json::Map::new(),
        }
    }
}

/// A paginated source of raw records.
///
/// Implementations must treat the source as unreliable: every failure is
/// reported as a [`SourceError`] so callers can decide whether to retry.
#[async_trait]
pub trait RemoteAnalyticsSource: Send + Sync {
    /// Fetch one page. A page shorter than `page_size` is the last one.
    async fn search(&self, request: &SearchRequest) -> Result<Vec<RawRecord>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_search_request_wire_format() {
        let key = CacheKey::new(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(), 12, "proj-9");
        let req = SearchRequest::for_day(&key, 2, 1000, "list");
        let json = serde_json::to_value(&req).unwrap();

        assert_eq!(json["projectId"], "proj-9");
        assert_eq!(json["selectedPointId"], 12);
        assert_eq!(json["page"], 2);
        assert_eq!(json["pageSize"], 1000);
        assert_eq!(json["order"], "desc");
        assert_eq!(json["date"], "2025-03-07");
        assert_eq!(json["filterList"], serde_json::json!([]));
        assert_eq!(json["calcInfo"], serde_json::json!({}));
    }

    #[test]
    fn test_pages_start_at_one() {
        let key = CacheKey::new(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(), 1, "p");
        assert_eq!(SearchRequest::for_day(&key, 0, 10, "list").page, 1);
    }
}
