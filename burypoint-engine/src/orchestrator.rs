//! Preload/Fetch Orchestrator
//!
//! Resolves a date range and tracking point into per-day fetches. Each day is
//! served from the tiered cache when an authoritative entry exists, otherwise
//! fetched page by page from the Remote Analytics Source and written through
//! every tier before it is returned.
//!
//! Per-day failures are collected into a [`RangeReport`] instead of aborting
//! the range. The one exception is an authentication failure: every later day
//! would fail the same way, so the range stops there and the error reaches
//! the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use burypoint_core::{
    BuryPointConfig, BuryPointError, BuryPointResult, CacheEntry, CacheKey, DataQuality,
    DateRange, DiagnosticError, RawRecord, RemoteAnalyticsSource, SearchRequest, SourceError,
    TierError, TierKind,
};
use burypoint_storage::TieredCacheStore;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cancel::{CancelFlag, RunGuard};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Settings the orchestrator needs from the `[source]` and `[preload]` sections.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub project_id: String,
    pub data_type: String,
    pub page_size: u32,
    /// Pages fetched per day before the result is marked partial.
    pub max_pages: u32,
    pub preload_window_days: u32,
    /// Tracking points warmed when a preload names none.
    pub preload_tracking_point_ids: Vec<i64>,
}

impl OrchestratorConfig {
    pub fn from_config(config: &BuryPointConfig) -> Self {
        Self {
            project_id: config.source.project_id.clone(),
            data_type: config.source.data_type.clone(),
            page_size: config.source.page_size.max(1),
            max_pages: config.source.max_pages.max(1),
            preload_window_days: config.preload.window_days,
            preload_tracking_point_ids: config.preload.tracking_point_ids.clone(),
        }
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Whether a load may be served from cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Use an authoritative cached entry when one exists.
    CacheFirst,
    /// Ignore every tier and fetch from the source.
    BypassCache,
}

/// One day's records and where they came from.
#[derive(Debug, Clone)]
pub struct DayData {
    /// Tier that served the day, `Remote` for a fresh fetch.
    pub served_from: TierKind,
    pub quality: DataQuality,
    pub records: Vec<RawRecord>,
    pub fetched_at: DateTime<Utc>,
    /// Set when a fresh fetch could not be written to every tier.
    pub write_error: Option<TierError>,
}

impl DayData {
    pub fn from_cache(&self) -> bool {
        self.served_from != TierKind::Remote
    }
}

/// Outcome of loading one day.
#[derive(Debug, Clone)]
pub struct DayOutcome {
    pub key: CacheKey,
    pub result: Result<DayData, BuryPointError>,
}

/// Per-day results of a range load, in date order.
#[derive(Debug, Clone)]
pub struct RangeReport {
    pub range: DateRange,
    pub tracking_point_id: i64,
    pub days: Vec<DayOutcome>,
    /// The load stopped early on a cancel request.
    pub cancelled: bool,
}

impl RangeReport {
    /// Records of every successful day, in date order.
    pub fn records(&self) -> impl Iterator<Item = &RawRecord> {
        self.days
            .iter()
            .filter_map(|d| d.result.as_ref().ok())
            .flat_map(|d| d.records.iter())
    }

    pub fn into_records(self) -> Vec<RawRecord> {
        self.days
            .into_iter()
            .filter_map(|d| d.result.ok())
            .flat_map(|d| d.records)
            .collect()
    }

    pub fn failed_days(&self) -> impl Iterator<Item = &DayOutcome> {
        self.days.iter().filter(|d| d.result.is_err())
    }

    pub fn loaded_days(&self) -> usize {
        self.days.iter().filter(|d| d.result.is_ok()).count()
    }

    pub fn cache_hits(&self) -> usize {
        self.days
            .iter()
            .filter(|d| matches!(&d.result, Ok(data) if data.from_cache()))
            .count()
    }

    /// The authentication failure that aborted the range, if any.
    pub fn auth_failure(&self) -> Option<&BuryPointError> {
        self.days
            .iter()
            .filter_map(|d| d.result.as_ref().err())
            .find(|e| e.is_auth())
    }
}

/// Totals of one preload run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadSummary {
    pub range: DateRange,
    pub tracking_points: usize,
    pub days_loaded: usize,
    pub days_from_cache: usize,
    pub days_failed: usize,
    pub cancelled: bool,
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
struct FetchMetrics {
    day_fetches: AtomicU64,
    pages_fetched: AtomicU64,
    cache_hits: AtomicU64,
    day_failures: AtomicU64,
}

/// Counters since the orchestrator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Days fetched from the source.
    pub day_fetches: u64,
    /// Search requests issued.
    pub pages_fetched: u64,
    pub cache_hits: u64,
    pub day_failures: u64,
}

impl FetchMetrics {
    fn snapshot(&self) -> FetchStats {
        FetchStats {
            day_fetches: self.day_fetches.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            day_failures: self.day_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct FetchOrchestrator {
    store: Arc<TieredCacheStore>,
    source: Arc<dyn RemoteAnalyticsSource>,
    config: OrchestratorConfig,
    preloading: AtomicBool,
    metrics: FetchMetrics,
}

impl std::fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("config", &self.config)
            .field("preloading", &self.is_preloading())
            .finish_non_exhaustive()
    }
}

impl FetchOrchestrator {
    pub fn new(
        store: Arc<TieredCacheStore>,
        source: Arc<dyn RemoteAnalyticsSource>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
            preloading: AtomicBool::new(false),
            metrics: FetchMetrics::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TieredCacheStore> {
        &self.store
    }

    /// Key of one day for this orchestrator's project.
    pub fn key_for(&self, date: chrono::NaiveDate, tracking_point_id: i64) -> CacheKey {
        CacheKey::new(date, tracking_point_id, self.config.project_id.clone())
    }

    /// Records for every day of `range`, best effort.
    ///
    /// Days that fail are logged and left out. Only an authentication
    /// failure is returned as an error.
    pub async fn get_multi_day_cached_data(
        &self,
        range: &DateRange,
        tracking_point_id: i64,
    ) -> BuryPointResult<Vec<RawRecord>> {
        let report = self
            .load_range(range, tracking_point_id, FetchMode::CacheFirst, &CancelFlag::new())
            .await;
        if let Some(err) = report.auth_failure() {
            return Err(err.clone());
        }
        Ok(report.into_records())
    }

    /// Load every day of `range` and report each day's outcome.
    pub async fn load_range(
        &self,
        range: &DateRange,
        tracking_point_id: i64,
        mode: FetchMode,
        cancel: &CancelFlag,
    ) -> RangeReport {
        let mut report = RangeReport {
            range: *range,
            tracking_point_id,
            days: Vec::with_capacity(range.len()),
            cancelled: false,
        };

        for date in range.days() {
            if cancel.is_cancelled() {
                info!(%range, tracking_point_id, loaded = report.days.len(), "Range load cancelled");
                report.cancelled = true;
                break;
            }

            let key = self.key_for(date, tracking_point_id);
            let result = self.load_day(&key, mode).await;
            let auth_failed = matches!(&result, Err(e) if e.is_auth());
            if let Err(e) = &result {
                warn!(
                    date = %key.date_string(),
                    tracking_point_id,
                    error = %e,
                    "Day load failed, continuing with remaining days"
                );
            }
            report.days.push(DayOutcome { key, result });

            if auth_failed {
                warn!(%range, tracking_point_id, "Authentication rejected, aborting range");
                break;
            }
        }

        debug!(
            %range,
            tracking_point_id,
            loaded = report.loaded_days(),
            failed = report.failed_days().count(),
            cache_hits = report.cache_hits(),
            "Range load finished"
        );
        report
    }

    /// Load one day, from cache when allowed.
    ///
    /// Callers for the same key serialize on the store's key lock and the
    /// cache is checked again once the lock is held, so concurrent loads of
    /// one day cost a single fetch.
    pub async fn load_day(&self, key: &CacheKey, mode: FetchMode) -> BuryPointResult<DayData> {
        let fingerprint = key.fingerprint();

        if mode == FetchMode::CacheFirst {
            if let Some(hit) = self.cached(key).await {
                return Ok(hit);
            }
        }

        let _guard = self.store.lock_key(&fingerprint).await;

        if mode == FetchMode::CacheFirst {
            if let Some(hit) = self.cached(key).await {
                return Ok(hit);
            }
        }

        let entry = match self.fetch_day(key).await {
            Ok(entry) => entry,
            Err(e) => {
                self.metrics.day_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let write_error = self.store.set(&fingerprint, &entry).await.err();
        if let Some(e) = &write_error {
            warn!(%fingerprint, error = %e, "Fetched day not written to every tier");
        }

        Ok(DayData {
            served_from: TierKind::Remote,
            quality: entry.quality(),
            fetched_at: entry.fetched_at,
            records: entry.into_records(),
            write_error,
        })
    }

    /// Fetch one day from the source and write it through, ignoring the cache.
    pub async fn refetch_day(&self, key: &CacheKey) -> BuryPointResult<DayData> {
        self.load_day(key, FetchMode::BypassCache).await
    }

    async fn cached(&self, key: &CacheKey) -> Option<DayData> {
        let hit = self.store.get(&key.fingerprint()).await?;
        let served_from = hit.served_by();
        debug!(
            fingerprint = %key.fingerprint(),
            tier = %served_from,
            cached_at = %hit.cached_at(),
            "Cache hit"
        );
        let entry = hit.into_value();
        if !entry.is_authoritative() {
            debug!(fingerprint = %key.fingerprint(), quality = %entry.quality(), "Cached entry is partial, refetching");
            return None;
        }
        self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
        Some(DayData {
            served_from,
            quality: entry.quality(),
            fetched_at: entry.fetched_at,
            records: entry.into_records(),
            write_error: None,
        })
    }

    /// Page through one day until a short page or the page cap.
    async fn fetch_day(&self, key: &CacheKey) -> Result<CacheEntry, SourceError> {
        self.metrics.day_fetches.fetch_add(1, Ordering::Relaxed);
        let page_size = self.config.page_size;
        let mut records = Vec::new();

        for page in 1..=self.config.max_pages {
            let request = SearchRequest::for_day(key, page, page_size, &self.config.data_type);
            let batch = self.source.search(&request).await?;
            self.metrics.pages_fetched.fetch_add(1, Ordering::Relaxed);

            let last_page = batch.len() < page_size as usize;
            records.extend(batch);
            if last_page {
                debug!(
                    date = %key.date_string(),
                    tracking_point_id = key.tracking_point_id,
                    pages = page,
                    records = records.len(),
                    "Day fetched"
                );
                return Ok(CacheEntry::new(key.clone(), records, Utc::now(), false));
            }
        }

        warn!(
            date = %key.date_string(),
            tracking_point_id = key.tracking_point_id,
            max_pages = self.config.max_pages,
            records = records.len(),
            "Page cap reached, storing day as partial"
        );
        Ok(CacheEntry::new(key.clone(), records, Utc::now(), true))
    }

    /// Warm the cache for the trailing preload window.
    ///
    /// An empty `tracking_point_ids` falls back to the configured preload set.
    /// Only one preload runs at a time; a second call gets `PreloadConflict`.
    pub async fn trigger_manual_preload(
        &self,
        tracking_point_ids: &[i64],
        cancel: &CancelFlag,
    ) -> BuryPointResult<PreloadSummary> {
        let _running =
            RunGuard::acquire(&self.preloading).ok_or(DiagnosticError::PreloadConflict)?;

        let tracking_points = if tracking_point_ids.is_empty() {
            self.config.preload_tracking_point_ids.as_slice()
        } else {
            tracking_point_ids
        };
        let range = DateRange::trailing(Utc::now().date_naive(), self.config.preload_window_days);
        info!(%range, tracking_points = tracking_points.len(), "Manual preload started");

        let mut summary = PreloadSummary {
            range,
            tracking_points: tracking_points.len(),
            days_loaded: 0,
            days_from_cache: 0,
            days_failed: 0,
            cancelled: false,
        };

        for &tracking_point_id in tracking_points {
            let report = self
                .load_range(&range, tracking_point_id, FetchMode::CacheFirst, cancel)
                .await;
            summary.days_loaded += report.loaded_days();
            summary.days_from_cache += report.cache_hits();
            summary.days_failed += report.failed_days().count();

            if let Some(err) = report.auth_failure() {
                return Err(err.clone());
            }
            if report.cancelled {
                summary.cancelled = true;
                break;
            }
        }

        info!(
            %range,
            loaded = summary.days_loaded,
            from_cache = summary.days_from_cache,
            failed = summary.days_failed,
            cancelled = summary.cancelled,
            "Manual preload finished"
        );
        Ok(summary)
    }

    pub fn is_preloading(&self) -> bool {
        self.preloading.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> FetchStats {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burypoint_test_utils::fixtures::{self, day, PROJECT};
    use burypoint_test_utils::{MockSource, TestStore};
    use std::time::Duration;

    fn config(page_size: u32, max_pages: u32) -> OrchestratorConfig {
        OrchestratorConfig {
            project_id: PROJECT.to_string(),
            data_type: "list".to_string(),
            page_size,
            max_pages,
            preload_window_days: 3,
            preload_tracking_point_ids: vec![1],
        }
    }

    fn orchestrator(
        ts: &TestStore,
        source: Arc<MockSource>,
        page_size: u32,
        max_pages: u32,
    ) -> FetchOrchestrator {
        FetchOrchestrator::new(ts.store.clone(), source, config(page_size, max_pages))
    }

    #[tokio::test]
    async fn test_paginates_until_short_page() {
        let ts = TestStore::new();
        let source = Arc::new(MockSource::new().with_day(1, day(2025, 3, 1), 25));
        let orch = orchestrator(&ts, source.clone(), 10, 50);

        let data = orch
            .load_day(&fixtures::key(day(2025, 3, 1), 1), FetchMode::CacheFirst)
            .await
            .unwrap();
        assert_eq!(data.records.len(), 25);
        assert_eq!(data.quality, DataQuality::Good);
        assert_eq!(data.served_from, TierKind::Remote);
        assert_eq!(source.calls(), 3);
        assert_eq!(orch.stats().pages_fetched, 3);
    }

    #[tokio::test]
    async fn test_exact_multiple_needs_empty_page() {
        let ts = TestStore::new();
        let source = Arc::new(MockSource::new().with_day(1, day(2025, 3, 1), 20));
        let orch = orchestrator(&ts, source.clone(), 10, 50);

        let data = orch
            .load_day(&fixtures::key(day(2025, 3, 1), 1), FetchMode::CacheFirst)
            .await
            .unwrap();
        assert_eq!(data.records.len(), 20);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_page_cap_marks_partial_and_refetches() {
        let ts = TestStore::new();
        let source = Arc::new(MockSource::new().with_day(1, day(2025, 3, 1), 50));
        let orch = orchestrator(&ts, source.clone(), 10, 2);
        let key = fixtures::key(day(2025, 3, 1), 1);

        let data = orch.load_day(&key, FetchMode::CacheFirst).await.unwrap();
        assert_eq!(data.quality, DataQuality::Partial);
        assert_eq!(data.records.len(), 20);

        // Partial entries are cached but never served as authoritative.
        orch.load_day(&key, FetchMode::CacheFirst).await.unwrap();
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn test_empty_day_is_cached_as_no_data() {
        let ts = TestStore::new();
        let source = Arc::new(MockSource::new());
        let orch = orchestrator(&ts, source.clone(), 10, 5);
        let key = fixtures::key(day(2025, 3, 1), 1);

        let first = orch.load_day(&key, FetchMode::CacheFirst).await.unwrap();
        assert_eq!(first.quality, DataQuality::NoData);

        let second = orch.load_day(&key, FetchMode::CacheFirst).await.unwrap();
        assert!(second.from_cache());
        assert_eq!(second.quality, DataQuality::NoData);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_bypass_ignores_cache() {
        let ts = TestStore::new();
        let key = fixtures::key(day(2025, 3, 1), 1);
        ts.seed(TierKind::Memory, &fixtures::entry(key.clone(), 3)).await;
        let source = Arc::new(MockSource::new().with_day(1, day(2025, 3, 1), 7));
        let orch = orchestrator(&ts, source.clone(), 10, 5);

        let data = orch.refetch_day(&key).await.unwrap();
        assert_eq!(data.records.len(), 7);
        assert_eq!(source.calls(), 1);

        let cached = ts.store.get(&key.fingerprint()).await.unwrap();
        assert_eq!(cached.value().record_count(), 7);
    }

    #[tokio::test]
    async fn test_write_failure_still_returns_data() {
        let ts = TestStore::new();
        ts.backend.fail_writes(true);
        let source = Arc::new(MockSource::new().with_day(1, day(2025, 3, 1), 4));
        let orch = orchestrator(&ts, source, 10, 5);

        let data = orch
            .load_day(&fixtures::key(day(2025, 3, 1), 1), FetchMode::CacheFirst)
            .await
            .unwrap();
        assert_eq!(data.records.len(), 4);
        assert!(matches!(
            data.write_error,
            Some(TierError::WriteThrough { ref failed }) if failed == &[TierKind::Backend]
        ));
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_range() {
        let ts = TestStore::new();
        let source = Arc::new(MockSource::new());
        source.reject_auth(true);
        let orch = orchestrator(&ts, source.clone(), 10, 5);
        let range = DateRange::new(day(2025, 3, 1), day(2025, 3, 5)).unwrap();

        let report = orch
            .load_range(&range, 1, FetchMode::CacheFirst, &CancelFlag::new())
            .await;
        assert_eq!(report.days.len(), 1);
        assert!(report.auth_failure().is_some());
        assert_eq!(source.calls(), 1);

        let err = orch.get_multi_day_cached_data(&range, 1).await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_cancel_stops_between_days() {
        let ts = TestStore::new();
        let source = Arc::new(MockSource::new());
        let orch = orchestrator(&ts, source, 10, 5);
        let range = DateRange::new(day(2025, 3, 1), day(2025, 3, 5)).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let report = orch.load_range(&range, 1, FetchMode::CacheFirst, &cancel).await;
        assert!(report.cancelled);
        assert!(report.days.is_empty());
    }

    #[tokio::test]
    async fn test_preload_uses_configured_points_and_rejects_overlap() {
        let ts = TestStore::new();
        let source = Arc::new(MockSource::new());
        source.set_latency(Duration::from_millis(20));
        let orch = Arc::new(orchestrator(&ts, source, 10, 5));

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.trigger_manual_preload(&[], &CancelFlag::new()).await })
        };
        while !orch.is_preloading() {
            tokio::task::yield_now().await;
        }
        let second = orch.trigger_manual_preload(&[], &CancelFlag::new()).await;
        assert!(matches!(
            second,
            Err(BuryPointError::Diagnostic(DiagnosticError::PreloadConflict))
        ));

        let summary = first.await.unwrap().unwrap();
        assert_eq!(summary.tracking_points, 1);
        assert_eq!(summary.days_loaded, 3);
        assert!(!orch.is_preloading());
    }
}
