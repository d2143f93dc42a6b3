//! BuryPoint Test Utilities
//!
//! Shared test infrastructure for the bury-point workspace:
//! - Mock Remote Analytics Source with per-day failure injection
//! - Mock backend tier with failure injection and delayed write visibility
//! - A ready-made tiered store over temporary storage
//! - Proptest generators and fixtures

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tempfile::TempDir;

pub use burypoint_core::{
    CacheEntry, CacheKey, ClearScope, DateRange, DiagnosticIssue, Fingerprint, IssueKind,
    RawRecord, RemoteAnalyticsSource, SearchRequest, Severity, SourceError, TierError, TierKind,
    DATE_FORMAT,
};
pub use burypoint_storage::{CacheStats, CacheTier, LmdbTier, MemoryTier, TieredCacheStore};

use burypoint_core::constants::SEARCH_PATH;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// MOCK REMOTE ANALYTICS SOURCE
// ============================================================================

/// In-memory Remote Analytics Source.
///
/// Serves configured records page by page, counts calls per day and can be
/// told to fail individual days or reject every call as unauthorized.
#[derive(Debug, Default)]
pub struct MockSource {
    records: Mutex<HashMap<(i64, NaiveDate), Vec<RawRecord>>>,
    failing_days: Mutex<HashMap<NaiveDate, SourceError>>,
    auth_rejected: AtomicBool,
    calls: AtomicUsize,
    calls_per_day: Mutex<HashMap<(i64, NaiveDate), usize>>,
    latency: Mutex<Option<Duration>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MockSource::set_day`] with `n` generated records.
    pub fn with_day(self, tracking_point_id: i64, date: NaiveDate, n: usize) -> Self {
        self.set_day(tracking_point_id, date, fixtures::records(n, date));
        self
    }

    /// Replace the records the source holds for one day.
    pub fn set_day(&self, tracking_point_id: i64, date: NaiveDate, records: Vec<RawRecord>) {
        lock(&self.records).insert((tracking_point_id, date), records);
    }

    /// Make every request for `date` fail with `error`.
    pub fn fail_day(&self, date: NaiveDate, error: SourceError) {
        lock(&self.failing_days).insert(date, error);
    }

    /// Stop failing requests for `date`.
    pub fn heal_day(&self, date: NaiveDate) {
        lock(&self.failing_days).remove(&date);
    }

    /// Reject every request as unauthorized.
    pub fn reject_auth(&self, rejected: bool) {
        self.auth_rejected.store(rejected, Ordering::SeqCst);
    }

    /// Delay every response.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Total `search` calls (one per page).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `search` calls for one day of one tracking point.
    pub fn calls_for(&self, tracking_point_id: i64, date: NaiveDate) -> usize {
        lock(&self.calls_per_day)
            .get(&(tracking_point_id, date))
            .copied()
            .unwrap_or(0)
    }

    /// A network failure for `date`, for use with [`MockSource::fail_day`].
    pub fn network_error() -> SourceError {
        SourceError::Network {
            endpoint: SEARCH_PATH.to_string(),
            reason: "connection reset".to_string(),
        }
    }
}

#[async_trait]
impl RemoteAnalyticsSource for MockSource {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<RawRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let date = NaiveDate::parse_from_str(&request.date, DATE_FORMAT).map_err(|e| {
            SourceError::InvalidResponse {
                endpoint: SEARCH_PATH.to_string(),
                reason: e.to_string(),
            }
        })?;
        *lock(&self.calls_per_day)
            .entry((request.selected_point_id, date))
            .or_default() += 1;

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.auth_rejected.load(Ordering::SeqCst) {
            return Err(SourceError::Auth {
                endpoint: SEARCH_PATH.to_string(),
                reason: "token expired".to_string(),
            });
        }
        if let Some(error) = lock(&self.failing_days).get(&date) {
            return Err(error.clone());
        }

        let records = lock(&self.records);
        let all = records
            .get(&(request.selected_point_id, date))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let size = request.page_size as usize;
        let start = (request.page.max(1) as usize - 1) * size;
        let end = (start + size).min(all.len());
        Ok(if start >= all.len() {
            Vec::new()
        } else {
            all[start..end].to_vec()
        })
    }
}

// ============================================================================
// MOCK BACKEND TIER
// ============================================================================

#[derive(Debug, Default)]
struct BackendState {
    committed: HashMap<Fingerprint, CacheEntry>,
    /// Writes accepted but not yet visible to readers.
    pending: Vec<(tokio::time::Instant, Fingerprint, CacheEntry)>,
}

impl BackendState {
    fn settle(&mut self) {
        let now = tokio::time::Instant::now();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(visible_at, _, _)| *visible_at <= now);
        self.pending = waiting;
        for (_, fp, entry) in ready {
            self.committed.insert(fp, entry);
        }
    }
}

/// Authoritative backend stand-in.
///
/// Behaves like the HTTP backend tier: `clear` leaves data in place and
/// writes may become visible only after a configurable delay. Timing uses
/// `tokio::time`, so tests with a paused clock control visibility exactly.
#[derive(Debug, Default)]
pub struct MockBackendTier {
    state: Mutex<BackendState>,
    visibility_delay: Mutex<Duration>,
    latency: Mutex<Option<Duration>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    unreachable: AtomicBool,
    writes: AtomicUsize,
}

impl MockBackendTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry, visible immediately.
    pub fn insert(&self, entry: CacheEntry) {
        let fp = entry.key.fingerprint();
        lock(&self.state)
            .committed
            .insert(fp, entry.held_by(TierKind::Backend));
    }

    pub fn remove(&self, fingerprint: &Fingerprint) {
        lock(&self.state).committed.remove(fingerprint);
    }

    /// Entries currently visible to readers.
    pub fn visible_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.settle();
        state.committed.len()
    }

    /// Accepted `set` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Delay between an accepted write and its visibility.
    pub fn set_visibility_delay(&self, delay: Duration) {
        *lock(&self.visibility_delay) = delay;
    }

    /// Delay every call.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Refuse every call, including `ping`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    async fn delay(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn reachable(&self) -> Result<(), TierError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(TierError::Unavailable {
                tier: TierKind::Backend,
                reason: "connection refused".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheTier for MockBackendTier {
    fn kind(&self) -> TierKind {
        TierKind::Backend
    }

    async fn get(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<(CacheEntry, DateTime<Utc>)>, TierError> {
        self.delay().await;
        self.reachable()?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TierError::Read {
                tier: TierKind::Backend,
                reason: "HTTP 500".to_string(),
            });
        }
        let mut state = lock(&self.state);
        state.settle();
        Ok(state
            .committed
            .get(fingerprint)
            .map(|entry| (entry.clone(), entry.updated_at)))
    }

    async fn set(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), TierError> {
        self.delay().await;
        self.reachable()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TierError::Write {
                tier: TierKind::Backend,
                reason: "HTTP 503".to_string(),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.visibility_delay);
        let mut state = lock(&self.state);
        if delay.is_zero() {
            state.committed.insert(fingerprint.clone(), entry.clone());
        } else {
            let visible_at = tokio::time::Instant::now() + delay;
            state.pending.push((visible_at, fingerprint.clone(), entry.clone()));
        }
        Ok(())
    }

    async fn clear(&self, _scope: &ClearScope) -> Result<u64, TierError> {
        Ok(0)
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: lock(&self.state).committed.len() as u64,
            ..Default::default()
        }
    }

    async fn ping(&self) -> Result<(), TierError> {
        self.delay().await;
        self.reachable()
    }
}

// ============================================================================
// STORE HARNESS
// ============================================================================

/// A tiered store over a memory tier, a temporary LMDB tier and a
/// [`MockBackendTier`], with handles to each tier for seeding and inspection.
pub struct TestStore {
    pub store: Arc<TieredCacheStore>,
    pub memory: Arc<MemoryTier>,
    pub local: Arc<LmdbTier>,
    pub backend: Arc<MockBackendTier>,
    _dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let memory = Arc::new(MemoryTier::new(1024));
        let local = Arc::new(LmdbTier::open(dir.path(), 16).expect("LMDB tier should open"));
        let backend = Arc::new(MockBackendTier::new());
        let store = Arc::new(TieredCacheStore::new(
            memory.clone(),
            local.clone(),
            backend.clone(),
        ));
        Self {
            store,
            memory,
            local,
            backend,
            _dir: dir,
        }
    }

    /// Write an entry straight into one tier.
    pub async fn seed(&self, tier: TierKind, entry: &CacheEntry) {
        let fp = entry.key.fingerprint();
        let seeded = match tier {
            TierKind::Memory => self.memory.set(&fp, &entry.held_by(tier)).await,
            TierKind::DurableLocal => self.local.set(&fp, &entry.held_by(tier)).await,
            TierKind::Backend | TierKind::Remote => {
                self.backend.insert(entry.clone());
                Ok(())
            }
        };
        seeded.expect("seeding a tier should succeed");
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for bury-point types.

    use super::*;
    use proptest::prelude::*;

    /// A calendar day in 2024-2025.
    pub fn arb_date() -> impl Strategy<Value = NaiveDate> {
        (0i64..730).prop_map(|offset| fixtures::day(2024, 1, 1) + chrono::Duration::days(offset))
    }

    /// Project ids, including ones containing the fingerprint separator.
    pub fn arb_project_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9:_-]{0,15}"
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (arb_date(), 1i64..100_000, arb_project_id())
            .prop_map(|(date, tp, project)| CacheKey::new(date, tp, project))
    }

    pub fn arb_date_range() -> impl Strategy<Value = DateRange> {
        (arb_date(), 0i64..31).prop_map(|(start, len)| {
            DateRange::new(start, start + chrono::Duration::days(len))
                .expect("start never exceeds end")
        })
    }

    pub fn arb_raw_record() -> impl Strategy<Value = RawRecord> {
        (
            prop_oneof![Just("visit"), Just("click"), Just("submit")],
            "[a-z]{1,8}",
            ".{0,24}",
            "[a-f0-9]{8}",
        )
            .prop_map(|(kind, page, content, visitor)| {
                RawRecord::new(kind, page, content, visitor, "2025-03-07 12:00:00")
            })
    }

    pub fn arb_severity() -> impl Strategy<Value = Severity> {
        prop_oneof![
            Just(Severity::Low),
            Just(Severity::Medium),
            Just(Severity::High),
        ]
    }

    pub fn arb_issue() -> impl Strategy<Value = DiagnosticIssue> {
        (arb_cache_key(), arb_severity())
            .prop_map(|(key, severity)| DiagnosticIssue::new(key, IssueKind::CountMismatch, severity))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common test scenarios.

    use super::*;

    /// Project id used by fixtures.
    pub const PROJECT: &str = "test-project";

    /// A calendar day. Panics on an invalid date.
    pub fn day(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("fixture date should be valid")
    }

    pub fn key(date: NaiveDate, tracking_point_id: i64) -> CacheKey {
        CacheKey::new(date, tracking_point_id, PROJECT)
    }

    /// `n` distinct records created on `date`.
    pub fn records(n: usize, date: NaiveDate) -> Vec<RawRecord> {
        (0..n)
            .map(|i| {
                RawRecord::new(
                    if i % 3 == 0 { "visit" } else { "click" },
                    format!("page-{}", i % 7),
                    format!("event {i}"),
                    format!("visitor-{:04}", i % 50),
                    format!("{} {:02}:00:00", date.format(DATE_FORMAT), i % 24),
                )
            })
            .collect()
    }

    /// A complete entry of `n` records fetched now.
    pub fn entry(key: CacheKey, n: usize) -> CacheEntry {
        entry_fetched_at(key, n, Utc::now())
    }

    pub fn entry_fetched_at(key: CacheKey, n: usize, fetched_at: DateTime<Utc>) -> CacheEntry {
        let records = records(n, key.date);
        CacheEntry::new(key, records, fetched_at, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_source_paginates() {
        let date = fixtures::day(2025, 3, 7);
        let source = MockSource::new().with_day(1, date, 25);
        let key = fixtures::key(date, 1);

        let first = source
            .search(&SearchRequest::for_day(&key, 1, 10, "list"))
            .await
            .unwrap();
        let last = source
            .search(&SearchRequest::for_day(&key, 3, 10, "list"))
            .await
            .unwrap();
        let beyond = source
            .search(&SearchRequest::for_day(&key, 4, 10, "list"))
            .await
            .unwrap();

        assert_eq!(first.len(), 10);
        assert_eq!(last.len(), 5);
        assert!(beyond.is_empty());
        assert_eq!(source.calls_for(1, date), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_backend_delayed_visibility() {
        let backend = MockBackendTier::new();
        backend.set_visibility_delay(Duration::from_secs(3));
        let entry = fixtures::entry(fixtures::key(fixtures::day(2025, 3, 7), 1), 4);
        let fp = entry.key.fingerprint();

        backend.set(&fp, &entry).await.unwrap();
        assert!(backend.get(&fp).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(backend.get(&fp).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mock_backend_unreachable() {
        let backend = MockBackendTier::new();
        backend.set_unreachable(true);
        assert!(matches!(
            backend.ping().await,
            Err(TierError::Unavailable { .. })
        ));
    }
}
