//! Consistency Diagnostic Engine
//!
//! Compares what each cache tier holds for every (day, tracking point) of a
//! scan and classifies the divergence:
//!
//! | Kind                 | Condition                                          | Severity     |
//! |----------------------|----------------------------------------------------|--------------|
//! | `missing-in-backend` | held by memory or durable-local, backend has none  | HIGH         |
//! | `count-mismatch`     | tiers disagree on the record count                 | HIGH/MEDIUM  |
//! | `stale-memory-copy`  | memory fetched before the backend last updated     | MEDIUM       |
//! | `absent-everywhere`  | no tier holds the day                              | LOW          |
//!
//! A full run is exclusive: while one is in flight a second is rejected with
//! [`DiagnosticError::RunConflict`]. The quick health check is read-only and
//! time-bounded, so it may overlap a full run.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use burypoint_core::{
    BuryPointResult, CacheEntry, CacheKey, DateRange, DiagnosticError, DiagnosticIssue,
    DiagnosticReport, DiagnosticsConfig, HealthSnapshot, IssueKind, Severity, TierKind,
};
use burypoint_storage::{TierSnapshot, TieredCacheStore};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cancel::{CancelFlag, RunGuard};

/// Lifecycle of full diagnostic runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiagnosticState {
    #[default]
    Idle,
    Running,
    /// The last run completed and produced a report.
    Reported,
    /// The last run could not complete.
    Failed,
}

/// Marks a run `Failed` if its future is dropped before it finishes.
struct AbandonedRun<'a>(&'a Mutex<DiagnosticState>);

impl Drop for AbandonedRun<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if *state == DiagnosticState::Running {
            *state = DiagnosticState::Failed;
        }
    }
}

#[derive(Debug, Default)]
struct ScanOutcome {
    issues: Vec<DiagnosticIssue>,
    keys_scanned: usize,
    unreadable: usize,
    cancelled: bool,
}

pub struct DiagnosticEngine {
    store: Arc<TieredCacheStore>,
    project_id: String,
    config: DiagnosticsConfig,
    running: AtomicBool,
    state: Mutex<DiagnosticState>,
    last_report: Mutex<Option<DiagnosticReport>>,
}

impl std::fmt::Debug for DiagnosticEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticEngine")
            .field("project_id", &self.project_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DiagnosticEngine {
    pub fn new(
        store: Arc<TieredCacheStore>,
        project_id: impl Into<String>,
        config: DiagnosticsConfig,
    ) -> Self {
        Self {
            store,
            project_id: project_id.into(),
            config,
            running: AtomicBool::new(false),
            state: Mutex::new(DiagnosticState::Idle),
            last_report: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    pub fn state(&self) -> DiagnosticState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The report of the most recent full run.
    pub fn last_report(&self) -> Option<DiagnosticReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&self, state: DiagnosticState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn finish(&self, state: DiagnosticState, report: &DiagnosticReport) {
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        self.set_state(state);
    }

    /// Scan every day of `range` for every tracking point.
    ///
    /// Returns `RunConflict` if a run is already in flight. An unreachable
    /// backend is not an error: the run ends `Failed` and the returned report
    /// carries the reason.
    pub async fn run_full_diagnostic(
        &self,
        range: &DateRange,
        tracking_point_ids: &[i64],
        cancel: &CancelFlag,
    ) -> BuryPointResult<DiagnosticReport> {
        let _running = RunGuard::acquire(&self.running).ok_or(DiagnosticError::RunConflict)?;
        self.set_state(DiagnosticState::Running);
        let _abandoned = AbandonedRun(&self.state);
        let started_at = Utc::now();
        info!(%range, tracking_points = tracking_point_ids.len(), "Full diagnostic started");

        if let Err(e) = self.store.backend_ping().await {
            let err = DiagnosticError::BackendUnreachable {
                reason: e.to_string(),
            };
            warn!(%range, error = %err, "Full diagnostic failed");
            let report = DiagnosticReport::failed(started_at, err.to_string());
            self.finish(DiagnosticState::Failed, &report);
            return Ok(report);
        }

        let scan = self.scan(range, tracking_point_ids, cancel).await;
        let report = DiagnosticReport::completed(
            scan.issues,
            started_at,
            scan.keys_scanned,
            scan.unreadable,
            scan.cancelled,
        );
        info!(
            %range,
            keys_scanned = report.keys_scanned,
            unreadable = report.unreadable,
            cancelled = report.cancelled,
            health = %report.health(),
            "{}",
            report.summary()
        );
        self.finish(DiagnosticState::Reported, &report);
        Ok(report)
    }

    /// Scan the trailing quick window within the time budget.
    ///
    /// Never blocks past the budget: a timeout or an unreachable backend
    /// yields an `unknown` snapshot.
    pub async fn quick_health_check(&self, tracking_point_ids: &[i64]) -> HealthSnapshot {
        let started = Instant::now();
        let budget = self.config.quick_budget();
        let range = DateRange::trailing(Utc::now().date_naive(), self.config.quick_window_days);

        let check = async {
            self.store.backend_ping().await?;
            Ok::<_, burypoint_core::TierError>(
                self.scan(&range, tracking_point_ids, &CancelFlag::new()).await,
            )
        };

        let snapshot = match tokio::time::timeout(budget, check).await {
            Ok(Ok(scan)) => HealthSnapshot::from_issues(scan.issues),
            Ok(Err(e)) => {
                warn!(error = %e, "Quick health check could not reach the backend");
                HealthSnapshot::unknown(format!("backend unreachable: {e}"))
            }
            Err(_) => {
                warn!(budget_ms = budget.as_millis() as u64, "Quick health check exceeded its budget");
                HealthSnapshot::unknown(format!("health check exceeded {budget:?}"))
            }
        };
        snapshot.with_response_time(started.elapsed().as_millis() as i64)
    }

    async fn scan(
        &self,
        range: &DateRange,
        tracking_point_ids: &[i64],
        cancel: &CancelFlag,
    ) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();

        'days: for date in range.days() {
            for &tracking_point_id in tracking_point_ids {
                if cancel.is_cancelled() {
                    info!(%range, keys_scanned = outcome.keys_scanned, "Diagnostic scan cancelled");
                    outcome.cancelled = true;
                    break 'days;
                }

                let key = CacheKey::new(date, tracking_point_id, self.project_id.clone());
                let snapshot = self.store.snapshot(&key.fingerprint()).await;
                outcome.keys_scanned += 1;

                let unreadable = snapshot.unreadable();
                if !unreadable.is_empty() {
                    warn!(fingerprint = %snapshot.fingerprint, tiers = ?unreadable, "Tier unreadable during scan");
                    outcome.unreadable += 1;
                }

                let issues = classify(&key, &snapshot, &self.config);
                for issue in &issues {
                    debug!(
                        fingerprint = %snapshot.fingerprint,
                        kind = %issue.kind,
                        severity = %issue.severity,
                        "{}",
                        issue.detail
                    );
                }
                outcome.issues.extend(issues);
            }
        }
        outcome
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Classify one key's tier snapshot.
///
/// Emits at most one issue of each kind. A tier whose read failed is treated
/// as unknown rather than absent, so it never produces `missing-in-backend`
/// or `absent-everywhere` on its own.
pub fn classify(
    key: &CacheKey,
    snapshot: &TierSnapshot,
    config: &DiagnosticsConfig,
) -> Vec<DiagnosticIssue> {
    let memory = snapshot.entry(TierKind::Memory);
    let local = snapshot.entry(TierKind::DurableLocal);
    let backend = snapshot.entry(TierKind::Backend);
    let mut issues = Vec::new();

    if memory.is_none() && local.is_none() && backend.is_none() {
        if snapshot.unreadable().is_empty() {
            issues.push(
                DiagnosticIssue::new(key.clone(), IssueKind::AbsentEverywhere, Severity::Low)
                    .with_detail("never fetched into any tier"),
            );
        }
        return issues;
    }

    let backend_confirmed_absent = matches!(snapshot.backend, Ok(None));
    if backend_confirmed_absent {
        if let Some((tier, held)) = local
            .map(|e| (TierKind::DurableLocal, e))
            .or_else(|| memory.map(|e| (TierKind::Memory, e)))
        {
            issues.push(
                DiagnosticIssue::new(key.clone(), IssueKind::MissingInBackend, Severity::High)
                    .with_tier(TierKind::Backend)
                    .with_counts(Some(held.record_count()), None)
                    .with_detail(format!(
                        "{} records held by {tier} but absent from backend",
                        held.record_count()
                    )),
            );
        }
    }

    if let Some(issue) = count_mismatch(key, memory, local, backend, config.count_mismatch_high_ratio)
    {
        issues.push(issue);
    }

    if let (Some(mem), Some(auth)) = (memory, backend) {
        let tolerance = chrono::Duration::milliseconds(config.stale_tolerance_ms as i64);
        if mem.fetched_at + tolerance < auth.updated_at {
            issues.push(
                DiagnosticIssue::new(key.clone(), IssueKind::StaleMemoryCopy, Severity::Medium)
                    .with_tier(TierKind::Memory)
                    .with_counts(Some(auth.record_count()), Some(mem.record_count()))
                    .with_detail(format!(
                        "memory fetched {} but backend updated {}",
                        mem.fetched_at.to_rfc3339(),
                        auth.updated_at.to_rfc3339()
                    )),
            );
        }
    }

    issues
}

/// Compare cached counts against the backend, or against durable-local when
/// the backend holds nothing, keeping the most divergent tier.
fn count_mismatch(
    key: &CacheKey,
    memory: Option<&CacheEntry>,
    local: Option<&CacheEntry>,
    backend: Option<&CacheEntry>,
    high_ratio: f64,
) -> Option<DiagnosticIssue> {
    let (reference_tier, reference) = match (backend, local) {
        (Some(b), _) => (TierKind::Backend, b),
        (None, Some(l)) => (TierKind::DurableLocal, l),
        (None, None) => return None,
    };
    let expected = reference.record_count();

    [(TierKind::Memory, memory), (TierKind::DurableLocal, local)]
        .into_iter()
        .filter(|(tier, _)| *tier != reference_tier)
        .filter_map(|(tier, entry)| entry.map(|e| (tier, e.record_count())))
        .filter(|(_, actual)| *actual != expected)
        .map(|(tier, actual)| {
            let ratio = expected.abs_diff(actual) as f64 / expected.max(1) as f64;
            let memory_ahead =
                tier == TierKind::Memory && reference_tier == TierKind::Backend && actual > expected;
            let severity = if memory_ahead || ratio > high_ratio {
                Severity::High
            } else {
                Severity::Medium
            };
            (severity, ratio, tier, actual)
        })
        .max_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)))
        .map(|(severity, ratio, tier, actual)| {
            DiagnosticIssue::new(key.clone(), IssueKind::CountMismatch, severity)
                .with_tier(tier)
                .with_counts(Some(expected), Some(actual))
                .with_detail(format!(
                    "{tier} holds {actual} records, {reference_tier} holds {expected} ({:.0}% apart)",
                    ratio * 100.0
                ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burypoint_core::TierError;
    use burypoint_test_utils::fixtures::{self, day};
    use burypoint_test_utils::TestStore;
    use burypoint_storage::TierView;
    use chrono::{DateTime, Duration};

    fn view(entry: Option<&CacheEntry>) -> TierView {
        Ok(entry.map(|e| (e.clone(), e.updated_at)))
    }

    fn snapshot(
        memory: Option<&CacheEntry>,
        local: Option<&CacheEntry>,
        backend: Option<&CacheEntry>,
    ) -> TierSnapshot {
        TierSnapshot {
            fingerprint: key().fingerprint(),
            memory: view(memory),
            durable_local: view(local),
            backend: view(backend),
        }
    }

    fn key() -> CacheKey {
        fixtures::key(day(2025, 3, 1), 1)
    }

    fn entry(n: usize, fetched_at: DateTime<Utc>) -> CacheEntry {
        fixtures::entry_fetched_at(key(), n, fetched_at)
    }

    fn kinds(issues: &[DiagnosticIssue]) -> Vec<(IssueKind, Severity)> {
        issues.iter().map(|i| (i.kind, i.severity)).collect()
    }

    #[test]
    fn test_consistent_tiers_have_no_issues() {
        let e = entry(10, Utc::now());
        let issues = classify(&key(), &snapshot(Some(&e), Some(&e), Some(&e)), &Default::default());
        assert!(issues.is_empty());
    }

    #[test]
    fn test_absent_everywhere_is_low() {
        let issues = classify(&key(), &snapshot(None, None, None), &Default::default());
        assert_eq!(kinds(&issues), vec![(IssueKind::AbsentEverywhere, Severity::Low)]);
    }

    #[test]
    fn test_unreadable_tier_is_not_absent() {
        let mut snap = snapshot(None, None, None);
        snap.backend = Err(TierError::Read {
            tier: TierKind::Backend,
            reason: "HTTP 500".into(),
        });
        assert!(classify(&key(), &snap, &Default::default()).is_empty());

        let e = entry(10, Utc::now());
        let mut snap = snapshot(Some(&e), None, None);
        snap.backend = Err(TierError::Read {
            tier: TierKind::Backend,
            reason: "HTTP 500".into(),
        });
        assert!(classify(&key(), &snap, &Default::default()).is_empty());
    }

    #[test]
    fn test_missing_in_backend_is_high() {
        let e = entry(10, Utc::now());
        let issues = classify(&key(), &snapshot(Some(&e), Some(&e), None), &Default::default());
        assert_eq!(kinds(&issues), vec![(IssueKind::MissingInBackend, Severity::High)]);
        assert_eq!(issues[0].expected_count, Some(10));
    }

    #[test]
    fn test_twenty_percent_gap_is_medium_by_default() {
        let now = Utc::now();
        let issues = classify(
            &key(),
            &snapshot(Some(&entry(80, now)), None, Some(&entry(100, now))),
            &Default::default(),
        );
        assert_eq!(kinds(&issues), vec![(IssueKind::CountMismatch, Severity::Medium)]);
        assert_eq!(issues[0].expected_count, Some(100));
        assert_eq!(issues[0].actual_count, Some(80));
    }

    #[test]
    fn test_lower_threshold_escalates_to_high() {
        let now = Utc::now();
        let config = DiagnosticsConfig {
            count_mismatch_high_ratio: 0.1,
            ..Default::default()
        };
        let issues = classify(
            &key(),
            &snapshot(Some(&entry(80, now)), None, Some(&entry(100, now))),
            &config,
        );
        assert_eq!(kinds(&issues), vec![(IssueKind::CountMismatch, Severity::High)]);
    }

    #[test]
    fn test_memory_ahead_of_backend_is_always_high() {
        let now = Utc::now();
        let issues = classify(
            &key(),
            &snapshot(Some(&entry(101, now)), None, Some(&entry(100, now))),
            &Default::default(),
        );
        assert_eq!(kinds(&issues), vec![(IssueKind::CountMismatch, Severity::High)]);
    }

    #[test]
    fn test_single_mismatch_keeps_most_divergent_tier() {
        let now = Utc::now();
        let issues = classify(
            &key(),
            &snapshot(Some(&entry(95, now)), Some(&entry(50, now)), Some(&entry(100, now))),
            &Default::default(),
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].tier, Some(TierKind::DurableLocal));
        assert_eq!(issues[0].severity, Severity::High);
    }

    #[test]
    fn test_memory_compared_with_local_when_backend_absent() {
        let now = Utc::now();
        let issues = classify(
            &key(),
            &snapshot(Some(&entry(9, now)), Some(&entry(10, now)), None),
            &Default::default(),
        );
        assert_eq!(
            kinds(&issues),
            vec![
                (IssueKind::MissingInBackend, Severity::High),
                (IssueKind::CountMismatch, Severity::Medium),
            ]
        );
    }

    #[test]
    fn test_stale_memory_copy() {
        let now = Utc::now();
        let old = entry(10, now - Duration::minutes(5));
        let fresh = entry(10, now);
        let issues = classify(&key(), &snapshot(Some(&old), None, Some(&fresh)), &Default::default());
        assert_eq!(kinds(&issues), vec![(IssueKind::StaleMemoryCopy, Severity::Medium)]);

        // Within tolerance.
        let recent = entry(10, now - Duration::seconds(2));
        let issues = classify(&key(), &snapshot(Some(&recent), None, Some(&fresh)), &Default::default());
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn test_full_run_reports_and_records_state() {
        let ts = TestStore::new();
        let now = Utc::now();
        ts.seed(TierKind::Memory, &fixtures::entry_fetched_at(key(), 10, now)).await;
        let engine = DiagnosticEngine::new(ts.store.clone(), fixtures::PROJECT, Default::default());
        let range = DateRange::new(day(2025, 3, 1), day(2025, 3, 2)).unwrap();

        let report = engine
            .run_full_diagnostic(&range, &[1], &CancelFlag::new())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.keys_scanned, 2);
        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.issues[0].kind, IssueKind::MissingInBackend);
        assert_eq!(report.issues[1].kind, IssueKind::AbsentEverywhere);
        assert_eq!(engine.state(), DiagnosticState::Reported);
        assert_eq!(engine.last_report(), Some(report));
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_run() {
        let ts = TestStore::new();
        ts.backend.set_unreachable(true);
        let engine = DiagnosticEngine::new(ts.store.clone(), fixtures::PROJECT, Default::default());

        let report = engine
            .run_full_diagnostic(&DateRange::single(day(2025, 3, 1)), &[1], &CancelFlag::new())
            .await
            .unwrap();
        assert!(!report.success);
        assert!(report.error.unwrap().contains("Backend unreachable"));
        assert_eq!(engine.state(), DiagnosticState::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let ts = TestStore::new();
        ts.backend.set_latency(std::time::Duration::from_millis(50));
        let engine = Arc::new(DiagnosticEngine::new(
            ts.store.clone(),
            fixtures::PROJECT,
            Default::default(),
        ));
        let range = DateRange::single(day(2025, 3, 1));

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .run_full_diagnostic(&range, &[1], &CancelFlag::new())
                    .await
            })
        };
        while engine.state() != DiagnosticState::Running {
            tokio::task::yield_now().await;
        }

        let err = engine
            .run_full_diagnostic(&range, &[1], &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            burypoint_core::BuryPointError::Diagnostic(DiagnosticError::RunConflict)
        ));

        assert!(first.await.unwrap().unwrap().success);
        assert!(engine
            .run_full_diagnostic(&range, &[1], &CancelFlag::new())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_leaves_failed_state() {
        let ts = TestStore::new();
        ts.backend.set_latency(std::time::Duration::from_secs(60));
        let engine = DiagnosticEngine::new(ts.store.clone(), fixtures::PROJECT, Default::default());
        let range = DateRange::single(day(2025, 3, 1));

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            engine.run_full_diagnostic(&range, &[1], &CancelFlag::new()),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(engine.state(), DiagnosticState::Failed);
        assert_eq!(engine.last_report(), None);

        ts.backend.set_latency(std::time::Duration::ZERO);
        let report = engine
            .run_full_diagnostic(&range, &[1], &CancelFlag::new())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(engine.state(), DiagnosticState::Reported);
    }

    #[tokio::test]
    async fn test_cancelled_scan_is_reported() {
        let ts = TestStore::new();
        let engine = DiagnosticEngine::new(ts.store.clone(), fixtures::PROJECT, Default::default());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let report = engine
            .run_full_diagnostic(
                &DateRange::new(day(2025, 3, 1), day(2025, 3, 9)).unwrap(),
                &[1, 2],
                &cancel,
            )
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.keys_scanned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_check_degrades_to_unknown_past_budget() {
        let ts = TestStore::new();
        ts.backend.set_latency(std::time::Duration::from_secs(60));
        let engine = DiagnosticEngine::new(ts.store.clone(), fixtures::PROJECT, Default::default());

        let snapshot = engine.quick_health_check(&[1]).await;
        assert_eq!(snapshot.status, burypoint_core::HealthStatus::Unknown);
        assert!(snapshot.message.unwrap().contains("exceeded"));
    }

    #[tokio::test]
    async fn test_quick_check_unreachable_backend_is_unknown() {
        let ts = TestStore::new();
        ts.backend.set_unreachable(true);
        let engine = DiagnosticEngine::new(ts.store.clone(), fixtures::PROJECT, Default::default());
        let snapshot = engine.quick_health_check(&[1]).await;
        assert_eq!(snapshot.status, burypoint_core::HealthStatus::Unknown);
    }
}
