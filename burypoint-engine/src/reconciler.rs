//! Auto-Fix Reconciler
//!
//! Repairs diagnostic findings by refetching the affected day from the
//! Remote Analytics Source (bypassing every tier) and writing it through
//! again.
//!
//! # Eventual consistency
//!
//! The backend tier acknowledges a write before it is guaranteed to be
//! readable. A repair marked `Fixed` means every tier accepted the write, not
//! that the backend already serves it. Re-verify only after the configured
//! settle delay; [`Reconciler::reconcile`] does this for you.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use burypoint_core::{
    BuryPointResult, CacheKey, DateRange, DiagnosticIssue, DiagnosticReport, Fingerprint,
    RepairBatch, RepairOutcome, RepairStatus, Severity,
};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::diagnostics::DiagnosticEngine;
use crate::orchestrator::FetchOrchestrator;

/// Issues at or above this severity are repaired by [`Reconciler::reconcile`].
const RECONCILE_MIN_SEVERITY: Severity = Severity::Medium;

/// Diagnose, repair and re-verify.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub before: DiagnosticReport,
    pub repairs: RepairBatch,
    /// Diagnostic taken after the settle delay, when anything was repaired.
    pub after: Option<DiagnosticReport>,
    /// Why the post-repair diagnostic could not run.
    pub recheck_error: Option<String>,
}

impl ReconcileReport {
    /// Human-readable counts, e.g. `"3 issues found, 2 fixed, 1 failed, 0 remaining"`.
    pub fn summary(&self) -> String {
        let remaining = self
            .after
            .as_ref()
            .map(|r| r.issues.iter().filter(|i| i.severity >= RECONCILE_MIN_SEVERITY).count());
        match remaining {
            Some(n) => format!(
                "{} issues found, {} fixed, {} failed, {} remaining",
                self.before.issues.len(),
                self.repairs.fixed(),
                self.repairs.failed(),
                n
            ),
            None if self.recheck_error.is_some() => format!(
                "{} issues found, {} fixed, {} failed, re-check failed",
                self.before.issues.len(),
                self.repairs.fixed(),
                self.repairs.failed()
            ),
            None => format!(
                "{} issues found, {} fixed, {} failed",
                self.before.issues.len(),
                self.repairs.fixed(),
                self.repairs.failed()
            ),
        }
    }
}

pub struct Reconciler {
    orchestrator: Arc<FetchOrchestrator>,
    diagnostics: Arc<DiagnosticEngine>,
    concurrency: usize,
    settle_delay: Duration,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("concurrency", &self.concurrency)
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Concurrency and settle delay come from the diagnostic engine's config.
    pub fn new(orchestrator: Arc<FetchOrchestrator>, diagnostics: Arc<DiagnosticEngine>) -> Self {
        let config = diagnostics.config();
        Self {
            concurrency: config.repair_concurrency.max(1),
            settle_delay: config.settle_delay(),
            orchestrator,
            diagnostics,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Repair each issue independently and report one outcome per issue, in
    /// input order.
    ///
    /// Issues sharing a fingerprint are repaired by a single refetch and
    /// share its outcome. Distinct fingerprints are repaired concurrently up
    /// to the configured window. Issues for tracking points outside
    /// `tracking_point_ids` are not touched and come back `Failed`.
    pub async fn auto_fix_issues(
        &self,
        issues: &[DiagnosticIssue],
        tracking_point_ids: &[i64],
        cancel: &CancelFlag,
    ) -> RepairBatch {
        let mut resolved: Vec<Option<(RepairStatus, String)>> = vec![None; issues.len()];
        let mut groups: Vec<(CacheKey, Vec<usize>)> = Vec::new();
        let mut group_of: HashMap<Fingerprint, usize> = HashMap::new();

        for (idx, issue) in issues.iter().enumerate() {
            let tracking_point_id = issue.key.tracking_point_id;
            if !tracking_point_ids.contains(&tracking_point_id) {
                resolved[idx] = Some((
                    RepairStatus::Failed,
                    format!("tracking point {tracking_point_id} not in scope"),
                ));
                continue;
            }
            let slot = *group_of
                .entry(issue.key.fingerprint())
                .or_insert_with(|| {
                    groups.push((issue.key.clone(), Vec::new()));
                    groups.len() - 1
                });
            groups[slot].1.push(idx);
        }

        info!(
            issues = issues.len(),
            keys = groups.len(),
            concurrency = self.concurrency,
            "Auto-fix started"
        );

        let repaired: Vec<(Vec<usize>, RepairStatus, String)> = stream::iter(groups)
            .map(|(key, members)| async move {
                let (status, detail) = self.repair(&key, cancel).await;
                (members, status, detail)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (members, status, detail) in repaired {
            for idx in members {
                resolved[idx] = Some((status, detail.clone()));
            }
        }

        let outcomes = issues
            .iter()
            .zip(resolved)
            .map(|(issue, resolved)| {
                let (status, detail) = resolved
                    .unwrap_or_else(|| (RepairStatus::Failed, "not attempted".to_string()));
                RepairOutcome {
                    issue: issue.clone(),
                    status,
                    detail,
                }
            })
            .collect();
        let batch = RepairBatch { outcomes };
        info!(fixed = batch.fixed(), failed = batch.failed(), "{}", batch.summary());
        batch
    }

    async fn repair(&self, key: &CacheKey, cancel: &CancelFlag) -> (RepairStatus, String) {
        if cancel.is_cancelled() {
            return (RepairStatus::Failed, "cancelled".to_string());
        }

        match self.orchestrator.refetch_day(key).await {
            Ok(day) => match day.write_error {
                None => {
                    debug!(fingerprint = %key.fingerprint(), records = day.records.len(), "Repaired");
                    (
                        RepairStatus::Fixed,
                        format!("refetched {} records and wrote all tiers", day.records.len()),
                    )
                }
                Some(e) => {
                    warn!(fingerprint = %key.fingerprint(), error = %e, "Repair write incomplete");
                    (RepairStatus::Failed, format!("refetched but {e}"))
                }
            },
            Err(e) => {
                warn!(fingerprint = %key.fingerprint(), error = %e, "Repair refetch failed");
                (RepairStatus::Failed, e.to_string())
            }
        }
    }

    /// Run a full diagnostic, repair every MEDIUM or HIGH issue, wait the
    /// settle delay and diagnose again.
    ///
    /// The second diagnostic is skipped when nothing was fixed or the run was
    /// cancelled.
    pub async fn reconcile(
        &self,
        range: &DateRange,
        tracking_point_ids: &[i64],
        cancel: &CancelFlag,
    ) -> BuryPointResult<ReconcileReport> {
        let before = self
            .diagnostics
            .run_full_diagnostic(range, tracking_point_ids, cancel)
            .await?;
        if !before.success {
            return Ok(ReconcileReport {
                before,
                repairs: RepairBatch::default(),
                after: None,
                recheck_error: None,
            });
        }

        let actionable: Vec<DiagnosticIssue> = before
            .issues
            .iter()
            .filter(|i| i.severity >= RECONCILE_MIN_SEVERITY)
            .cloned()
            .collect();
        let repairs = self
            .auto_fix_issues(&actionable, tracking_point_ids, cancel)
            .await;

        let mut after = None;
        let mut recheck_error = None;
        if repairs.fixed() > 0 && !cancel.is_cancelled() {
            debug!(delay_ms = self.settle_delay.as_millis() as u64, "Waiting for backend to settle");
            tokio::time::sleep(self.settle_delay).await;
            // Repairs are already written; a failed re-check must not hide them.
            match self
                .diagnostics
                .run_full_diagnostic(range, tracking_point_ids, cancel)
                .await
            {
                Ok(report) => after = Some(report),
                Err(e) => {
                    warn!(%range, error = %e, "Post-repair diagnostic did not run");
                    recheck_error = Some(e.to_string());
                }
            }
        }

        let report = ReconcileReport {
            before,
            repairs,
            after,
            recheck_error,
        };
        info!(%range, "{}", report.summary());
        Ok(report)
    }
}
