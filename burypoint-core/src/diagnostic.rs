//! Diagnostic findings and repair outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::entry::TierKind;
use crate::health::HealthStatus;
use crate::key::CacheKey;

/// Severity of a diagnostic finding. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        };
        f.write_str(label)
    }
}

/// Kind of divergence between tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    /// Present in memory or durable-local, absent from the backend.
    MissingInBackend,
    /// Present in several tiers with differing record counts.
    CountMismatch,
    /// Memory copy fetched before the backend's last update.
    StaleMemoryCopy,
    /// Never fetched into any tier.
    AbsentEverywhere,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingInBackend => "missing-in-backend",
            Self::CountMismatch => "count-mismatch",
            Self::StaleMemoryCopy => "stale-memory-copy",
            Self::AbsentEverywhere => "absent-everywhere",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One divergence detected for one cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticIssue {
    /// Time-sortable identifier (UUIDv7).
    pub id: Uuid,
    pub key: CacheKey,
    pub severity: Severity,
    pub kind: IssueKind,
    /// The divergent tier, when one tier is singled out.
    pub tier: Option<TierKind>,
    pub expected_count: Option<usize>,
    pub actual_count: Option<usize>,
    pub detected_at: DateTime<Utc>,
    pub detail: String,
}

impl DiagnosticIssue {
    pub fn new(key: CacheKey, kind: IssueKind, severity: Severity) -> Self {
        Self {
            id: Uuid::now_v7(),
            key,
            severity,
            kind,
            tier: None,
            expected_count: None,
            actual_count: None,
            detected_at: Utc::now(),
            detail: String::new(),
        }
    }

    pub fn with_tier(mut self, tier: TierKind) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_counts(mut self, expected: Option<usize>, actual: Option<usize>) -> Self {
        self.expected_count = expected;
        self.actual_count = actual;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Result of a diagnostic pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    /// Findings, most severe first.
    pub issues: Vec<DiagnosticIssue>,
    pub success: bool,
    /// Fatal error that ended the run, if any.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub keys_scanned: usize,
    /// Tier reads that failed and were left out of the comparison.
    pub unreadable: usize,
    pub cancelled: bool,
}

impl DiagnosticReport {
    /// A completed run. Issues are sorted most severe first, then by key.
    pub fn completed(
        mut issues: Vec<DiagnosticIssue>,
        started_at: DateTime<Utc>,
        keys_scanned: usize,
        unreadable: usize,
        cancelled: bool,
    ) -> Self {
        issues.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.key.cmp(&b.key)));
        Self {
            issues,
            success: true,
            error: None,
            started_at,
            finished_at: Utc::now(),
            keys_scanned,
            unreadable,
            cancelled,
        }
    }

    /// A run that ended on a fatal error.
    pub fn failed(started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            issues: Vec::new(),
            success: false,
            error: Some(error.into()),
            started_at,
            finished_at: Utc::now(),
            keys_scanned: 0,
            unreadable: 0,
            cancelled: false,
        }
    }

    /// Health derived from the most severe issue; `unknown` for failed runs.
    pub fn health(&self) -> HealthStatus {
        if !self.success {
            return HealthStatus::Unknown;
        }
        HealthStatus::from_issues(&self.issues)
    }

    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    pub fn issues_of_kind(&self, kind: IssueKind) -> impl Iterator<Item = &DiagnosticIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }

    /// User-facing one-line summary.
    pub fn summary(&self) -> String {
        match &self.error {
            Some(error) => format!("diagnostic failed: {error}"),
            None => format!("{} issues found", self.issues.len()),
        }
    }
}

/// Outcome of one repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RepairStatus {
    Fixed,
    Failed,
}

/// Per-issue result of a reconciliation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    pub issue: DiagnosticIssue,
    pub status: RepairStatus,
    pub detail: String,
}

/// All outcomes of one reconciliation batch, in the order issues were given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairBatch {
    pub outcomes: Vec<RepairOutcome>,
}

impl RepairBatch {
    pub fn fixed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == RepairStatus::Fixed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == RepairStatus::Failed)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// User-facing one-line summary.
    pub fn summary(&self) -> String {
        format!("{} fixed, {} failed", self.fixed(), self.failed())
    }
}
