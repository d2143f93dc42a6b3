//! Cache health classification
//!
//! Health is derived from the most severe unresolved diagnostic issue and
//! shown by the dashboard next to its charts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::diagnostic::{DiagnosticIssue, Severity};

/// Aggregate cache health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No issue above LOW
    Healthy,
    /// Worst issue is MEDIUM
    Warning,
    /// At least one HIGH issue
    Critical,
    /// Not checked yet, or the check could not complete
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Map the worst severity to a status.
    pub fn from_severity(worst: Option<Severity>) -> Self {
        match worst {
            Some(Severity::High) => Self::Critical,
            Some(Severity::Medium) => Self::Warning,
            Some(Severity::Low) | None => Self::Healthy,
        }
    }

    /// Status for a set of unresolved issues.
    pub fn from_issues(issues: &[DiagnosticIssue]) -> Self {
        Self::from_severity(issues.iter().map(|i| i.severity).max())
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    /// Issues found by the check (empty when `unknown`).
    pub issues: Vec<DiagnosticIssue>,
    pub checked_at: Option<DateTime<Utc>>,
    /// Why the status is `unknown`, when it is.
    pub message: Option<String>,
    pub response_time_ms: Option<i64>,
}

impl HealthSnapshot {
    /// Snapshot before any check has run.
    pub fn unchecked() -> Self {
        Self {
            status: HealthStatus::Unknown,
            issues: Vec::new(),
            checked_at: None,
            message: None,
            response_time_ms: None,
        }
    }

    /// Snapshot from a completed check.
    pub fn from_issues(issues: Vec<DiagnosticIssue>) -> Self {
        Self {
            status: HealthStatus::from_issues(&issues),
            issues,
            checked_at: Some(Utc::now()),
            message: None,
            response_time_ms: None,
        }
    }

    /// Snapshot for a check that could not complete.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            issues: Vec::new(),
            checked_at: Some(Utc::now()),
            message: Some(message.into()),
            response_time_ms: None,
        }
    }

    /// Set the response time.
    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// User-facing one-line summary.
    pub fn summary(&self) -> String {
        match (&self.status, &self.message) {
            (HealthStatus::Unknown, Some(message)) => format!("health unknown: {message}"),
            (status, _) => format!("{status}: {} issues found", self.issues.len()),
        }
    }
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self::unchecked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::IssueKind;
    use crate::key::CacheKey;
    use chrono::NaiveDate;

    fn issue(severity: Severity) -> DiagnosticIssue {
        let key = CacheKey::new(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(), 1, "p");
        DiagnosticIssue::new(key, IssueKind::CountMismatch, severity)
    }

    #[test]
    fn test_health_from_issues() {
        assert_eq!(HealthStatus::from_issues(&[]), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_issues(&[issue(Severity::Low)]), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_issues(&[issue(Severity::Medium)]), HealthStatus::Warning);
        assert_eq!(
            HealthStatus::from_issues(&[issue(Severity::Medium), issue(Severity::High)]),
            HealthStatus::Critical
        );
    }

    #[test]
    fn test_health_serialization() {
        let json = serde_json::to_string(&HealthStatus::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
    }

    #[test]
    fn test_snapshot_unchecked_is_unknown() {
        let snapshot = HealthSnapshot::default();
        assert_eq!(snapshot.status, HealthStatus::Unknown);
        assert!(snapshot.checked_at.is_none());
    }

    #[test]
    fn test_snapshot_summary() {
        let snapshot = HealthSnapshot::from_issues(vec![issue(Severity::Medium)]);
        assert_eq!(snapshot.summary(), "warning: 1 issues found");
        assert_eq!(
            HealthSnapshot::unknown("backend unreachable").summary(),
            "health unknown: backend unreachable"
        );
    }
}
