//! Error types for bury-point cache operations

use crate::entry::TierKind;
use std::time::Duration;
use thiserror::Error;

/// Remote Analytics Source errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Network failure calling {endpoint}: {reason}")]
    Network { endpoint: String, reason: String },

    #[error("Request to {endpoint} timed out after {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("Authentication rejected by {endpoint}: {reason}")]
    Auth { endpoint: String, reason: String },

    #[error("Application error {code} from {endpoint}: {msg}")]
    Api {
        endpoint: String,
        code: i64,
        msg: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
}

/// Cache tier errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TierError {
    #[error("Read from {tier} tier failed: {reason}")]
    Read { tier: TierKind, reason: String },

    #[error("Write to {tier} tier failed: {reason}")]
    Write { tier: TierKind, reason: String },

    #[error("Write-through incomplete, failed tiers: {failed:?}")]
    WriteThrough { failed: Vec<TierKind> },

    #[error("Corrupt entry in {tier} tier for {fingerprint}")]
    Corrupt { tier: TierKind, fingerprint: String },

    #[error("Serialization error in {tier} tier: {reason}")]
    Serialization { tier: TierKind, reason: String },

    #[error("{tier} tier unavailable: {reason}")]
    Unavailable { tier: TierKind, reason: String },
}

impl TierError {
    /// The tier the error originated in, when it is a single tier.
    pub fn tier(&self) -> Option<TierKind> {
        match self {
            Self::Read { tier, .. }
            | Self::Write { tier, .. }
            | Self::Corrupt { tier, .. }
            | Self::Serialization { tier, .. }
            | Self::Unavailable { tier, .. } => Some(*tier),
            Self::WriteThrough { .. } => None,
        }
    }
}

/// Diagnostic engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiagnosticError {
    #[error("A diagnostic run is already in progress")]
    RunConflict,

    #[error("A preload run is already in progress")]
    PreloadConflict,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Backend unreachable: {reason}")]
    BackendUnreachable { reason: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid date range: {start} is after {end}")]
    InvalidDateRange { start: String, end: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or BURYPOINT_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all bury-point errors.
#[derive(Debug, Clone, Error)]
pub enum BuryPointError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Tier error: {0}")]
    Tier(#[from] TierError),

    #[error("Diagnostic error: {0}")]
    Diagnostic(#[from] DiagnosticError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl BuryPointError {
    /// Invalid or expired credentials. Surfaced to the caller, never retried.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Source(SourceError::Auth { .. }))
    }

    /// Transient failure worth retrying at the next scheduled check.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Source(SourceError::Network { .. } | SourceError::Timeout { .. })
                | Self::Tier(TierError::Unavailable { .. })
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Diagnostic(DiagnosticError::Cancelled))
    }
}

/// Result type alias for bury-point operations.
pub type BuryPointResult<T> = Result<T, BuryPointError>;

// =============================================================================
// TESTS
// =============================================================================
