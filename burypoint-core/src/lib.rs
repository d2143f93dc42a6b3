//! BuryPoint Core - Data Types
//!
//! Pure data structures shared by the cache tiers, the fetch orchestrator and
//! the consistency engine. This crate performs no I/O beyond reading its
//! configuration file. The Remote Analytics Source contract lives here too so
//! that test doubles can implement it without depending on the engine.

pub mod config;
pub mod constants;
pub mod diagnostic;
pub mod entry;
pub mod error;
pub mod health;
pub mod key;
pub mod source;

pub use config::{
    BackendConfig, BuryPointConfig, DiagnosticsConfig, HealthConfig, LocalConfig, LoggingConfig,
    MemoryConfig, PreloadConfig, SourceConfig,
};
pub use diagnostic::{
    DiagnosticIssue, DiagnosticReport, IssueKind, RepairBatch, RepairOutcome, RepairStatus,
    Severity,
};
pub use entry::{compute_checksum, CacheEntry, DataQuality, RawRecord, TierKind};
pub use error::{
    BuryPointError, BuryPointResult, ConfigError, DiagnosticError, SourceError, TierError,
    ValidationError,
};
pub use health::{HealthSnapshot, HealthStatus};
pub use key::{CacheKey, ClearScope, DateRange, Fingerprint, DATE_FORMAT};
pub use source::{RemoteAnalyticsSource, SearchRequest};
