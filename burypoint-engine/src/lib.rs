//! BuryPoint Engine - Fetch Orchestration and Consistency
//!
//! Builds on the tiered cache store to provide:
//!
//! - [`FetchOrchestrator`]: cache-first per-day loading with write-through
//! - [`DiagnosticEngine`]: cross-tier divergence detection and severity
//! - [`Reconciler`]: targeted refetch repairs with bounded parallelism
//! - [`HealthMonitor`]: periodic quick checks published on a watch channel
//!
//! [`BuryPointEngine`] wires them together from a single configuration.

pub mod cancel;
pub mod diagnostics;
pub mod engine;
pub mod monitor;
pub mod orchestrator;
pub mod reconciler;
pub mod source;
pub mod telemetry;

pub use cancel::CancelFlag;
pub use diagnostics::{classify, DiagnosticEngine, DiagnosticState};
pub use engine::{BuryPointEngine, EngineError};
pub use monitor::{
    HealthMonitor, HealthMonitorConfig, HealthMonitorHandle, HealthMonitorMetrics,
    HealthMonitorStats,
};
pub use orchestrator::{
    DayData, DayOutcome, FetchMode, FetchOrchestrator, FetchStats, OrchestratorConfig,
    PreloadSummary, RangeReport,
};
pub use reconciler::{ReconcileReport, Reconciler};
pub use source::BuryPointClient;
pub use telemetry::{init_tracing, TelemetryError};
