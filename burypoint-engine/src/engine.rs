//! Engine wiring: one store, orchestrator, diagnostic engine and reconciler
//! per process, built from a [`BuryPointConfig`].

use std::sync::Arc;

use burypoint_core::{
    BuryPointConfig, BuryPointResult, ClearScope, ConfigError, DateRange, DiagnosticIssue,
    DiagnosticReport, HealthSnapshot, RawRecord, RemoteAnalyticsSource, RepairBatch, SourceError,
    TierError,
};
use burypoint_storage::{
    HttpBackendTier, LmdbTier, MemoryTier, PreloadStatus, TieredCacheStore, TieredStats,
};
use thiserror::Error;
use tracing::info;

use crate::cancel::CancelFlag;
use crate::diagnostics::DiagnosticEngine;
use crate::monitor::{HealthMonitor, HealthMonitorConfig, HealthMonitorHandle};
use crate::orchestrator::{
    FetchMode, FetchOrchestrator, FetchStats, OrchestratorConfig, PreloadSummary, RangeReport,
};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::source::BuryPointClient;
use crate::telemetry::TelemetryError;

/// Startup failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to build source client: {0}")]
    Source(#[from] SourceError),

    #[error("Failed to open cache tier: {0}")]
    Tier(#[from] TierError),

    #[error("Failed to initialise tracing: {0}")]
    Telemetry(#[from] TelemetryError),
}

pub struct BuryPointEngine {
    config: BuryPointConfig,
    store: Arc<TieredCacheStore>,
    orchestrator: Arc<FetchOrchestrator>,
    diagnostics: Arc<DiagnosticEngine>,
    reconciler: Reconciler,
    http_backend: Option<Arc<HttpBackendTier>>,
}

impl std::fmt::Debug for BuryPointEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuryPointEngine")
            .field("project_id", &self.config.source.project_id)
            .field("store", &self.store)
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}

impl BuryPointEngine {
    /// Build the production stack: memory, LMDB and HTTP backend tiers with
    /// the vendor search client.
    pub fn from_config(config: BuryPointConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let source = Arc::new(BuryPointClient::new(&config.source)?);
        let memory = Arc::new(MemoryTier::new(config.memory.max_entries));
        let local = Arc::new(
            LmdbTier::open(&config.local.path, config.local.max_size_mb).map_err(TierError::from)?,
        );
        let backend = Arc::new(HttpBackendTier::new(&config.backend)?);
        let store = Arc::new(TieredCacheStore::new(memory, local, backend.clone()));

        info!(
            project_id = %config.source.project_id,
            backend = backend.base_url(),
            local_path = %config.local.path.display(),
            "Engine initialised"
        );

        let mut engine = Self::with_parts(config, store, source);
        engine.http_backend = Some(backend);
        Ok(engine)
    }

    /// Build around an existing store and source.
    pub fn with_parts(
        config: BuryPointConfig,
        store: Arc<TieredCacheStore>,
        source: Arc<dyn RemoteAnalyticsSource>,
    ) -> Self {
        let orchestrator = Arc::new(FetchOrchestrator::new(
            store.clone(),
            source,
            OrchestratorConfig::from_config(&config),
        ));
        let diagnostics = Arc::new(DiagnosticEngine::new(
            store.clone(),
            config.source.project_id.clone(),
            config.diagnostics.clone(),
        ));
        let reconciler = Reconciler::new(orchestrator.clone(), diagnostics.clone());

        Self {
            config,
            store,
            orchestrator,
            diagnostics,
            reconciler,
            http_backend: None,
        }
    }

    pub fn config(&self) -> &BuryPointConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TieredCacheStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<FetchOrchestrator> {
        &self.orchestrator
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticEngine> {
        &self.diagnostics
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    // --- fetch ---

    pub async fn get_multi_day_cached_data(
        &self,
        range: &DateRange,
        tracking_point_id: i64,
    ) -> BuryPointResult<Vec<RawRecord>> {
        self.orchestrator
            .get_multi_day_cached_data(range, tracking_point_id)
            .await
    }

    pub async fn load_range(
        &self,
        range: &DateRange,
        tracking_point_id: i64,
        mode: FetchMode,
        cancel: &CancelFlag,
    ) -> RangeReport {
        self.orchestrator
            .load_range(range, tracking_point_id, mode, cancel)
            .await
    }

    pub async fn trigger_manual_preload(
        &self,
        tracking_point_ids: &[i64],
        cancel: &CancelFlag,
    ) -> BuryPointResult<PreloadSummary> {
        self.orchestrator
            .trigger_manual_preload(tracking_point_ids, cancel)
            .await
    }

    pub fn is_preloading(&self) -> bool {
        self.orchestrator.is_preloading()
    }

    /// Drop cached days selected by `scope` (everything when `None`).
    ///
    /// The backend keeps its copy; only this process's tiers are cleared.
    pub async fn clear_cache(&self, scope: Option<&ClearScope>) -> u64 {
        self.store.clear(scope).await
    }

    // --- consistency ---

    pub async fn run_full_diagnostic(
        &self,
        range: &DateRange,
        tracking_point_ids: &[i64],
        cancel: &CancelFlag,
    ) -> BuryPointResult<DiagnosticReport> {
        self.diagnostics
            .run_full_diagnostic(range, tracking_point_ids, cancel)
            .await
    }

    pub async fn quick_health_check(&self, tracking_point_ids: &[i64]) -> HealthSnapshot {
        self.diagnostics.quick_health_check(tracking_point_ids).await
    }

    pub async fn auto_fix_issues(
        &self,
        issues: &[DiagnosticIssue],
        tracking_point_ids: &[i64],
        cancel: &CancelFlag,
    ) -> RepairBatch {
        self.reconciler
            .auto_fix_issues(issues, tracking_point_ids, cancel)
            .await
    }

    pub async fn reconcile(
        &self,
        range: &DateRange,
        tracking_point_ids: &[i64],
        cancel: &CancelFlag,
    ) -> BuryPointResult<ReconcileReport> {
        self.reconciler
            .reconcile(range, tracking_point_ids, cancel)
            .await
    }

    /// Start the periodic health monitor from the `[health]` section.
    pub fn spawn_health_monitor(&self) -> HealthMonitorHandle {
        HealthMonitor::spawn(
            self.diagnostics.clone(),
            HealthMonitorConfig::from(&self.config.health),
        )
    }

    /// Preload subsystem status, when the backend is the HTTP store.
    pub async fn preload_status(&self) -> BuryPointResult<Option<PreloadStatus>> {
        match &self.http_backend {
            Some(backend) => Ok(Some(backend.preload_status().await?)),
            None => Ok(None),
        }
    }

    pub async fn cache_stats(&self) -> TieredStats {
        self.store.stats().await
    }

    pub fn fetch_stats(&self) -> FetchStats {
        self.orchestrator.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burypoint_test_utils::fixtures::{day, PROJECT};
    use burypoint_test_utils::{MockSource, TestStore};

    fn config() -> BuryPointConfig {
        BuryPointConfig::from_toml(&format!(
            r#"
            [source]
            base_url = "https://tracker.example.com"
            project_id = "{PROJECT}"

            [backend]
            base_url = "http://127.0.0.1:9"
            "#
        ))
        .unwrap()
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let err = BuryPointEngine::from_config(BuryPointConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_from_config_opens_local_tier() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = config();
        config.local.path = dir.path().join("cache");
        config.local.max_size_mb = 16;
        let engine = BuryPointEngine::from_config(config).unwrap();
        assert!(engine.http_backend.is_some());
    }

    #[tokio::test]
    async fn test_with_parts_has_no_preload_status() {
        let ts = TestStore::new();
        let source = Arc::new(MockSource::new().with_day(1, day(2025, 3, 1), 2));
        let engine = BuryPointEngine::with_parts(config(), ts.store.clone(), source);

        assert_eq!(engine.preload_status().await.unwrap(), None);
        let records = engine
            .get_multi_day_cached_data(&DateRange::single(day(2025, 3, 1)), 1)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(engine.fetch_stats().day_fetches, 1);
        assert_eq!(engine.clear_cache(None).await, 2);
    }
}
