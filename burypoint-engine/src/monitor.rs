//! Health Monitor Background Task
//!
//! Runs the quick health check on a fixed interval and publishes the latest
//! [`HealthSnapshot`] on a `watch` channel. The first check runs after a
//! short initial delay so the backend has time to come up.
//!
//! The task is owned by a [`HealthMonitorHandle`]; `stop()` signals shutdown
//! and waits for the loop to exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burypoint_core::{HealthConfig, HealthSnapshot};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::diagnostics::DiagnosticEngine;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub enabled: bool,
    /// Time between checks (default: 10 minutes)
    pub interval: Duration,
    /// Delay before the first check (default: 5 seconds)
    pub initial_delay: Duration,
    pub tracking_point_ids: Vec<i64>,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthMonitorConfig {
    fn from(config: &HealthConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: config.interval(),
            initial_delay: config.initial_delay(),
            tracking_point_ids: config.tracking_point_ids.clone(),
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct HealthMonitorMetrics {
    /// Checks completed since startup
    pub checks_run: AtomicU64,
    /// Checks that ended in `unknown`
    pub checks_unknown: AtomicU64,
    /// Issues found by the most recent check
    pub last_issue_count: AtomicU64,
}

impl HealthMonitorMetrics {
    pub fn snapshot(&self) -> HealthMonitorStats {
        HealthMonitorStats {
            checks_run: self.checks_run.load(Ordering::Relaxed),
            checks_unknown: self.checks_unknown.load(Ordering::Relaxed),
            last_issue_count: self.last_issue_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthMonitorStats {
    pub checks_run: u64,
    pub checks_unknown: u64,
    pub last_issue_count: u64,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Owner of a running (or disabled) health monitor.
#[derive(Debug)]
pub struct HealthMonitorHandle {
    status_rx: watch::Receiver<HealthSnapshot>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    metrics: Arc<HealthMonitorMetrics>,
}

impl HealthMonitorHandle {
    /// The latest published snapshot.
    pub fn current(&self) -> HealthSnapshot {
        self.status_rx.borrow().clone()
    }

    /// A receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.status_rx.clone()
    }

    pub fn metrics(&self) -> HealthMonitorStats {
        self.metrics.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal shutdown and wait for the task to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
        }
        info!("Health monitor stopped");
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

pub struct HealthMonitor;

impl HealthMonitor {
    /// Start the monitor. A disabled config spawns nothing and the handle
    /// reports `unknown`.
    pub fn spawn(
        diagnostics: Arc<DiagnosticEngine>,
        config: HealthMonitorConfig,
    ) -> HealthMonitorHandle {
        let metrics = Arc::new(HealthMonitorMetrics::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if !config.enabled {
            let (_, status_rx) = watch::channel(HealthSnapshot::unknown("health monitor disabled"));
            info!("Health monitor disabled");
            return HealthMonitorHandle {
                status_rx,
                shutdown_tx,
                task: None,
                metrics,
            };
        }

        let (status_tx, status_rx) = watch::channel(HealthSnapshot::unchecked());
        info!(
            interval_secs = config.interval.as_secs(),
            initial_delay_secs = config.initial_delay.as_secs(),
            tracking_points = config.tracking_point_ids.len(),
            "Starting health monitor"
        );
        let task = tokio::spawn(run_monitor(
            diagnostics,
            config,
            status_tx,
            metrics.clone(),
            shutdown_rx,
        ));

        HealthMonitorHandle {
            status_rx,
            shutdown_tx,
            task: Some(task),
            metrics,
        }
    }
}

async fn run_monitor(
    diagnostics: Arc<DiagnosticEngine>,
    config: HealthMonitorConfig,
    status_tx: watch::Sender<HealthSnapshot>,
    metrics: Arc<HealthMonitorMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = config.interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + config.initial_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Health monitor received shutdown signal");
                    break;
                }
            }
            _ = ticker.tick() => {
                run_check(&diagnostics, &config, &status_tx, &metrics).await;
            }
        }
    }
}

async fn run_check(
    diagnostics: &DiagnosticEngine,
    config: &HealthMonitorConfig,
    status_tx: &watch::Sender<HealthSnapshot>,
    metrics: &HealthMonitorMetrics,
) {
    let snapshot = diagnostics
        .quick_health_check(&config.tracking_point_ids)
        .await;

    metrics.checks_run.fetch_add(1, Ordering::Relaxed);
    metrics
        .last_issue_count
        .store(snapshot.issues.len() as u64, Ordering::Relaxed);
    if !snapshot.status.is_known() {
        metrics.checks_unknown.fetch_add(1, Ordering::Relaxed);
    }

    let previous = status_tx.borrow().status;
    if previous != snapshot.status {
        info!(from = %previous, to = %snapshot.status, "{}", snapshot.summary());
    } else {
        debug!(status = %snapshot.status, "{}", snapshot.summary());
    }
    status_tx.send_replace(snapshot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use burypoint_core::{ClearScope, HealthStatus, TierKind};
    use burypoint_storage::CacheTier;
    use burypoint_test_utils::fixtures::{self, PROJECT};
    use burypoint_test_utils::TestStore;
    use chrono::Utc;

    fn config(tracking_point_ids: Vec<i64>) -> HealthMonitorConfig {
        HealthMonitorConfig {
            enabled: true,
            interval: Duration::from_secs(600),
            initial_delay: Duration::from_secs(5),
            tracking_point_ids,
        }
    }

    #[tokio::test]
    async fn test_disabled_monitor_is_unknown() {
        let ts = TestStore::new();
        let engine = Arc::new(DiagnosticEngine::new(ts.store.clone(), PROJECT, Default::default()));
        let handle = HealthMonitor::spawn(
            engine,
            HealthMonitorConfig {
                enabled: false,
                ..config(vec![1])
            },
        );
        assert!(!handle.is_running());
        assert_eq!(handle.current().status, HealthStatus::Unknown);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_check_after_delay_then_interval() {
        let ts = TestStore::new();
        let today = Utc::now().date_naive();
        let key = fixtures::key(today, 1);
        ts.seed(TierKind::Memory, &fixtures::entry(key, 4)).await;
        let engine = Arc::new(DiagnosticEngine::new(ts.store.clone(), PROJECT, Default::default()));

        let handle = HealthMonitor::spawn(engine, config(vec![1]));
        let mut rx = handle.subscribe();
        assert_eq!(handle.current().status, HealthStatus::Unknown);

        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.status, HealthStatus::Critical);
        assert!(snapshot.checked_at.is_some());
        assert_eq!(handle.metrics().checks_run, 1);

        ts.backend.insert(fixtures::entry(fixtures::key(today, 1), 4));
        ts.memory.clear(&ClearScope::All).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().status, HealthStatus::Healthy);
        assert_eq!(handle.metrics().checks_run, 2);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backend_counts_unknown() {
        let ts = TestStore::new();
        ts.backend.set_unreachable(true);
        let engine = Arc::new(DiagnosticEngine::new(ts.store.clone(), PROJECT, Default::default()));

        let handle = HealthMonitor::spawn(engine, config(vec![1]));
        let mut rx = handle.subscribe();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().status, HealthStatus::Unknown);
        assert_eq!(handle.metrics().checks_unknown, 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_check() {
        let ts = TestStore::new();
        let engine = Arc::new(DiagnosticEngine::new(ts.store.clone(), PROJECT, Default::default()));
        let handle = HealthMonitor::spawn(engine, config(vec![1]));
        assert!(handle.is_running());
        handle.stop().await;
    }
}
