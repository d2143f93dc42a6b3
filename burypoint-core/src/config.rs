//! Configuration loading for the bury-point cache engine.
//!
//! Configuration is read from a TOML file located via `--config <path>` or
//! `BURYPOINT_CONFIG`. Every section has defaults except the endpoint URLs
//! and the project id, which `validate` requires. A handful of fields can be
//! overridden from `BURYPOINT_*` environment variables.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuryPointConfig {
    pub source: SourceConfig,
    pub backend: BackendConfig,
    pub local: LocalConfig,
    pub memory: MemoryConfig,
    pub diagnostics: DiagnosticsConfig,
    pub health: HealthConfig,
    pub preload: PreloadConfig,
    pub logging: LoggingConfig,
}

/// Remote Analytics Source settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub base_url: String,
    pub project_id: String,
    /// Bearer token, acquired elsewhere and injected here.
    pub token: Option<String>,
    pub data_type: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub timeout_ms: u64,
    pub requests_per_minute: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            project_id: String::new(),
            token: None,
            data_type: DEFAULT_DATA_TYPE.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            timeout_ms: DEFAULT_SOURCE_TIMEOUT_MS,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
        }
    }
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backend authoritative store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: DEFAULT_BACKEND_TIMEOUT_MS,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Durable-local tier settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalConfig {
    pub path: PathBuf,
    pub max_size_mb: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_LOCAL_PATH),
            max_size_mb: DEFAULT_LOCAL_MAX_SIZE_MB,
        }
    }
}

/// Memory tier settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    pub max_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MEMORY_MAX_ENTRIES,
        }
    }
}

/// Diagnostic and repair settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiagnosticsConfig {
    /// Relative count difference above which a mismatch is HIGH.
    pub count_mismatch_high_ratio: f64,
    pub stale_tolerance_ms: u64,
    pub quick_window_days: u32,
    pub quick_budget_ms: u64,
    pub repair_concurrency: usize,
    /// Pause before re-verifying repairs; the backend is eventually consistent.
    pub settle_delay_ms: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            count_mismatch_high_ratio: DEFAULT_COUNT_MISMATCH_HIGH_RATIO,
            stale_tolerance_ms: DEFAULT_STALE_TOLERANCE_MS,
            quick_window_days: DEFAULT_QUICK_WINDOW_DAYS,
            quick_budget_ms: DEFAULT_QUICK_BUDGET_MS,
            repair_concurrency: DEFAULT_REPAIR_CONCURRENCY,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
        }
    }
}

impl DiagnosticsConfig {
    pub fn stale_tolerance(&self) -> Duration {
        Duration::from_millis(self.stale_tolerance_ms)
    }

    pub fn quick_budget(&self) -> Duration {
        Duration::from_millis(self.quick_budget_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
    pub tracking_point_ids: Vec<i64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            initial_delay_secs: DEFAULT_HEALTH_INITIAL_DELAY_SECS,
            tracking_point_ids: Vec::new(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

/// Manual preload settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreloadConfig {
    pub window_days: u32,
    pub tracking_point_ids: Vec<i64>,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_PRELOAD_WINDOW_DAYS,
            tracking_point_ids: Vec::new(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive; `RUST_LOG` wins when set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

impl BuryPointConfig {
    /// Locate, read, override from the environment and validate the config.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let mut config = Self::from_path(&path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: BuryPointConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Apply `BURYPOINT_*` overrides.
    ///
    /// # Environment Variables
    /// - `BURYPOINT_SOURCE_BASE_URL`: vendor API base URL
    /// - `BURYPOINT_PROJECT_ID`: vendor project id
    /// - `BURYPOINT_SOURCE_TOKEN`: bearer token for the vendor API
    /// - `BURYPOINT_BACKEND_BASE_URL`: backend store base URL
    /// - `BURYPOINT_LOCAL_PATH`: durable-local store directory
    /// - `BURYPOINT_SETTLE_DELAY_MS`: settle delay before re-verification
    /// - `BURYPOINT_LOG_JSON`: "true" for JSON log lines
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("BURYPOINT_SOURCE_BASE_URL") {
            self.source.base_url = url;
        }
        if let Some(project) = lookup("BURYPOINT_PROJECT_ID") {
            self.source.project_id = project;
        }
        if let Some(token) = lookup("BURYPOINT_SOURCE_TOKEN") {
            self.source.token = Some(token);
        }
        if let Some(url) = lookup("BURYPOINT_BACKEND_BASE_URL") {
            self.backend.base_url = url;
        }
        if let Some(path) = lookup("BURYPOINT_LOCAL_PATH") {
            self.local.path = PathBuf::from(path);
        }
        if let Some(ms) = lookup("BURYPOINT_SETTLE_DELAY_MS").and_then(|s| s.parse().ok()) {
            self.diagnostics.settle_delay_ms = ms;
        }
        if let Some(json) = lookup("BURYPOINT_LOG_JSON") {
            self.logging.json = json.to_lowercase() == "true";
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "source.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.source.project_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "source.project_id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "backend.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.source.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "source.page_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.source.max_pages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "source.max_pages",
                reason: "must be > 0".to_string(),
            });
        }
        if self.source.timeout_ms == 0 || self.backend.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.local.max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "local.max_size_mb",
                reason: "must be > 0".to_string(),
            });
        }
        if self.memory.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_entries",
                reason: "must be > 0".to_string(),
            });
        }
        let ratio = self.diagnostics.count_mismatch_high_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "diagnostics.count_mismatch_high_ratio",
                reason: format!("must be in (0, 1], got {ratio}"),
            });
        }
        if self.diagnostics.repair_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "diagnostics.repair_concurrency",
                reason: "must be > 0".to_string(),
            });
        }
        for (field, days) in [
            ("preload.window_days", self.preload.window_days),
            ("diagnostics.quick_window_days", self.diagnostics.quick_window_days),
        ] {
            if days == 0 || days > MAX_WINDOW_DAYS {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("must be in 1..={MAX_WINDOW_DAYS}, got {days}"),
                });
            }
        }
        if self.health.enabled && self.health.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health.interval_secs",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("BURYPOINT_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
