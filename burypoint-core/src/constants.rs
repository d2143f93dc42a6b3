//! Constants for the bury-point cache engine
//!
//! Defaults for every configurable value live here so they are easy to find
//! and to reference from tests.

// ============================================================================
// REMOTE ANALYTICS SOURCE
// ============================================================================

/// Search endpoint path on the vendor API.
pub const SEARCH_PATH: &str = "/tracker/buryPointTest/search";

/// Application-level success code in vendor responses.
pub const SOURCE_SUCCESS_CODE: i64 = 200;

/// Default records requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Default maximum pages fetched for one day before the entry is marked partial.
pub const DEFAULT_MAX_PAGES: u32 = 50;

/// Default timeout for bulk fetch calls (30 seconds)
pub const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 30_000;

/// Default vendor request budget per minute.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 120;

/// Default `dataType` sent with search requests.
pub const DEFAULT_DATA_TYPE: &str = "list";

// ============================================================================
// BACKEND STORE
// ============================================================================

/// Liveness endpoint of the backend store.
pub const BACKEND_HEALTH_PATH: &str = "/api/health";

/// Preload subsystem status endpoint.
pub const BACKEND_PRELOAD_STATUS_PATH: &str = "/api/preload/status";

/// Prefix of the per-day raw-data cache endpoint.
pub const BACKEND_RAW_DATA_PATH: &str = "/api/cache/raw-data";

/// Default timeout for backend and diagnostic queries (10 seconds)
pub const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 10_000;

// ============================================================================
// LOCAL TIERS
// ============================================================================

/// Default durable-local store location.
pub const DEFAULT_LOCAL_PATH: &str = ".burypoint/cache";

/// Default LMDB map size in megabytes.
pub const DEFAULT_LOCAL_MAX_SIZE_MB: usize = 256;

/// Default memory tier capacity in entries.
pub const DEFAULT_MEMORY_MAX_ENTRIES: usize = 2048;

// ============================================================================
// DIAGNOSTICS AND REPAIR
// ============================================================================

/// Relative record-count difference above which a mismatch is HIGH.
pub const DEFAULT_COUNT_MISMATCH_HIGH_RATIO: f64 = 0.25;

/// Clock slack allowed before a memory copy counts as stale (5 seconds)
pub const DEFAULT_STALE_TOLERANCE_MS: u64 = 5_000;

/// Days scanned by the quick health check (today only).
pub const DEFAULT_QUICK_WINDOW_DAYS: u32 = 1;

/// Time budget of the quick health check (10 seconds)
pub const DEFAULT_QUICK_BUDGET_MS: u64 = 10_000;

/// Repairs dispatched concurrently within one batch.
pub const DEFAULT_REPAIR_CONCURRENCY: usize = 4;

/// Pause before re-verifying repaired keys (3 seconds)
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 3_000;

// ============================================================================
// HEALTH MONITOR
// ============================================================================

/// Interval between periodic health checks (10 minutes)
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 600;

/// Delay before the first health check after startup.
pub const DEFAULT_HEALTH_INITIAL_DELAY_SECS: u64 = 5;

// ============================================================================
// PRELOAD
// ============================================================================

/// Rolling window warmed by a manual preload.
pub const DEFAULT_PRELOAD_WINDOW_DAYS: u32 = 7;

/// Longest trailing window accepted for preload, quick checks and the doctor.
pub const MAX_WINDOW_DAYS: u32 = 366;

// ============================================================================
// LOGGING
// ============================================================================

/// Default tracing filter directive.
pub const DEFAULT_LOG_FILTER: &str = "burypoint=info";
