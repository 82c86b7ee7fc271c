//! Default values for all configuration settings.
//!
//! Contains all `DEFAULT_*` constants and the `ConfigFile::default()`
//! implementation.

use std::path::PathBuf;

use super::settings::*;

// =============================================================================
// [calc_backend]
// =============================================================================

/// Default task time limit in seconds.
pub const DEFAULT_TASK_TIME_LIMIT_SECS: u64 = 300;

// =============================================================================
// [conc_cache]
// =============================================================================

/// Default artifact cache size (20 GB).
pub const DEFAULT_CONC_CACHE_MAX_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// Default seconds between janitor sweeps.
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 600;

/// Default orphan age in seconds.
pub const DEFAULT_ORPHAN_AGE_SECS: u64 = 3600;

// =============================================================================
// [conc]
// =============================================================================

pub const DEFAULT_WAIT_BUDGET_PARTIAL_SECS: f64 = 2.0;
pub const DEFAULT_WAIT_BUDGET_COMPLETE_SECS: f64 = 19.0;
pub const DEFAULT_WAIT_BUDGET_ANY_SECS: f64 = 2.0;
pub const DEFAULT_POLL_STEP_SECS: f64 = 0.1;

/// Aligned-drop pipelines on corpora above this size run in the background.
pub const DEFAULT_ALIGNED_BACKGROUND_MIN_SIZE: u64 = 50_000_000;

/// Multi-step pipelines on corpora above this size run in the background.
pub const DEFAULT_BACKGROUND_MIN_SIZE: u64 = 2_000_000_000;

pub const DEFAULT_LOCK_TIMEOUT_SECS: f64 = 30.0;

// =============================================================================
// [async_worker]
// =============================================================================

pub const DEFAULT_ASYNC_INITIAL_DELAY_SECS: f64 = 0.3;
pub const DEFAULT_ASYNC_SLEEP_STEP_SECS: f64 = 0.1;
pub const DEFAULT_ASYNC_MAX_SLEEP_SECS: f64 = 2.0;

// =============================================================================
// [logging]
// =============================================================================

pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_LOG_FILE: &str = "concache.log";

/// Default artifact root (platform cache dir + `concache`).
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("concache")
}

// =============================================================================
// ConfigFile::default()
// =============================================================================

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            calc_backend: CalcBackendSettings {
                task_time_limit: DEFAULT_TASK_TIME_LIMIT_SECS,
            },
            conc_cache: ConcCacheSettings {
                directory: default_cache_directory(),
                max_size: DEFAULT_CONC_CACHE_MAX_SIZE,
                gc_interval: DEFAULT_GC_INTERVAL_SECS,
                orphan_age: DEFAULT_ORPHAN_AGE_SECS,
            },
            conc: ConcSettings {
                wait_budget_partial: DEFAULT_WAIT_BUDGET_PARTIAL_SECS,
                wait_budget_complete: DEFAULT_WAIT_BUDGET_COMPLETE_SECS,
                wait_budget_any: DEFAULT_WAIT_BUDGET_ANY_SECS,
                poll_step: DEFAULT_POLL_STEP_SECS,
                aligned_background_min_size: DEFAULT_ALIGNED_BACKGROUND_MIN_SIZE,
                background_min_size: DEFAULT_BACKGROUND_MIN_SIZE,
                lock_timeout: DEFAULT_LOCK_TIMEOUT_SECS,
            },
            async_worker: AsyncWorkerSettings {
                initial_delay: DEFAULT_ASYNC_INITIAL_DELAY_SECS,
                sleep_step: DEFAULT_ASYNC_SLEEP_STEP_SECS,
                max_sleep: DEFAULT_ASYNC_MAX_SLEEP_SECS,
            },
            logging: LoggingSettings {
                directory: PathBuf::from(DEFAULT_LOG_DIR),
                file: DEFAULT_LOG_FILE.to_string(),
            },
        }
    }
}
