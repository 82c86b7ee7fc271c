//! Settings structs for all configuration sections.
//!
//! Each struct represents one `[section]` of the INI config file.
//! These are pure data types with no parsing or serialization logic.

use std::path::PathBuf;

/// Complete configuration loaded from config.ini.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    /// Worker runtime settings
    pub calc_backend: CalcBackendSettings,
    /// Artifact cache settings
    pub conc_cache: ConcCacheSettings,
    /// Dispatcher and resolver settings
    pub conc: ConcSettings,
    /// Async worker republish schedule
    pub async_worker: AsyncWorkerSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// `[calc_backend]`
#[derive(Debug, Clone, PartialEq)]
pub struct CalcBackendSettings {
    /// Seconds a task may go without updating its status record.
    pub task_time_limit: u64,
}

/// `[conc_cache]`
#[derive(Debug, Clone, PartialEq)]
pub struct ConcCacheSettings {
    /// Root directory of concordance artifacts
    pub directory: PathBuf,
    /// Artifact bytes above which the janitor evicts
    pub max_size: u64,
    /// Seconds between janitor sweeps
    pub gc_interval: u64,
    /// Seconds before an unreferenced artifact counts as orphaned
    pub orphan_age: u64,
}

/// `[conc]`
#[derive(Debug, Clone, PartialEq)]
pub struct ConcSettings {
    /// Poll budget (seconds) when a number of lines is requested
    pub wait_budget_partial: f64,
    /// Poll budget (seconds) when the whole concordance is requested
    pub wait_budget_complete: f64,
    /// Poll budget (seconds) when anything readable will do
    pub wait_budget_any: f64,
    /// Unit of the poll schedule (seconds)
    pub poll_step: f64,
    /// Corpus size above which aligned-drop pipelines run in the background
    pub aligned_background_min_size: u64,
    /// Corpus size above which multi-step pipelines run in the background
    pub background_min_size: u64,
    /// Seconds to wait for the per-request lock
    pub lock_timeout: f64,
}

/// `[async_worker]`
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncWorkerSettings {
    /// Seconds before the first partial save
    pub initial_delay: f64,
    /// Seconds added to the republish sleep each cycle
    pub sleep_step: f64,
    /// Upper bound of the republish sleep
    pub max_sleep: f64,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    /// Log directory
    pub directory: PathBuf,
    /// Log file name inside `directory`
    pub file: String,
}
