//! Runtime configuration of the coordinator.

use std::path::PathBuf;
use std::time::Duration;

use super::defaults::*;
use crate::status::MinSize;

/// Typed configuration shared by the dispatcher, resolver, workers and janitor.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use concache::config::CalcConfig;
///
/// let config = CalcConfig::new("/tmp/conc")
///     .with_task_time_limit(Duration::from_secs(60))
///     .with_poll_step(Duration::from_millis(10));
/// assert_eq!(config.task_time_limit.as_secs(), 60);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CalcConfig {
    /// Limit for `check_for_errors` and the worker task timeout
    pub task_time_limit: Duration,
    /// Artifact root
    pub cache_dir: PathBuf,
    /// Artifact bytes above which the janitor evicts
    pub max_cache_size: u64,
    pub gc_interval: Duration,
    pub orphan_age: Duration,
    pub wait_budget_partial: Duration,
    pub wait_budget_complete: Duration,
    pub wait_budget_any: Duration,
    pub poll_step: Duration,
    pub aligned_background_min_size: u64,
    pub background_min_size: u64,
    pub lock_timeout: Duration,
    pub async_initial_delay: Duration,
    pub async_sleep_step: Duration,
    pub async_max_sleep: Duration,
}

impl CalcConfig {
    /// Defaults with artifacts under `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_task_time_limit(mut self, limit: Duration) -> Self {
        self.task_time_limit = limit;
        self
    }

    pub fn with_poll_step(mut self, step: Duration) -> Self {
        self.poll_step = step;
        self
    }

    /// Sets all three `wait_for_status` budgets.
    pub fn with_wait_budgets(mut self, partial: Duration, complete: Duration, any: Duration) -> Self {
        self.wait_budget_partial = partial;
        self.wait_budget_complete = complete;
        self.wait_budget_any = any;
        self
    }

    pub fn with_background_thresholds(mut self, aligned: u64, any: u64) -> Self {
        self.aligned_background_min_size = aligned;
        self.background_min_size = any;
        self
    }

    /// Sets the async worker republish schedule.
    pub fn with_async_schedule(mut self, initial: Duration, step: Duration, max: Duration) -> Self {
        self.async_initial_delay = initial;
        self.async_sleep_step = step;
        self.async_max_sleep = max;
        self
    }

    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn with_orphan_age(mut self, age: Duration) -> Self {
        self.orphan_age = age;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// How long `wait_for_status` may poll for `minsize`.
    pub fn wait_budget(&self, minsize: MinSize) -> Duration {
        match minsize {
            MinSize::Lines(_) => self.wait_budget_partial,
            MinSize::Complete => self.wait_budget_complete,
            MinSize::Any => self.wait_budget_any,
        }
    }
}

impl Default for CalcConfig {
    fn default() -> Self {
        Self {
            task_time_limit: Duration::from_secs(DEFAULT_TASK_TIME_LIMIT_SECS),
            cache_dir: default_cache_directory(),
            max_cache_size: DEFAULT_CONC_CACHE_MAX_SIZE,
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
            orphan_age: Duration::from_secs(DEFAULT_ORPHAN_AGE_SECS),
            wait_budget_partial: Duration::from_secs_f64(DEFAULT_WAIT_BUDGET_PARTIAL_SECS),
            wait_budget_complete: Duration::from_secs_f64(DEFAULT_WAIT_BUDGET_COMPLETE_SECS),
            wait_budget_any: Duration::from_secs_f64(DEFAULT_WAIT_BUDGET_ANY_SECS),
            poll_step: Duration::from_secs_f64(DEFAULT_POLL_STEP_SECS),
            aligned_background_min_size: DEFAULT_ALIGNED_BACKGROUND_MIN_SIZE,
            background_min_size: DEFAULT_BACKGROUND_MIN_SIZE,
            lock_timeout: Duration::from_secs_f64(DEFAULT_LOCK_TIMEOUT_SECS),
            async_initial_delay: Duration::from_secs_f64(DEFAULT_ASYNC_INITIAL_DELAY_SECS),
            async_sleep_step: Duration::from_secs_f64(DEFAULT_ASYNC_SLEEP_STEP_SECS),
            async_max_sleep: Duration::from_secs_f64(DEFAULT_ASYNC_MAX_SLEEP_SECS),
        }
    }
}
