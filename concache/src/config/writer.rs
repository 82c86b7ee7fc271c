//! INI serialization logic for converting `ConfigFile` → INI string.

use std::path::Path;

use super::settings::ConfigFile;
use super::size::format_size;

/// Convert a `ConfigFile` to a commented INI string for saving.
pub(super) fn to_config_string(config: &ConfigFile) -> String {
    format!(
        r#"[calc_backend]
; Seconds a calculation may go without updating its status record before it
; is considered lost (default: 300)
task_time_limit = {}

[conc_cache]
; Root directory for concordance artifacts
directory = {}
; Artifact cache size (default: 20GB). Supports KB, MB, GB suffixes
max_size = {}
; Seconds between janitor sweeps (default: 600)
gc_interval = {}
; Seconds before an artifact without a status record is deleted (default: 3600)
orphan_age = {}

[conc]
; Seconds to wait for a calculation depending on what the request needs:
;   partial  - a page of results
;   complete - the whole concordance
;   any      - anything readable
wait_budget_partial = {}
wait_budget_complete = {}
wait_budget_any = {}
; Poll schedule unit in seconds; the k-th poll sleeps poll_step * k
poll_step = {}
; Corpus sizes (tokens) above which multi-step pipelines run in the background
aligned_background_min_size = {}
background_min_size = {}
; Seconds to wait for the per-request lock
lock_timeout = {}

[async_worker]
; Republish schedule of growing concordances (seconds)
initial_delay = {}
sleep_step = {}
max_sleep = {}

[logging]
directory = {}
file = {}
"#,
        config.calc_backend.task_time_limit,
        path_to_string(&config.conc_cache.directory),
        format_size(config.conc_cache.max_size),
        config.conc_cache.gc_interval,
        config.conc_cache.orphan_age,
        config.conc.wait_budget_partial,
        config.conc.wait_budget_complete,
        config.conc.wait_budget_any,
        config.conc.poll_step,
        config.conc.aligned_background_min_size,
        config.conc.background_min_size,
        config.conc.lock_timeout,
        config.async_worker.initial_delay,
        config.async_worker.sleep_step,
        config.async_worker.max_sleep,
        path_to_string(&config.logging.directory),
        config.logging.file,
    )
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
