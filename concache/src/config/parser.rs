//! INI parsing logic for converting `Ini` → `ConfigFile`.
//!
//! This is the single place where INI key names are mapped to struct fields.
//! Unknown sections and keys are ignored.

use std::path::PathBuf;
use std::str::FromStr;

use ini::{Ini, Properties};

use super::file::ConfigFileError;
use super::settings::ConfigFile;
use super::size::parse_size;

/// Parse an `Ini` object into a `ConfigFile`.
///
/// Starts from `ConfigFile::default()` and overlays any values found in the INI.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    // [calc_backend] section
    if let Some(section) = ini.section(Some("calc_backend")) {
        let s = Section::new("calc_backend", section);
        if let Some(v) = s.parsed("task_time_limit", "must be a positive integer (seconds)")? {
            config.calc_backend.task_time_limit = s.positive("task_time_limit", v)?;
        }
    }

    // [conc_cache] section
    if let Some(section) = ini.section(Some("conc_cache")) {
        let s = Section::new("conc_cache", section);
        if let Some(v) = s.path("directory") {
            config.conc_cache.directory = v;
        }
        if let Some(v) = section.get("max_size") {
            config.conc_cache.max_size = parse_size(v).map_err(|_| {
                invalid("conc_cache", "max_size", v, "expected format like '20GB', '500MB', or '1024KB'")
            })?;
        }
        if let Some(v) = s.parsed("gc_interval", "must be a positive integer (seconds)")? {
            config.conc_cache.gc_interval = s.positive("gc_interval", v)?;
        }
        if let Some(v) = s.parsed("orphan_age", "must be a non-negative integer (seconds)")? {
            config.conc_cache.orphan_age = v;
        }
    }

    // [conc] section
    if let Some(section) = ini.section(Some("conc")) {
        let s = Section::new("conc", section);
        if let Some(v) = s.seconds("wait_budget_partial")? {
            config.conc.wait_budget_partial = v;
        }
        if let Some(v) = s.seconds("wait_budget_complete")? {
            config.conc.wait_budget_complete = v;
        }
        if let Some(v) = s.seconds("wait_budget_any")? {
            config.conc.wait_budget_any = v;
        }
        if let Some(v) = s.seconds("poll_step")? {
            if v <= 0.0 {
                return Err(invalid("conc", "poll_step", &v.to_string(), "must be greater than zero"));
            }
            config.conc.poll_step = v;
        }
        if let Some(v) = s.parsed("aligned_background_min_size", "must be a token count")? {
            config.conc.aligned_background_min_size = v;
        }
        if let Some(v) = s.parsed("background_min_size", "must be a token count")? {
            config.conc.background_min_size = v;
        }
        if let Some(v) = s.seconds("lock_timeout")? {
            config.conc.lock_timeout = v;
        }
    }

    // [async_worker] section
    if let Some(section) = ini.section(Some("async_worker")) {
        let s = Section::new("async_worker", section);
        if let Some(v) = s.seconds("initial_delay")? {
            config.async_worker.initial_delay = v;
        }
        if let Some(v) = s.seconds("sleep_step")? {
            config.async_worker.sleep_step = v;
        }
        if let Some(v) = s.seconds("max_sleep")? {
            config.async_worker.max_sleep = v;
        }
    }

    // [logging] section
    if let Some(section) = ini.section(Some("logging")) {
        let s = Section::new("logging", section);
        if let Some(v) = s.path("directory") {
            config.logging.directory = v;
        }
        if let Some(v) = section.get("file") {
            let v = v.trim();
            if !v.is_empty() {
                config.logging.file = v.to_string();
            }
        }
    }

    if config.async_worker.max_sleep < config.async_worker.initial_delay {
        return Err(invalid(
            "async_worker",
            "max_sleep",
            &config.async_worker.max_sleep.to_string(),
            "must not be smaller than initial_delay",
        ));
    }

    Ok(config)
}

/// One INI section being read.
struct Section<'a> {
    name: &'static str,
    props: &'a Properties,
}

impl<'a> Section<'a> {
    fn new(name: &'static str, props: &'a Properties) -> Self {
        Self { name, props }
    }

    fn parsed<T: FromStr>(&self, key: &str, reason: &str) -> Result<Option<T>, ConfigFileError> {
        match self.props.get(key) {
            Some(v) => v
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(self.name, key, v, reason)),
            None => Ok(None),
        }
    }

    fn positive(&self, key: &str, value: u64) -> Result<u64, ConfigFileError> {
        if value == 0 {
            return Err(invalid(self.name, key, "0", "must be greater than zero"));
        }
        Ok(value)
    }

    /// Non-negative, finite seconds; fractions allowed.
    fn seconds(&self, key: &str) -> Result<Option<f64>, ConfigFileError> {
        let reason = "must be a non-negative number (seconds)";
        match self.parsed::<f64>(key, reason)? {
            Some(v) if !v.is_finite() || v < 0.0 => {
                Err(invalid(self.name, key, &v.to_string(), reason))
            }
            other => Ok(other),
        }
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.props
            .get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(expand_tilde)
    }
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

pub(super) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
