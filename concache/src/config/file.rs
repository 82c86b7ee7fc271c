//! Configuration file handling for ~/.concache/config.ini.
//!
//! Settings structs live in [`super::settings`], constants in [`super::defaults`],
//! parsing in [`super::parser`], and serialization in [`super::writer`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use super::calc::CalcConfig;
use super::settings::ConfigFile;

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    /// Failed to write config file
    #[error("Failed to write config file: {0}")]
    WriteError(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    /// Failed to create config directory
    #[error("Failed to create config directory: {0}")]
    DirectoryError(std::io::Error),
}

impl ConfigFile {
    /// Load configuration from the default path (~/.concache/config.ini).
    pub fn load() -> Result<Self, ConfigFileError> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from a specific path.
    ///
    /// If the file doesn't exist, returns defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path)?;
        super::parser::parse_ini(&ini)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigFileError::DirectoryError)?;
        }

        let content = super::writer::to_config_string(self);
        std::fs::write(path, content).map_err(|e| ConfigFileError::WriteError(e.to_string()))
    }

    /// Runtime configuration derived from the file settings.
    pub fn to_calc_config(&self) -> CalcConfig {
        CalcConfig {
            task_time_limit: Duration::from_secs(self.calc_backend.task_time_limit),
            cache_dir: self.conc_cache.directory.clone(),
            max_cache_size: self.conc_cache.max_size,
            gc_interval: Duration::from_secs(self.conc_cache.gc_interval),
            orphan_age: Duration::from_secs(self.conc_cache.orphan_age),
            wait_budget_partial: Duration::from_secs_f64(self.conc.wait_budget_partial),
            wait_budget_complete: Duration::from_secs_f64(self.conc.wait_budget_complete),
            wait_budget_any: Duration::from_secs_f64(self.conc.wait_budget_any),
            poll_step: Duration::from_secs_f64(self.conc.poll_step),
            aligned_background_min_size: self.conc.aligned_background_min_size,
            background_min_size: self.conc.background_min_size,
            lock_timeout: Duration::from_secs_f64(self.conc.lock_timeout),
            async_initial_delay: Duration::from_secs_f64(self.async_worker.initial_delay),
            async_sleep_step: Duration::from_secs_f64(self.async_worker.sleep_step),
            async_max_sleep: Duration::from_secs_f64(self.async_worker.max_sleep),
        }
    }
}

/// Get the path to the config directory (~/.concache).
pub fn config_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".concache")
}

/// Get the path to the config file (~/.concache/config.ini).
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}
