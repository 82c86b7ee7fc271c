//! Configuration.
//!
//! Two layers:
//!
//! - [`ConfigFile`]: the user-facing INI file (`~/.concache/config.ini`), one
//!   settings struct per `[section]`
//! - [`CalcConfig`]: the typed runtime configuration every component receives,
//!   produced by [`ConfigFile::to_calc_config`]
//!
//! # Example
//!
//! ```ignore
//! use concache::config::{CalcConfig, ConfigFile};
//!
//! let config = ConfigFile::load()?.to_calc_config();
//! assert_eq!(config.task_time_limit.as_secs(), 300);
//!
//! // or build directly, e.g. in tests
//! let config = CalcConfig::new("/tmp/conc").with_task_time_limit(Duration::from_secs(60));
//! ```

mod calc;
mod defaults;
mod file;
mod parser;
mod settings;
mod size;
mod writer;

pub use calc::CalcConfig;
pub use defaults::*;
pub use file::{config_directory, config_file_path, ConfigFileError};
pub use settings::*;
pub use size::{format_size, parse_size, SizeParseError};
