//! Status records.
//!
//! One [`CalcStatus`] exists per cache fingerprint. It is the coordination
//! primitive between request handlers and workers: whoever wants to know
//! whether a concordance can be served reads it, and only the owning worker
//! (or the janitor) mutates it.
//!
//! # Lifecycle
//!
//! ```text
//! Creating ──task_id──► Running ──readable, concsize > 0──► Partial ──finished──► Complete
//!                          │                                   │
//!                          └──────────── error ───────────────►└──────► Failed
//! ```
//!
//! The state is derived from the record's fields, so it can never disagree
//! with them. Field mutations go through [`CalcStatus::apply`], which enforces:
//!
//! - an error always finishes the record
//! - a finished record never regresses (readable stays set, concsize never
//!   decreases, fullsize is frozen)

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CalcError, CalcResult};

/// A failure stored in a status record as `[type-name, message]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError(String, String);

impl SerializedError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self(type_name.into(), message.into())
    }

    pub fn type_name(&self) -> &str {
        &self.0
    }

    pub fn message(&self) -> &str {
        &self.1
    }

    /// Restores the error kind, falling back to [`CalcError::CalcStatus`].
    pub fn to_error(&self) -> CalcError {
        CalcError::from_parts(&self.0, &self.1)
    }
}

impl From<&CalcError> for SerializedError {
    fn from(err: &CalcError) -> Self {
        Self::new(err.type_name(), err.message())
    }
}

/// Lifecycle state of a status record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalcState {
    /// Record exists, no worker assigned yet.
    Creating,
    /// A worker owns the record; nothing is readable yet.
    Running,
    /// Some lines are readable while the computation continues.
    Partial,
    /// Finished without error.
    Complete,
    /// Finished with an error.
    Failed,
}

impl CalcState {
    /// Returns true if no further transitions happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for CalcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Partial => write!(f, "Partial"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// How much of a result a caller needs before it can proceed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinSize {
    /// The whole concordance (`-1`).
    Complete,
    /// Anything readable (`0`).
    Any,
    /// At least this many lines.
    Lines(u64),
}

impl MinSize {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Complete => -1,
            Self::Any => 0,
            Self::Lines(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }
}

impl From<i64> for MinSize {
    fn from(value: i64) -> Self {
        match value {
            v if v < 0 => Self::Complete,
            0 => Self::Any,
            v => Self::Lines(v as u64),
        }
    }
}

impl std::fmt::Display for MinSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// Metadata of one cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalcStatus {
    /// Worker task owning the entry.
    pub task_id: Option<String>,
    /// Artifact path, assigned when the entry is registered.
    pub cachefile: Option<PathBuf>,
    pub readable: bool,
    pub finished: bool,
    pub concsize: u64,
    pub fullsize: u64,
    /// concsize per million tokens of search space
    pub relconcsize: f64,
    pub arf: Option<f64>,
    pub error: Option<SerializedError>,
    pub created: DateTime<Utc>,
    pub last_upd: DateTime<Utc>,
    pub pid: u32,
    pub q0hash: Option<String>,
}

impl Default for CalcStatus {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            task_id: None,
            cachefile: None,
            readable: false,
            finished: false,
            concsize: 0,
            fullsize: 0,
            relconcsize: 0.0,
            arf: None,
            error: None,
            created: now,
            last_upd: now,
            pid: std::process::id(),
            q0hash: None,
        }
    }
}

impl CalcStatus {
    /// Fresh record created by the current process.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn state(&self) -> CalcState {
        if self.error.is_some() {
            CalcState::Failed
        } else if self.finished {
            CalcState::Complete
        } else if self.readable && self.concsize > 0 {
            CalcState::Partial
        } else if self.task_id.is_some() {
            CalcState::Running
        } else {
            CalcState::Creating
        }
    }

    /// Returns true while a computation may still update the record.
    pub fn is_running(&self) -> bool {
        !self.finished
    }

    /// Returns true if a caller needing `minsize` lines can proceed.
    pub fn has_some_result(&self, minsize: MinSize) -> bool {
        if self.finished {
            return true;
        }
        match minsize {
            MinSize::Complete => false,
            MinSize::Any => self.readable,
            MinSize::Lines(n) => self.readable && self.concsize >= n,
        }
    }

    /// Synthesises a timeout if the owner stopped updating the record.
    ///
    /// Returns true if the record was changed.
    pub fn check_for_errors(&mut self, time_limit: Duration) -> bool {
        if self.finished {
            return false;
        }
        let idle = Utc::now().signed_duration_since(self.last_upd);
        let limit = chrono::Duration::from_std(time_limit).unwrap_or(chrono::Duration::MAX);
        if idle <= limit {
            return false;
        }
        let err = CalcError::Timeout(format!(
            "Calculation made no progress for {}s (limit {}s)",
            idle.num_seconds(),
            time_limit.as_secs()
        ));
        self.error = Some(SerializedError::from(&err));
        self.finished = true;
        true
    }

    /// The recorded error, restored to its kind.
    pub fn normalized_error(&self) -> Option<CalcError> {
        self.error.as_ref().map(SerializedError::to_error)
    }

    /// Applies a partial update and refreshes `last_upd`.
    pub fn apply(&mut self, update: &StatusUpdate) {
        let was_finished = self.finished;

        if let Some(task_id) = &update.task_id {
            self.task_id = Some(task_id.clone());
        }
        if let Some(arf) = update.arf {
            self.arf = Some(arf);
        }

        if was_finished {
            // terminal: only monotonic growth
            if update.readable == Some(true) {
                self.readable = true;
            }
            if let Some(concsize) = update.concsize {
                self.concsize = self.concsize.max(concsize);
            }
            if let Some(relconcsize) = update.relconcsize {
                self.relconcsize = self.relconcsize.max(relconcsize);
            }
        } else {
            if let Some(readable) = update.readable {
                self.readable = readable;
            }
            if let Some(concsize) = update.concsize {
                self.concsize = concsize;
            }
            if let Some(fullsize) = update.fullsize {
                self.fullsize = fullsize;
            }
            if let Some(relconcsize) = update.relconcsize {
                self.relconcsize = relconcsize;
            }
            if let Some(finished) = update.finished {
                self.finished = finished;
            }
            if let Some(error) = &update.error {
                self.error = Some(error.clone());
                self.finished = true;
            }
        }

        self.last_upd = Utc::now();
    }

    pub fn to_json(&self) -> CalcResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> CalcResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Partial mutation of a [`CalcStatus`].
///
/// Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub task_id: Option<String>,
    pub readable: Option<bool>,
    pub finished: Option<bool>,
    pub concsize: Option<u64>,
    pub fullsize: Option<u64>,
    pub relconcsize: Option<f64>,
    pub arf: Option<f64>,
    pub error: Option<SerializedError>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn readable(mut self, readable: bool) -> Self {
        self.readable = Some(readable);
        self
    }

    pub fn finished(mut self, finished: bool) -> Self {
        self.finished = Some(finished);
        self
    }

    /// Sets concsize, fullsize and relconcsize together.
    pub fn sizes(mut self, concsize: u64, fullsize: u64, relconcsize: f64) -> Self {
        self.concsize = Some(concsize);
        self.fullsize = Some(fullsize);
        self.relconcsize = Some(relconcsize);
        self
    }

    pub fn arf(mut self, arf: Option<f64>) -> Self {
        self.arf = arf;
        self
    }

    /// Marks the record failed with `err`.
    pub fn failed(err: &CalcError) -> Self {
        Self {
            error: Some(SerializedError::from(err)),
            finished: Some(true),
            ..Self::default()
        }
    }

    /// Marks the record complete with its final sizes.
    pub fn complete(concsize: u64, fullsize: u64, relconcsize: f64, arf: Option<f64>) -> Self {
        Self::new()
            .sizes(concsize, fullsize, relconcsize)
            .readable(true)
            .finished(true)
            .arf(arf)
    }
}
