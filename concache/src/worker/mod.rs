//! Worker runtime and calculation workers.
//!
//! Calculations run as tasks on a [`WorkerRuntime`]. The runtime only knows
//! how to start, time-limit and revoke tasks; what a task does is decided by
//! the [`TaskHandler`] attached to it (the calculation context), which
//! delegates to one of two workers:
//!
//! - [`AsyncWorker`]: single root query, republishes a growing artifact so
//!   readers can page through partial results
//! - [`SyncWorker`]: whole pipeline in one shot, publishing every step
//!
//! # Architecture
//!
//! ```text
//! Dispatcher ──send_task(WorkerTask)──► WorkerRuntime ──handle()──► TaskHandler
//!     ▲                                     │                            │
//!     │                                revoke(task_id)          AsyncWorker / SyncWorker
//!     │                                     ▲                            │
//!     └──────── status records ◄────── Janitor                 status records, artifacts
//! ```
//!
//! Tasks must be idempotent: the runtime may deliver a task more than once.
//! Workers never report errors to the runtime; failures end up in the
//! status records of the steps they own.

mod async_worker;
mod local;
mod sync_worker;

pub use async_worker::AsyncWorker;
pub use local::LocalWorkerRuntime;
pub use sync_worker::{SyncMode, SyncWorker};

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::artifact::{ArtifactHeader, ArtifactStore};
use crate::context::CalcContext;
use crate::engine::{Concordance, Corpus, EngineError, SaveMode};
use crate::error::CalcResult;
use crate::query::Pipeline;

/// Worker runtime errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The task is unknown to the runtime (finished, revoked or never sent).
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The runtime no longer accepts tasks.
    #[error("Worker runtime is shut down")]
    ShutDown,

    /// No task handler is attached to the runtime.
    #[error("Worker runtime has no task handler attached")]
    NoHandler,
}

/// Identity of a worker task.
#[derive(Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A calculation task.
///
/// Serializable so that a distributed runtime can ship it to another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum WorkerTask {
    /// Compute a single root query with periodic republication.
    CalculateAsync {
        corpus: Corpus,
        pipeline: Pipeline,
        cutoff: u64,
        samplesize: u64,
    },
    /// Compute a pipeline from its first missing step.
    CalculateSync {
        corpus: Corpus,
        pipeline: Pipeline,
        cutoff: u64,
        samplesize: u64,
    },
}

impl WorkerTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CalculateAsync { .. } => "calculate_async",
            Self::CalculateSync { .. } => "calculate_sync",
        }
    }

    pub fn corpus(&self) -> &Corpus {
        match self {
            Self::CalculateAsync { corpus, .. } | Self::CalculateSync { corpus, .. } => corpus,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        match self {
            Self::CalculateAsync { pipeline, .. } | Self::CalculateSync { pipeline, .. } => pipeline,
        }
    }
}

/// Task queue used to run calculations outside the request.
pub trait WorkerRuntime: Send + Sync + 'static {
    /// Starts `task`. It is abandoned after `time_limit`.
    fn send_task<'a>(
        &'a self,
        task: WorkerTask,
        time_limit: Duration,
    ) -> BoxFuture<'a, Result<TaskId, WorkerError>>;

    /// Stops a running task.
    ///
    /// With `terminate` the task is killed immediately; otherwise it is asked
    /// to stop at its next suspension point.
    fn revoke<'a>(
        &'a self,
        task_id: &'a TaskId,
        terminate: bool,
    ) -> BoxFuture<'a, Result<(), WorkerError>>;
}

/// Executes tasks delivered by a runtime.
pub trait TaskHandler: Send + Sync + 'static {
    /// Runs `task` until it finishes or `cancel` fires.
    fn handle(
        self: Arc<Self>,
        task_id: TaskId,
        task: WorkerTask,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()>;
}

/// Saves `conc` next to `path`, publishes it by rename and reads back the
/// published header.
pub(crate) async fn save_and_publish(
    ctx: &CalcContext,
    conc: Concordance,
    path: &Path,
    mode: SaveMode,
) -> CalcResult<(Concordance, ArtifactHeader)> {
    let tmp = ArtifactStore::tmp_path(path);
    let (conc, saved) = conc.run_blocking(move |c| c.save(&tmp, mode)).await?;
    saved?;
    ctx.artifacts().publish(path).await?;
    let header = ctx.artifacts().read_header(path).await?.ok_or_else(|| {
        EngineError::failed(format!("{} has no concordance header", path.display()))
    })?;
    Ok((conc, header))
}
