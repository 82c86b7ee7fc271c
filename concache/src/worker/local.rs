//! In-process worker runtime on tokio.
//!
//! Every task runs as a spawned tokio task with its own
//! [`CancellationToken`], a child of the runtime's shutdown token.
//!
//! # Revocation
//!
//! - `revoke(id, false)` cancels the token; the worker stops at its next
//!   suspension point
//! - `revoke(id, true)` additionally aborts the tokio task
//!
//! Blocking engine calls already in flight cannot be interrupted; their
//! results are discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TaskHandler, TaskId, WorkerError, WorkerRuntime, WorkerTask};

struct RunningTask {
    name: &'static str,
    cancel: CancellationToken,
    abort: Option<AbortHandle>,
}

/// Runs tasks on the current tokio runtime.
///
/// The handler is attached after construction because it usually owns the
/// runtime itself; only a weak reference is kept.
pub struct LocalWorkerRuntime {
    handler: OnceLock<Weak<dyn TaskHandler>>,
    tasks: Arc<DashMap<TaskId, RunningTask>>,
    counter: AtomicU64,
    shutdown: CancellationToken,
}

impl LocalWorkerRuntime {
    pub fn new() -> Self {
        Self {
            handler: OnceLock::new(),
            tasks: Arc::new(DashMap::new()),
            counter: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Attaches the task handler. Only the first call has an effect.
    pub fn attach(&self, handler: Weak<dyn TaskHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    /// Number of tasks currently running.
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Cancels every running task and rejects new ones.
    pub fn shutdown(&self) {
        info!(running = self.tasks.len(), "Worker runtime shutting down");
        self.shutdown.cancel();
    }

    fn next_task_id(&self) -> TaskId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        TaskId::new(format!("task-{}-{}", std::process::id(), n))
    }

    fn start(&self, task: WorkerTask, time_limit: Duration) -> Result<TaskId, WorkerError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkerError::ShutDown);
        }
        let handler = self
            .handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or(WorkerError::NoHandler)?;

        let task_id = self.next_task_id();
        let name = task.name();
        let cancel = self.shutdown.child_token();
        self.tasks.insert(
            task_id.clone(),
            RunningTask {
                name,
                cancel: cancel.clone(),
                abort: None,
            },
        );

        let tasks = Arc::clone(&self.tasks);
        let id = task_id.clone();
        let join = tokio::spawn(async move {
            let work = handler.handle(id.clone(), task, cancel);
            if tokio::time::timeout(time_limit, work).await.is_err() {
                warn!(task_id = %id, limit_secs = time_limit.as_secs(), "Task exceeded its time limit");
            }
            tasks.remove(&id);
            debug!(task_id = %id, "Task finished");
        });

        // the task may already be gone; then there is nothing to abort
        if let Some(mut entry) = self.tasks.get_mut(&task_id) {
            entry.abort = Some(join.abort_handle());
        }

        info!(task_id = %task_id, task = name, "Task started");
        Ok(task_id)
    }
}

impl Default for LocalWorkerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRuntime for LocalWorkerRuntime {
    fn send_task<'a>(
        &'a self,
        task: WorkerTask,
        time_limit: Duration,
    ) -> BoxFuture<'a, Result<TaskId, WorkerError>> {
        Box::pin(async move { self.start(task, time_limit) })
    }

    fn revoke<'a>(
        &'a self,
        task_id: &'a TaskId,
        terminate: bool,
    ) -> BoxFuture<'a, Result<(), WorkerError>> {
        Box::pin(async move {
            let entry = if terminate {
                self.tasks.remove(task_id).map(|(_, entry)| entry)
            } else {
                self.tasks.get(task_id).map(|entry| RunningTask {
                    name: entry.name,
                    cancel: entry.cancel.clone(),
                    abort: None,
                })
            };
            let Some(entry) = entry else {
                return Err(WorkerError::TaskNotFound(task_id.to_string()));
            };

            entry.cancel.cancel();
            if let Some(abort) = entry.abort {
                abort.abort();
            }
            info!(task_id = %task_id, task = entry.name, terminate, "Task revoked");
            Ok(())
        })
    }
}

impl Drop for LocalWorkerRuntime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for LocalWorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorkerRuntime")
            .field("running", &self.tasks.len())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}
