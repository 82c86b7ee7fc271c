//! Public facade.
//!
//! [`ConcService`] bundles the calculation context with the in-process worker
//! runtime and exposes the operations request handlers need.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use concache::{ConcRequest, ConcService, MemoryStore, Pipeline};
//!
//! let service = ConcService::in_process(config, Arc::new(MemoryStore::new()), engine);
//! let corpus = engine.open_corpus("syn2020", None)?;
//! let q = Pipeline::parse(&["q[lemma=\"pes\"]", "r100"])?;
//! let handle = service.get_conc(&corpus, &ConcRequest::new(q)).await?;
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CalcConfig, ConfigFile};
use crate::context::CalcContext;
use crate::dispatcher::{ConcRequest, Dispatcher};
use crate::engine::{Corpus, CorpusEngine};
use crate::error::CalcResult;
use crate::fingerprint::Fingerprint;
use crate::handle::ConcHandle;
use crate::janitor::{self, Janitor, SweepStats};
use crate::query::Pipeline;
use crate::resolver::Resolver;
use crate::status::{CalcStatus, MinSize};
use crate::store::KeyStore;
use crate::worker::{LocalWorkerRuntime, TaskHandler, WorkerRuntime};

/// Concordance computation and cache coordinator.
pub struct ConcService {
    ctx: Arc<CalcContext>,
    local_runtime: Option<Arc<LocalWorkerRuntime>>,
}

impl ConcService {
    /// Service over an existing context.
    ///
    /// The context's worker runtime must already deliver tasks to a
    /// [`CalcContext`] handler.
    pub fn new(ctx: Arc<CalcContext>) -> Self {
        Self {
            ctx,
            local_runtime: None,
        }
    }

    /// Service running worker tasks on the current tokio runtime.
    pub fn in_process(
        config: CalcConfig,
        store: Arc<dyn KeyStore>,
        engine: Arc<dyn CorpusEngine>,
    ) -> Self {
        let runtime = Arc::new(LocalWorkerRuntime::new());
        let ctx = Arc::new(CalcContext::new(
            config,
            store,
            engine,
            Arc::clone(&runtime) as Arc<dyn WorkerRuntime>,
        ));
        let handler: Arc<dyn TaskHandler> = Arc::clone(&ctx) as Arc<dyn TaskHandler>;
        if !runtime.attach(Arc::downgrade(&handler)) {
            warn!("Worker runtime already had a task handler");
        }
        info!(cache_dir = %ctx.config().cache_dir.display(), "Conc service started");
        Self {
            ctx,
            local_runtime: Some(runtime),
        }
    }

    /// In-process service configured from a loaded config file.
    pub fn from_config_file(
        config: &ConfigFile,
        store: Arc<dyn KeyStore>,
        engine: Arc<dyn CorpusEngine>,
    ) -> Self {
        Self::in_process(config.to_calc_config(), store, engine)
    }

    pub fn context(&self) -> &Arc<CalcContext> {
        &self.ctx
    }

    pub fn config(&self) -> &CalcConfig {
        self.ctx.config()
    }

    /// See [`Dispatcher::get_conc`].
    pub async fn get_conc(&self, corpus: &Corpus, req: &ConcRequest) -> CalcResult<ConcHandle> {
        Dispatcher::new(&self.ctx).get_conc(corpus, req).await
    }

    /// See [`Dispatcher::require_existing_conc`].
    pub async fn require_existing_conc(
        &self,
        corpus: &Corpus,
        q: &Pipeline,
        cutoff: u64,
    ) -> CalcResult<ConcHandle> {
        Dispatcher::new(&self.ctx)
            .require_existing_conc(corpus, q, cutoff)
            .await
    }

    /// Stops the computation of `fp` and drops its cache entry.
    pub async fn cancel_conc_task(&self, corpus: &Corpus, fp: &Fingerprint) -> CalcResult<()> {
        let map = self.ctx.cache_map(corpus);
        Janitor::new(&self.ctx).cancel_conc_task(&map, fp).await
    }

    /// See [`Resolver::find_cached_conc_base`].
    pub async fn find_cached_conc_base(
        &self,
        corpus: &Corpus,
        q: &Pipeline,
        cutoff: u64,
        minsize: MinSize,
    ) -> CalcResult<(usize, ConcHandle)> {
        Resolver::new(&self.ctx)
            .find_cached_conc_base(corpus, q, cutoff, minsize)
            .await
    }

    /// Waits until the entry of `fp` satisfies `minsize`.
    ///
    /// Returns false when the wait budget runs out first.
    pub async fn wait_for_conc(
        &self,
        corpus: &Corpus,
        fp: &Fingerprint,
        minsize: MinSize,
    ) -> CalcResult<bool> {
        let map = self.ctx.cache_map(corpus);
        Resolver::new(&self.ctx).wait_for_conc(&map, fp, minsize).await
    }

    /// Current status record of `fp`, if any.
    pub async fn calc_status(&self, corpus: &Corpus, fp: &Fingerprint) -> CalcResult<Option<CalcStatus>> {
        self.ctx.cache_map(corpus).get_calc_status(fp).await
    }

    /// Runs one janitor sweep now.
    pub async fn sweep(&self) -> CalcResult<SweepStats> {
        Janitor::new(&self.ctx).sweep().await
    }

    /// Starts the periodic janitor; it stops when `shutdown` fires.
    pub fn start_janitor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        janitor::spawn_daemon(Arc::clone(&self.ctx), shutdown)
    }

    /// Cancels running worker tasks of the in-process runtime.
    pub fn shutdown(&self) {
        if let Some(runtime) = &self.local_runtime {
            runtime.shutdown();
        }
    }
}

impl std::fmt::Debug for ConcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcService")
            .field("ctx", &self.ctx)
            .field("local_runtime", &self.local_runtime)
            .finish()
    }
}
