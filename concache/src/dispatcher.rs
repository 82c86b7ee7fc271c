//! Request dispatcher.
//!
//! Decides, per request, how a concordance is produced:
//!
//! ```text
//!                      ┌─ calc_from == n ─────────────► cached handle
//! get_conc ─► resolver ┼─ background-eligible ────────► CalculateSync task, in-progress handle
//!   (lock)             ├─ nothing cached, 1 op, async ► CalculateAsync task, wait, partial handle
//!                      └─ otherwise ──────────────────► in-process SyncWorker
//! ```
//!
//! Everything after lock acquisition runs under a per-request [`StoreLock`]
//! keyed by the fingerprint of the full pipeline, so concurrent identical
//! requests either share one computation or both find the finished result.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache_map::CacheMap;
use crate::config::CalcConfig;
use crate::context::CalcContext;
use crate::engine::Corpus;
use crate::error::{CalcError, CalcResult};
use crate::fingerprint::Fingerprint;
use crate::handle::ConcHandle;
use crate::janitor::Janitor;
use crate::query::{Opcode, Pipeline};
use crate::resolver::{load_conc, Resolver, WaitOutcome};
use crate::status::{CalcStatus, MinSize, StatusUpdate};
use crate::store::StoreLock;
use crate::worker::{SyncMode, SyncWorker, WorkerTask};

/// Prefix of per-request lock keys.
pub const LOCK_PREFIX: &str = "conc_lock:";

/// Lines per page when the caller does not say.
pub const DEFAULT_PAGESIZE: u64 = 40;

/// A concordance request.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcRequest {
    /// Requesting user; only user-specific operations depend on it.
    pub user_id: Option<u64>,
    pub q: Pipeline,
    /// First page the caller wants to show (1-based).
    pub fromp: u64,
    pub pagesize: u64,
    /// Allow returning before the computation finished.
    pub asnc: bool,
    /// Random sample size applied to the root query (0 = none).
    pub samplesize: u64,
    /// Maximum number of lines (0 = unbounded).
    pub cutoff: u64,
}

impl ConcRequest {
    pub fn new(q: Pipeline) -> Self {
        Self {
            user_id: None,
            q,
            fromp: 1,
            pagesize: DEFAULT_PAGESIZE,
            asnc: true,
            samplesize: 0,
            cutoff: 0,
        }
    }

    pub fn with_user(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_page(mut self, fromp: u64, pagesize: u64) -> Self {
        self.fromp = fromp;
        self.pagesize = pagesize;
        self
    }

    pub fn with_async(mut self, asnc: bool) -> Self {
        self.asnc = asnc;
        self
    }

    pub fn with_samplesize(mut self, samplesize: u64) -> Self {
        self.samplesize = samplesize;
        self
    }

    pub fn with_cutoff(mut self, cutoff: u64) -> Self {
        self.cutoff = cutoff;
        self
    }

    /// Whether the pipeline should be computed by a background worker while
    /// the caller gets an in-progress handle.
    pub fn is_background_eligible(&self, corpus: &Corpus, config: &CalcConfig) -> bool {
        if self.q.len() < 2 || !self.asnc {
            return false;
        }
        let drops_aligned = self.q.get(1).is_some_and(|op| op.opcode == Opcode::DropAligned);
        (drops_aligned && corpus.size > config.aligned_background_min_size)
            || corpus.size > config.background_min_size
    }

    /// How much of the result the caller needs before returning.
    pub fn minsize(&self, corpus: &Corpus, config: &CalcConfig) -> MinSize {
        if self.is_background_eligible(corpus, config) {
            MinSize::Any
        } else if self.q.len() > 1 || !self.asnc {
            MinSize::Complete
        } else {
            MinSize::Lines(self.fromp.saturating_mul(self.pagesize))
        }
    }
}

/// Entry point for concordance requests.
pub struct Dispatcher<'a> {
    ctx: &'a CalcContext,
}

impl<'a> Dispatcher<'a> {
    pub fn new(ctx: &'a CalcContext) -> Self {
        Self { ctx }
    }

    /// Returns a handle for `req.q` on `corpus`, computing or dispatching
    /// whatever is missing.
    pub async fn get_conc(&self, corpus: &Corpus, req: &ConcRequest) -> CalcResult<ConcHandle> {
        if req.q.is_empty() {
            return Ok(ConcHandle::empty());
        }
        req.q.validate()?;

        let config = self.ctx.config();
        let background = req.is_background_eligible(corpus, config);
        let minsize = req.minsize(corpus, config);
        let map = self.ctx.cache_map(corpus);
        let full_fp = map.fingerprint(req.q.ops(), req.cutoff);
        debug!(corpus = %map.corpus_key(), fp = %full_fp.short(), user_id = ?req.user_id, %minsize, background, "Concordance requested");

        let lock = StoreLock::acquire(
            Arc::clone(self.ctx.store()),
            format!("{LOCK_PREFIX}{full_fp}"),
            config.task_time_limit + config.lock_timeout,
            config.lock_timeout,
        )
        .await?;
        let result = self.dispatch(&map, corpus, req, background, minsize).await;
        if let Err(e) = lock.release().await {
            warn!(fp = %full_fp.short(), error = %e, "Failed to release request lock");
        }
        result
    }

    async fn dispatch(
        &self,
        map: &CacheMap,
        corpus: &Corpus,
        req: &ConcRequest,
        background: bool,
        minsize: MinSize,
    ) -> CalcResult<ConcHandle> {
        let q = &req.q;
        let (calc_from, base) = Resolver::new(self.ctx)
            .find_cached_conc_base(corpus, q, req.cutoff, minsize)
            .await?;
        if calc_from == q.len() {
            debug!(corpus = %map.corpus_key(), calc_from, "Served from cache");
            return Ok(base);
        }

        if background && calc_from < q.cacheable_len() {
            return self.dispatch_background(map, corpus, req, calc_from).await;
        }
        if calc_from == 0 && q.len() == 1 && req.asnc {
            return self.dispatch_async(map, corpus, req, minsize).await;
        }

        debug!(corpus = %map.corpus_key(), calc_from, len = q.len(), "Computing in process");
        SyncWorker::new(self.ctx, SyncMode::InProcess)
            .run_in_process(corpus, q, base, req.cutoff, req.samplesize)
            .await
    }

    /// Pre-creates records for the missing cacheable steps and hands them to
    /// a `CalculateSync` task.
    async fn dispatch_background(
        &self,
        map: &CacheMap,
        corpus: &Corpus,
        req: &ConcRequest,
        calc_from: usize,
    ) -> CalcResult<ConcHandle> {
        let q = &req.q;
        let cacheable = q.cacheable_len();
        let fps: Vec<Fingerprint> = (calc_from + 1..=cacheable)
            .map(|i| map.fingerprint(q.prefix(i), req.cutoff))
            .collect();
        let Some(last) = fps.last() else {
            return Err(CalcError::InvalidPipeline(format!("nothing to compute for {q}")));
        };
        let handle = ConcHandle::in_progress(last.clone(), map.cache_file_path(last)).with_calc_from(calc_from);

        map.ensure_writable_storage().await?;
        let mut created = Vec::with_capacity(fps.len());
        for fp in &fps {
            if map.add_to_map(fp, CalcStatus::new(), false).await?.is_created() {
                created.push(fp.clone());
            }
        }
        if created.is_empty() {
            debug!(corpus = %map.corpus_key(), fp = %last.short(), "Background calculation already dispatched");
            return Ok(handle);
        }

        let task = WorkerTask::CalculateSync {
            corpus: corpus.clone(),
            pipeline: Pipeline::new(q.prefix(cacheable).to_vec()),
            cutoff: req.cutoff,
            samplesize: req.samplesize,
        };
        let task_id = match self
            .ctx
            .runtime()
            .send_task(task, self.ctx.config().task_time_limit)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let err = CalcError::from(e);
                for fp in &created {
                    map.update_calc_status(fp, &StatusUpdate::failed(&err)).await?;
                }
                return Err(err);
            }
        };

        // steps registered by an earlier dispatch stay with their task
        let update = StatusUpdate::new().task_id(task_id.as_str());
        for fp in &created {
            map.update_calc_status(fp, &update).await?;
        }
        info!(task_id = %task_id, corpus = %map.corpus_key(), calc_from, steps = created.len(), "Background calculation dispatched");
        Ok(handle)
    }

    /// Starts (or joins) an async root-query computation and waits until
    /// enough lines are available for the first page.
    async fn dispatch_async(
        &self,
        map: &CacheMap,
        corpus: &Corpus,
        req: &ConcRequest,
        minsize: MinSize,
    ) -> CalcResult<ConcHandle> {
        let fp = map.fingerprint(req.q.prefix(1), req.cutoff);
        let path = map.cache_file_path(&fp);

        map.ensure_writable_storage().await?;
        if map.add_to_map(&fp, CalcStatus::new(), false).await?.is_created() {
            let task = WorkerTask::CalculateAsync {
                corpus: corpus.clone(),
                pipeline: req.q.clone(),
                cutoff: req.cutoff,
                samplesize: req.samplesize,
            };
            match self
                .ctx
                .runtime()
                .send_task(task, self.ctx.config().task_time_limit)
                .await
            {
                Ok(task_id) => {
                    map.update_calc_status(&fp, &StatusUpdate::new().task_id(task_id.as_str()))
                        .await?;
                    info!(task_id = %task_id, corpus = %map.corpus_key(), fp = %fp.short(), "Async calculation dispatched");
                }
                Err(e) => {
                    let err = CalcError::from(e);
                    map.update_calc_status(&fp, &StatusUpdate::failed(&err)).await?;
                    return Err(err);
                }
            }
        }

        match Resolver::new(self.ctx).wait_for_status(map, &fp, minsize).await? {
            WaitOutcome::Ready => match load_conc(self.ctx, corpus, &path).await? {
                Ok(conc) => Ok(ConcHandle::new(conc, 0).with_source(fp, path)),
                Err(e) => {
                    debug!(fp = %fp.short(), error = %e, "Partial result not loadable yet");
                    Ok(ConcHandle::in_progress(fp, path))
                }
            },
            WaitOutcome::NotReady => Ok(ConcHandle::in_progress(fp, path)),
            WaitOutcome::Failed(e) => {
                Janitor::new(self.ctx).cancel_conc_task(map, &fp).await?;
                Err(e)
            }
        }
    }

    /// Loads the cached result of `q` without computing anything.
    ///
    /// Returns [`CalcError::NotFound`] without an entry, the recorded error of
    /// a failed entry, and [`CalcError::Unreadable`] if the artifact cannot be
    /// opened. User-specific trailing operations are replayed on the loaded
    /// result.
    pub async fn require_existing_conc(
        &self,
        corpus: &Corpus,
        q: &Pipeline,
        cutoff: u64,
    ) -> CalcResult<ConcHandle> {
        if q.is_empty() {
            return Ok(ConcHandle::empty());
        }
        q.validate()?;

        let map = self.ctx.cache_map(corpus);
        let cacheable = q.cacheable_len();
        let fp = map.fingerprint(q.prefix(cacheable), cutoff);
        let status = map
            .get_calc_status(&fp)
            .await?
            .ok_or_else(|| CalcError::NotFound(q.to_string()))?;
        if let Some(err) = status.normalized_error() {
            return Err(err);
        }
        let path = status
            .cachefile
            .clone()
            .unwrap_or_else(|| map.cache_file_path(&fp));
        if !status.readable {
            return Ok(ConcHandle::in_progress(fp, path).with_calc_from(cacheable));
        }

        let mut conc = match load_conc(self.ctx, corpus, &path).await? {
            Ok(conc) => conc,
            Err(e) => {
                return Err(CalcError::Unreadable {
                    path,
                    reason: e.to_string(),
                })
            }
        };
        for op in &q.ops()[cacheable..] {
            let cmd = op.clone();
            let (next, applied) = conc.run_blocking(move |c| c.exec_command(&cmd)).await?;
            applied?;
            conc = next;
        }
        Ok(ConcHandle::new(conc, cacheable).with_source(fp, path))
    }
}
