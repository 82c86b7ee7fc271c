//! Asynchronous root-query worker.
//!
//! Computes a single root query and republishes the growing artifact on a
//! back-off schedule so readers can page through partial results:
//!
//! ```text
//! compute ─► sleep(initial) ─► save partial ─► readable=true
//!                                   │
//!                ┌──────────────────┘
//!                ▼
//!         sleep(step·k, ≤ max) ─► save partial ─► update sizes   (until finished)
//!                │
//!                ▼
//!         save final ─► arf ─► complete
//! ```
//!
//! Every status write goes through [`CacheMap::update_calc_status`], which
//! refuses to recreate a deleted record. When the record is gone the task was
//! cancelled: the worker removes what it wrote and stops quietly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{save_and_publish, TaskId};
use crate::artifact::ArtifactHeader;
use crate::cache_map::CacheMap;
use crate::context::CalcContext;
use crate::engine::{blocking, Concordance, Corpus, RootQuery, SaveMode};
use crate::error::{CalcError, CalcResult};
use crate::fingerprint::Fingerprint;
use crate::query::Pipeline;
use crate::status::StatusUpdate;

/// How a run ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    /// Cancelled, or the record disappeared underneath the worker.
    Abandoned,
}

/// Worker for `CalculateAsync` tasks.
pub struct AsyncWorker<'a> {
    ctx: &'a CalcContext,
}

impl<'a> AsyncWorker<'a> {
    pub fn new(ctx: &'a CalcContext) -> Self {
        Self { ctx }
    }

    /// Runs the task to completion. Failures are recorded in the status
    /// record, never returned.
    pub async fn run(
        &self,
        task_id: &TaskId,
        corpus: &Corpus,
        pipeline: &Pipeline,
        cutoff: u64,
        samplesize: u64,
        cancel: &CancellationToken,
    ) {
        let map = self.ctx.cache_map(corpus);
        let Some(root) = pipeline.get(0) else {
            warn!(task_id = %task_id, "Async task without a root query ignored");
            return;
        };
        let fp = map.fingerprint(pipeline.prefix(1), cutoff);
        let root_query = match RootQuery::from_operation(root, cutoff, samplesize) {
            Ok(rq) => rq,
            Err(e) => {
                self.record_failure(&map, &fp, task_id, &e).await;
                return;
            }
        };

        let result = self
            .calculate(&map, &fp, task_id, corpus, root_query, cancel)
            .await;
        match result {
            Ok(Outcome::Completed) => {
                info!(task_id = %task_id, corpus = %map.corpus_key(), fp = %fp.short(), "Async calculation complete");
            }
            Ok(Outcome::Abandoned) => {
                info!(task_id = %task_id, corpus = %map.corpus_key(), fp = %fp.short(), "Async calculation abandoned");
            }
            Err(_) if cancel.is_cancelled() => {
                debug!(task_id = %task_id, fp = %fp.short(), "Async calculation cancelled");
            }
            Err(e) => self.record_failure(&map, &fp, task_id, &e).await,
        }
    }

    async fn calculate(
        &self,
        map: &CacheMap,
        fp: &Fingerprint,
        task_id: &TaskId,
        corpus: &Corpus,
        root_query: RootQuery,
        cancel: &CancellationToken,
    ) -> CalcResult<Outcome> {
        let config = self.ctx.config();
        let path = map.cache_file_path(fp);

        // a redelivered task must not resurrect a cancelled entry
        if map.get_calc_status(fp).await?.is_none() {
            return Ok(Outcome::Abandoned);
        }
        map.ensure_writable_storage().await?;

        let engine = Arc::clone(self.ctx.engine());
        let corp = corpus.clone();
        let mut conc = Concordance::from(blocking(move || engine.compute(&corp, &root_query)).await??);
        debug!(task_id = %task_id, fp = %fp.short(), "Root query started");

        if !sleep_or_cancel(config.async_initial_delay, cancel).await {
            return Ok(Outcome::Abandoned);
        }

        let mut sleep = config.async_sleep_step;
        let mut first = true;
        while !conc.finished() {
            if !first {
                if !sleep_or_cancel(sleep, cancel).await {
                    return Ok(Outcome::Abandoned);
                }
                sleep = (sleep + config.async_sleep_step).min(config.async_max_sleep);
            }
            first = false;

            let (c, header) = save_and_publish(self.ctx, conc, &path, SaveMode::PARTIAL).await?;
            conc = c;
            let mut update = StatusUpdate::new()
                .readable(true)
                .sizes(
                    u64::from(header.concsize),
                    header.fullsize,
                    corpus.relative_size(u64::from(header.concsize)),
                );
            update.task_id = Some(task_id.to_string());
            if !self.publish_progress(map, fp, &path, &update).await? {
                return Ok(Outcome::Abandoned);
            }
            debug!(task_id = %task_id, fp = %fp.short(), concsize = header.concsize, "Partial result published");
        }

        let (conc, header) = save_and_publish(self.ctx, conc, &path, SaveMode::FINAL).await?;
        let arf = if corpus.is_subcorpus() {
            None
        } else {
            let (_, arf) = conc.run_blocking(|c| c.compute_arf()).await?;
            Some(arf?)
        };
        let update = final_update(corpus, &header, arf);
        if !self.publish_progress(map, fp, &path, &update).await? {
            return Ok(Outcome::Abandoned);
        }
        Ok(Outcome::Completed)
    }

    /// Writes `update`; if the record is gone, deletes the artifact and
    /// returns false.
    async fn publish_progress(
        &self,
        map: &CacheMap,
        fp: &Fingerprint,
        path: &Path,
        update: &StatusUpdate,
    ) -> CalcResult<bool> {
        if map.update_calc_status(fp, update).await?.is_some() {
            return Ok(true);
        }
        self.ctx.artifacts().del_silent(path).await;
        Ok(false)
    }

    async fn record_failure(&self, map: &CacheMap, fp: &Fingerprint, task_id: &TaskId, err: &CalcError) {
        warn!(task_id = %task_id, corpus = %map.corpus_key(), fp = %fp.short(), error = %err, "Async calculation failed");
        if let Err(e) = map.update_calc_status(fp, &StatusUpdate::failed(err)).await {
            warn!(task_id = %task_id, fp = %fp.short(), error = %e, "Failed to record calculation error");
        }
    }
}

fn final_update(corpus: &Corpus, header: &ArtifactHeader, arf: Option<f64>) -> StatusUpdate {
    let concsize = u64::from(header.concsize);
    StatusUpdate::complete(concsize, header.fullsize, corpus.relative_size(concsize), arf)
}

/// Sleeps for `duration`; returns false if `cancel` fired first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
