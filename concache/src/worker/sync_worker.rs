//! Synchronous pipeline worker.
//!
//! Replays a pipeline from its first missing step, publishing the artifact of
//! every cacheable step before completing its record. Runs either inside the
//! request ([`SyncMode::InProcess`]) or as a `CalculateSync` task
//! ([`SyncMode::Background`]).
//!
//! Steps are strictly sequential: the record of step `i + 1` is never
//! completed before the artifact of step `i` is published.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{save_and_publish, TaskId};
use crate::cache_map::{CacheMap, Registration};
use crate::context::CalcContext;
use crate::engine::{blocking, Concordance, Corpus, RootQuery, SaveMode};
use crate::error::{CalcError, CalcResult, CALC_STATUS_TYPE};
use crate::fingerprint::Fingerprint;
use crate::handle::{CacheSource, ConcHandle};
use crate::janitor::Janitor;
use crate::query::Pipeline;
use crate::resolver::{load_conc, Resolver, WaitOutcome};
use crate::status::{CalcStatus, MinSize, StatusUpdate};

/// Who computes a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Owned,
    Foreign,
}

fn new_claim(owner: Option<&str>) -> CalcStatus {
    match owner {
        Some(task_id) => CalcStatus::new().with_task_id(task_id),
        None => CalcStatus::new(),
    }
}

/// Fails the steps an in-process worker claimed if its request is dropped
/// before they are published.
struct AbandonGuard {
    map: CacheMap,
    steps: Vec<Fingerprint>,
}

impl AbandonGuard {
    fn new(map: &CacheMap) -> Self {
        Self {
            map: map.clone(),
            steps: Vec::new(),
        }
    }

    fn disarm(&mut self) {
        self.steps.clear();
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let map = self.map.clone();
        let steps = std::mem::take(&mut self.steps);
        runtime.spawn(async move {
            let err = CalcError::CalcStatus {
                type_name: CALC_STATUS_TYPE.to_string(),
                message: "Calculation abandoned by its request".to_string(),
            };
            let update = StatusUpdate::failed(&err);
            for fp in &steps {
                let marked = map
                    .modify_by_hash(fp.as_str(), |status| {
                        // published, or re-registered by a task meanwhile
                        if status.finished || status.task_id.is_some() {
                            return false;
                        }
                        status.apply(&update);
                        true
                    })
                    .await;
                match marked {
                    Ok(Some((_, true))) => debug!(fp = %fp.short(), "Abandoned step marked failed"),
                    Ok(_) => {}
                    Err(e) => warn!(fp = %fp.short(), error = %e, "Failed to mark abandoned step"),
                }
            }
        });
    }
}

/// Where the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Inside the request; user-specific steps run uncached.
    InProcess,
    /// As a worker task; user-specific steps are rejected.
    Background,
}

/// Worker replaying pipeline suffixes.
pub struct SyncWorker<'a> {
    ctx: &'a CalcContext,
    mode: SyncMode,
}

impl<'a> SyncWorker<'a> {
    pub fn new(ctx: &'a CalcContext, mode: SyncMode) -> Self {
        Self { ctx, mode }
    }

    /// Entry point of a `CalculateSync` task.
    ///
    /// Looks up the longest complete cached prefix itself, then computes the
    /// rest. Failures are recorded in the records owned by `task_id`.
    pub async fn run_task(
        &self,
        task_id: &TaskId,
        corpus: &Corpus,
        pipeline: &Pipeline,
        cutoff: u64,
        samplesize: u64,
        cancel: &CancellationToken,
    ) {
        let map = self.ctx.cache_map(corpus);
        let owner = Some(task_id.as_str());

        let base = Resolver::new(self.ctx)
            .find_cached_conc_base(corpus, pipeline, cutoff, MinSize::Complete)
            .await;
        let (calc_from, base) = match base {
            Ok(found) => found,
            Err(e) => {
                warn!(task_id = %task_id, corpus = %map.corpus_key(), error = %e, "Cannot resolve cached base");
                self.fail_steps(&map, pipeline, 0, cutoff, owner, &e).await;
                return;
            }
        };
        debug!(task_id = %task_id, calc_from, len = pipeline.len(), "Background calculation starting");

        match self
            .compute(&map, corpus, pipeline, base, cutoff, samplesize, owner, Some(cancel))
            .await
        {
            Ok(handle) => {
                info!(task_id = %task_id, corpus = %map.corpus_key(), size = handle.size(), "Background calculation complete");
            }
            Err(e) => {
                warn!(task_id = %task_id, corpus = %map.corpus_key(), error = %e, "Background calculation failed");
            }
        }
    }

    /// Computes `pipeline` on top of `base` inside the current request.
    ///
    /// `base` is the result of the prefix resolver; its `calc_from` tells
    /// where to resume.
    pub async fn run_in_process(
        &self,
        corpus: &Corpus,
        pipeline: &Pipeline,
        base: ConcHandle,
        cutoff: u64,
        samplesize: u64,
    ) -> CalcResult<ConcHandle> {
        let map = self.ctx.cache_map(corpus);
        self.compute(&map, corpus, pipeline, base, cutoff, samplesize, None, None)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn compute(
        &self,
        map: &CacheMap,
        corpus: &Corpus,
        q: &Pipeline,
        base: ConcHandle,
        cutoff: u64,
        samplesize: u64,
        owner: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> CalcResult<ConcHandle> {
        let (mut conc, mut source, calc_from) = base.into_parts();
        let cacheable = q.cacheable_len();

        let claims = match self.claim_steps(map, q, calc_from, cacheable, cutoff, owner).await {
            Ok(claims) => claims,
            Err(e) => {
                self.fail_steps(map, q, calc_from, cutoff, owner, &e).await;
                return Err(e);
            }
        };
        let mut abandoned = AbandonGuard::new(map);
        if self.mode == SyncMode::InProcess {
            for (i, claim) in (calc_from..).zip(&claims) {
                if *claim == Claim::Owned {
                    abandoned.steps.push(map.fingerprint(q.prefix(i + 1), cutoff));
                }
            }
        }

        for i in calc_from..q.len() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                debug!(step = i, "Calculation cancelled");
                break;
            }
            if claims.get(i - calc_from) == Some(&Claim::Foreign) {
                match self.adopt_step(map, corpus, q, i, cutoff, owner).await {
                    Ok(Some((adopted, src))) => {
                        conc = adopted;
                        source = Some(src);
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        abandoned.disarm();
                        self.fail_steps(map, q, i, cutoff, owner, &e).await;
                        return Err(e);
                    }
                }
            }
            match self.run_step(map, corpus, q, i, conc, cutoff, samplesize).await {
                Ok((next, published)) => {
                    conc = next;
                    if let Some((fp, path)) = published {
                        source = Some(CacheSource {
                            fingerprint: fp,
                            cachefile: path,
                        });
                    }
                }
                Err(e) => {
                    abandoned.disarm();
                    self.fail_steps(map, q, i, cutoff, owner, &e).await;
                    return Err(e);
                }
            }
        }
        abandoned.disarm();

        let handle = ConcHandle::new(conc, calc_from);
        Ok(match source {
            Some(src) => handle.with_source(src.fingerprint, src.cachefile),
            None => handle,
        })
    }

    /// Waits for step `i`, computed by another builder, and loads its
    /// artifact.
    ///
    /// Returns `None` when the step has to be computed here after all. A
    /// failed or vanished record is then re-registered for this worker; one
    /// that is merely slow is left to its builder and completed by whoever
    /// publishes first.
    async fn adopt_step(
        &self,
        map: &CacheMap,
        corpus: &Corpus,
        q: &Pipeline,
        i: usize,
        cutoff: u64,
        owner: Option<&str>,
    ) -> CalcResult<Option<(Concordance, CacheSource)>> {
        let fp = map.fingerprint(q.prefix(i + 1), cutoff);
        let resolver = Resolver::new(self.ctx);

        let outcome = match resolver.wait_for_status(map, &fp, MinSize::Complete).await {
            Err(CalcError::ConcurrencyViolation(_)) => {
                debug!(step = i, fp = %fp.short(), "Shared step record vanished, computing it here");
                map.add_to_map(&fp, new_claim(owner), false).await?;
                return Ok(None);
            }
            other => other?,
        };
        match outcome {
            WaitOutcome::Ready => {}
            WaitOutcome::NotReady => {
                debug!(step = i, fp = %fp.short(), "Shared step not complete in time, computing it here");
                return Ok(None);
            }
            WaitOutcome::Failed(e) => {
                info!(step = i, fp = %fp.short(), error = %e, "Shared step failed, computing it here");
                Janitor::new(self.ctx).cancel_conc_task(map, &fp).await?;
                map.add_to_map(&fp, new_claim(owner), true).await?;
                return Ok(None);
            }
        }

        let Some(path) = map.readable_cache_path(&fp).await? else {
            return Ok(None);
        };
        match load_conc(self.ctx, corpus, &path).await? {
            Ok(conc) => {
                debug!(step = i, fp = %fp.short(), size = conc.size(), "Adopted step computed elsewhere");
                Ok(Some((
                    conc,
                    CacheSource {
                        fingerprint: fp,
                        cachefile: path,
                    },
                )))
            }
            Err(e) => {
                warn!(step = i, fp = %fp.short(), error = %e, "Shared step artifact cannot be loaded, computing it here");
                Ok(None)
            }
        }
    }

    /// Applies operation `i` and, if it is cacheable, publishes its artifact
    /// and completes its record.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        map: &CacheMap,
        corpus: &Corpus,
        q: &Pipeline,
        i: usize,
        conc: Concordance,
        cutoff: u64,
        samplesize: u64,
    ) -> CalcResult<(Concordance, Option<(Fingerprint, PathBuf)>)> {
        let op = &q.ops()[i];

        let conc = if i == 0 {
            let root_query = RootQuery::from_operation(op, cutoff, samplesize)?;
            let engine = Arc::clone(self.ctx.engine());
            let corp = corpus.clone();
            let conc = Concordance::from(blocking(move || engine.compute(&corp, &root_query)).await??);
            let (conc, synced) = conc.run_blocking(|c| c.sync()).await?;
            synced?;
            conc
        } else {
            if !op.opcode.is_cacheable() && self.mode == SyncMode::Background {
                return Err(CalcError::UserSpecificInBackground(op.opcode.as_char()));
            }
            let cmd = op.clone();
            let (conc, applied) = conc.run_blocking(move |c| c.exec_command(&cmd)).await?;
            applied?;
            conc
        };

        if i >= q.cacheable_len() {
            debug!(step = i, op = %op, "User-specific step applied without caching");
            return Ok((conc, None));
        }

        let fp = map.fingerprint(q.prefix(i + 1), cutoff);
        let path = map.cache_file_path(&fp);
        let (conc, _) = save_and_publish(self.ctx, conc, &path, SaveMode::FINAL).await?;

        let (conc, arf) = if i == 0 && !corpus.is_subcorpus() {
            let (conc, arf) = conc.run_blocking(|c| c.compute_arf()).await?;
            (conc, Some(arf?))
        } else {
            (conc, None)
        };
        let concsize = conc.size();
        let update = StatusUpdate::complete(concsize, conc.fullsize(), corpus.relative_size(concsize), arf);
        if map.update_calc_status(&fp, &update).await?.is_none() {
            debug!(fp = %fp.short(), "Record removed during calculation, dropping artifact");
            self.ctx.artifacts().del_silent(&path).await;
            return Ok((conc, None));
        }
        debug!(step = i, fp = %fp.short(), concsize, "Step published");
        Ok((conc, Some((fp, path))))
    }

    /// Registers records for the steps `from..to` this worker is about to
    /// compute.
    ///
    /// Records that already exist are never replaced. An unfinished one
    /// belongs to another builder unless it carries this worker's task id;
    /// the returned claims tell which steps to wait for instead of
    /// computing.
    async fn claim_steps(
        &self,
        map: &CacheMap,
        q: &Pipeline,
        from: usize,
        to: usize,
        cutoff: u64,
        owner: Option<&str>,
    ) -> CalcResult<Vec<Claim>> {
        if from >= to {
            return Ok(Vec::new());
        }
        map.ensure_writable_storage().await?;
        let mut claims = Vec::with_capacity(to - from);
        for i in from..to {
            let fp = map.fingerprint(q.prefix(i + 1), cutoff);
            let claim = match map.add_to_map(&fp, new_claim(owner), false).await? {
                Registration::Created(_) => Claim::Owned,
                Registration::Existing(existing) => self.classify(&existing, owner),
            };
            if claim == Claim::Foreign {
                debug!(step = i, fp = %fp.short(), "Step already claimed by another builder");
            }
            claims.push(claim);
        }
        Ok(claims)
    }

    fn classify(&self, existing: &CalcStatus, owner: Option<&str>) -> Claim {
        if existing.finished {
            // complete records are loaded, failed ones replaced
            return Claim::Foreign;
        }
        match (self.mode, existing.task_id.as_deref()) {
            // the dispatcher registers a task's steps before it starts
            (SyncMode::Background, None) => Claim::Owned,
            (SyncMode::Background, Some(id)) if Some(id) == owner => Claim::Owned,
            _ => Claim::Foreign,
        }
    }

    /// Marks the unfinished records of steps `from..` owned by this worker as
    /// failed with `err`.
    async fn fail_steps(
        &self,
        map: &CacheMap,
        q: &Pipeline,
        from: usize,
        cutoff: u64,
        owner: Option<&str>,
        err: &CalcError,
    ) {
        let update = StatusUpdate::failed(err);
        for i in from..q.cacheable_len() {
            let fp = map.fingerprint(q.prefix(i + 1), cutoff);
            let owned = match map.get_calc_status(&fp).await {
                Ok(Some(status)) => {
                    // the dispatcher assigns task ids after sending the task
                    !status.finished && (status.task_id.is_none() || status.task_id.as_deref() == owner)
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(fp = %fp.short(), error = %e, "Cannot read step record");
                    false
                }
            };
            if !owned {
                continue;
            }
            if let Err(e) = map.update_calc_status(&fp, &update).await {
                warn!(fp = %fp.short(), error = %e, "Failed to record step failure");
            }
        }
    }
}
