//! Prefix resolver.
//!
//! Given a pipeline `q[0..n)`, finds the longest prefix whose artifact can be
//! reused, so that only the remaining suffix has to be computed.
//!
//! # Algorithm
//!
//! ```text
//! start = 1 if q contains two consecutive shuffles, else n
//! for i in start..=1:
//!     status(fp(q[0..i))) readable and ready within budget?  → load, return (i, conc)
//!     failed or unopenable?                                    → cancel entry, next i
//!     otherwise                                               → next i
//! return (0, empty)
//! ```
//!
//! Entries that are still growing are skipped but left running. Only failed
//! entries (including owners that stopped updating them) and entries whose
//! artifact cannot be opened are cancelled.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cache_map::CacheMap;
use crate::context::CalcContext;
use crate::engine::{blocking, Concordance, Corpus, EngineError};
use crate::error::{CalcError, CalcResult};
use crate::fingerprint::Fingerprint;
use crate::handle::ConcHandle;
use crate::janitor::Janitor;
use crate::query::Pipeline;
use crate::status::MinSize;

/// Result of polling a status record.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The record satisfies the requested minsize (or finished).
    Ready,
    /// The budget ran out; the computation keeps running.
    NotReady,
    /// The computation failed.
    Failed(CalcError),
}

/// Finds reusable cached prefixes.
pub struct Resolver<'a> {
    ctx: &'a CalcContext,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: &'a CalcContext) -> Self {
        Self { ctx }
    }

    /// Returns the number of leading operations served from the cache and
    /// the concordance they produced.
    ///
    /// `(0, empty)` means nothing usable was found.
    pub async fn find_cached_conc_base(
        &self,
        corpus: &Corpus,
        q: &Pipeline,
        cutoff: u64,
        minsize: MinSize,
    ) -> CalcResult<(usize, ConcHandle)> {
        let map = self.ctx.cache_map(corpus);
        let janitor = Janitor::new(self.ctx);
        let cacheable = q.cacheable_len();
        let start = if q.has_consecutive_shuffles() {
            cacheable.min(1)
        } else {
            cacheable
        };

        for i in (1..=start).rev() {
            let fp = map.fingerprint(q.prefix(i), cutoff);
            let Some(mut status) = map.get_calc_status(&fp).await? else {
                continue;
            };

            if !status.readable {
                if status.check_for_errors(self.ctx.config().task_time_limit) {
                    map.store_calc_status(&fp, &status).await?;
                }
                if status.error.is_some() {
                    info!(corpus = %map.corpus_key(), fp = %fp.short(), "Dropping failed cache entry");
                    janitor.cancel_conc_task(&map, &fp).await?;
                } else {
                    debug!(corpus = %map.corpus_key(), fp = %fp.short(), "Prefix still being computed, skipping");
                }
                continue;
            }

            match self.wait_for_status(&map, &fp, minsize).await? {
                WaitOutcome::Ready => {}
                WaitOutcome::NotReady => {
                    debug!(corpus = %map.corpus_key(), fp = %fp.short(), %minsize, "Cached prefix not ready in time");
                    continue;
                }
                WaitOutcome::Failed(e) => {
                    warn!(corpus = %map.corpus_key(), fp = %fp.short(), error = %e, "Cached prefix failed, cancelling");
                    janitor.cancel_conc_task(&map, &fp).await?;
                    continue;
                }
            }

            let Some(path) = map.readable_cache_path(&fp).await? else {
                continue;
            };
            match load_conc(self.ctx, corpus, &path).await? {
                Ok(conc) => {
                    debug!(corpus = %map.corpus_key(), fp = %fp.short(), calc_from = i, size = conc.size(), "Reusing cached prefix");
                    let handle = ConcHandle::new(conc, i).with_source(fp, path);
                    return Ok((i, handle));
                }
                Err(e) => {
                    warn!(corpus = %map.corpus_key(), fp = %fp.short(), error = %e, "Cached artifact cannot be loaded, cancelling");
                    janitor.cancel_conc_task(&map, &fp).await?;
                }
            }
        }

        Ok((0, ConcHandle::new(Concordance::empty(), 0)))
    }

    /// Polls the record of `fp` until it satisfies `minsize`, fails, or the
    /// budget for `minsize` runs out.
    ///
    /// The k-th poll sleeps `poll_step · k`. Returns
    /// [`CalcError::ConcurrencyViolation`] if the record disappears.
    pub async fn wait_for_status(
        &self,
        map: &CacheMap,
        fp: &Fingerprint,
        minsize: MinSize,
    ) -> CalcResult<WaitOutcome> {
        let config = self.ctx.config();
        let budget = config.wait_budget(minsize);
        let started = Instant::now();
        let mut k: u32 = 1;

        loop {
            let Some(mut status) = map.get_calc_status(fp).await? else {
                return Err(CalcError::ConcurrencyViolation(fp.to_string()));
            };
            if status.check_for_errors(config.task_time_limit) {
                map.store_calc_status(fp, &status).await?;
            }
            if let Some(err) = status.normalized_error() {
                return Ok(WaitOutcome::Failed(err));
            }
            if status.has_some_result(minsize) {
                return Ok(WaitOutcome::Ready);
            }

            let elapsed = started.elapsed();
            if elapsed >= budget {
                debug!(fp = %fp.short(), %minsize, waited_ms = elapsed.as_millis() as u64, "Wait budget exhausted");
                return Ok(WaitOutcome::NotReady);
            }
            let pause = (config.poll_step * k).min(budget - elapsed);
            tokio::time::sleep(pause.max(Duration::from_millis(1))).await;
            k = k.saturating_add(1);
        }
    }

    /// Waits for the record of `fp` to satisfy `minsize`.
    ///
    /// Returns false if the budget ran out, and the recorded error if the
    /// computation failed.
    pub async fn wait_for_conc(
        &self,
        map: &CacheMap,
        fp: &Fingerprint,
        minsize: MinSize,
    ) -> CalcResult<bool> {
        match self.wait_for_status(map, fp, minsize).await? {
            WaitOutcome::Ready => Ok(true),
            WaitOutcome::NotReady => Ok(false),
            WaitOutcome::Failed(e) => Err(e),
        }
    }
}

/// Loads a published artifact through the engine.
///
/// The outer result carries infrastructure failures, the inner one engine
/// failures (e.g. the file vanished).
pub(crate) async fn load_conc(
    ctx: &CalcContext,
    corpus: &Corpus,
    path: &Path,
) -> CalcResult<Result<Concordance, EngineError>> {
    let engine = Arc::clone(ctx.engine());
    let corpus = corpus.clone();
    let path = path.to_path_buf();
    let loaded = blocking(move || engine.load(&corpus, &path)).await?;
    Ok(loaded.map(Concordance::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{CalcStatus, StatusUpdate};
    use crate::testing::{test_context, MockEngine};
    use crate::worker::{SyncMode, SyncWorker};

    fn pipeline(raw: &[&str]) -> Pipeline {
        Pipeline::parse(raw).unwrap()
    }

    async fn compute(ctx: &CalcContext, corpus: &Corpus, q: &Pipeline) {
        SyncWorker::new(ctx, SyncMode::InProcess)
            .run_in_process(corpus, q, ConcHandle::empty(), 0, 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_nothing_cached() {
        let (_dir, ctx) = test_context(MockEngine::new());
        let corpus = Corpus::new("C1", 1000);
        let (calc_from, handle) = Resolver::new(&ctx)
            .find_cached_conc_base(&corpus, &pipeline(&["q[word=\"dog\"]"]), 0, MinSize::Complete)
            .await
            .unwrap();
        assert_eq!(calc_from, 0);
        assert!(handle.source().is_none());
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let (_dir, ctx) = test_context(MockEngine::new());
        let corpus = Corpus::new("C1", 1000);
        compute(&ctx, &corpus, &pipeline(&["q[word=\"dog\"]", "r50"])).await;

        let q = pipeline(&["q[word=\"dog\"]", "r50", "s word/ 0"]);
        let (calc_from, handle) = Resolver::new(&ctx)
            .find_cached_conc_base(&corpus, &q, 0, MinSize::Complete)
            .await
            .unwrap();
        assert_eq!(calc_from, 2);
        assert_eq!(handle.size(), 50);
        let map = ctx.cache_map(&corpus);
        assert_eq!(handle.fingerprint(), Some(&map.fingerprint(q.prefix(2), 0)));
    }

    #[tokio::test]
    async fn test_consecutive_shuffles_only_reuse_root() {
        let (_dir, ctx) = test_context(MockEngine::new());
        let corpus = Corpus::new("C1", 1000);
        let q = pipeline(&["q[word=\"dog\"]", "f", "f"]);
        compute(&ctx, &corpus, &q).await;

        let (calc_from, _) = Resolver::new(&ctx)
            .find_cached_conc_base(&corpus, &q, 0, MinSize::Complete)
            .await
            .unwrap();
        assert_eq!(calc_from, 1);
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_skipped_not_cancelled() {
        let (_dir, ctx) = test_context(MockEngine::new());
        let corpus = Corpus::new("C1", 1000);
        let q = pipeline(&["q[word=\"dog\"]"]);
        let map = ctx.cache_map(&corpus);
        let fp = map.fingerprint(q.prefix(1), 0);
        map.add_to_map(&fp, CalcStatus::new().with_task_id("t1"), false)
            .await
            .unwrap();

        let (calc_from, _) = Resolver::new(&ctx)
            .find_cached_conc_base(&corpus, &q, 0, MinSize::Complete)
            .await
            .unwrap();
        assert_eq!(calc_from, 0);
        assert!(map.get_calc_status(&fp).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_entry_is_cancelled() {
        let (_dir, ctx) = test_context(MockEngine::new());
        let corpus = Corpus::new("C1", 1000);
        let q = pipeline(&["q[word=\"dog\"]"]);
        let map = ctx.cache_map(&corpus);
        let fp = map.fingerprint(q.prefix(1), 0);
        map.add_to_map(&fp, CalcStatus::new(), false).await.unwrap();
        let err = CalcError::Engine(EngineError::failed("boom"));
        map.update_calc_status(&fp, &StatusUpdate::failed(&err))
            .await
            .unwrap();

        let (calc_from, _) = Resolver::new(&ctx)
            .find_cached_conc_base(&corpus, &q, 0, MinSize::Complete)
            .await
            .unwrap();
        assert_eq!(calc_from, 0);
        assert!(map.get_calc_status(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_cancelled() {
        let (_dir, ctx) = test_context(MockEngine::new());
        let corpus = Corpus::new("C1", 1000);
        let q = pipeline(&["q[word=\"dog\"]"]);
        compute(&ctx, &corpus, &q).await;
        let map = ctx.cache_map(&corpus);
        let fp = map.fingerprint(q.prefix(1), 0);
        std::fs::remove_file(map.cache_file_path(&fp)).unwrap();

        let (calc_from, _) = Resolver::new(&ctx)
            .find_cached_conc_base(&corpus, &q, 0, MinSize::Complete)
            .await
            .unwrap();
        assert_eq!(calc_from, 0);
        assert!(map.get_calc_status(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_status_budget() {
        let (_dir, ctx) = test_context(MockEngine::new());
        let corpus = Corpus::new("C1", 1000);
        let map = ctx.cache_map(&corpus);
        let fp = map.fingerprint(pipeline(&["q[word=\"dog\"]"]).prefix(1), 0);
        map.add_to_map(&fp, CalcStatus::new(), false).await.unwrap();
        let resolver = Resolver::new(&ctx);

        let started = Instant::now();
        assert!(!resolver.wait_for_conc(&map, &fp, MinSize::Any).await.unwrap());
        assert!(started.elapsed() >= ctx.config().wait_budget_any);

        map.update_calc_status(&fp, &StatusUpdate::new().readable(true).sizes(5, 5, 0.0))
            .await
            .unwrap();
        assert!(resolver.wait_for_conc(&map, &fp, MinSize::Any).await.unwrap());
        assert!(!resolver.wait_for_conc(&map, &fp, MinSize::Lines(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_vanished_record() {
        let (_dir, ctx) = test_context(MockEngine::new());
        let corpus = Corpus::new("C1", 1000);
        let map = ctx.cache_map(&corpus);
        let fp = map.fingerprint(pipeline(&["q[word=\"dog\"]"]).prefix(1), 0);
        let result = Resolver::new(&ctx).wait_for_conc(&map, &fp, MinSize::Any).await;
        assert!(matches!(result, Err(CalcError::ConcurrencyViolation(_))));
    }
}
