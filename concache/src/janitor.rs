//! Cache janitor.
//!
//! Cancels entries on request and keeps the cache directory healthy:
//!
//! - stale `.tmp` files left behind by crashed writers
//! - records whose owner stopped updating them (lost tasks)
//! - artifacts without a record (orphans)
//! - LRU eviction once the artifact root exceeds `max_cache_size`
//!
//! The periodic sweep runs in a daemon task spawned with [`spawn_daemon`].
//! Several processes may share a cache root, so every cleanup only touches
//! files old enough that no live writer can own them.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{fingerprint_of, ArtifactStat, ArtifactStore};
use crate::cache_map::CacheMap;
use crate::context::CalcContext;
use crate::error::CalcResult;
use crate::fingerprint::Fingerprint;
use crate::worker::{TaskId, WorkerError};

/// Target fraction of `max_cache_size` after eviction.
const EVICTION_TARGET_PERCENTAGE: f64 = 0.9;

/// Counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub tmp_removed: usize,
    pub lost_tasks: usize,
    pub orphans_removed: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
    pub duration_ms: u64,
}

impl SweepStats {
    /// Returns true if the sweep removed nothing.
    pub fn is_idle(&self) -> bool {
        self.tmp_removed == 0
            && self.lost_tasks == 0
            && self.orphans_removed == 0
            && self.evicted == 0
    }
}

/// Cancellation and garbage collection.
pub struct Janitor<'a> {
    ctx: &'a CalcContext,
}

impl<'a> Janitor<'a> {
    pub fn new(ctx: &'a CalcContext) -> Self {
        Self { ctx }
    }

    /// Revokes the task computing `fp` (if any), deletes its record and
    /// removes the artifact.
    pub async fn cancel_conc_task(&self, map: &CacheMap, fp: &Fingerprint) -> CalcResult<()> {
        let status = map.get_raw(fp.as_str()).await?;
        let path = status
            .as_ref()
            .and_then(|s| s.cachefile.clone())
            .unwrap_or_else(|| map.cache_file_path(fp));

        if let Some(status) = &status {
            if let (true, Some(task_id)) = (status.is_running(), &status.task_id) {
                self.revoke(&TaskId::from(task_id.as_str())).await;
            }
        }
        map.del_entry(fp).await?;
        self.ctx.artifacts().del_silent(&path).await;
        info!(corpus = %map.corpus_key(), fp = %fp.short(), "Cache entry cancelled");
        Ok(())
    }

    async fn revoke(&self, task_id: &TaskId) {
        match self.ctx.runtime().revoke(task_id, true).await {
            Ok(()) => {}
            Err(WorkerError::TaskNotFound(_)) => {
                debug!(task_id = %task_id, "Task already gone");
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "Failed to revoke task"),
        }
    }

    /// Deletes `.tmp` files older than the task time limit.
    pub async fn cleanup_tmp_files(&self) -> CalcResult<usize> {
        let artifacts = self.ctx.artifacts();
        let max_age = self.ctx.config().task_time_limit;
        let mut removed = 0;

        for dir in artifacts.corpus_dirs().await? {
            for (path, stat) in artifacts.list_files(&dir).await? {
                if !ArtifactStore::is_tmp_path(&path) || age(&stat) <= max_age {
                    continue;
                }
                match artifacts.delete(&path).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete stale tmp file"),
                }
            }
        }
        if removed > 0 {
            info!(removed, "Stale tmp files removed");
        }
        Ok(removed)
    }

    /// Fails records of computations that stopped reporting progress and
    /// revokes their tasks.
    pub async fn reap_lost_tasks(&self, map: &CacheMap) -> CalcResult<usize> {
        let limit = self.ctx.config().task_time_limit;
        let mut reaped = 0;

        for (hash, listed) in map.entries().await? {
            if listed.finished {
                continue;
            }
            let Some((status, true)) = map
                .modify_by_hash(&hash, |status| status.check_for_errors(limit))
                .await?
            else {
                continue;
            };
            reaped += 1;
            warn!(corpus = %map.corpus_key(), fp = %&hash[..hash.len().min(12)], task_id = ?status.task_id, "Lost calculation marked as timed out");
            if let Some(task_id) = &status.task_id {
                self.revoke(&TaskId::from(task_id.as_str())).await;
            }
        }
        Ok(reaped)
    }

    /// Deletes artifacts of `map`'s corpus that have no record and are older
    /// than `orphan_age`.
    pub async fn remove_orphans(&self, map: &CacheMap) -> CalcResult<usize> {
        let artifacts = self.ctx.artifacts();
        let max_age = self.ctx.config().orphan_age;
        let known: HashSet<String> = map.entries().await?.into_iter().map(|(hash, _)| hash).collect();
        let dir = artifacts.corpus_dir(map.corpus_key());
        let mut removed = 0;

        for (path, stat) in artifacts.list_files(&dir).await? {
            let Some(fp) = fingerprint_of(&path) else {
                continue;
            };
            if known.contains(fp) || age(&stat) <= max_age {
                continue;
            }
            if artifacts.delete(&path).await? {
                debug!(path = %path.display(), "Orphaned artifact removed");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(corpus = %map.corpus_key(), removed, "Orphaned artifacts removed");
        }
        Ok(removed)
    }

    /// Evicts least recently modified artifacts (and their records) until
    /// the cache is under 90% of `max_cache_size`. Running entries are never
    /// evicted.
    ///
    /// Returns the number of entries evicted and the bytes freed.
    pub async fn evict(&self) -> CalcResult<(usize, u64)> {
        let config = self.ctx.config();
        let artifacts = self.ctx.artifacts();
        let max_bytes = config.max_cache_size;

        let mut candidates: Vec<(CacheMap, String, PathBuf, ArtifactStat)> = Vec::new();
        let mut total_size = 0u64;
        for (dir_name, key) in self.ctx.cache_maps().registered_corpora().await? {
            let map = self.ctx.cache_maps().for_key(key);
            let records: HashMap<String, bool> = map
                .entries()
                .await?
                .into_iter()
                .map(|(hash, status)| (hash, status.is_running()))
                .collect();
            for (path, stat) in artifacts.list_files(&artifacts.root().join(&dir_name)).await? {
                total_size += stat.size;
                let Some(fp) = fingerprint_of(&path) else {
                    continue;
                };
                if records.get(fp).copied().unwrap_or(false) {
                    continue;
                }
                let fp = fp.to_string();
                candidates.push((map.clone(), fp, path, stat));
            }
        }

        debug!(total_size, limit = max_bytes, candidates = candidates.len(), "Eviction scan complete");
        if total_size <= max_bytes {
            return Ok((0, 0));
        }

        let target_size = (max_bytes as f64 * EVICTION_TARGET_PERCENTAGE) as u64;
        info!(current_size = total_size, limit = max_bytes, target = target_size, "Conc cache over limit, starting eviction");

        candidates.sort_by_key(|(_, _, _, stat)| stat.mtime);

        let mut remaining = total_size;
        let mut evicted = 0;
        let mut bytes_freed = 0u64;
        for (map, hash, path, stat) in candidates {
            if remaining <= target_size {
                break;
            }
            map.del_by_hash(&hash).await?;
            match artifacts.delete(&path).await {
                Ok(_) => {
                    remaining = remaining.saturating_sub(stat.size);
                    bytes_freed += stat.size;
                    evicted += 1;
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to delete artifact during eviction");
                }
            }
        }
        Ok((evicted, bytes_freed))
    }

    /// One full maintenance pass.
    pub async fn sweep(&self) -> CalcResult<SweepStats> {
        let start = Instant::now();
        let mut stats = SweepStats {
            tmp_removed: self.cleanup_tmp_files().await?,
            ..SweepStats::default()
        };

        for (_, key) in self.ctx.cache_maps().registered_corpora().await? {
            let map = self.ctx.cache_maps().for_key(key);
            stats.lost_tasks += self.reap_lost_tasks(&map).await?;
            stats.orphans_removed += self.remove_orphans(&map).await?;
        }

        let (evicted, bytes_freed) = self.evict().await?;
        stats.evicted = evicted;
        stats.bytes_freed = bytes_freed;
        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }
}

fn age(stat: &ArtifactStat) -> Duration {
    SystemTime::now()
        .duration_since(stat.mtime)
        .unwrap_or_default()
}

/// Spawns the periodic sweep. Runs one sweep immediately, then every
/// `gc_interval` until `shutdown` fires.
pub fn spawn_daemon(ctx: Arc<CalcContext>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = ctx.config().gc_interval;
        info!(
            dir = %ctx.artifacts().root().display(),
            max_bytes = ctx.config().max_cache_size,
            interval_secs = interval.as_secs(),
            "Conc cache janitor started"
        );

        run_sweep(&ctx).await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Conc cache janitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => run_sweep(&ctx).await,
            }
        }
    })
}

async fn run_sweep(ctx: &CalcContext) {
    match Janitor::new(ctx).sweep().await {
        Ok(stats) if !stats.is_idle() => {
            info!(
                tmp_removed = stats.tmp_removed,
                lost_tasks = stats.lost_tasks,
                orphans_removed = stats.orphans_removed,
                evicted = stats.evicted,
                bytes_freed = stats.bytes_freed,
                duration_ms = stats.duration_ms,
                "Conc cache sweep complete"
            );
        }
        Ok(_) => debug!("Conc cache sweep found nothing to do"),
        Err(e) => warn!(error = %e, "Conc cache sweep failed"),
    }
}
