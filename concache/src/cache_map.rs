//! Cache map: fingerprint → status record.
//!
//! Each corpus (or subcorpus) owns one hash in the fast store:
//!
//! ```text
//! corp_cache_map:<corpus cache key>
//!     <fingerprint> → JSON status record
//!     <fingerprint> → ...
//! ```
//!
//! The cache map is the only path through which entries are created, read,
//! updated and invalidated. Registration is an atomic create-or-get
//! (`hsetnx`): the first caller to register a fingerprint becomes its owner,
//! everybody else observes the existing record.
//!
//! # Staleness
//!
//! When the corpus index file is newer than a record's `created` timestamp,
//! the record and every record sharing its `q0hash` are dropped on lookup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::engine::Corpus;
use crate::error::{CalcError, CalcResult};
use crate::fingerprint::{CorpusCacheKey, Fingerprint};
use crate::query::Operation;
use crate::status::{CalcStatus, StatusUpdate};
use crate::store::KeyStore;

/// Compare-and-set retries before a record update gives up.
const MAX_WRITE_ATTEMPTS: usize = 32;

/// Prefix of per-corpus cache map keys.
pub const CACHE_MAP_PREFIX: &str = "corp_cache_map:";

/// Hash mapping artifact directory names to corpus cache keys.
pub const CACHE_DIRS_KEY: &str = "corp_cache_dirs";

/// Outcome of [`CacheMap::add_to_map`].
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// This caller created the record and owns the computation.
    Created(CalcStatus),
    /// A record already existed; someone else owns it.
    Existing(CalcStatus),
}

impl Registration {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn status(&self) -> &CalcStatus {
        match self {
            Self::Created(status) | Self::Existing(status) => status,
        }
    }

    pub fn into_status(self) -> CalcStatus {
        match self {
            Self::Created(status) | Self::Existing(status) => status,
        }
    }
}

/// Builds [`CacheMap`]s bound to the shared store and artifact root.
#[derive(Clone)]
pub struct CacheMapFactory {
    store: Arc<dyn KeyStore>,
    artifacts: ArtifactStore,
}

impl CacheMapFactory {
    pub fn new(store: Arc<dyn KeyStore>, artifacts: ArtifactStore) -> Self {
        Self { store, artifacts }
    }

    /// Cache map of an opened corpus, with staleness checks against its index.
    pub fn get(&self, corpus: &Corpus) -> CacheMap {
        CacheMap::new(
            Arc::clone(&self.store),
            self.artifacts.clone(),
            corpus.cache_key(),
            corpus.index_path.clone(),
        )
    }

    /// Cache map for a bare corpus cache key (no staleness checks).
    pub fn for_key(&self, key: CorpusCacheKey) -> CacheMap {
        CacheMap::new(Arc::clone(&self.store), self.artifacts.clone(), key, None)
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Corpus cache keys of every registered artifact directory.
    pub async fn registered_corpora(&self) -> CalcResult<Vec<(String, CorpusCacheKey)>> {
        let dirs = self.store.hgetall(CACHE_DIRS_KEY).await?;
        let mut out = Vec::with_capacity(dirs.len());
        for (dir_name, raw) in dirs {
            match serde_json::from_str::<CorpusCacheKey>(&raw) {
                Ok(key) => out.push((dir_name, key)),
                Err(e) => warn!(dir = %dir_name, error = %e, "Ignoring malformed corpus registration"),
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for CacheMapFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMapFactory")
            .field("root", &self.artifacts.root())
            .finish()
    }
}

/// Status records of one corpus.
#[derive(Clone)]
pub struct CacheMap {
    store: Arc<dyn KeyStore>,
    artifacts: ArtifactStore,
    corpus: CorpusCacheKey,
    index_path: Option<PathBuf>,
    map_key: String,
}

impl CacheMap {
    pub fn new(
        store: Arc<dyn KeyStore>,
        artifacts: ArtifactStore,
        corpus: CorpusCacheKey,
        index_path: Option<PathBuf>,
    ) -> Self {
        let map_key = format!("{CACHE_MAP_PREFIX}{corpus}");
        Self {
            store,
            artifacts,
            corpus,
            index_path,
            map_key,
        }
    }

    pub fn corpus_key(&self) -> &CorpusCacheKey {
        &self.corpus
    }

    pub fn map_key(&self) -> &str {
        &self.map_key
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Fingerprint of `prefix` on this corpus.
    pub fn fingerprint(&self, prefix: &[Operation], cutoff: u64) -> Fingerprint {
        Fingerprint::compute(&self.corpus, prefix, cutoff)
    }

    /// Where the artifact for `fp` lives.
    pub fn cache_file_path(&self, fp: &Fingerprint) -> PathBuf {
        self.artifacts.artifact_path(&self.corpus, fp)
    }

    /// Creates the per-corpus artifact directory and registers it for sweeps.
    pub async fn ensure_writable_storage(&self) -> CalcResult<PathBuf> {
        let dir = self.artifacts.ensure_dir(&self.corpus).await?;
        let registration = serde_json::to_string(&self.corpus)?;
        self.store
            .hset(CACHE_DIRS_KEY, &self.corpus.dir_name(), registration)
            .await?;
        Ok(dir)
    }

    /// Looks up the record of `fp`, dropping it first if the corpus index
    /// is newer.
    pub async fn get_calc_status(&self, fp: &Fingerprint) -> CalcResult<Option<CalcStatus>> {
        let Some(status) = self.get_raw(fp.as_str()).await? else {
            return Ok(None);
        };
        if self.is_stale(&status).await {
            info!(corpus = %self.corpus, fp = %fp.short(), "Corpus index changed, invalidating cached query");
            self.del_full_entry(fp).await?;
            return Ok(None);
        }
        Ok(Some(status))
    }

    /// Registers `status` under `fp`.
    ///
    /// Assigns `cachefile` and `q0hash`. Without `overwrite` an existing
    /// record wins and is returned as [`Registration::Existing`].
    pub async fn add_to_map(
        &self,
        fp: &Fingerprint,
        mut status: CalcStatus,
        overwrite: bool,
    ) -> CalcResult<Registration> {
        if status.cachefile.is_none() {
            status.cachefile = Some(self.cache_file_path(fp));
        }
        status.q0hash = Some(fp.q0hash().to_string());
        let json = status.to_json()?;

        if overwrite {
            self.store.hset(&self.map_key, fp.as_str(), json).await?;
            debug!(corpus = %self.corpus, fp = %fp.short(), "Status record written");
            return Ok(Registration::Created(status));
        }

        loop {
            if self
                .store
                .hsetnx(&self.map_key, fp.as_str(), json.clone())
                .await?
            {
                debug!(corpus = %self.corpus, fp = %fp.short(), "Status record created");
                return Ok(Registration::Created(status));
            }
            // a concurrent delete can slip between hsetnx and hget
            if let Some(existing) = self.get_raw(fp.as_str()).await? {
                return Ok(Registration::Existing(existing));
            }
        }
    }

    /// Applies `update` to the record of `fp`.
    ///
    /// Returns `None` without writing when the record no longer exists, so a
    /// worker can never resurrect a cancelled entry.
    pub async fn update_calc_status(
        &self,
        fp: &Fingerprint,
        update: &StatusUpdate,
    ) -> CalcResult<Option<CalcStatus>> {
        let modified = self
            .modify_by_hash(fp.as_str(), |status| {
                status.apply(update);
                true
            })
            .await?;
        if modified.is_none() {
            debug!(corpus = %self.corpus, fp = %fp.short(), "Update of missing status record skipped");
        }
        Ok(modified.map(|(status, _)| status))
    }

    /// Replaces the stored record of `fp` with `status` if one exists.
    pub async fn store_calc_status(&self, fp: &Fingerprint, status: &CalcStatus) -> CalcResult<bool> {
        Ok(self
            .store
            .hset_existing(&self.map_key, fp.as_str(), status.to_json()?)
            .await?)
    }

    /// Artifact path of `fp` if its record is readable.
    pub async fn readable_cache_path(&self, fp: &Fingerprint) -> CalcResult<Option<PathBuf>> {
        Ok(self
            .get_calc_status(fp)
            .await?
            .filter(|s| s.readable)
            .and_then(|s| s.cachefile))
    }

    /// Removes the record of `fp`. Returns true if it existed.
    pub async fn del_entry(&self, fp: &Fingerprint) -> CalcResult<bool> {
        self.del_by_hash(fp.as_str()).await
    }

    pub(crate) async fn del_by_hash(&self, hash: &str) -> CalcResult<bool> {
        let removed = self.store.hdel(&self.map_key, hash).await?;
        if removed {
            debug!(corpus = %self.corpus, fp = %&hash[..hash.len().min(12)], "Status record deleted");
        }
        Ok(removed)
    }

    /// Removes every record sharing `fp`'s root query, with their artifacts.
    ///
    /// Returns the number of records removed.
    pub async fn del_full_entry(&self, fp: &Fingerprint) -> CalcResult<usize> {
        let mut removed = 0;
        for (hash, status) in self.entries().await? {
            let same_root = hash == fp.as_str() || status.q0hash.as_deref() == Some(fp.q0hash());
            if !same_root {
                continue;
            }
            if self.store.hdel(&self.map_key, &hash).await? {
                removed += 1;
            }
            if let Some(path) = &status.cachefile {
                self.artifacts.del_silent(path).await;
            }
        }
        info!(corpus = %self.corpus, q0hash = %&fp.q0hash()[..12], removed, "Removed query family");
        Ok(removed)
    }

    /// Every record of this corpus. Malformed records are skipped.
    pub async fn entries(&self) -> CalcResult<Vec<(String, CalcStatus)>> {
        let raw = self.store.hgetall(&self.map_key).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (hash, json) in raw {
            match CalcStatus::from_json(&json) {
                Ok(status) => out.push((hash, status)),
                Err(e) => warn!(corpus = %self.corpus, fp = %hash, error = %e, "Skipping malformed status record"),
            }
        }
        Ok(out)
    }

    pub(crate) async fn get_raw(&self, hash: &str) -> CalcResult<Option<CalcStatus>> {
        match self.store.hget(&self.map_key, hash).await? {
            Some(json) => Ok(Some(CalcStatus::from_json(&json)?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write of the record under `hash`.
    ///
    /// The write is a compare-and-set against the value read, retried when
    /// another writer got in between; a record deleted meanwhile stays
    /// deleted. `change` returns false to skip the write. Yields the record
    /// as it is stored afterwards and whether it was written, or `None` if
    /// there is no record.
    pub(crate) async fn modify_by_hash(
        &self,
        hash: &str,
        mut change: impl FnMut(&mut CalcStatus) -> bool,
    ) -> CalcResult<Option<(CalcStatus, bool)>> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(json) = self.store.hget(&self.map_key, hash).await? else {
                return Ok(None);
            };
            let mut status = CalcStatus::from_json(&json)?;
            if !change(&mut status) {
                return Ok(Some((status, false)));
            }
            if self
                .store
                .hcompare_and_set(&self.map_key, hash, &json, status.to_json()?)
                .await?
            {
                return Ok(Some((status, true)));
            }
        }
        Err(CalcError::ConcurrencyViolation(format!(
            "{hash}: record kept changing during update"
        )))
    }

    async fn is_stale(&self, status: &CalcStatus) -> bool {
        let Some(index) = &self.index_path else {
            return false;
        };
        match tokio::fs::metadata(index).await.and_then(|m| m.modified()) {
            Ok(mtime) => status.created < to_utc(mtime),
            Err(e) => {
                debug!(path = %index.display(), error = %e, "Corpus index not accessible, skipping staleness check");
                false
            }
        }
    }
}

impl std::fmt::Debug for CacheMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMap")
            .field("corpus", &self.corpus)
            .field("map_key", &self.map_key)
            .finish()
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
