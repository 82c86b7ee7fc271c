//! Shared calculation context.
//!
//! Everything a request handler or worker needs: configuration, the fast
//! store (through cache maps), the artifact store, the corpus engine and the
//! worker runtime. One instance per process, passed around as
//! `Arc<CalcContext>`.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::artifact::ArtifactStore;
use crate::cache_map::{CacheMap, CacheMapFactory};
use crate::config::CalcConfig;
use crate::engine::{Corpus, CorpusEngine};
use crate::store::KeyStore;
use crate::worker::{
    AsyncWorker, SyncMode, SyncWorker, TaskHandler, TaskId, WorkerRuntime, WorkerTask,
};

/// Dependencies shared by every component.
pub struct CalcContext {
    config: CalcConfig,
    cache_maps: CacheMapFactory,
    engine: Arc<dyn CorpusEngine>,
    runtime: Arc<dyn WorkerRuntime>,
}

impl CalcContext {
    pub fn new(
        config: CalcConfig,
        store: Arc<dyn KeyStore>,
        engine: Arc<dyn CorpusEngine>,
        runtime: Arc<dyn WorkerRuntime>,
    ) -> Self {
        let artifacts = ArtifactStore::new(config.cache_dir.clone());
        Self {
            config,
            cache_maps: CacheMapFactory::new(store, artifacts),
            engine,
            runtime,
        }
    }

    pub fn config(&self) -> &CalcConfig {
        &self.config
    }

    pub fn cache_maps(&self) -> &CacheMapFactory {
        &self.cache_maps
    }

    /// Cache map of `corpus`.
    pub fn cache_map(&self, corpus: &Corpus) -> CacheMap {
        self.cache_maps.get(corpus)
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        self.cache_maps.artifacts()
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        self.cache_maps.store()
    }

    pub fn engine(&self) -> &Arc<dyn CorpusEngine> {
        &self.engine
    }

    pub fn runtime(&self) -> &Arc<dyn WorkerRuntime> {
        &self.runtime
    }
}

impl TaskHandler for CalcContext {
    fn handle(
        self: Arc<Self>,
        task_id: TaskId,
        task: WorkerTask,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            debug!(task_id = %task_id, task = task.name(), corpus = %task.corpus().cache_key(), "Handling task");
            match task {
                WorkerTask::CalculateAsync {
                    corpus,
                    pipeline,
                    cutoff,
                    samplesize,
                } => {
                    AsyncWorker::new(&self)
                        .run(&task_id, &corpus, &pipeline, cutoff, samplesize, &cancel)
                        .await
                }
                WorkerTask::CalculateSync {
                    corpus,
                    pipeline,
                    cutoff,
                    samplesize,
                } => {
                    SyncWorker::new(&self, SyncMode::Background)
                        .run_task(&task_id, &corpus, &pipeline, cutoff, samplesize, &cancel)
                        .await
                }
            }
        })
    }
}

impl std::fmt::Debug for CalcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalcContext")
            .field("config", &self.config)
            .field("cache_maps", &self.cache_maps)
            .finish()
    }
}
