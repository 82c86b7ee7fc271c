//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use concache::artifact::ArtifactHeader;
use concache::config::CalcConfig;
use concache::engine::{RootQuery, SaveMode};
use concache::query::Opcode;
use concache::{
    CalcStatus, ConcService, Corpus, CorpusEngine, EngineConc, EngineError, Fingerprint,
    MemoryStore, Operation, Pipeline,
};

/// Lines a query produces unless configured otherwise.
pub const DEFAULT_HITS: u64 = 100;

#[derive(Default)]
struct Calls {
    compute: AtomicUsize,
    exec: AtomicUsize,
}

/// Engine whose artifacts consist of the header alone.
///
/// A query grows linearly to its hit count over its configured duration.
#[derive(Clone, Default)]
pub struct FakeEngine {
    queries: Arc<Mutex<HashMap<String, (u64, Duration)>>>,
    calls: Arc<Calls>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(self, query: &str, hits: u64, duration: Duration) -> Self {
        self.queries
            .lock()
            .unwrap()
            .insert(query.to_string(), (hits, duration));
        self
    }

    pub fn compute_calls(&self) -> usize {
        self.calls.compute.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> usize {
        self.calls.exec.load(Ordering::SeqCst)
    }
}

impl CorpusEngine for FakeEngine {
    fn open_corpus(&self, corpname: &str, _subcname: Option<&str>) -> Result<Corpus, EngineError> {
        Ok(Corpus::new(corpname, 1_000_000))
    }

    fn compute(&self, _corpus: &Corpus, query: &RootQuery) -> Result<Box<dyn EngineConc>, EngineError> {
        self.calls.compute.fetch_add(1, Ordering::SeqCst);
        let (hits, duration) = self
            .queries
            .lock()
            .unwrap()
            .get(&query.query)
            .copied()
            .unwrap_or((DEFAULT_HITS, Duration::ZERO));
        let total = if query.cutoff > 0 { hits.min(query.cutoff) } else { hits };
        Ok(Box::new(FakeConc {
            total,
            fullsize: hits,
            started: Instant::now(),
            duration,
            done: false,
            calls: Arc::clone(&self.calls),
        }))
    }

    fn load(&self, _corpus: &Corpus, path: &Path) -> Result<Box<dyn EngineConc>, EngineError> {
        let bytes = std::fs::read(path).map_err(|_| EngineError::file_access(path))?;
        let header = ArtifactHeader::parse(&bytes).ok_or_else(|| EngineError::file_access(path))?;
        Ok(Box::new(FakeConc {
            total: u64::from(header.concsize),
            fullsize: header.fullsize,
            started: Instant::now(),
            duration: Duration::ZERO,
            done: header.finished,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct FakeConc {
    total: u64,
    fullsize: u64,
    started: Instant,
    duration: Duration,
    done: bool,
    calls: Arc<Calls>,
}

impl EngineConc for FakeConc {
    fn size(&self) -> u64 {
        if self.finished() {
            return self.total;
        }
        let progress = self.started.elapsed().as_secs_f64() / self.duration.as_secs_f64();
        (self.total as f64 * progress.min(1.0)) as u64
    }

    fn fullsize(&self) -> u64 {
        self.fullsize
    }

    fn finished(&self) -> bool {
        self.done || self.started.elapsed() >= self.duration
    }

    fn sync(&mut self) -> Result<(), EngineError> {
        std::thread::sleep(self.duration.saturating_sub(self.started.elapsed()));
        self.done = true;
        Ok(())
    }

    fn exec_command(&mut self, op: &Operation) -> Result<(), EngineError> {
        self.sync()?;
        self.calls.exec.fetch_add(1, Ordering::SeqCst);
        match op.opcode {
            Opcode::Sample => {
                let n: u64 = op.args.trim().parse().map_err(|_| EngineError::failed("bad sample"))?;
                self.total = self.total.min(n);
            }
            Opcode::PositiveFilter | Opcode::NegativeFilter => self.total /= 2,
            _ => {}
        }
        Ok(())
    }

    fn save(&self, path: &Path, mode: SaveMode) -> Result<(), EngineError> {
        let header = ArtifactHeader {
            finished: mode.final_save,
            fullsize: self.fullsize,
            concsize: u32::try_from(self.size()).unwrap_or(u32::MAX),
        };
        std::fs::write(path, header.encode()).map_err(|e| EngineError::failed(e.to_string()))
    }

    fn compute_arf(&self) -> Result<f64, EngineError> {
        Ok(self.total as f64 / 2.0)
    }
}

/// Configuration with budgets short enough for tests.
pub fn config(root: &Path) -> CalcConfig {
    CalcConfig::new(root.join("cache"))
        .with_task_time_limit(Duration::from_secs(30))
        .with_poll_step(Duration::from_millis(10))
        .with_wait_budgets(
            Duration::from_millis(200),
            Duration::from_secs(10),
            Duration::from_millis(100),
        )
        .with_async_schedule(
            Duration::from_millis(5),
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
}

pub struct Harness {
    pub dir: TempDir,
    pub engine: FakeEngine,
    pub service: ConcService,
}

impl Harness {
    pub fn new(engine: FakeEngine) -> Self {
        let dir = TempDir::new().unwrap();
        let service = ConcService::in_process(
            config(dir.path()),
            Arc::new(MemoryStore::new()),
            Arc::new(engine.clone()),
        );
        Self {
            dir,
            engine,
            service,
        }
    }

    pub fn fingerprint(&self, corpus: &Corpus, q: &Pipeline, len: usize, cutoff: u64) -> Fingerprint {
        self.service
            .context()
            .cache_map(corpus)
            .fingerprint(q.prefix(len), cutoff)
    }

    /// Registers a finished entry for `q[0..len)` together with its artifact.
    pub async fn preload(
        &self,
        corpus: &Corpus,
        q: &Pipeline,
        len: usize,
        header: ArtifactHeader,
    ) -> (Fingerprint, PathBuf) {
        let map = self.service.context().cache_map(corpus);
        let fp = map.fingerprint(q.prefix(len), 0);
        let path = map.cache_file_path(&fp);
        map.ensure_writable_storage().await.unwrap();
        std::fs::write(&path, header.encode()).unwrap();

        let mut status = CalcStatus::new();
        status.readable = header.finished;
        status.finished = header.finished;
        status.concsize = u64::from(header.concsize);
        status.fullsize = header.fullsize;
        map.add_to_map(&fp, status, false).await.unwrap();
        (fp, path)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.service.shutdown();
    }
}

pub fn pipeline(raw: &[&str]) -> Pipeline {
    Pipeline::parse(raw).unwrap()
}

pub fn finished_header(concsize: u32, fullsize: u64) -> ArtifactHeader {
    ArtifactHeader {
        finished: true,
        fullsize,
        concsize,
    }
}
