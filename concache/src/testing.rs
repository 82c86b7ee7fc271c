//! Test doubles shared by unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::artifact::ArtifactHeader;
use crate::config::CalcConfig;
use crate::context::CalcContext;
use crate::engine::{Corpus, CorpusEngine, EngineConc, EngineError, RootQuery, SaveMode};
use crate::query::{Opcode, Operation};
use crate::store::MemoryStore;
use crate::worker::LocalWorkerRuntime;

const DEFAULT_HITS: u64 = 100;

#[derive(Default)]
struct Counters {
    compute: AtomicUsize,
    exec: AtomicUsize,
    load: AtomicUsize,
}

/// Engine producing header-only artifacts.
///
/// Queries containing `fail` fail; hit counts and run times are set per query.
#[derive(Clone, Default)]
pub(crate) struct MockEngine {
    hits: Arc<Mutex<HashMap<String, (u64, Duration)>>>,
    counters: Arc<Counters>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hits(&self, query: &str, hits: u64, duration: Duration) {
        if let Ok(mut map) = self.hits.lock() {
            map.insert(query.to_string(), (hits, duration));
        }
    }

    pub fn compute_calls(&self) -> usize {
        self.counters.compute.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> usize {
        self.counters.exec.load(Ordering::SeqCst)
    }
}

impl CorpusEngine for MockEngine {
    fn open_corpus(&self, corpname: &str, subcname: Option<&str>) -> Result<Corpus, EngineError> {
        let corpus = Corpus::new(corpname, 1_000_000);
        Ok(match subcname {
            Some(subc) => corpus.with_subcorpus(subc, 250_000),
            None => corpus,
        })
    }

    fn compute(&self, _corpus: &Corpus, query: &RootQuery) -> Result<Box<dyn EngineConc>, EngineError> {
        self.counters.compute.fetch_add(1, Ordering::SeqCst);
        if query.query.contains("fail") {
            return Err(EngineError::failed(format!("syntax error in {}", query.query)));
        }
        let (hits, duration) = self
            .hits
            .lock()
            .ok()
            .and_then(|m| m.get(&query.query).copied())
            .unwrap_or((DEFAULT_HITS, Duration::ZERO));
        let total = if query.cutoff > 0 { hits.min(query.cutoff) } else { hits };
        Ok(Box::new(MockConc {
            total,
            fullsize: hits,
            started: Instant::now(),
            duration,
            done: false,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn load(&self, _corpus: &Corpus, path: &Path) -> Result<Box<dyn EngineConc>, EngineError> {
        self.counters.load.fetch_add(1, Ordering::SeqCst);
        let bytes = std::fs::read(path).map_err(|_| EngineError::file_access(path))?;
        let header = ArtifactHeader::parse(&bytes).ok_or_else(|| EngineError::file_access(path))?;
        Ok(Box::new(MockConc {
            total: u64::from(header.concsize),
            fullsize: header.fullsize,
            started: Instant::now(),
            duration: Duration::ZERO,
            done: header.finished,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MockConc {
    total: u64,
    fullsize: u64,
    started: Instant,
    duration: Duration,
    done: bool,
    counters: Arc<Counters>,
}

impl EngineConc for MockConc {
    fn size(&self) -> u64 {
        if self.finished() {
            return self.total;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let progress = elapsed / self.duration.as_secs_f64().max(f64::EPSILON);
        (self.total as f64 * progress.min(1.0)) as u64
    }

    fn fullsize(&self) -> u64 {
        self.fullsize
    }

    fn finished(&self) -> bool {
        self.done || self.started.elapsed() >= self.duration
    }

    fn sync(&mut self) -> Result<(), EngineError> {
        let remaining = self.duration.saturating_sub(self.started.elapsed());
        std::thread::sleep(remaining);
        self.done = true;
        Ok(())
    }

    fn exec_command(&mut self, op: &Operation) -> Result<(), EngineError> {
        self.sync()?;
        self.counters.exec.fetch_add(1, Ordering::SeqCst);
        match op.opcode {
            Opcode::Sample => {
                let n: u64 = op.args.trim().parse().map_err(|_| EngineError::failed("bad sample size"))?;
                self.total = self.total.min(n);
            }
            Opcode::PositiveFilter | Opcode::NegativeFilter | Opcode::Subhits | Opcode::FirstHits => {
                self.total /= 2;
            }
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
        Ok(self.total as f64 * 0.5)
    }
}

/// Configuration with short budgets suitable for tests.
pub(crate) fn test_config(root: &Path) -> CalcConfig {
    CalcConfig::new(root.join("cache"))
        .with_task_time_limit(Duration::from_secs(30))
        .with_poll_step(Duration::from_millis(5))
        .with_wait_budgets(
            Duration::from_millis(300),
            Duration::from_millis(300),
            Duration::from_millis(100),
        )
        .with_async_schedule(
            Duration::from_millis(5),
            Duration::from_millis(10),
            Duration::from_millis(40),
        )
}

pub(crate) fn test_context(engine: MockEngine) -> (TempDir, CalcContext) {
    test_context_with(engine, |c| c)
}

/// Context over a temp directory, an in-memory store and a runtime without
/// a handler.
pub(crate) fn test_context_with(
    engine: MockEngine,
    configure: impl FnOnce(CalcConfig) -> CalcConfig,
) -> (TempDir, CalcContext) {
    let dir = TempDir::new().unwrap();
    let config = configure(test_config(dir.path()));
    let ctx = CalcContext::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(engine),
        Arc::new(LocalWorkerRuntime::new()),
    );
    (dir, ctx)
}
