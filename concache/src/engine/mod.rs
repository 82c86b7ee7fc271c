//! Corpus engine interface.
//!
//! The coordinator never evaluates queries itself. It hands root queries and
//! transformation commands to a [`CorpusEngine`] and treats the resulting
//! [`EngineConc`] as an opaque, possibly still-growing concordance.
//!
//! Engine calls are blocking native calls. The helpers [`blocking`] and
//! [`Concordance::run_blocking`] move them onto tokio's blocking pool so they
//! never stall the async runtime.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  open_corpus / compute / load   ┌────────────────┐
//! │  Workers,    │ ──────────────────────────────► │  CorpusEngine  │
//! │  Resolver    │                                 └───────┬────────┘
//! └──────┬───────┘                                         │
//!        │ size / fullsize / finished / sync               ▼
//!        │ exec_command / save / compute_arf       ┌────────────────┐
//!        └───────────────────────────────────────► │   EngineConc   │
//!                                                  └────────────────┘
//! ```

mod concordance;

pub use concordance::{Concordance, InitialConc};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CalcError, CalcResult};
use crate::fingerprint::CorpusCacheKey;
use crate::query::{Opcode, Operation};

/// Errors reported by the corpus engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The backing file of a concordance cannot be accessed.
    ///
    /// Implies the artifact was deleted or truncated externally.
    #[error("Cannot access concordance file {0}")]
    FileAccess(String),

    /// Any other engine failure.
    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn file_access(path: &Path) -> Self {
        Self::FileAccess(path.display().to_string())
    }
}

/// An opened corpus or subcorpus.
///
/// Plain data so it can travel inside worker task arguments; workers reopen
/// engine-side resources by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    /// Corpus identifier.
    pub corpname: String,
    /// Active subcorpus, if any.
    pub subcname: Option<String>,
    /// Number of tokens in the whole corpus.
    pub size: u64,
    /// Number of tokens in the search space (subcorpus size for subcorpora).
    pub search_size: u64,
    /// Corpus index file whose mtime invalidates cached entries.
    pub index_path: Option<PathBuf>,
}

impl Corpus {
    pub fn new(corpname: impl Into<String>, size: u64) -> Self {
        Self {
            corpname: corpname.into(),
            subcname: None,
            size,
            search_size: size,
            index_path: None,
        }
    }

    pub fn with_subcorpus(mut self, subcname: impl Into<String>, search_size: u64) -> Self {
        self.subcname = Some(subcname.into());
        self.search_size = search_size;
        self
    }

    pub fn with_index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.index_path = Some(path.into());
        self
    }

    pub fn cache_key(&self) -> CorpusCacheKey {
        CorpusCacheKey::new(self.corpname.clone(), self.subcname.clone())
    }

    pub fn is_subcorpus(&self) -> bool {
        self.subcname.is_some()
    }

    /// Scales `concsize` to hits per million tokens of search space.
    pub fn relative_size(&self, concsize: u64) -> f64 {
        if self.search_size == 0 {
            return 0.0;
        }
        concsize as f64 * 1_000_000.0 / self.search_size as f64
    }
}

/// Root query handed to [`CorpusEngine::compute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootQuery {
    /// Query text in the engine's query language.
    pub query: String,
    /// Default attribute for `a` queries.
    pub default_attr: Option<String>,
    /// Maximum number of lines to produce (0 = unbounded).
    pub cutoff: u64,
    /// Random sample size applied by the engine (0 = none).
    pub samplesize: u64,
}

impl RootQuery {
    /// Builds the root query from the first pipeline operation.
    pub fn from_operation(op: &Operation, cutoff: u64, samplesize: u64) -> CalcResult<Self> {
        let (query, default_attr) = match op.opcode {
            Opcode::Query => (op.args.clone(), None),
            Opcode::AttrQuery => match op.attr_query() {
                Some((attr, query)) => (query.to_string(), Some(attr.to_string())),
                None => (op.args.clone(), None),
            },
            other => {
                return Err(CalcError::InvalidPipeline(format!(
                    "'{other}' cannot start a pipeline"
                )))
            }
        };
        Ok(Self {
            query,
            default_attr,
            cutoff,
            samplesize,
        })
    }
}

/// Flags for [`EngineConc::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveMode {
    /// Append lines computed since the previous save.
    pub append: bool,
    /// The concordance is complete; write the finished marker.
    pub final_save: bool,
}

impl SaveMode {
    pub const PARTIAL: Self = Self {
        append: false,
        final_save: false,
    };
    pub const FINAL: Self = Self {
        append: false,
        final_save: true,
    };
}

/// Native corpus engine.
pub trait CorpusEngine: Send + Sync + 'static {
    /// Opens a corpus, optionally restricted to a subcorpus.
    fn open_corpus(&self, corpname: &str, subcname: Option<&str>) -> Result<Corpus, EngineError>;

    /// Starts evaluating a root query.
    ///
    /// The returned concordance may still be growing; `finished()` flips to
    /// true once the engine is done.
    fn compute(&self, corpus: &Corpus, query: &RootQuery) -> Result<Box<dyn EngineConc>, EngineError>;

    /// Loads a previously saved concordance.
    ///
    /// Returns [`EngineError::FileAccess`] when the file is missing or unreadable.
    fn load(&self, corpus: &Corpus, path: &Path) -> Result<Box<dyn EngineConc>, EngineError>;
}

/// An engine-backed concordance.
pub trait EngineConc: Send + 'static {
    /// Lines currently available.
    fn size(&self) -> u64;

    /// Expected final number of lines (before cutoff).
    fn fullsize(&self) -> u64;

    /// Whether the engine finished computing.
    fn finished(&self) -> bool;

    /// Blocks until the computation is complete.
    fn sync(&mut self) -> Result<(), EngineError>;

    /// Applies a transformation operation.
    fn exec_command(&mut self, op: &Operation) -> Result<(), EngineError>;

    /// Writes the concordance to `path`.
    fn save(&self, path: &Path, mode: SaveMode) -> Result<(), EngineError>;

    /// Average reduced frequency of the hits.
    fn compute_arf(&self) -> Result<f64, EngineError>;
}

/// Runs a blocking engine call on the blocking thread pool.
pub async fn blocking<T, F>(f: F) -> CalcResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CalcError::Spawn(e.to_string()))
}
