//! concache - Concordance computation and cache coordinator
//!
//! Sits between a corpus-query web application and a native corpus engine.
//! Query results (concordances) are expensive to compute, so every
//! cacheable prefix of a query pipeline is stored as an on-disk artifact
//! indexed by a fingerprint, with a status record in a shared fast store.
//! Concurrent identical requests share one computation; long computations
//! run in worker tasks and publish partial results while they grow.
//!
//! # High-Level API
//!
//! The [`service`] module provides the facade:
//!
//! ```ignore
//! use concache::{ConcRequest, ConcService, MemoryStore, Pipeline};
//!
//! let service = ConcService::in_process(config, Arc::new(MemoryStore::new()), engine);
//! let q = Pipeline::parse(&["q[word=\"dog\"]", "r100"])?;
//! let handle = service.get_conc(&corpus, &ConcRequest::new(q)).await?;
//!
//! if handle.is_in_progress() {
//!     // poll the entry behind handle.fingerprint() and ask again later
//! }
//! ```

pub mod artifact;
pub mod cache_map;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod handle;
pub mod janitor;
pub mod logging;
pub mod query;
pub mod resolver;
pub mod service;
pub mod status;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::ConcRequest;
pub use engine::{Concordance, Corpus, CorpusEngine, EngineConc, EngineError};
pub use error::{CalcError, CalcResult};
pub use fingerprint::{CorpusCacheKey, Fingerprint};
pub use handle::ConcHandle;
pub use query::{Opcode, Operation, Pipeline};
pub use service::ConcService;
pub use status::{CalcState, CalcStatus, MinSize};
pub use store::{KeyStore, MemoryStore};

/// Version of the concache library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
