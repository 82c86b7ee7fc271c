//! Concordance variants handled by the coordinator.

use std::path::Path;

use super::{EngineConc, EngineError, SaveMode};
use crate::error::{CalcError, CalcResult};
use crate::query::Operation;

/// Placeholder used before any result exists.
///
/// An empty pipeline yields a finished placeholder; a computation that has not
/// published anything yet yields an unfinished one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialConc {
    finished: bool,
}

impl InitialConc {
    pub fn finished() -> Self {
        Self { finished: true }
    }

    pub fn pending() -> Self {
        Self { finished: false }
    }
}

/// A concordance as seen by the coordinator.
pub enum Concordance {
    /// No result yet.
    Initial(InitialConc),
    /// Backed by the corpus engine.
    Engine(Box<dyn EngineConc>),
}

impl Concordance {
    /// Finished, empty concordance.
    pub fn empty() -> Self {
        Self::Initial(InitialConc::finished())
    }

    /// Placeholder for a computation in progress.
    pub fn pending() -> Self {
        Self::Initial(InitialConc::pending())
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Initial(_))
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Initial(_) => 0,
            Self::Engine(conc) => conc.size(),
        }
    }

    pub fn fullsize(&self) -> u64 {
        match self {
            Self::Initial(_) => 0,
            Self::Engine(conc) => conc.fullsize(),
        }
    }

    pub fn finished(&self) -> bool {
        match self {
            Self::Initial(initial) => initial.finished,
            Self::Engine(conc) => conc.finished(),
        }
    }

    pub fn sync(&mut self) -> Result<(), EngineError> {
        match self {
            Self::Initial(_) => Ok(()),
            Self::Engine(conc) => conc.sync(),
        }
    }

    pub fn exec_command(&mut self, op: &Operation) -> Result<(), EngineError> {
        match self {
            Self::Initial(_) => Err(EngineError::failed(format!(
                "cannot apply '{op}' to an empty concordance"
            ))),
            Self::Engine(conc) => conc.exec_command(op),
        }
    }

    pub fn save(&self, path: &Path, mode: SaveMode) -> Result<(), EngineError> {
        match self {
            Self::Initial(_) => Err(EngineError::failed("cannot save an empty concordance")),
            Self::Engine(conc) => conc.save(path, mode),
        }
    }

    pub fn compute_arf(&self) -> Result<f64, EngineError> {
        match self {
            Self::Initial(_) => Ok(0.0),
            Self::Engine(conc) => conc.compute_arf(),
        }
    }

    /// Runs `f` against this concordance on the blocking pool and hands the
    /// concordance back together with the result.
    pub async fn run_blocking<T, F>(self, f: F) -> CalcResult<(Self, T)>
    where
        F: FnOnce(&mut Self) -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let mut conc = self;
            let out = f(&mut conc);
            (conc, out)
        })
        .await
        .map_err(|e| CalcError::Spawn(e.to_string()))
    }
}

impl From<Box<dyn EngineConc>> for Concordance {
    fn from(conc: Box<dyn EngineConc>) -> Self {
        Self::Engine(conc)
    }
}

impl std::fmt::Debug for Concordance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial(initial) => f.debug_tuple("Initial").field(initial).finish(),
            Self::Engine(conc) => f
                .debug_struct("Engine")
                .field("size", &conc.size())
                .field("fullsize", &conc.fullsize())
                .field("finished", &conc.finished())
                .finish(),
        }
    }
}
