//! Concordance handle returned to callers.
//!
//! A [`ConcHandle`] wraps the [`Concordance`] a request ended up with, plus
//! where it came from: the cache entry it was loaded from (or is being
//! computed into) and the pipeline index computation resumed at.
//!
//! # Example
//!
//! ```ignore
//! let handle = service.get_conc(&corpus, request).await?;
//!
//! if !handle.finished() {
//!     // in progress: poll the cache entry and reload later
//!     let ready = service.wait_for_conc(&corpus, handle.fingerprint().unwrap(), MinSize::Any).await?;
//! }
//! println!("{} lines", handle.size());
//! ```

use std::path::{Path, PathBuf};

use crate::engine::Concordance;
use crate::fingerprint::Fingerprint;

/// Cache entry backing a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSource {
    pub fingerprint: Fingerprint,
    pub cachefile: PathBuf,
}

/// Result of a concordance request.
#[derive(Debug)]
pub struct ConcHandle {
    conc: Concordance,
    source: Option<CacheSource>,
    calc_from: usize,
}

impl ConcHandle {
    pub fn new(conc: Concordance, calc_from: usize) -> Self {
        Self {
            conc,
            source: None,
            calc_from,
        }
    }

    /// Finished, empty handle.
    pub fn empty() -> Self {
        Self::new(Concordance::empty(), 0)
    }

    /// Handle for a computation that has not published anything usable yet.
    pub fn in_progress(fingerprint: Fingerprint, cachefile: PathBuf) -> Self {
        Self::new(Concordance::pending(), 0).with_source(fingerprint, cachefile)
    }

    pub fn with_source(mut self, fingerprint: Fingerprint, cachefile: PathBuf) -> Self {
        self.source = Some(CacheSource {
            fingerprint,
            cachefile,
        });
        self
    }

    pub fn with_calc_from(mut self, calc_from: usize) -> Self {
        self.calc_from = calc_from;
        self
    }

    pub fn size(&self) -> u64 {
        self.conc.size()
    }

    pub fn fullsize(&self) -> u64 {
        self.conc.fullsize()
    }

    pub fn finished(&self) -> bool {
        self.conc.finished()
    }

    /// Number of leading pipeline operations served from the cache.
    pub fn calc_from(&self) -> usize {
        self.calc_from
    }

    pub fn source(&self) -> Option<&CacheSource> {
        self.source.as_ref()
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.source.as_ref().map(|s| &s.fingerprint)
    }

    pub fn cachefile(&self) -> Option<&Path> {
        self.source.as_ref().map(|s| s.cachefile.as_path())
    }

    /// Returns true for a placeholder of a still-running computation.
    pub fn is_in_progress(&self) -> bool {
        self.conc.is_initial() && !self.conc.finished()
    }

    pub fn concordance(&self) -> &Concordance {
        &self.conc
    }

    pub fn concordance_mut(&mut self) -> &mut Concordance {
        &mut self.conc
    }

    pub fn into_concordance(self) -> Concordance {
        self.conc
    }

    /// Splits the handle into its concordance and cache source.
    pub(crate) fn into_parts(self) -> (Concordance, Option<CacheSource>, usize) {
        (self.conc, self.source, self.calc_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::CorpusCacheKey;
    use crate::query::Pipeline;

    #[test]
    fn test_empty_handle() {
        let handle = ConcHandle::empty();
        assert!(handle.finished());
        assert_eq!(handle.size(), 0);
        assert!(handle.fingerprint().is_none());
        assert!(!handle.is_in_progress());
    }

    #[test]
    fn test_in_progress_handle_carries_cachefile() {
        let q = Pipeline::parse(&["q[word=\"the\"]"]).unwrap();
        let fp = Fingerprint::compute(&CorpusCacheKey::whole("C1"), q.ops(), 0);
        let handle = ConcHandle::in_progress(fp.clone(), PathBuf::from("/c/C1/x.conc"));
        assert!(handle.is_in_progress());
        assert!(!handle.finished());
        assert_eq!(handle.fingerprint(), Some(&fp));
        assert_eq!(handle.cachefile(), Some(Path::new("/c/C1/x.conc")));
    }
}
