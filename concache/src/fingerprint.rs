//! Deterministic naming of cache entries.
//!
//! A fingerprint identifies a cacheable unit: (corpus cache key, pipeline
//! prefix, cutoff). It is a SHA-256 digest so that it is stable across
//! processes and restarts. Every fingerprint also carries `q0hash`, the
//! fingerprint of the same corpus/cutoff restricted to the root operation,
//! which groups a root query with all of its descendants.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::query::Operation;

/// Separates hashed components so that concatenations cannot collide.
const COMPONENT_SEP: u8 = 0x1f;
/// Terminates each hashed operation.
const OPERATION_SEP: u8 = 0x1e;

/// Identifies a corpus together with its active subcorpus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorpusCacheKey {
    corpname: String,
    subcorpus: Option<String>,
}

impl CorpusCacheKey {
    pub fn new(corpname: impl Into<String>, subcorpus: Option<String>) -> Self {
        Self {
            corpname: corpname.into(),
            subcorpus,
        }
    }

    /// Key for a whole-corpus query.
    pub fn whole(corpname: impl Into<String>) -> Self {
        Self::new(corpname, None)
    }

    pub fn corpname(&self) -> &str {
        &self.corpname
    }

    pub fn subcorpus(&self) -> Option<&str> {
        self.subcorpus.as_deref()
    }

    pub fn is_subcorpus(&self) -> bool {
        self.subcorpus.is_some()
    }

    /// Name of the per-corpus artifact directory.
    ///
    /// Only ASCII alphanumerics, `-`, `_` and `.` survive; everything else
    /// becomes `_`. A subcorpus is appended after `@`.
    pub fn dir_name(&self) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect()
        };
        match &self.subcorpus {
            Some(subc) => format!("{}@{}", sanitize(&self.corpname), sanitize(subc)),
            None => sanitize(&self.corpname),
        }
    }
}

impl fmt::Display for CorpusCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subcorpus {
            Some(subc) => write!(f, "{}:{}", self.corpname, subc),
            None => write!(f, "{}", self.corpname),
        }
    }
}

/// Value-equal identifier of a cacheable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    hash: String,
    q0hash: String,
}

impl Fingerprint {
    /// Computes the fingerprint of `prefix` evaluated on `corpus` with `cutoff`.
    pub fn compute(corpus: &CorpusCacheKey, prefix: &[Operation], cutoff: u64) -> Self {
        let hash = digest(corpus, prefix, cutoff);
        let q0hash = if prefix.len() <= 1 {
            hash.clone()
        } else {
            digest(corpus, &prefix[..1], cutoff)
        };
        Self { hash, q0hash }
    }

    /// Hex digest of the whole prefix.
    pub fn as_str(&self) -> &str {
        &self.hash
    }

    /// Hex digest of the root operation alone.
    pub fn q0hash(&self) -> &str {
        &self.q0hash
    }

    /// Returns true if this fingerprint names a root-query entry.
    pub fn is_root(&self) -> bool {
        self.hash == self.q0hash
    }

    /// Short form for log output.
    pub fn short(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash)
    }
}

fn digest(corpus: &CorpusCacheKey, prefix: &[Operation], cutoff: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(corpus.corpname.as_bytes());
    hasher.update([COMPONENT_SEP]);
    if let Some(subc) = &corpus.subcorpus {
        hasher.update(subc.as_bytes());
    }
    hasher.update([COMPONENT_SEP]);
    for op in prefix {
        hasher.update(op.to_string().as_bytes());
        hasher.update([OPERATION_SEP]);
    }
    hasher.update([COMPONENT_SEP]);
    hasher.update(cutoff.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
