//! Query pipelines.
//!
//! A pipeline is an ordered list of operations. Each operation is a single
//! character opcode followed by an opaque argument string, e.g.
//! `q[word="dog"]` or `p0 0 1 [lemma="bark"]`. Only the first operation
//! produces a raw concordance; every later one transforms the previous result.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CalcError;

/// Operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// `q` - root query in the default query language
    Query,
    /// `a` - root query with an explicit default attribute
    AttrQuery,
    /// `p` - positive filter
    PositiveFilter,
    /// `n` - negative filter
    NegativeFilter,
    /// `r` - random sample of N lines
    Sample,
    /// `f` - shuffle
    Shuffle,
    /// `s` - sort
    Sort,
    /// `D` - subhits filter
    Subhits,
    /// `F` - first-hits filter
    FirstHits,
    /// `x` - switch aligned main corpus
    SwitchAligned,
    /// `X` - drop aligned corpus
    DropAligned,
    /// `g` - apply persisted line grouping (user-specific)
    LineGroups,
    /// `e` - re-rank by good-example score (user-specific)
    GoodExamples,
}

impl Opcode {
    /// Returns the wire character of this opcode.
    pub fn as_char(self) -> char {
        match self {
            Self::Query => 'q',
            Self::AttrQuery => 'a',
            Self::PositiveFilter => 'p',
            Self::NegativeFilter => 'n',
            Self::Sample => 'r',
            Self::Shuffle => 'f',
            Self::Sort => 's',
            Self::Subhits => 'D',
            Self::FirstHits => 'F',
            Self::SwitchAligned => 'x',
            Self::DropAligned => 'X',
            Self::LineGroups => 'g',
            Self::GoodExamples => 'e',
        }
    }

    /// Returns true for root-query opcodes (`q`, `a`).
    pub fn is_root(self) -> bool {
        matches!(self, Self::Query | Self::AttrQuery)
    }

    /// Returns true if results of this operation may be shared across users.
    pub fn is_cacheable(self) -> bool {
        !matches!(self, Self::LineGroups | Self::GoodExamples)
    }
}

impl TryFrom<char> for Opcode {
    type Error = CalcError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        Ok(match c {
            'q' => Self::Query,
            'a' => Self::AttrQuery,
            'p' => Self::PositiveFilter,
            'n' => Self::NegativeFilter,
            'r' => Self::Sample,
            'f' => Self::Shuffle,
            's' => Self::Sort,
            'D' => Self::Subhits,
            'F' => Self::FirstHits,
            'x' => Self::SwitchAligned,
            'X' => Self::DropAligned,
            'g' => Self::LineGroups,
            'e' => Self::GoodExamples,
            other => {
                return Err(CalcError::InvalidPipeline(format!(
                    "unknown opcode '{other}'"
                )))
            }
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A single pipeline operation.
///
/// Serialized in its compact string form (opcode immediately followed by
/// the argument string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Operation {
    pub opcode: Opcode,
    pub args: String,
}

impl Operation {
    pub fn new(opcode: Opcode, args: impl Into<String>) -> Self {
        Self {
            opcode,
            args: args.into(),
        }
    }

    /// Builds an operation from its raw opcode character and arguments.
    pub fn from_parts(opcode: char, args: impl Into<String>) -> Result<Self, CalcError> {
        Ok(Self::new(Opcode::try_from(opcode)?, args))
    }

    /// Splits the arguments of an `a` operation into (attribute, query).
    ///
    /// Returns `None` for other opcodes or a missing separator.
    pub fn attr_query(&self) -> Option<(&str, &str)> {
        match self.opcode {
            Opcode::AttrQuery => self.args.split_once(','),
            _ => None,
        }
    }
}

impl FromStr for Operation {
    type Err = CalcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let opcode = chars
            .next()
            .ok_or_else(|| CalcError::InvalidPipeline("empty operation".to_string()))?;
        Self::from_parts(opcode, chars.as_str())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.opcode, self.args)
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.to_string()
    }
}

impl TryFrom<String> for Operation {
    type Error = CalcError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Ordered sequence of operations building a concordance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline(Vec<Operation>);

impl Pipeline {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self(ops)
    }

    /// Parses a pipeline from compact operation strings.
    pub fn parse<S: AsRef<str>>(ops: &[S]) -> Result<Self, CalcError> {
        ops.iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ops(&self) -> &[Operation] {
        &self.0
    }

    pub fn get(&self, idx: usize) -> Option<&Operation> {
        self.0.get(idx)
    }

    /// Returns the first `len` operations.
    pub fn prefix(&self, len: usize) -> &[Operation] {
        &self.0[..len.min(self.0.len())]
    }

    /// A pipeline is valid iff it starts with a root query.
    pub fn is_valid(&self) -> bool {
        self.0.first().is_some_and(|op| op.opcode.is_root())
    }

    /// Returns an error unless the pipeline is valid.
    pub fn validate(&self) -> Result<(), CalcError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CalcError::InvalidPipeline(format!(
                "pipeline must start with 'q' or 'a': {self}"
            )))
        }
    }

    /// Returns true if two shuffle operations follow each other anywhere.
    pub fn has_consecutive_shuffles(&self) -> bool {
        self.0
            .windows(2)
            .any(|w| w[0].opcode == Opcode::Shuffle && w[1].opcode == Opcode::Shuffle)
    }

    /// Index of the first user-specific operation, if any.
    pub fn first_user_specific(&self) -> Option<usize> {
        self.0.iter().position(|op| !op.opcode.is_cacheable())
    }

    /// Number of leading operations whose results may be cached.
    pub fn cacheable_len(&self) -> usize {
        self.first_user_specific().unwrap_or(self.0.len())
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|op| op.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

impl From<Vec<Operation>> for Pipeline {
    fn from(ops: Vec<Operation>) -> Self {
        Self(ops)
    }
}
