use std::{
    error::Error,
    fmt::{self, Display},
};

use crate::reduction::ReduceErr;

/// The result type used in the entire aggregation crate.
pub type Result<T> = std::result::Result<T, AggregationErr>;

/// Coarse classification of an `AggregationErr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrKind {
    /// Invalid configuration or gradient representation, fatal to the caller.
    Configuration,
    /// The gradients of a call don't follow the pattern fixed at initialization.
    ShapeMismatch,
    /// The injected reduction failed, the controller's state was left untouched.
    Reduction,
}

/// The aggregation crate's error type.
#[derive(Debug)]
pub enum AggregationErr {
    ZeroFrequency,
    SparseNotAllowed {
        position: usize,
        frequency: usize,
    },
    MalformedSpec(String),
    InvalidSlices(&'static str),
    LengthMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    AbsenceMismatch {
        position: usize,
        expected_absent: bool,
    },
    ShapeMismatch {
        position: usize,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    ReducedLengthMismatch {
        got: usize,
        expected: usize,
    },
    ReducedShapeMismatch {
        position: usize,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    Reduction(ReduceErr),
}

impl AggregationErr {
    /// Classifies this error.
    ///
    /// # Returns
    /// The kind of failure this error belongs to.
    pub fn kind(&self) -> ErrKind {
        match self {
            AggregationErr::ZeroFrequency
            | AggregationErr::SparseNotAllowed { .. }
            | AggregationErr::MalformedSpec(_)
            | AggregationErr::InvalidSlices(_) => ErrKind::Configuration,
            AggregationErr::LengthMismatch { .. }
            | AggregationErr::AbsenceMismatch { .. }
            | AggregationErr::ShapeMismatch { .. } => ErrKind::ShapeMismatch,
            AggregationErr::ReducedLengthMismatch { .. }
            | AggregationErr::ReducedShapeMismatch { .. }
            | AggregationErr::Reduction(_) => ErrKind::Reduction,
        }
    }
}

impl Display for AggregationErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationErr::ZeroFrequency => {
                f.write_str("the aggregation frequency must be greater than zero")
            }
            AggregationErr::SparseNotAllowed {
                position,
                frequency,
            } => write!(
                f,
                "sparse gradient at {position} needs sparse_as_dense with frequency {frequency}"
            ),
            AggregationErr::MalformedSpec(detail) => {
                write!(f, "malformed aggregation spec: {detail}")
            }
            AggregationErr::InvalidSlices(reason) => {
                write!(f, "invalid indexed slices: {reason}")
            }
            AggregationErr::LengthMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "length mismatch for {what}: got {got}, expected {expected}"
            ),
            AggregationErr::AbsenceMismatch {
                position,
                expected_absent: true,
            } => write!(
                f,
                "got a gradient at position {position}, which was absent at initialization"
            ),
            AggregationErr::AbsenceMismatch { position, .. } => write!(
                f,
                "gradient at position {position} is absent but was present at initialization"
            ),
            AggregationErr::ShapeMismatch {
                position,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch at position {position}: got {got:?}, expected {expected:?}"
            ),
            AggregationErr::ReducedLengthMismatch { got, expected } => {
                write!(f, "the reducer returned {got} tensors, expected {expected}")
            }
            AggregationErr::ReducedShapeMismatch {
                position,
                got,
                expected,
            } => write!(
                f,
                "reduced shape {got:?} at accumulator {position}, expected {expected:?}"
            ),
            AggregationErr::Reduction(e) => write!(f, "reduction failed: {e}"),
        }
    }
}

impl Error for AggregationErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AggregationErr::Reduction(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ReduceErr> for AggregationErr {
    fn from(value: ReduceErr) -> Self {
        Self::Reduction(value)
    }
}

impl From<serde_json::Error> for AggregationErr {
    fn from(value: serde_json::Error) -> Self {
        Self::MalformedSpec(value.to_string())
    }
}
