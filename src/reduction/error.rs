use std::{
    error::Error,
    fmt::{self, Display},
    time::Duration,
};

/// The specific result type for reducers.
pub type Result<T> = std::result::Result<T, ReduceErr>;

/// Failure of a cross-process reduction.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceErr {
    /// The round didn't complete within the configured timeout.
    Timeout { waited: Duration },
    /// A participant left the group while a round was pending.
    PeerLeft,
    /// The group was broken by an earlier failure and can't be used anymore.
    GroupBroken,
    /// Participants contributed a different amount of tensors.
    SizeMismatch { got: usize, expected: usize },
    /// Participants contributed tensors of different shapes.
    ShapeMismatch {
        position: usize,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    /// Failure reported by a user-supplied reducer.
    Communication(String),
}

impl Display for ReduceErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceErr::Timeout { waited } => {
                write!(f, "reduction round timed out after {waited:?}")
            }
            ReduceErr::PeerLeft => f.write_str("a peer left the reduction group"),
            ReduceErr::GroupBroken => f.write_str("the reduction group is broken"),
            ReduceErr::SizeMismatch { got, expected } => {
                write!(f, "peers contributed {got} tensors, expected {expected}")
            }
            ReduceErr::ShapeMismatch {
                position,
                got,
                expected,
            } => write!(
                f,
                "peers contributed shape {got:?} at position {position}, expected {expected:?}"
            ),
            ReduceErr::Communication(detail) => write!(f, "communication error: {detail}"),
        }
    }
}

impl Error for ReduceErr {}
