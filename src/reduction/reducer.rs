use serde::{Deserialize, Serialize};

use super::Result;
use crate::gradient::Tensor;

/// How contributions are combined across participants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    #[default]
    Sum,
    Average,
}

/// Combines tensors across every participating process.
///
/// A reduction behaves as a synchronization barrier: every participant must call it
/// the same amount of times with tensors of the same shapes.
pub trait Reducer {
    /// Reduces `values` across all participants.
    ///
    /// # Arguments
    /// * `values` - This participant's contribution, one tensor per accumulator.
    ///
    /// # Returns
    /// The reduced tensors in the same order, or a `ReduceErr` on communication failure.
    fn reduce(&mut self, values: Vec<Tensor>) -> Result<Vec<Tensor>>;
}

impl<F> Reducer for F
where
    F: FnMut(Vec<Tensor>) -> Result<Vec<Tensor>>,
{
    fn reduce(&mut self, values: Vec<Tensor>) -> Result<Vec<Tensor>> {
        self(values)
    }
}
