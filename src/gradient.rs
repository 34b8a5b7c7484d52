use std::borrow::Cow;

use ndarray::{ArrayD, Axis, IxDyn};

use crate::error::{AggregationErr, Result};

/// A dense `f32` tensor of any rank.
pub type Tensor = ArrayD<f32>;

/// A gradient slot, `None` marks a parameter without gradient this step.
pub type GradSlot = Option<Gradient>;

/// A sparse update touching a subset of the rows of a dense tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedSlices {
    indices: Vec<usize>,
    values: Tensor,
    dense_shape: Vec<usize>,
}

impl IndexedSlices {
    /// Creates a new `IndexedSlices`.
    ///
    /// # Arguments
    /// * `indices` - The rows of the dense tensor being updated, may repeat.
    /// * `values` - One row of values per index, stacked along the first axis.
    /// * `dense_shape` - The shape of the dense tensor these slices belong to.
    ///
    /// # Returns
    /// A new `IndexedSlices` or an `InvalidSlices` error if the parts don't line up.
    pub fn new(indices: Vec<usize>, values: Tensor, dense_shape: Vec<usize>) -> Result<Self> {
        let Some((&rows, row_shape)) = dense_shape.split_first() else {
            return Err(AggregationErr::InvalidSlices(
                "dense shape must have rank >= 1",
            ));
        };

        match values.shape().split_first() {
            Some((&n, value_row_shape)) if n == indices.len() && value_row_shape == row_shape => {}
            _ => {
                return Err(AggregationErr::InvalidSlices(
                    "values must hold one row of the dense shape per index",
                ));
            }
        }

        if indices.iter().any(|&idx| idx >= rows) {
            return Err(AggregationErr::InvalidSlices("index out of bounds"));
        }

        Ok(Self {
            indices,
            values,
            dense_shape,
        })
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn dense_shape(&self) -> &[usize] {
        &self.dense_shape
    }

    /// Scatter-adds every row into `dense`, repeated indices are summed.
    fn add_to(&self, dense: &mut Tensor) {
        for (row, &idx) in self.indices.iter().enumerate() {
            let src = self.values.index_axis(Axis(0), row);
            let mut dst = dense.index_axis_mut(Axis(0), idx);
            dst.zip_mut_with(&src, |d, &s| *d += s);
        }
    }

    /// Converts the slices into their dense representation.
    pub fn to_dense(&self) -> Tensor {
        let mut dense = Tensor::zeros(IxDyn(&self.dense_shape));
        self.add_to(&mut dense);
        dense
    }
}

/// The gradient of the loss with respect to a single parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Gradient {
    Dense(Tensor),
    Sparse(IndexedSlices),
}

impl Gradient {
    /// Returns the dense shape of this gradient.
    pub fn shape(&self) -> &[usize] {
        match self {
            Gradient::Dense(t) => t.shape(),
            Gradient::Sparse(s) => s.dense_shape(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse(_))
    }

    /// Borrows a dense gradient or densifies a sparse one.
    pub fn to_dense(&self) -> Cow<'_, Tensor> {
        match self {
            Gradient::Dense(t) => Cow::Borrowed(t),
            Gradient::Sparse(s) => Cow::Owned(s.to_dense()),
        }
    }

    pub fn into_dense(self) -> Tensor {
        match self {
            Gradient::Dense(t) => t,
            Gradient::Sparse(s) => s.to_dense(),
        }
    }

    /// Adds this gradient in place into `acc`.
    ///
    /// # Arguments
    /// * `acc` - A dense tensor with the same shape as this gradient.
    ///
    /// # Panics
    /// If `acc` doesn't have the shape of this gradient, callers validate it beforehand.
    pub fn add_to(&self, acc: &mut Tensor) {
        match self {
            Gradient::Dense(t) => acc.zip_mut_with(t, |a, &g| *a += g),
            Gradient::Sparse(s) => s.add_to(acc),
        }
    }
}

impl From<Tensor> for Gradient {
    fn from(value: Tensor) -> Self {
        Self::Dense(value)
    }
}

impl From<IndexedSlices> for Gradient {
    fn from(value: IndexedSlices) -> Self {
        Self::Sparse(value)
    }
}
