use crate::{
    error::{AggregationErr, Result},
    gradient::{GradSlot, Tensor},
    steps::StepCounters,
};

/// Defines the strategy for updating model parameters based on aggregated gradients.
pub trait Optimizer {
    /// Updates the parameters using one gradient per parameter.
    ///
    /// # Arguments
    /// * `grads` - The gradients to apply, absent ones leave their parameter untouched.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error if there's a mismatch between the lengths or shapes of `grads` and `params`.
    fn update_params(&mut self, grads: &[GradSlot], params: &mut [Tensor]) -> Result<()>;

    /// Returns the step counters this optimizer advances on every update.
    fn counters(&self) -> &StepCounters;
}

/// Checks that every gradient lines up with its parameter.
pub(super) fn check_params(grads: &[GradSlot], params: &[Tensor]) -> Result<()> {
    if grads.len() != params.len() {
        return Err(AggregationErr::LengthMismatch {
            what: "parameters",
            got: params.len(),
            expected: grads.len(),
        });
    }

    for (position, (grad, param)) in grads.iter().zip(params).enumerate() {
        if let Some(grad) = grad {
            if grad.shape() != param.shape() {
                return Err(AggregationErr::ShapeMismatch {
                    position,
                    got: grad.shape().to_vec(),
                    expected: param.shape().to_vec(),
                });
            }
        }
    }

    Ok(())
}
