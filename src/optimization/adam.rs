use ndarray::Zip;

use super::{Optimizer, optimizer::check_params};
use crate::{
    error::{AggregationErr, Result},
    gradient::{GradSlot, Tensor},
    steps::{StepCounter, StepCounters},
};

/// Adam optimization algorithm.
///
/// Bias correction is keyed on the iteration counter, so advancing it on skipped
/// steps moves the correction along with them.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    counters: StepCounters,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance with its own iteration counter.
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            m: Vec::new(),
            v: Vec::new(),
            counters: StepCounters::new().with_iterations(StepCounter::new()),
        }
    }

    /// Tracks a global step, advanced on every update.
    pub fn with_global_step(mut self, global_step: StepCounter) -> Self {
        self.counters = self.counters.with_global_step(global_step);
        self
    }

    fn iteration(&self) -> u64 {
        self.counters.iterations().map_or(0, StepCounter::get)
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grads: &[GradSlot], params: &mut [Tensor]) -> Result<()> {
        check_params(grads, params)?;

        if self.m.is_empty() {
            self.m = params.iter().map(|p| Tensor::zeros(p.raw_dim())).collect();
            self.v = params.iter().map(|p| Tensor::zeros(p.raw_dim())).collect();
        } else if self.m.len() != params.len() {
            return Err(AggregationErr::LengthMismatch {
                what: "parameters",
                got: params.len(),
                expected: self.m.len(),
            });
        }

        for (position, (m, param)) in self.m.iter().zip(params.iter()).enumerate() {
            if m.shape() != param.shape() {
                return Err(AggregationErr::ShapeMismatch {
                    position,
                    got: param.shape().to_vec(),
                    expected: m.shape().to_vec(),
                });
            }
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        let (bc1, bc2) = bias_corrections(b1, b2, self.iteration());
        let step_size = lr * (bc2.sqrt() / bc1);

        let moments = self.m.iter_mut().zip(self.v.iter_mut());

        for ((grad, param), (m, v)) in grads.iter().zip(params.iter_mut()).zip(moments) {
            let Some(grad) = grad else {
                continue;
            };

            let grad = grad.to_dense();

            Zip::from(param)
                .and(m)
                .and(v)
                .and(&*grad)
                .for_each(|p, m, v, &g| {
                    *m = b1 * *m + (1. - b1) * g;
                    *v = b2 * *v + (1. - b2) * g.powi(2);
                    *p -= step_size * *m / (v.sqrt() + eps);
                });
        }

        self.counters.record_update();
        Ok(())
    }

    fn counters(&self) -> &StepCounters {
        &self.counters
    }
}

/// Returns the bias corrections of both moments for the update following `iteration`.
fn bias_corrections(beta1: f32, beta2: f32, iteration: u64) -> (f32, f32) {
    let t = i32::try_from(iteration.saturating_add(1)).unwrap_or(i32::MAX);
    (1. - beta1.powi(t), 1. - beta2.powi(t))
}
