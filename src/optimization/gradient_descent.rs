use std::num::NonZeroU64;

use ndarray::Axis;
use serde::{Deserialize, Serialize};

use super::{Optimizer, optimizer::check_params};
use crate::{
    error::Result,
    gradient::{GradSlot, Gradient, Tensor},
    steps::{StepCounter, StepCounters},
};

/// A learning rate, optionally decaying with the global step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRate {
    Constant(f32),
    ExponentialDecay {
        initial: f32,
        decay_rate: f32,
        decay_steps: NonZeroU64,
    },
}

impl LearningRate {
    /// Returns the learning rate at the given step.
    pub fn at(&self, step: u64) -> f32 {
        match *self {
            LearningRate::Constant(lr) => lr,
            LearningRate::ExponentialDecay {
                initial,
                decay_rate,
                decay_steps,
            } => initial * decay_rate.powf(step as f32 / decay_steps.get() as f32),
        }
    }
}

/// Gradient descent optimization algorithm.
#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: LearningRate,
    counters: StepCounters,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    ///
    /// # Returns
    /// A new `GradientDescent` instance with its own iteration counter.
    pub fn new(learning_rate: f32) -> Self {
        Self::with_schedule(LearningRate::Constant(learning_rate))
    }

    /// Creates a new `GradientDescent` optimizer following a learning rate schedule.
    pub fn with_schedule(learning_rate: LearningRate) -> Self {
        Self {
            learning_rate,
            counters: StepCounters::new().with_iterations(StepCounter::new()),
        }
    }

    /// Tracks a global step, advanced on every update and used to evaluate the schedule.
    pub fn with_global_step(mut self, global_step: StepCounter) -> Self {
        self.counters = self.counters.with_global_step(global_step);
        self
    }

    /// Returns the learning rate the next update will use.
    pub fn current_learning_rate(&self) -> f32 {
        let step = self
            .counters
            .global_step()
            .or(self.counters.iterations())
            .map_or(0, StepCounter::get);

        self.learning_rate.at(step)
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, grads: &[GradSlot], params: &mut [Tensor]) -> Result<()> {
        check_params(grads, params)?;

        let lr = self.current_learning_rate();

        for (grad, param) in grads.iter().zip(params.iter_mut()) {
            match grad {
                Some(Gradient::Dense(g)) => param.scaled_add(-lr, g),
                Some(Gradient::Sparse(s)) => {
                    for (row, &idx) in s.indices().iter().enumerate() {
                        let src = s.values().index_axis(Axis(0), row);
                        let mut dst = param.index_axis_mut(Axis(0), idx);
                        dst.scaled_add(-lr, &src);
                    }
                }
                None => {}
            }
        }

        self.counters.record_update();
        Ok(())
    }

    fn counters(&self) -> &StepCounters {
        &self.counters
    }
}
