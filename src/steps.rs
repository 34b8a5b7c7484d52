use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

/// Selects which external counter advances when a parameter update is skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Advance the training loop's global step.
    #[default]
    GlobalStep,
    /// Advance the optimizer's own iteration counter.
    Iterations,
}

/// A shared, monotonically increasing step counter.
///
/// Clones share the same underlying value, so schedules holding a clone observe
/// every increment.
#[derive(Debug, Clone, Default)]
pub struct StepCounter(Arc<AtomicU64>);

impl StepCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Increments the counter by one.
    ///
    /// # Returns
    /// The value after the increment.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// The optional external step counters a training step advances.
#[derive(Debug, Clone, Default)]
pub struct StepCounters {
    global_step: Option<StepCounter>,
    iterations: Option<StepCounter>,
}

impl StepCounters {
    /// Creates an empty set of counters, advancing them is a no-op.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_step(mut self, counter: StepCounter) -> Self {
        self.global_step = Some(counter);
        self
    }

    pub fn with_iterations(mut self, counter: StepCounter) -> Self {
        self.iterations = Some(counter);
        self
    }

    pub fn global_step(&self) -> Option<&StepCounter> {
        self.global_step.as_ref()
    }

    pub fn iterations(&self) -> Option<&StepCounter> {
        self.iterations.as_ref()
    }

    /// Advances the counter selected by `mode`, if it's being tracked.
    ///
    /// # Arguments
    /// * `mode` - The stepping convention in use.
    pub fn advance(&self, mode: StepMode) {
        let counter = match mode {
            StepMode::GlobalStep => &self.global_step,
            StepMode::Iterations => &self.iterations,
        };

        if let Some(counter) = counter {
            counter.increment();
        }
    }

    /// Advances every tracked counter, this is what an applied update does.
    pub fn record_update(&self) {
        for counter in [&self.global_step, &self.iterations].into_iter().flatten() {
            counter.increment();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_value() {
        let counter = StepCounter::new();
        let other = counter.clone();

        assert_eq!(counter.increment(), 1);
        assert_eq!(other.increment(), 2);
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn advance_follows_the_mode() {
        let global_step = StepCounter::new();
        let iterations = StepCounter::new();
        let counters = StepCounters::new()
            .with_global_step(global_step.clone())
            .with_iterations(iterations.clone());

        counters.advance(StepMode::GlobalStep);
        counters.advance(StepMode::GlobalStep);
        counters.advance(StepMode::Iterations);
        assert_eq!(global_step.get(), 2);
        assert_eq!(iterations.get(), 1);

        counters.record_update();
        assert_eq!(global_step.get(), 3);
        assert_eq!(iterations.get(), 2);
    }

    #[test]
    fn untracked_counters_are_noops() {
        let counters = StepCounters::new();
        counters.advance(StepMode::GlobalStep);
        counters.advance(StepMode::Iterations);
        counters.record_update();
        assert!(counters.global_step().is_none());
    }
}
