use log::{debug, info, trace, warn};

use super::{AggregationCounter, SlotLayout};
use crate::{
    config::AggregationConfig,
    error::Result,
    gradient::{GradSlot, Tensor},
    reduction::Reducer,
    steps::StepCounters,
};

/// Accumulates gradients locally and reduces them across processes once every
/// `frequency` steps.
///
/// Each training step calls `compute` with the freshly computed gradients and then
/// `apply` with the parameter update. Only steps that completed a reduction let the
/// update through, the rest just advance the external step counters.
pub struct AggregationController<R: Reducer> {
    config: AggregationConfig,
    reducer: R,
    rank: usize,
    counter: AggregationCounter,
    layout: Option<SlotLayout>,
    counters: StepCounters,
    reductions: u64,
}

impl<R: Reducer> AggregationController<R> {
    /// Creates a new `AggregationController`.
    ///
    /// # Arguments
    /// * `config` - The aggregation configuration.
    /// * `reducer` - The cross-process reduction, called once every `frequency` steps.
    ///
    /// # Returns
    /// A new controller, its accumulators get allocated on the first gradient batch.
    pub fn new(config: AggregationConfig, reducer: R) -> Self {
        Self {
            counter: AggregationCounter::new(config.frequency()),
            config,
            reducer,
            rank: 0,
            layout: None,
            counters: StepCounters::default(),
            reductions: 0,
        }
    }

    /// Sets the rank of this process, only used for observability.
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    /// Sets the external counters advanced on skipped updates.
    pub fn with_step_counters(mut self, counters: StepCounters) -> Self {
        self.counters = counters;
        self
    }

    /// Allocates the accumulators for the given gradient batch.
    ///
    /// Calling it is optional, `compute` initializes the controller on its first call.
    /// Once initialized, this only checks that `grads` follows the established pattern.
    ///
    /// # Arguments
    /// * `grads` - A gradient batch, one slot per parameter.
    ///
    /// # Returns
    /// `SparseNotAllowed` when a sparse gradient can't be accumulated, or a mismatch
    /// error if the controller was initialized with a different pattern.
    pub fn initialize(&mut self, grads: &[GradSlot]) -> Result<()> {
        prepare(&mut self.layout, &self.config, self.rank, grads)?;
        Ok(())
    }

    /// Runs a single aggregation step.
    ///
    /// Clears the accumulators when a new cycle starts, adds `grads` into them and
    /// advances the step counter. When the counter reaches the frequency the accumulated
    /// sums are reduced, optionally averaged over the frequency and returned, resetting
    /// the counter. Otherwise `grads` are returned untouched.
    ///
    /// If the reduction fails nothing is modified, retrying the call with the same
    /// gradients attempts the reduction again.
    ///
    /// # Arguments
    /// * `grads` - The gradients of this step, one slot per parameter.
    ///
    /// # Returns
    /// The gradients to apply, with absent slots at the same positions as in `grads`.
    ///
    /// # Errors
    /// A mismatch error if `grads` doesn't follow the established pattern, or the
    /// reducer's failure.
    pub fn compute(&mut self, grads: Vec<GradSlot>) -> Result<Vec<GradSlot>> {
        let layout = prepare(&mut self.layout, &self.config, self.rank, &grads)?;
        let fresh = self.counter.is_zero();

        if !self.counter.next_fills() {
            if fresh {
                layout.clear();
            }

            layout.accumulate(&grads);
            self.counter.advance();
            return Ok(grads);
        }

        let snapshot = layout.snapshot(&grads, fresh);
        let reduced = match self.reducer.reduce(snapshot) {
            Ok(reduced) => reduced,
            Err(e) => {
                warn!(rank = self.rank, counter = self.counter.value(); "reduction failed: {e}");
                return Err(e.into());
            }
        };

        layout.check_reduced(&reduced)?;

        if fresh {
            layout.clear();
        }

        layout.accumulate(&grads);
        self.counter.advance();
        debug_assert!(self.counter.is_full());
        self.counter.reset();
        self.reductions += 1;

        debug!(rank = self.rank, reductions = self.reductions; "reduction cycle complete");

        let divisor = self
            .config
            .average()
            .then(|| self.config.frequency().get() as f32);

        Ok(layout.scatter(reduced, divisor))
    }

    /// Runs `update` if the last `compute` completed a reduction cycle.
    ///
    /// Skipped steps advance the external counter selected by the configured step mode
    /// instead, so that step-keyed schedules move on every call. On applied steps the
    /// controller doesn't touch the counters: `update` must advance them itself, as
    /// `Optimizer::update_params` does through `StepCounters::record_update`. A closure
    /// that doesn't leaves the counters one step behind per reduction cycle.
    ///
    /// # Arguments
    /// * `update` - The parameter update, applying the last computed gradients.
    ///
    /// # Returns
    /// The output of `update` if it ran, `None` if the step was skipped.
    ///
    /// # Errors
    /// The error returned by `update`.
    pub fn apply<T, E, F>(&self, update: F) -> std::result::Result<Option<T>, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
    {
        if self.counter.is_zero() {
            return update().map(Some);
        }

        self.counters.advance(self.config.step_mode());
        trace!(rank = self.rank, counter = self.counter.value(); "skipped parameter update");
        Ok(None)
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn step_counters(&self) -> &StepCounters {
        &self.counters
    }

    /// Returns the amount of steps accumulated since the last reduction.
    pub fn counter(&self) -> usize {
        self.counter.value()
    }

    /// Returns the amount of completed reduction cycles.
    pub fn reductions(&self) -> u64 {
        self.reductions
    }

    pub fn is_initialized(&self) -> bool {
        self.layout.is_some()
    }

    pub fn accumulator_count(&self) -> usize {
        self.layout
            .as_ref()
            .map_or(0, SlotLayout::accumulator_count)
    }

    pub fn absent_count(&self) -> usize {
        self.layout.as_ref().map_or(0, SlotLayout::absent_count)
    }

    /// Returns the accumulators in parameter order, `None` at absent positions.
    pub fn accumulators(&self) -> Vec<Option<&Tensor>> {
        self.layout
            .as_ref()
            .map(SlotLayout::accumulators)
            .unwrap_or_default()
    }
}

/// Returns the layout validated against `grads`, building it if it doesn't exist yet.
fn prepare<'a>(
    layout: &'a mut Option<SlotLayout>,
    config: &AggregationConfig,
    rank: usize,
    grads: &[GradSlot],
) -> Result<&'a mut SlotLayout> {
    match layout {
        Some(layout) => {
            layout.validate(grads, config)?;
            Ok(layout)
        }
        None => {
            let new = SlotLayout::from_grads(grads, config)?;

            info!(
                rank = rank,
                accumulators = new.accumulator_count(),
                absent = new.absent_count(),
                frequency = config.frequency().get();
                "aggregation initialized"
            );

            Ok(layout.insert(new))
        }
    }
}
