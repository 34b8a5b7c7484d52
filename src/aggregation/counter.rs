use std::num::NonZeroUsize;

/// Counts local steps since the last reduction.
///
/// The value lives in `0..=frequency`, it only reaches `frequency` transiently
/// within the step that triggers a reduction.
#[derive(Debug, Clone)]
pub struct AggregationCounter {
    value: usize,
    frequency: NonZeroUsize,
}

impl AggregationCounter {
    pub fn new(frequency: NonZeroUsize) -> Self {
        Self {
            value: 0,
            frequency,
        }
    }

    #[inline]
    pub fn value(&self) -> usize {
        self.value
    }

    /// Returns true if no step has been accumulated in the current cycle.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    /// Returns true if the current cycle is complete.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.value == self.frequency.get()
    }

    /// Returns true if the next step ends the current cycle.
    #[inline]
    pub fn next_fills(&self) -> bool {
        self.value + 1 == self.frequency.get()
    }

    #[inline]
    pub fn advance(&mut self) {
        debug_assert!(self.value < self.frequency.get());
        self.value += 1;
    }

    #[inline]
    pub fn reset(&mut self) {
        self.value = 0;
    }
}
