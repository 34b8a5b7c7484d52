use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::{
    error::{AggregationErr, Result},
    steps::StepMode,
};

/// Immutable behaviour of an `AggregationController`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationConfig {
    frequency: NonZeroUsize,
    average: bool,
    sparse_as_dense: bool,
    step_mode: StepMode,
}

impl AggregationConfig {
    /// Creates a new aggregation configuration.
    ///
    /// # Arguments
    /// * `frequency` - The amount of local steps between reductions.
    ///
    /// # Returns
    /// A new `AggregationConfig`, or `ZeroFrequency` if `frequency` is zero.
    pub fn new(frequency: usize) -> Result<Self> {
        let frequency = NonZeroUsize::new(frequency).ok_or(AggregationErr::ZeroFrequency)?;

        Ok(Self {
            frequency,
            average: false,
            sparse_as_dense: false,
            step_mode: StepMode::default(),
        })
    }

    /// Whether the reduced sums get divided by the aggregation frequency.
    pub fn with_average(mut self, average: bool) -> Self {
        self.average = average;
        self
    }

    /// Whether sparse gradients get converted into dense ones instead of being rejected.
    pub fn with_sparse_as_dense(mut self, sparse_as_dense: bool) -> Self {
        self.sparse_as_dense = sparse_as_dense;
        self
    }

    pub fn with_step_mode(mut self, step_mode: StepMode) -> Self {
        self.step_mode = step_mode;
        self
    }

    pub fn frequency(&self) -> NonZeroUsize {
        self.frequency
    }

    pub fn average(&self) -> bool {
        self.average
    }

    pub fn sparse_as_dense(&self) -> bool {
        self.sparse_as_dense
    }

    pub fn step_mode(&self) -> StepMode {
        self.step_mode
    }

    /// Whether a sparse gradient can be accumulated under this configuration.
    pub(crate) fn allows_sparse(&self) -> bool {
        self.sparse_as_dense || self.frequency.get() == 1
    }
}

/// The serializable specification of an `AggregationConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub aggregation_frequency: usize,
    #[serde(default)]
    pub average_aggregated_gradients: bool,
    #[serde(default)]
    pub sparse_as_dense: bool,
    #[serde(default)]
    pub step_mode: StepMode,
}

impl AggregationSpec {
    /// Parses a spec from its JSON form.
    ///
    /// # Arguments
    /// * `json` - The JSON document.
    ///
    /// # Returns
    /// The parsed spec or `MalformedSpec`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl TryFrom<AggregationSpec> for AggregationConfig {
    type Error = AggregationErr;

    fn try_from(spec: AggregationSpec) -> Result<Self> {
        let config = AggregationConfig::new(spec.aggregation_frequency)?
            .with_average(spec.average_aggregated_gradients)
            .with_sparse_as_dense(spec.sparse_as_dense)
            .with_step_mode(spec.step_mode);

        Ok(config)
    }
}
