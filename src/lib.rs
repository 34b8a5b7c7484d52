//! Local gradient aggregation for data-parallel training.
//!
//! Gradients are accumulated on every replica for a fixed amount of steps and only
//! then reduced across replicas, trading update frequency for communication.

pub mod aggregation;
pub mod config;
pub mod error;
pub mod gradient;
pub mod optimization;
pub mod reduction;
pub mod steps;

pub use aggregation::AggregationController;
pub use config::{AggregationConfig, AggregationSpec};
pub use error::{AggregationErr, ErrKind, Result};
pub use gradient::{GradSlot, Gradient, IndexedSlices, Tensor};
pub use reduction::{LocalGroup, LocalMember, ReduceErr, ReduceOp, Reducer};
pub use steps::{StepCounter, StepCounters, StepMode};
