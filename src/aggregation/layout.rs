use ndarray::IxDyn;
use rayon::prelude::*;

use crate::{
    config::AggregationConfig,
    error::{AggregationErr, Result},
    gradient::{GradSlot, Gradient, Tensor},
};

/// A parameter position, either backed by an accumulator or permanently absent.
#[derive(Debug)]
enum Slot {
    Present(Tensor),
    Absent,
}

/// The accumulators of every parameter, laid out in parameter order.
///
/// The layout is fixed by the first gradient batch: absent positions never get
/// storage and the present ones keep their shapes for the layout's lifetime.
#[derive(Debug)]
pub struct SlotLayout {
    slots: Vec<Slot>,
    present: usize,
}

impl SlotLayout {
    /// Creates a new layout with zeroed accumulators.
    ///
    /// # Arguments
    /// * `grads` - The first observed gradient batch.
    /// * `config` - The aggregation configuration.
    ///
    /// # Returns
    /// A new `SlotLayout` or `SparseNotAllowed` if the configuration can't accumulate
    /// one of the given sparse gradients.
    pub fn from_grads(grads: &[GradSlot], config: &AggregationConfig) -> Result<Self> {
        let mut slots = Vec::with_capacity(grads.len());
        let mut present = 0;

        for (position, grad) in grads.iter().enumerate() {
            let slot = match grad {
                Some(grad) => {
                    check_sparse(position, grad, config)?;
                    present += 1;
                    Slot::Present(Tensor::zeros(IxDyn(grad.shape())))
                }
                None => Slot::Absent,
            };

            slots.push(slot);
        }

        Ok(Self { slots, present })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn accumulator_count(&self) -> usize {
        self.present
    }

    pub fn absent_count(&self) -> usize {
        self.slots.len() - self.present
    }

    /// Returns every accumulator in parameter order, `None` for absent positions.
    pub fn accumulators(&self) -> Vec<Option<&Tensor>> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Present(acc) => Some(acc),
                Slot::Absent => None,
            })
            .collect()
    }

    /// Checks that `grads` follows the pattern this layout was built from.
    ///
    /// # Arguments
    /// * `grads` - A gradient batch.
    /// * `config` - The aggregation configuration.
    ///
    /// # Returns
    /// The first mismatch found, if any.
    pub fn validate(&self, grads: &[GradSlot], config: &AggregationConfig) -> Result<()> {
        if grads.len() != self.slots.len() {
            return Err(AggregationErr::LengthMismatch {
                what: "gradients",
                got: grads.len(),
                expected: self.slots.len(),
            });
        }

        for (position, (slot, grad)) in self.slots.iter().zip(grads).enumerate() {
            match (slot, grad) {
                (Slot::Present(acc), Some(grad)) => {
                    if acc.shape() != grad.shape() {
                        return Err(AggregationErr::ShapeMismatch {
                            position,
                            got: grad.shape().to_vec(),
                            expected: acc.shape().to_vec(),
                        });
                    }

                    check_sparse(position, grad, config)?;
                }
                (Slot::Absent, None) => {}
                (Slot::Absent, Some(_)) => {
                    return Err(AggregationErr::AbsenceMismatch {
                        position,
                        expected_absent: true,
                    });
                }
                (Slot::Present(_), None) => {
                    return Err(AggregationErr::AbsenceMismatch {
                        position,
                        expected_absent: false,
                    });
                }
            }
        }

        Ok(())
    }

    /// Resets every accumulator to zero.
    pub fn clear(&mut self) {
        self.slots.par_iter_mut().for_each(|slot| {
            if let Slot::Present(acc) = slot {
                acc.fill(0.);
            }
        });
    }

    /// Adds `grads` into the accumulators, `grads` must have been validated.
    pub fn accumulate(&mut self, grads: &[GradSlot]) {
        self.slots
            .par_iter_mut()
            .zip(grads.par_iter())
            .for_each(|(slot, grad)| {
                if let (Slot::Present(acc), Some(grad)) = (slot, grad) {
                    grad.add_to(acc);
                }
            });
    }

    /// Computes what the accumulators would hold after accumulating `grads`,
    /// without modifying them.
    ///
    /// # Arguments
    /// * `grads` - A validated gradient batch.
    /// * `fresh` - Whether the accumulators are due to be cleared first.
    ///
    /// # Returns
    /// One tensor per accumulator, in parameter order.
    pub fn snapshot(&self, grads: &[GradSlot], fresh: bool) -> Vec<Tensor> {
        self.slots
            .par_iter()
            .zip(grads.par_iter())
            .filter_map(|(slot, grad)| match (slot, grad) {
                (Slot::Present(acc), Some(grad)) => {
                    let mut value = if fresh {
                        Tensor::zeros(acc.raw_dim())
                    } else {
                        acc.clone()
                    };

                    grad.add_to(&mut value);
                    Some(value)
                }
                _ => None,
            })
            .collect()
    }

    /// Checks that a reducer's output lines up with the accumulators.
    pub fn check_reduced(&self, reduced: &[Tensor]) -> Result<()> {
        if reduced.len() != self.present {
            return Err(AggregationErr::ReducedLengthMismatch {
                got: reduced.len(),
                expected: self.present,
            });
        }

        let accs = self.slots.iter().filter_map(|slot| match slot {
            Slot::Present(acc) => Some(acc),
            Slot::Absent => None,
        });

        for (position, (acc, tensor)) in accs.zip(reduced).enumerate() {
            if acc.shape() != tensor.shape() {
                return Err(AggregationErr::ReducedShapeMismatch {
                    position,
                    got: tensor.shape().to_vec(),
                    expected: acc.shape().to_vec(),
                });
            }
        }

        Ok(())
    }

    /// Places reduced tensors back at their parameter positions.
    ///
    /// # Arguments
    /// * `reduced` - A checked reducer output, one tensor per accumulator.
    /// * `divisor` - An optional value to divide every tensor by.
    ///
    /// # Returns
    /// A gradient batch with the same length and absent positions as the layout.
    pub fn scatter(&self, reduced: Vec<Tensor>, divisor: Option<f32>) -> Vec<GradSlot> {
        let mut reduced = reduced.into_iter();

        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Present(_) => reduced.next().map(|mut tensor| {
                    if let Some(divisor) = divisor {
                        tensor.mapv_inplace(|v| v / divisor);
                    }

                    Gradient::Dense(tensor)
                }),
                Slot::Absent => None,
            })
            .collect()
    }
}

fn check_sparse(position: usize, grad: &Gradient, config: &AggregationConfig) -> Result<()> {
    if grad.is_sparse() && !config.allows_sparse() {
        return Err(AggregationErr::SparseNotAllowed {
            position,
            frequency: config.frequency().get(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;

    fn dense(values: &[f32]) -> GradSlot {
        Some(Gradient::Dense(arr1(values).into_dyn()))
    }

    fn config() -> AggregationConfig {
        AggregationConfig::new(2).unwrap()
    }

    /// Returns where an absence mismatch happened and which side expected absence.
    fn absence(result: Result<()>) -> Option<(usize, bool)> {
        match result {
            Err(AggregationErr::AbsenceMismatch {
                position,
                expected_absent,
            }) => Some((position, expected_absent)),
            _ => None,
        }
    }

    #[test]
    fn absent_positions_get_no_storage() {
        let grads = [dense(&[1.]), None, dense(&[1., 2.])];
        let layout = SlotLayout::from_grads(&grads, &config()).unwrap();

        assert_eq!(layout.len(), 3);
        assert_eq!(layout.accumulator_count(), 2);
        assert_eq!(layout.absent_count(), 1);
        assert!(layout.accumulators()[1].is_none());
    }

    #[test]
    fn validation_catches_pattern_changes() {
        let layout = SlotLayout::from_grads(&[dense(&[1.]), None], &config()).unwrap();

        assert!(layout.validate(&[dense(&[3.]), None], &config()).is_ok());
        assert!(matches!(
            layout.validate(&[dense(&[3.])], &config()),
            Err(AggregationErr::LengthMismatch { got: 1, .. })
        ));

        let both = layout.validate(&[dense(&[3.]), dense(&[3.])], &config());
        assert_eq!(absence(both), Some((1, true)));

        let none = layout.validate(&[None, None], &config());
        assert_eq!(absence(none), Some((0, false)));

        assert!(matches!(
            layout.validate(&[dense(&[3., 4.]), None], &config()),
            Err(AggregationErr::ShapeMismatch { position: 0, .. })
        ));
    }

    #[test]
    fn snapshot_leaves_accumulators_untouched() {
        let mut layout = SlotLayout::from_grads(&[dense(&[1., 2.]), None], &config()).unwrap();
        layout.accumulate(&[dense(&[1., 2.]), None]);

        let snapshot = layout.snapshot(&[dense(&[1., 1.]), None], false);
        assert_eq!(snapshot, vec![arr1(&[2., 3.]).into_dyn()]);

        let snapshot = layout.snapshot(&[dense(&[1., 1.]), None], true);
        assert_eq!(snapshot, vec![arr1(&[1., 1.]).into_dyn()]);

        assert_eq!(layout.accumulators()[0], Some(&arr1(&[1., 2.]).into_dyn()));
    }

    #[test]
    fn scatter_reinserts_absents_and_divides() {
        let layout = SlotLayout::from_grads(&[None, dense(&[0., 0.]), None], &config()).unwrap();
        let reduced = vec![arr1(&[4., 8.]).into_dyn()];

        layout.check_reduced(&reduced).unwrap();
        let out = layout.scatter(reduced, Some(2.));
        assert_eq!(out, vec![None, dense(&[2., 4.]), None]);
    }

    #[test]
    fn reduced_output_is_checked() {
        let layout = SlotLayout::from_grads(&[dense(&[0., 0.])], &config()).unwrap();

        assert!(matches!(
            layout.check_reduced(&[]),
            Err(AggregationErr::ReducedLengthMismatch { got: 0, .. })
        ));
        assert!(matches!(
            layout.check_reduced(&[arr1(&[0.]).into_dyn()]),
            Err(AggregationErr::ReducedShapeMismatch { position: 0, .. })
        ));
    }
}
