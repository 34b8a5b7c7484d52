use std::{
    mem,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{trace, warn};
use parking_lot::{Condvar, Mutex};

use super::{ReduceErr, ReduceOp, Reducer, Result};
use crate::gradient::Tensor;

/// An in-process collective between a fixed amount of participants.
///
/// Every participant gets a `LocalMember`, usually moved into its own thread. A round
/// completes once all of them have called `reduce`, the last one to arrive combines the
/// contributions and wakes up the rest.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    size: NonZeroUsize,
    op: ReduceOp,
    timeout: Option<Duration>,
}

impl LocalGroup {
    /// Creates a new `LocalGroup`.
    ///
    /// # Arguments
    /// * `size` - The amount of participants.
    /// * `op` - How contributions are combined.
    ///
    /// # Returns
    /// A new `LocalGroup` instance.
    pub fn new(size: NonZeroUsize, op: ReduceOp) -> Self {
        Self {
            size,
            op,
            timeout: None,
        }
    }

    /// Bounds how long a participant waits for the rest on every round.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Splits the group into its members, ordered by rank.
    pub fn split(self) -> Vec<LocalMember> {
        let shared = Arc::new(Shared {
            size: self.size.get(),
            op: self.op,
            timeout: self.timeout,
            round: Mutex::new(Round::default()),
            cvar: Condvar::new(),
        });

        (0..self.size.get())
            .map(|rank| LocalMember {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

#[derive(Debug)]
struct Shared {
    size: usize,
    op: ReduceOp,
    timeout: Option<Duration>,
    round: Mutex<Round>,
    cvar: Condvar,
}

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    sums: Vec<Tensor>,
    result: Arc<Vec<Tensor>>,
    broken: Option<ReduceErr>,
}

impl Round {
    /// Adds a contribution into the pending sums.
    fn combine(&mut self, values: Vec<Tensor>) -> Result<()> {
        if self.arrived == 0 {
            self.sums = values;
            return Ok(());
        }

        if values.len() != self.sums.len() {
            return Err(ReduceErr::SizeMismatch {
                got: values.len(),
                expected: self.sums.len(),
            });
        }

        for (position, (sum, value)) in self.sums.iter().zip(&values).enumerate() {
            if sum.shape() != value.shape() {
                return Err(ReduceErr::ShapeMismatch {
                    position,
                    got: value.shape().to_vec(),
                    expected: sum.shape().to_vec(),
                });
            }
        }

        for (sum, value) in self.sums.iter_mut().zip(&values) {
            sum.zip_mut_with(value, |s, &v| *s += v);
        }

        Ok(())
    }

    fn break_with(&mut self, cause: ReduceErr) {
        if self.broken.is_none() {
            self.broken = Some(cause);
        }
    }
}

/// A single participant of a `LocalGroup`.
///
/// Dropping a member breaks the group, peers waiting on a round fail with `PeerLeft`.
#[derive(Debug)]
pub struct LocalMember {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalMember {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn group_size(&self) -> usize {
        self.shared.size
    }
}

impl Reducer for LocalMember {
    fn reduce(&mut self, values: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let shared = &*self.shared;
        let mut round = shared.round.lock();

        if round.broken.is_some() {
            return Err(ReduceErr::GroupBroken);
        }

        if let Err(e) = round.combine(values) {
            warn!(rank = self.rank; "rejected contribution: {e}");
            round.break_with(e.clone());
            shared.cvar.notify_all();
            return Err(e);
        }

        round.arrived += 1;
        let generation = round.generation;

        if round.arrived == shared.size {
            let mut sums = mem::take(&mut round.sums);

            if shared.op == ReduceOp::Average {
                let n = shared.size as f32;
                sums.iter_mut().for_each(|t| t.mapv_inplace(|v| v / n));
            }

            round.result = Arc::new(sums);
            round.arrived = 0;
            round.generation += 1;
            shared.cvar.notify_all();

            trace!(rank = self.rank, generation = generation; "reduction round complete");
            return Ok(round.result.as_ref().clone());
        }

        let deadline = shared
            .timeout
            .map(|timeout| (timeout, Instant::now() + timeout));

        while round.generation == generation {
            if let Some(cause) = &round.broken {
                return Err(cause.clone());
            }

            match deadline {
                Some((waited, deadline)) => {
                    let timed_out = shared.cvar.wait_until(&mut round, deadline).timed_out();

                    if timed_out && round.generation == generation && round.broken.is_none() {
                        let e = ReduceErr::Timeout { waited };
                        warn!(rank = self.rank; "reduction round {generation} timed out");
                        round.break_with(e.clone());
                        shared.cvar.notify_all();
                        return Err(e);
                    }
                }
                None => shared.cvar.wait(&mut round),
            }
        }

        Ok(round.result.as_ref().clone())
    }
}

impl Drop for LocalMember {
    fn drop(&mut self) {
        let mut round = self.shared.round.lock();
        round.break_with(ReduceErr::PeerLeft);
        self.shared.cvar.notify_all();
    }
}
