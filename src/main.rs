use std::{env, fs, num::NonZeroUsize, sync::Arc, time::Duration};

use anyhow::Context;
use gradient_aggregation::{
    AggregationConfig, AggregationController, AggregationSpec, GradSlot, Gradient, LocalGroup,
    LocalMember, ReduceOp, StepCounter, StepMode, Tensor,
    optimization::{GradientDescent, Optimizer},
};
use log::{debug, info, warn};
use ndarray::{IxDyn, arr0};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tokio::task;

const TRUE_WEIGHTS: [f32; 2] = [2.0, -3.0];
const TRUE_BIAS: f32 = 0.5;

/// Parameters of a simulated data-parallel training run.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct SimulationSpec {
    aggregation: AggregationSpec,
    workers: usize,
    steps: usize,
    batch_size: usize,
    learning_rate: f32,
    seed: u64,
    reduce_op: ReduceOp,
    timeout_ms: Option<u64>,
}

impl Default for SimulationSpec {
    fn default() -> Self {
        Self {
            aggregation: AggregationSpec {
                aggregation_frequency: 4,
                average_aggregated_gradients: true,
                sparse_as_dense: false,
                step_mode: StepMode::GlobalStep,
            },
            workers: 2,
            steps: 400,
            batch_size: 8,
            learning_rate: 0.1,
            seed: 42,
            reduce_op: ReduceOp::Average,
            timeout_ms: Some(5_000),
        }
    }
}

/// What a replica ends up with after training.
#[derive(Debug)]
struct ReplicaReport {
    rank: usize,
    params: Vec<Vec<f32>>,
    global_step: u64,
    updates: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let spec = match env::args().nth(1) {
        Some(path) => {
            let json = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&json).with_context(|| format!("parsing {path}"))?
        }
        None => SimulationSpec::default(),
    };

    let workers = NonZeroUsize::new(spec.workers).context("at least one worker is required")?;
    let mut group = LocalGroup::new(workers, spec.reduce_op);

    if let Some(ms) = spec.timeout_ms {
        group = group.with_timeout(Duration::from_millis(ms));
    }

    info!("starting simulation: {spec:?}");
    let spec = Arc::new(spec);

    let tasks = group.split().into_iter().map(|member| {
        let spec = Arc::clone(&spec);
        task::spawn_blocking(move || run_replica(&spec, member))
    });

    let mut reports = Vec::with_capacity(workers.get());
    for report in futures::future::try_join_all(tasks).await? {
        reports.push(report?);
    }

    for report in &reports {
        info!(
            rank = report.rank,
            global_step = report.global_step,
            updates = report.updates;
            "final parameters: {:?}",
            report.params
        );
    }

    let diverged = reports.windows(2).any(|w| w[0].params != w[1].params);
    if diverged {
        warn!("replicas diverged");
    }

    Ok(())
}

/// Trains a linear model on this replica's own synthetic data.
fn run_replica(spec: &SimulationSpec, member: LocalMember) -> anyhow::Result<ReplicaReport> {
    let rank = member.rank();
    let config = AggregationConfig::try_from(spec.aggregation.clone())?;

    let global_step = StepCounter::new();
    let mut optimizer =
        GradientDescent::new(spec.learning_rate).with_global_step(global_step.clone());

    let mut controller = AggregationController::new(config, member)
        .with_rank(rank)
        .with_step_counters(optimizer.counters().clone());

    // weights, bias and a parameter that never receives a gradient
    let mut params = vec![
        Tensor::zeros(IxDyn(&[2])),
        Tensor::zeros(IxDyn(&[])),
        Tensor::zeros(IxDyn(&[2])),
    ];
    let mut rng = StdRng::seed_from_u64(spec.seed + rank as u64);

    for step in 0..spec.steps {
        let grads = gradients(&params, &mut rng, spec.batch_size);
        let grads = controller.compute(grads)?;

        let applied = controller.apply(|| optimizer.update_params(&grads, &mut params))?;
        if applied.is_some() {
            debug!(rank = rank, step = step; "parameters updated");
        }
    }

    let updates = optimizer
        .counters()
        .iterations()
        .map_or(0, StepCounter::get);

    Ok(ReplicaReport {
        rank,
        params: params.iter().map(|p| p.iter().copied().collect()).collect(),
        global_step: global_step.get(),
        updates,
    })
}

/// Computes the mean squared error gradients on a fresh batch.
fn gradients(params: &[Tensor], rng: &mut StdRng, batch_size: usize) -> Vec<GradSlot> {
    let n = batch_size.max(1) as f32;
    let bias = params[1].sum();

    let mut grad_w = Tensor::zeros(IxDyn(&[2]));
    let mut grad_b = 0.;

    for _ in 0..batch_size {
        let x: [f32; 2] = [rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0)];
        let noise: f32 = rng.random_range(-0.05..0.05);
        let y = dot(TRUE_WEIGHTS.iter(), &x) + TRUE_BIAS + noise;

        let pred = dot(params[0].iter(), &x) + bias;
        let err = pred - y;

        grad_w
            .iter_mut()
            .zip(&x)
            .for_each(|(g, x)| *g += 2. * err * x / n);
        grad_b += 2. * err / n;
    }

    vec![
        Some(Gradient::Dense(grad_w)),
        Some(Gradient::Dense(arr0(grad_b).into_dyn())),
        None,
    ]
}

fn dot<'a>(weights: impl Iterator<Item = &'a f32>, x: &[f32]) -> f32 {
    weights.zip(x).map(|(w, x)| w * x).sum()
}
