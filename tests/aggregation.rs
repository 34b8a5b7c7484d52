use std::{cell::RefCell, rc::Rc};

use gradient_aggregation::{
    AggregationConfig, AggregationController, AggregationErr, ErrKind, GradSlot, Gradient,
    IndexedSlices, ReduceErr, StepCounter, StepCounters, StepMode, Tensor,
    optimization::{Adam, GradientDescent, Optimizer},
};
use ndarray::{arr1, arr2};

type ReduceResult = Result<Vec<Tensor>, ReduceErr>;
type Calls = Rc<RefCell<Vec<Vec<Tensor>>>>;

fn dense(values: &[f32]) -> GradSlot {
    Some(Gradient::Dense(arr1(values).into_dyn()))
}

fn identity(values: Vec<Tensor>) -> ReduceResult {
    Ok(values)
}

/// A reducer simulating `workers` identical replicas summing their contributions,
/// recording every call.
fn recording_sum(workers: f32, calls: Calls) -> impl FnMut(Vec<Tensor>) -> ReduceResult {
    move |values| {
        calls.borrow_mut().push(values.clone());
        Ok(values.into_iter().map(|t| t * workers).collect())
    }
}

#[test]
fn averaged_reduction_across_two_workers() {
    let calls = Calls::default();
    let config = AggregationConfig::new(3).unwrap().with_average(true);
    let reducer = recording_sum(2., Rc::clone(&calls));
    let mut controller = AggregationController::new(config, reducer);

    let out = controller.compute(vec![dense(&[1., 2.])]).unwrap();
    assert_eq!(out, vec![dense(&[1., 2.])]);
    assert_eq!(controller.counter(), 1);

    let out = controller.compute(vec![dense(&[1., 2.])]).unwrap();
    assert_eq!(out, vec![dense(&[1., 2.])]);
    assert_eq!(controller.counter(), 2);
    assert!(calls.borrow().is_empty());

    let out = controller.compute(vec![dense(&[1., 2.])]).unwrap();
    assert_eq!(out, vec![dense(&[2., 4.])]);
    assert_eq!(controller.counter(), 0);
    assert_eq!(*calls.borrow(), vec![vec![arr1(&[3., 6.]).into_dyn()]]);
}

#[test]
fn reductions_fire_every_frequency_steps() {
    const FREQUENCY: usize = 4;
    const CYCLES: usize = 3;

    let calls = Calls::default();
    let config = AggregationConfig::new(FREQUENCY).unwrap();
    let reducer = recording_sum(1., Rc::clone(&calls));
    let mut controller = AggregationController::new(config, reducer);

    let mut reduced_at = Vec::new();

    for step in 1..=FREQUENCY * CYCLES {
        let grad = step as f32;
        let out = controller.compute(vec![dense(&[grad])]).unwrap();

        if out != vec![dense(&[grad])] {
            reduced_at.push(step);
        }

        assert_eq!(controller.counter(), step % FREQUENCY);
    }

    assert_eq!(reduced_at, [4, 8, 12]);
    assert_eq!(controller.reductions(), CYCLES as u64);

    // each cycle reduces the sum of its own gradients only
    let sums: Vec<Tensor> = calls.borrow().iter().map(|c| c[0].clone()).collect();
    assert_eq!(
        sums,
        vec![
            arr1(&[1. + 2. + 3. + 4.]).into_dyn(),
            arr1(&[5. + 6. + 7. + 8.]).into_dyn(),
            arr1(&[9. + 10. + 11. + 12.]).into_dyn(),
        ]
    );
}

#[test]
fn unaveraged_reduction_returns_sums() {
    let config = AggregationConfig::new(2).unwrap();
    let mut controller = AggregationController::new(config, identity);

    controller.compute(vec![dense(&[1., 1.])]).unwrap();
    let out = controller.compute(vec![dense(&[2., 3.])]).unwrap();
    assert_eq!(out, vec![dense(&[3., 4.])]);
}

#[test]
fn absent_gradients_stay_absent() {
    let config = AggregationConfig::new(2).unwrap().with_average(true);
    let reducer = |values: Vec<Tensor>| -> ReduceResult {
        assert_eq!(values.len(), 1);
        Ok(values)
    };
    let mut controller = AggregationController::new(config, reducer);

    for _ in 0..3 {
        let out = controller.compute(vec![None, dense(&[4.])]).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_none());
        assert!(out[1].is_some());

        assert_eq!(controller.accumulator_count(), 1);
        assert_eq!(controller.absent_count(), 1);
        assert!(controller.accumulators()[0].is_none());
    }
}

#[test]
fn failed_reduction_can_be_retried() {
    let attempts = Rc::new(RefCell::new(0));
    let failures = Rc::clone(&attempts);

    let reducer = move |values: Vec<Tensor>| -> ReduceResult {
        *failures.borrow_mut() += 1;

        if *failures.borrow() == 1 {
            return Err(ReduceErr::Communication("connection reset".into()));
        }

        Ok(values)
    };

    let config = AggregationConfig::new(2).unwrap();
    let mut controller = AggregationController::new(config, reducer);

    controller.compute(vec![dense(&[1.])]).unwrap();

    let err = controller.compute(vec![dense(&[2.])]).unwrap_err();
    assert_eq!(err.kind(), ErrKind::Reduction);
    assert!(matches!(
        err,
        AggregationErr::Reduction(ReduceErr::Communication(_))
    ));
    assert_eq!(controller.counter(), 1);
    assert_eq!(controller.accumulators()[0], Some(&arr1(&[1.]).into_dyn()));

    let out = controller.compute(vec![dense(&[2.])]).unwrap();
    assert_eq!(out, vec![dense(&[3.])]);
    assert_eq!(controller.counter(), 0);
    assert_eq!(*attempts.borrow(), 2);
}

#[test]
fn new_cycle_starts_from_clean_accumulators() {
    let config = AggregationConfig::new(2).unwrap();
    let mut controller = AggregationController::new(config, identity);

    controller.compute(vec![dense(&[1.])]).unwrap();
    controller.compute(vec![dense(&[1.])]).unwrap();
    assert_eq!(controller.accumulators()[0], Some(&arr1(&[2.]).into_dyn()));

    controller.compute(vec![dense(&[5.])]).unwrap();
    assert_eq!(controller.accumulators()[0], Some(&arr1(&[5.]).into_dyn()));
}

#[test]
fn sparse_gradients_need_densification() {
    let values = arr2(&[[1., 1.]]).into_dyn();
    let slices = IndexedSlices::new(vec![1], values, vec![2, 2]).unwrap();

    let config = AggregationConfig::new(2).unwrap();
    let mut controller = AggregationController::new(config, identity);
    let grads = vec![Some(slices.clone().into())];
    let err = controller.compute(grads).unwrap_err();

    assert!(matches!(
        err,
        AggregationErr::SparseNotAllowed { position: 0, .. }
    ));
    assert_eq!(err.kind(), ErrKind::Configuration);
    assert!(!controller.is_initialized());

    let config = AggregationConfig::new(2)
        .unwrap()
        .with_sparse_as_dense(true);
    let mut controller = AggregationController::new(config, identity);

    let grads = vec![Some(slices.clone().into())];
    let out = controller.compute(grads).unwrap();
    assert!(out[0].as_ref().is_some_and(Gradient::is_sparse));

    let out = controller.compute(vec![Some(slices.into())]).unwrap();
    let expected = arr2(&[[0., 0.], [2., 2.]]).into_dyn();
    assert_eq!(out, vec![Some(Gradient::Dense(expected))]);
}

#[test]
fn sparse_gradients_pass_with_single_step_frequency() {
    let values = arr2(&[[1.], [2.]]).into_dyn();
    let slices = IndexedSlices::new(vec![0, 0], values, vec![2, 1]).unwrap();

    let config = AggregationConfig::new(1).unwrap();
    let mut controller = AggregationController::new(config, identity);

    let out = controller.compute(vec![Some(slices.into())]).unwrap();
    let expected = arr2(&[[3.], [0.]]).into_dyn();
    assert_eq!(out, vec![Some(Gradient::Dense(expected))]);
}

#[test]
fn apply_runs_once_per_cycle_and_steps_every_call() {
    const FREQUENCY: usize = 3;
    const STEPS: usize = 9;

    let global_step = StepCounter::new();
    let mut optimizer = GradientDescent::new(0.1).with_global_step(global_step.clone());
    let config = AggregationConfig::new(FREQUENCY)
        .unwrap()
        .with_average(true);
    let mut controller = AggregationController::new(config, identity)
        .with_step_counters(optimizer.counters().clone());

    let mut params = vec![arr1(&[0.]).into_dyn()];
    let mut applied_at = Vec::new();

    for step in 1..=STEPS {
        let grads = controller.compute(vec![dense(&[1.])]).unwrap();
        let applied = controller
            .apply(|| optimizer.update_params(&grads, &mut params))
            .unwrap();

        if applied.is_some() {
            applied_at.push(step);
        }

        assert_eq!(global_step.get(), step as u64);
    }

    assert_eq!(applied_at, [3, 6, 9]);

    let iterations = optimizer.counters().iterations().map(StepCounter::get);
    assert_eq!(iterations, Some(3));

    let p: Vec<f32> = params[0].iter().copied().collect();
    assert!((p[0] + 0.3).abs() < 1e-6);
}

#[test]
fn iteration_mode_advances_the_optimizer_counter() {
    let mut optimizer = Adam::new(0.01, 0.9, 0.999, 1e-7);
    let iterations = optimizer.counters().iterations().cloned().unwrap();
    let global_step = StepCounter::new();

    let config = AggregationConfig::new(2)
        .unwrap()
        .with_step_mode(StepMode::Iterations);
    let counters = StepCounters::new()
        .with_global_step(global_step.clone())
        .with_iterations(iterations.clone());
    let mut controller = AggregationController::new(config, identity).with_step_counters(counters);

    let mut params = vec![arr1(&[1.]).into_dyn()];

    for step in 1..=4u64 {
        let grads = controller.compute(vec![dense(&[0.5])]).unwrap();
        controller
            .apply(|| optimizer.update_params(&grads, &mut params))
            .unwrap();

        assert_eq!(iterations.get(), step);
    }

    assert_eq!(global_step.get(), 0);
}

#[test]
fn skipped_update_errors_never_surface() {
    let config = AggregationConfig::new(2).unwrap();
    let mut controller = AggregationController::new(config, identity);

    controller.compute(vec![dense(&[1.])]).unwrap();
    let out: Result<Option<()>, &str> = controller.apply(|| Err("should not run"));
    assert_eq!(out, Ok(None));

    controller.compute(vec![dense(&[1.])]).unwrap();
    let out: Result<Option<()>, &str> = controller.apply(|| Err("ran"));
    assert_eq!(out, Err("ran"));
}
