use mlmc_alloc::config::{
    AllocationTarget, ConvergenceTolTarget, CovApproximation, MlmcConfig, PilotMgmtMode,
    QoiAggregation,
};
use mlmc_alloc::sde::{SdeModel, SdeParams};
use mlmc_alloc::{EvaluationMode, Evaluator, LevelResponse, MlmcController, MlmcError, Result, SamplePoint};

/// Delegates to another evaluator and counts evaluations per level.
struct Counting<E> {
    inner: E,
    evaluations: Vec<usize>,
}

impl<E: Evaluator> Counting<E> {
    fn new(inner: E) -> Self {
        let levels = inner.num_levels();
        Self { inner, evaluations: vec![0; levels] }
    }
}

impl<E: Evaluator> Evaluator for Counting<E> {
    fn num_levels(&self) -> usize {
        self.inner.num_levels()
    }

    fn num_functions(&self) -> usize {
        self.inner.num_functions()
    }

    fn evaluate_batch(
        &mut self,
        level: usize,
        mode: EvaluationMode,
        points: &[SamplePoint],
    ) -> Result<Vec<LevelResponse>> {
        self.evaluations[level] += points.len();
        self.inner.evaluate_batch(level, mode, points)
    }

    fn cost_per_level(&self) -> Option<Vec<f64>> {
        self.inner.cost_per_level()
    }
}

/// Level `l` discrepancies alternate `+a_l, -a_l` in evaluation order.
struct Alternating {
    amplitudes: Vec<f64>,
    costs: Vec<f64>,
    counters: Vec<usize>,
}

impl Alternating {
    fn new(amplitudes: Vec<f64>, costs: Vec<f64>) -> Self {
        let counters = vec![0; amplitudes.len()];
        Self { amplitudes, costs, counters }
    }
}

impl Evaluator for Alternating {
    fn num_levels(&self) -> usize {
        self.amplitudes.len()
    }

    fn num_functions(&self) -> usize {
        1
    }

    fn evaluate_batch(
        &mut self,
        level: usize,
        mode: EvaluationMode,
        points: &[SamplePoint],
    ) -> Result<Vec<LevelResponse>> {
        let a = self.amplitudes[level];
        Ok(points
            .iter()
            .map(|_| {
                let sign = if self.counters[level] % 2 == 0 { 1.0 } else { -1.0 };
                self.counters[level] += 1;
                match mode {
                    EvaluationMode::Fine => LevelResponse::fine(vec![sign * a]),
                    EvaluationMode::FineCoarse => {
                        LevelResponse::paired(vec![2.0 + sign * a], vec![2.0])
                    }
                }
            })
            .collect())
    }

    fn cost_per_level(&self) -> Option<Vec<f64>> {
        Some(self.costs.clone())
    }
}

/// SDE model whose second QoI fails on every fifth evaluation.
struct Flaky {
    inner: SdeModel,
    calls: usize,
}

impl Evaluator for Flaky {
    fn num_levels(&self) -> usize {
        self.inner.num_levels()
    }

    fn num_functions(&self) -> usize {
        self.inner.num_functions()
    }

    fn evaluate_batch(
        &mut self,
        level: usize,
        mode: EvaluationMode,
        points: &[SamplePoint],
    ) -> Result<Vec<LevelResponse>> {
        let mut responses = self.inner.evaluate_batch(level, mode, points)?;
        for response in responses.iter_mut() {
            if self.calls % 5 == 0 {
                response.fine[1] = f64::NAN;
            }
            self.calls += 1;
        }
        Ok(responses)
    }

    fn cost_per_level(&self) -> Option<Vec<f64>> {
        self.inner.cost_per_level()
    }
}

fn sde(levels: usize) -> SdeModel {
    SdeModel::new(SdeParams::default(), levels)
}

#[test]
fn test_full_pipeline() {
    let config = MlmcConfig { pilot_samples: vec![50], ..MlmcConfig::default() };
    let mut controller = MlmcController::new(config, sde(4)).unwrap();
    let results = controller.run().unwrap();

    assert!(results.iterations.len() <= 26);
    assert_eq!(results.actual_counts.len(), 4);
    for summary in &results.qoi {
        assert!(summary.moments.iter().all(|m| m.is_finite()));
        assert!(summary.std_error_mean > 0.0);
        assert!(summary.rates.is_some());
    }
    // The mean is close to x0 * exp(-t) for p = 1.
    assert!((results.qoi[0].moments[0] - 1.2 * (-0.1f64).exp()).abs() < 0.1);
    for (l, &n) in results.allocated_counts.iter().enumerate() {
        assert!(n >= 50);
        assert_eq!(results.actual_counts[l], vec![n, n]);
    }
    let json = results.to_json().unwrap();
    assert!(json.contains("\"moment_kind\": \"STANDARD\""));
}

#[test]
fn test_online_projection_does_not_evaluate() {
    let config = MlmcConfig {
        pilot_samples: vec![20],
        pilot_mgmt_mode: PilotMgmtMode::OnlinePilotProjection,
        ..MlmcConfig::default()
    };
    let mut controller = MlmcController::new(config, Counting::new(sde(3))).unwrap();
    let results = controller.run().unwrap();

    assert_eq!(controller.evaluator().evaluations, vec![20, 20, 20]);
    assert_eq!(controller.accumulators().counts(), vec![vec![20, 20]; 3]);
    assert_eq!(results.allocated_counts, vec![20, 20, 20]);

    let projection = results.projection.as_ref().unwrap();
    let deltas = &results.iterations[0].deltas;
    assert!(deltas.iter().any(|&d| d > 0));
    for (l, &n) in projection.samples.iter().enumerate() {
        assert_eq!(n, 20 + deltas[l]);
    }
    let pilot_variance = &results.iterations[0].estimator_variance;
    for (projected, pilot) in projection.estimator_variance.iter().zip(pilot_variance) {
        assert!(projected < pilot);
    }
}

#[test]
fn test_monotone_convergence() {
    let config = MlmcConfig {
        pilot_samples: vec![10],
        convergence_tol: 0.01,
        max_iterations: 10,
        ..MlmcConfig::default()
    };
    let evaluator = Alternating::new(vec![1.0, 0.5, 0.25], vec![1.0, 4.0, 16.0]);
    let mut controller = MlmcController::new(config, evaluator).unwrap();
    let results = controller.run().unwrap();

    assert!(results.converged);
    assert!(results.iterations.len() <= 11);
    let variances: Vec<f64> = results.iterations.iter().map(|r| r.estimator_variance[0]).collect();
    for pair in variances.windows(2) {
        assert!(pair[1] <= pair[0], "estimator variance increased: {variances:?}");
    }
    // The loop stops once the target variance is met.
    let target = 0.01 * variances[0];
    assert!(*results.estimator_variance.first().unwrap() <= target * 1.0001);
}

#[test]
fn test_offline_pilot_discards_pilot_samples() {
    let config = MlmcConfig {
        pilot_samples: vec![30],
        pilot_mgmt_mode: PilotMgmtMode::OfflinePilot,
        ..MlmcConfig::default()
    };
    let mut controller = MlmcController::new(config, Counting::new(sde(3))).unwrap();
    let results = controller.run().unwrap();

    let evaluations = &controller.evaluator().evaluations;
    for l in 0..3 {
        let fresh = results.allocated_counts[l];
        assert!(fresh >= 2);
        assert_eq!(evaluations[l], 30 + fresh);
        assert_eq!(results.actual_counts[l], vec![fresh, fresh]);
    }
    let costs = [1.0, 2.0, 4.0];
    let spent: f64 = results.allocated_counts.iter().zip(costs).map(|(&n, c)| n as f64 * c).sum();
    assert_eq!(results.equivalent_cost, spent);
}

#[test]
fn test_offline_projection() {
    let config = MlmcConfig {
        pilot_samples: vec![30],
        pilot_mgmt_mode: PilotMgmtMode::OfflinePilotProjection,
        ..MlmcConfig::default()
    };
    let mut controller = MlmcController::new(config, Counting::new(sde(3))).unwrap();
    let results = controller.run().unwrap();

    assert_eq!(controller.evaluator().evaluations, vec![30, 30, 30]);
    assert_eq!(results.allocated_counts, vec![0, 0, 0]);
    assert_eq!(results.equivalent_cost, 0.0);
    let projection = results.projection.unwrap();
    assert!(projection.cost > 0.0);
    assert!(projection.samples.iter().all(|&n| n >= 2));
}

#[test]
fn test_failed_components_are_dropped() {
    let config = MlmcConfig { pilot_samples: vec![40], ..MlmcConfig::default() };
    let evaluator = Flaky { inner: sde(3), calls: 0 };
    let mut controller = MlmcController::new(config, evaluator).unwrap();
    let results = controller.run().unwrap();

    for (l, counts) in results.actual_counts.iter().enumerate() {
        assert_eq!(counts[0], results.allocated_counts[l]);
        assert!(counts[1] < counts[0]);
    }
    assert!(results.qoi[1].moments.iter().all(|m| m.is_finite()));
}

#[test]
fn test_variance_and_sigma_targets() {
    for target in [AllocationTarget::Variance, AllocationTarget::Sigma] {
        let config = MlmcConfig {
            allocation_target: target,
            pilot_samples: vec![40],
            convergence_tol: 0.1,
            ..MlmcConfig::default()
        };
        let mut controller = MlmcController::new(config, sde(3)).unwrap();
        let results = controller.run().unwrap();
        assert!(results.allocated_counts.iter().all(|&n| n >= 40));
        assert!(results.estimator_variance.iter().all(|v| v.is_finite() && *v >= 0.0));
        // Growth per iteration is capped at three times the allocation.
        for record in &results.iterations {
            for (d, n) in record.deltas.iter().zip(&record.allocated) {
                assert!(*d <= 3 * n);
            }
        }
    }
}

#[test]
fn test_scalarization_target_with_bootstrap() {
    let config = MlmcConfig {
        allocation_target: AllocationTarget::Scalarization,
        cov_approximation: CovApproximation::Bootstrap,
        scalarization: Some(vec![vec![1.0, 2.0, 0.0, 0.0], vec![0.0, 0.0, 1.0, 1.0]]),
        pilot_samples: vec![30],
        convergence_tol: 0.2,
        qoi_aggregation: QoiAggregation::Max,
        ..MlmcConfig::default()
    };
    let mut controller = MlmcController::new(config, sde(3)).unwrap();
    let results = controller.run().unwrap();
    for summary in &results.qoi {
        assert!(summary.scalarized_value.unwrap().is_finite());
        assert!(summary.scalarized_std_error.unwrap() >= 0.0);
    }
}

#[test]
fn test_cost_constrained_run_spends_budget() {
    let budget = 3000.0;
    let config = MlmcConfig {
        convergence_tol_target: ConvergenceTolTarget::CostConstraint,
        budget: Some(budget),
        pilot_samples: vec![20],
        ..MlmcConfig::default()
    };
    let mut controller = MlmcController::new(config, sde(3)).unwrap();
    let results = controller.run().unwrap();
    assert!(results.equivalent_cost > 0.5 * budget);
    assert!(results.equivalent_cost < 1.5 * budget);
}

#[test]
fn test_configuration_errors() {
    let empty = MlmcConfig { pilot_samples: vec![0, 0, 0], ..MlmcConfig::default() };
    assert!(matches!(MlmcController::new(empty, sde(3)), Err(MlmcError::EmptyPilot)));

    let wrong_shape = MlmcConfig {
        allocation_target: AllocationTarget::Scalarization,
        scalarization: Some(vec![vec![1.0, 0.0]]),
        ..MlmcConfig::default()
    };
    assert!(matches!(
        MlmcController::new(wrong_shape, sde(3)),
        Err(MlmcError::ScalarizationShape { rows: 2, cols: 4, .. })
    ));

    let missing = MlmcConfig {
        allocation_target: AllocationTarget::Scalarization,
        ..MlmcConfig::default()
    };
    assert!(matches!(MlmcController::new(missing, sde(3)), Err(MlmcError::Config(_))));

    let max_budget = MlmcConfig {
        convergence_tol_target: ConvergenceTolTarget::CostConstraint,
        qoi_aggregation: QoiAggregation::Max,
        budget: Some(100.0),
        ..MlmcConfig::default()
    };
    assert!(matches!(MlmcController::new(max_budget, sde(3)), Err(MlmcError::Unsupported(_))));

    let pilot_length = MlmcConfig { pilot_samples: vec![10, 10], ..MlmcConfig::default() };
    assert!(matches!(MlmcController::new(pilot_length, sde(3)), Err(MlmcError::Config(_))));
}
