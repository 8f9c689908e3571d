//! The MLMC pilot/iteration controller.

use std::time::Instant;

use ndarray::Array2;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::accumulator::Accumulators;
use crate::allocation::{sample_increments, AllocationConstraint, SampleAllocator};
use crate::config::{
    AllocationTarget, ConvergenceTolTarget, CostSource, MlmcConfig,
};
use crate::error::{MlmcError, Result};
use crate::estimators::{CovarianceModel, Statistics};
use crate::evaluator::{EvaluationMode, Evaluator, SampleGenerator};
use crate::nlp::{AugmentedLagrangian, NlpSolver};
use crate::rollup::{self, MlmcResults, Projection};
use crate::scalarization::ScalarizationMap;

/// Smallest online cost per sample, in seconds.
const MIN_MEASURED_COST: f64 = 1e-9;

/// State after one allocation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Cost-counted samples per level when the allocation was computed.
    pub allocated: Vec<usize>,
    pub deltas: Vec<usize>,
    /// Estimator variance of the allocation target per QoI.
    pub estimator_variance: Vec<f64>,
    pub relaxation: f64,
}

/// Drives sampling, allocation and roll-up for one evaluator.
///
/// Accumulators are owned here; the allocation step only reads a snapshot
/// of them.
pub struct MlmcController<E: Evaluator> {
    config: MlmcConfig,
    evaluator: E,
    map: ScalarizationMap,
    cov: CovarianceModel,
    solver: Box<dyn NlpSolver>,
    generator: SampleGenerator,
    accumulators: Accumulators,
    allocated: Vec<usize>,
    costs: Vec<f64>,
    cost_measured: Vec<bool>,
    history: Vec<IterationRecord>,
    warnings: Vec<String>,
}

impl<E: Evaluator> MlmcController<E> {
    /// Validates `config` against the evaluator. Every fatal configuration
    /// error surfaces here, before any sample is drawn.
    pub fn new(config: MlmcConfig, evaluator: E) -> Result<Self> {
        let num_levels = evaluator.num_levels();
        let num_functions = evaluator.num_functions();
        config.validate(num_functions, num_levels)?;
        let map = config.scalarization_map(num_functions)?;

        let costs = match config.cost_source {
            CostSource::Offline => {
                let costs = evaluator.cost_per_level().ok_or_else(|| {
                    MlmcError::Config("offline cost source needs a-priori level costs".into())
                })?;
                if costs.len() != num_levels || costs.iter().any(|c| !(c.is_finite() && *c > 0.0)) {
                    return Err(MlmcError::Config(format!(
                        "expected {num_levels} positive level costs, got {costs:?}"
                    )));
                }
                costs
            }
            CostSource::Online => {
                if config.pilot_for(num_levels).contains(&0) {
                    return Err(MlmcError::Config(
                        "online cost estimation needs a nonzero pilot on every level".into(),
                    ));
                }
                vec![0.0; num_levels]
            }
        };

        let cov = CovarianceModel::from(config.cov_approximation);
        let solver = Box::new(AugmentedLagrangian::new(config.solver.clone()));
        let generator = SampleGenerator::new(config.seed, evaluator.input_bounds());
        let accumulators = Accumulators::new(
            num_levels,
            num_functions,
            cov == CovarianceModel::Bootstrap,
        );
        Ok(Self {
            config,
            evaluator,
            map,
            cov,
            solver,
            generator,
            accumulators,
            allocated: vec![0; num_levels],
            costs,
            cost_measured: vec![false; num_levels],
            history: Vec::new(),
            warnings: Vec::new(),
        })
    }

    /// Replaces the default allocation solver.
    pub fn with_solver(mut self, solver: Box<dyn NlpSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn accumulators(&self) -> &Accumulators {
        &self.accumulators
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn costs(&self) -> &[f64] {
        &self.costs
    }

    fn num_levels(&self) -> usize {
        self.allocated.len()
    }

    pub fn run(&mut self) -> Result<MlmcResults> {
        let pilot = self.config.pilot_for(self.num_levels());
        info!(
            mode = ?self.config.pilot_mgmt_mode,
            target = ?self.config.allocation_target,
            levels = self.num_levels(),
            qoi = self.accumulators.num_functions(),
            ?pilot,
            "starting MLMC"
        );
        let mode = self.config.pilot_mgmt_mode;
        let (converged, projection) = if mode.is_offline() {
            self.offline(&pilot, mode.is_projection())?
        } else {
            self.online(&pilot, mode.is_projection())?
        };
        Ok(self.finish(converged, projection))
    }

    /// Iterates until no level needs more samples or the iteration cap is
    /// passed. With `project`, stops after the pilot and projects instead.
    fn online(&mut self, pilot: &[usize], project: bool) -> Result<(bool, Option<Projection>)> {
        let mut deltas = pilot.to_vec();
        let mut constraint: Option<AllocationConstraint> = None;
        let mut targets: Option<Array2<f64>> = None;
        let mut iteration = 0;

        while deltas.iter().any(|&d| d > 0) && iteration <= self.config.max_iterations {
            self.evaluate_all(&deltas, true)?;
            let stats = self.snapshot();
            let constraint = constraint.get_or_insert_with(|| self.constraint(&stats));
            let initial = targets.take().unwrap_or_else(|| self.counts_guess(&self.allocated));
            let relaxation = self.config.relaxation(iteration);
            let (new_targets, new_deltas) = self.plan(&stats, constraint, &initial, relaxation)?;
            let estimator_variance = self.allocator().current_estimator_variances(&stats);
            info!(
                iteration,
                allocated = ?self.allocated,
                deltas = ?new_deltas,
                ?estimator_variance,
                "MLMC iteration"
            );
            self.history.push(IterationRecord {
                iteration,
                allocated: self.allocated.clone(),
                deltas: new_deltas.clone(),
                estimator_variance,
                relaxation,
            });
            deltas = new_deltas;
            targets = Some(new_targets);
            iteration += 1;

            if project {
                let samples = self.allocated.iter().zip(&deltas).map(|(n, d)| n + d).collect();
                let estimator_variance = self.allocator().projected_estimator_variances(&stats, &deltas);
                let projection = self.projection(samples, estimator_variance);
                return Ok((deltas.iter().all(|&d| d == 0), Some(projection)));
            }
        }

        let converged = deltas.iter().all(|&d| d == 0);
        if !converged {
            warn!(
                max_iterations = self.config.max_iterations,
                ?deltas,
                "iteration limit reached before the allocation converged"
            );
        }
        Ok((converged, None))
    }

    /// Pilot outside the cost accounting, then one fresh batch sized from it.
    fn offline(&mut self, pilot: &[usize], project: bool) -> Result<(bool, Option<Projection>)> {
        self.evaluate_all(pilot, false)?;
        let stats = self.snapshot();
        let constraint = self.constraint(&stats);
        let initial = self.counts_guess(pilot);
        let (_, deltas) = self.plan(&stats, &constraint, &initial, 1.0)?;
        let fresh: Vec<usize> = deltas.iter().map(|&d| d.max(2)).collect();
        let estimator_variance = self.allocator().current_estimator_variances(&stats);
        info!(pilot = ?pilot, fresh = ?fresh, ?estimator_variance, "offline pilot complete");
        self.history.push(IterationRecord {
            iteration: 0,
            allocated: self.allocated.clone(),
            deltas: fresh.clone(),
            estimator_variance,
            relaxation: 1.0,
        });

        if project {
            let n: Vec<f64> = fresh.iter().map(|&n| n as f64).collect();
            let estimator_variance = self.allocator().estimator_variances(&stats, &n);
            return Ok((false, Some(self.projection(fresh, estimator_variance))));
        }

        self.accumulators.reset();
        self.evaluate_all(&fresh, true)?;
        Ok((true, None))
    }

    fn evaluate_all(&mut self, counts: &[usize], counted: bool) -> Result<()> {
        for (level, &n) in counts.iter().enumerate() {
            if n > 0 {
                self.evaluate_level(level, n, counted)?;
            }
        }
        Ok(())
    }

    fn evaluate_level(&mut self, level: usize, n: usize, counted: bool) -> Result<()> {
        let points = self.generator.draw(n);
        let start = Instant::now();
        let responses = self
            .evaluator
            .evaluate_batch(level, EvaluationMode::for_level(level), &points)?;
        let elapsed = start.elapsed().as_secs_f64();
        if responses.len() != n {
            return Err(MlmcError::Evaluation {
                level,
                reason: format!("expected {n} responses, got {}", responses.len()),
            });
        }
        if self.config.cost_source == CostSource::Online && !self.cost_measured[level] {
            self.costs[level] = (elapsed / n as f64).max(MIN_MEASURED_COST);
            self.cost_measured[level] = true;
            debug!(level, cost = self.costs[level], "measured level cost");
        }
        self.accumulators.accumulate(level, &responses);
        if counted {
            self.allocated[level] += n;
        }
        debug!(level, n, counted, "evaluated batch");
        Ok(())
    }

    fn snapshot(&self) -> Statistics {
        let bootstrap = (self.cov == CovarianceModel::Bootstrap)
            .then_some((self.config.bootstrap_samples, self.config.seed));
        Statistics::from_accumulators(&self.accumulators, bootstrap)
    }

    fn allocator(&self) -> SampleAllocator<'_> {
        SampleAllocator {
            target: self.config.allocation_target,
            aggregation: self.config.qoi_aggregation,
            map: &self.map,
            cov: self.cov,
            solver: self.solver.as_ref(),
        }
    }

    /// Fixed for the whole run: the budget, or the target variance derived
    /// from the first batch.
    fn constraint(&self, stats: &Statistics) -> AllocationConstraint {
        match self.config.convergence_tol_target {
            ConvergenceTolTarget::CostConstraint => {
                AllocationConstraint::Budget(self.config.budget.unwrap_or_default())
            }
            ConvergenceTolTarget::VarianceConstraint => {
                let allocator = self.allocator();
                let current = allocator.current_estimator_variances(stats);
                let eps = allocator.variance_targets(
                    &current,
                    self.config.convergence_tol,
                    self.config.convergence_tol_type,
                );
                info!(?current, target = ?eps, "target estimator variance");
                AllocationConstraint::Variance(eps)
            }
        }
    }

    fn counts_guess(&self, counts: &[usize]) -> Array2<f64> {
        let num_functions = self.accumulators.num_functions();
        Array2::from_shape_fn((num_functions, counts.len()), |(_, l)| counts[l] as f64)
    }

    fn plan(
        &mut self,
        stats: &Statistics,
        constraint: &AllocationConstraint,
        initial: &Array2<f64>,
        relaxation: f64,
    ) -> Result<(Array2<f64>, Vec<usize>)> {
        let allocation = self.allocator().allocate(stats, &self.costs, constraint, initial)?;
        self.warnings.extend(allocation.warnings);
        let cap = self.config.allocation_target != AllocationTarget::Mean;
        let deltas = sample_increments(&allocation.targets, &self.allocated, relaxation, cap);
        debug!(targets = ?allocation.targets, ?deltas, "allocation");
        Ok((allocation.targets, deltas))
    }

    fn projection(&self, samples: Vec<usize>, estimator_variance: Vec<f64>) -> Projection {
        let cost = samples.iter().zip(&self.costs).map(|(&n, c)| n as f64 * c).sum();
        info!(?samples, ?estimator_variance, cost, "projected allocation");
        Projection { samples, estimator_variance, cost }
    }

    fn finish(&mut self, converged: bool, projection: Option<Projection>) -> MlmcResults {
        let stats = self.snapshot();
        let equivalent_cost: f64 = self
            .allocated
            .iter()
            .zip(&self.costs)
            .map(|(&n, c)| n as f64 * c)
            .sum();
        let top_cost = self.costs.last().copied().unwrap_or(0.0);
        let equivalent_hf_evals = if top_cost > 0.0 { equivalent_cost / top_cost } else { 0.0 };
        let qoi = rollup::summarize(
            &stats,
            &self.map,
            self.cov,
            self.config.final_moments,
            &self.costs,
            equivalent_cost,
            self.config.allocation_target == AllocationTarget::Scalarization,
        );
        let estimator_variance = self.allocator().current_estimator_variances(&stats);
        info!(equivalent_cost, equivalent_hf_evals, converged, "MLMC complete");
        MlmcResults {
            moment_kind: self.config.final_moments,
            qoi,
            actual_counts: self.accumulators.counts(),
            allocated_counts: self.allocated.clone(),
            costs: self.costs.clone(),
            equivalent_cost,
            equivalent_hf_evals,
            estimator_variance,
            projection,
            iterations: std::mem::take(&mut self.history),
            converged,
            allocation_warnings: std::mem::take(&mut self.warnings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PilotMgmtMode;
    use crate::evaluator::{LevelResponse, SamplePoint};
    use crate::sde::{SdeModel, SdeParams};

    /// Returns fixed values, counting every evaluation.
    struct Constant {
        levels: usize,
        evaluations: Vec<usize>,
    }

    impl Evaluator for Constant {
        fn num_levels(&self) -> usize {
            self.levels
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
            self.evaluations[level] += points.len();
            Ok(points
                .iter()
                .map(|_| match mode {
                    EvaluationMode::Fine => LevelResponse::fine(vec![1.0]),
                    EvaluationMode::FineCoarse => LevelResponse::paired(vec![1.0], vec![1.0]),
                })
                .collect())
        }

        fn cost_per_level(&self) -> Option<Vec<f64>> {
            Some((0..self.levels).map(|l| (l + 1) as f64).collect())
        }
    }

    #[test]
    fn test_constant_model_needs_no_more_samples() {
        let config = MlmcConfig { pilot_samples: vec![10], ..MlmcConfig::default() };
        let evaluator = Constant { levels: 3, evaluations: vec![0; 3] };
        let mut controller = MlmcController::new(config, evaluator).unwrap();
        let results = controller.run().unwrap();
        assert!(results.converged);
        assert_eq!(results.iterations.len(), 1);
        assert_eq!(controller.evaluator().evaluations, vec![10, 10, 10]);
        assert_eq!(results.qoi[0].moments, [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(results.equivalent_cost, 60.0);
        assert_eq!(results.equivalent_hf_evals, 20.0);
    }

    #[test]
    fn test_offline_cost_must_be_known() {
        struct NoCost;
        impl Evaluator for NoCost {
            fn num_levels(&self) -> usize {
                2
            }
            fn num_functions(&self) -> usize {
                1
            }
            fn evaluate_batch(
                &mut self,
                _level: usize,
                _mode: EvaluationMode,
                points: &[SamplePoint],
            ) -> Result<Vec<LevelResponse>> {
                Ok(points.iter().map(|_| LevelResponse::fine(vec![0.0])).collect())
            }
            fn cost_per_level(&self) -> Option<Vec<f64>> {
                None
            }
        }
        assert!(matches!(
            MlmcController::new(MlmcConfig::default(), NoCost),
            Err(MlmcError::Config(_))
        ));
        let online = MlmcConfig { cost_source: CostSource::Online, ..MlmcConfig::default() };
        assert!(MlmcController::new(online, NoCost).is_ok());
        let online_gap = MlmcConfig {
            cost_source: CostSource::Online,
            pilot_samples: vec![10, 0],
            ..MlmcConfig::default()
        };
        assert!(MlmcController::new(online_gap, NoCost).is_err());
    }

    #[test]
    fn test_online_costs_are_measured() {
        let config = MlmcConfig {
            cost_source: CostSource::Online,
            pilot_samples: vec![50],
            pilot_mgmt_mode: PilotMgmtMode::OnlinePilotProjection,
            ..MlmcConfig::default()
        };
        let mut controller = MlmcController::new(config, SdeModel::new(SdeParams::default(), 3)).unwrap();
        controller.run().unwrap();
        assert!(controller.costs().iter().all(|&c| c >= MIN_MEASURED_COST));
    }
}
