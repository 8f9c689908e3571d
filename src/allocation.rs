//! Per-level sample allocation.
//!
//! Each allocation target is an [`EstimatorVarianceModel`]: the variance of
//! the target statistic's multilevel estimator as a function of real-valued
//! per-level sample counts, with its gradient. The mean target has the
//! classical square-root closed form; the other targets go through an
//! [`NlpSolver`].

use ndarray::{Array2, ArrayView1};
use tracing::{debug, info, warn};

use crate::config::{AllocationTarget, ConvergenceTolType, QoiAggregation};
use crate::error::Result;
use crate::estimators::{CovarianceModel, QoiStatistics, Statistics};
use crate::nlp::{ConstrainedProblem, NlpSolution, NlpSolver};
use crate::scalarization::{ScalarizationMap, StatisticTerms};

/// Lower bound on optimized per-level targets; keeps the fourth-moment
/// formulas well defined.
pub const MIN_OPTIMIZED_SAMPLES: f64 = 6.0;

/// Relative constraint residual above which a solve is retried in log scale.
pub const CONSTRAINT_REL_TOL: f64 = 1e-5;

/// Largest per-iteration increment, as a multiple of the current allocation,
/// for optimized targets.
pub const MAX_GROWTH_FACTOR: usize = 3;

/// Estimator variance of one target statistic as a function of the sample
/// count on every level.
pub trait EstimatorVarianceModel {
    fn num_levels(&self) -> usize;

    fn estimator_variance(&self, n: &[f64]) -> f64;

    fn gradient(&self, n: &[f64], grad: &mut [f64]);
}

/// `sum_l Var[Y_l] / N_l`.
pub struct MeanModel<'a> {
    stats: &'a QoiStatistics,
}

impl EstimatorVarianceModel for MeanModel<'_> {
    fn num_levels(&self) -> usize {
        self.stats.num_levels()
    }

    fn estimator_variance(&self, n: &[f64]) -> f64 {
        self.stats
            .levels
            .iter()
            .zip(n)
            .map(|(s, &nl)| s.variance_of_mean_at(nl))
            .sum()
    }

    fn gradient(&self, n: &[f64], grad: &mut [f64]) {
        for (l, s) in self.stats.levels.iter().enumerate() {
            grad[l] = s.d_variance_of_mean(n[l]);
        }
    }
}

/// `sum_l Var[S^2_l - S^2_{l-1}]`.
pub struct VarianceModel<'a> {
    stats: &'a QoiStatistics,
}

impl EstimatorVarianceModel for VarianceModel<'_> {
    fn num_levels(&self) -> usize {
        self.stats.num_levels()
    }

    fn estimator_variance(&self, n: &[f64]) -> f64 {
        self.stats
            .levels
            .iter()
            .zip(n)
            .map(|(s, &nl)| s.variance_of_variance_at(nl))
            .sum()
    }

    fn gradient(&self, n: &[f64], grad: &mut [f64]) {
        for (l, s) in self.stats.levels.iter().enumerate() {
            grad[l] = s.d_variance_of_variance(n[l]);
        }
    }
}

/// Delta-method variance of the standard deviation estimator.
pub struct SigmaModel<'a> {
    stats: &'a QoiStatistics,
}

impl EstimatorVarianceModel for SigmaModel<'_> {
    fn num_levels(&self) -> usize {
        self.stats.num_levels()
    }

    fn estimator_variance(&self, n: &[f64]) -> f64 {
        (0..self.num_levels())
            .map(|l| self.stats.variance_of_sigma_at(l, n[l]))
            .sum()
    }

    fn gradient(&self, n: &[f64], grad: &mut [f64]) {
        for (l, g) in grad.iter_mut().enumerate().take(self.num_levels()) {
            *g = self.stats.d_variance_of_sigma(l, n[l]);
        }
    }
}

/// Variance of one row of the scalarization map.
pub struct ScalarizedModel<'a> {
    stats: &'a Statistics,
    map: &'a ScalarizationMap,
    qoi: usize,
    cov: CovarianceModel,
}

impl ScalarizedModel<'_> {
    fn level_terms(&self, level: usize, n: f64, derivative: bool) -> Vec<StatisticTerms> {
        self.stats
            .qoi
            .iter()
            .map(|stats| {
                let s = &stats.levels[level];
                if derivative {
                    StatisticTerms {
                        var_mean: s.d_variance_of_mean(n),
                        var_sigma: stats.d_variance_of_sigma(level, n),
                        cov_mean_sigma: self.cov.derivative_at(stats, level, n),
                    }
                } else {
                    StatisticTerms {
                        var_mean: s.variance_of_mean_at(n),
                        var_sigma: stats.variance_of_sigma_at(level, n),
                        cov_mean_sigma: self.cov.covariance_at(stats, level, n),
                    }
                }
            })
            .collect()
    }

    fn raw_variance(&self, n: &[f64]) -> f64 {
        (0..self.num_levels())
            .map(|l| {
                self.map
                    .scalarized_variance(self.qoi, &self.level_terms(l, n[l], false))
            })
            .sum()
    }
}

impl EstimatorVarianceModel for ScalarizedModel<'_> {
    fn num_levels(&self) -> usize {
        self.stats.num_levels()
    }

    fn estimator_variance(&self, n: &[f64]) -> f64 {
        self.raw_variance(n).max(0.0)
    }

    fn gradient(&self, n: &[f64], grad: &mut [f64]) {
        let clamped = self.raw_variance(n) < 0.0;
        for (l, g) in grad.iter_mut().enumerate().take(self.num_levels()) {
            *g = if clamped {
                0.0
            } else {
                // The scalarization is linear in its terms, so it maps
                // derivatives the same way it maps values.
                self.map
                    .scalarized_variance(self.qoi, &self.level_terms(l, n[l], true))
            };
        }
    }
}

/// Sum of several models over the same levels.
pub struct SummedModel<'a> {
    parts: Vec<Box<dyn EstimatorVarianceModel + 'a>>,
}

impl EstimatorVarianceModel for SummedModel<'_> {
    fn num_levels(&self) -> usize {
        self.parts.first().map_or(0, |p| p.num_levels())
    }

    fn estimator_variance(&self, n: &[f64]) -> f64 {
        self.parts.iter().map(|p| p.estimator_variance(n)).sum()
    }

    fn gradient(&self, n: &[f64], grad: &mut [f64]) {
        grad.fill(0.0);
        let mut part = vec![0.0; grad.len()];
        for p in &self.parts {
            p.gradient(n, &mut part);
            grad.iter_mut().zip(&part).for_each(|(g, d)| *g += d);
        }
    }
}

/// Variance model of `target` for one QoI.
pub fn variance_model<'a>(
    target: AllocationTarget,
    stats: &'a Statistics,
    qoi: usize,
    map: &'a ScalarizationMap,
    cov: CovarianceModel,
) -> Box<dyn EstimatorVarianceModel + 'a> {
    let q = &stats.qoi[qoi];
    match target {
        AllocationTarget::Mean => Box::new(MeanModel { stats: q }),
        AllocationTarget::Variance => Box::new(VarianceModel { stats: q }),
        AllocationTarget::Sigma => Box::new(SigmaModel { stats: q }),
        AllocationTarget::Scalarization => Box::new(ScalarizedModel { stats, map, qoi, cov }),
    }
}

/// Minimize `sum N_l c_l` subject to `V(N) == target`.
struct VarianceConstrained<'a> {
    model: &'a dyn EstimatorVarianceModel,
    costs: &'a [f64],
    target: f64,
}

impl ConstrainedProblem for VarianceConstrained<'_> {
    fn num_variables(&self) -> usize {
        self.costs.len()
    }

    fn objective(&self, x: &[f64]) -> f64 {
        x.iter().zip(self.costs).map(|(n, c)| n * c).sum()
    }

    fn objective_gradient(&self, _x: &[f64], grad: &mut [f64]) {
        grad.copy_from_slice(self.costs);
    }

    fn constraint(&self, x: &[f64]) -> f64 {
        self.model.estimator_variance(x)
    }

    fn constraint_gradient(&self, x: &[f64], grad: &mut [f64]) {
        self.model.gradient(x, grad);
    }

    fn constraint_target(&self) -> f64 {
        self.target
    }
}

/// Minimize `V(N)` subject to `sum N_l c_l == budget`.
struct CostConstrained<'a> {
    model: &'a dyn EstimatorVarianceModel,
    costs: &'a [f64],
    budget: f64,
}

impl ConstrainedProblem for CostConstrained<'_> {
    fn num_variables(&self) -> usize {
        self.costs.len()
    }

    fn objective(&self, x: &[f64]) -> f64 {
        self.model.estimator_variance(x)
    }

    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]) {
        self.model.gradient(x, grad);
    }

    fn constraint(&self, x: &[f64]) -> f64 {
        x.iter().zip(self.costs).map(|(n, c)| n * c).sum()
    }

    fn constraint_gradient(&self, _x: &[f64], grad: &mut [f64]) {
        grad.copy_from_slice(self.costs);
    }

    fn constraint_target(&self) -> f64 {
        self.budget
    }
}

/// The same problem with objective and constraint replaced by their logs.
struct LogScaled<'a> {
    inner: &'a dyn ConstrainedProblem,
}

impl ConstrainedProblem for LogScaled<'_> {
    fn num_variables(&self) -> usize {
        self.inner.num_variables()
    }

    fn objective(&self, x: &[f64]) -> f64 {
        self.inner.objective(x).ln()
    }

    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]) {
        let value = self.inner.objective(x);
        self.inner.objective_gradient(x, grad);
        grad.iter_mut().for_each(|g| *g /= value);
    }

    fn constraint(&self, x: &[f64]) -> f64 {
        self.inner.constraint(x).ln()
    }

    fn constraint_gradient(&self, x: &[f64], grad: &mut [f64]) {
        let value = self.inner.constraint(x);
        self.inner.constraint_gradient(x, grad);
        grad.iter_mut().for_each(|g| *g /= value);
    }

    fn constraint_target(&self) -> f64 {
        self.inner.constraint_target().ln()
    }
}

/// What the allocation holds fixed.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationConstraint {
    /// Target estimator variance: one entry for SUM aggregation, one per QoI
    /// for MAX.
    Variance(Vec<f64>),
    /// Total cost.
    Budget(f64),
}

impl AllocationConstraint {
    fn for_group(&self, group: usize) -> f64 {
        match self {
            Self::Variance(eps) => eps[group.min(eps.len().saturating_sub(1))],
            Self::Budget(b) => *b,
        }
    }
}

/// Allocation targets `[qoi][level]` and any soft failures met on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub targets: Array2<f64>,
    pub warnings: Vec<String>,
}

fn relative_residual(solution: &NlpSolution, target: f64) -> f64 {
    (solution.constraint - target).abs() / target.abs().max(f64::MIN_POSITIVE)
}

/// Allocation strategy fixed at configuration time.
pub struct SampleAllocator<'a> {
    pub target: AllocationTarget,
    pub aggregation: QoiAggregation,
    pub map: &'a ScalarizationMap,
    pub cov: CovarianceModel,
    pub solver: &'a dyn NlpSolver,
}

impl<'a> SampleAllocator<'a> {
    fn model<'s>(&self, stats: &'s Statistics, qoi: usize) -> Box<dyn EstimatorVarianceModel + 's>
    where
        'a: 's,
    {
        variance_model(self.target, stats, qoi, self.map, self.cov)
    }

    /// Model for one allocation group: all QoIs summed, or a single QoI.
    fn group_model<'s>(&self, stats: &'s Statistics, group: usize) -> Box<dyn EstimatorVarianceModel + 's>
    where
        'a: 's,
    {
        match self.aggregation {
            QoiAggregation::Sum => Box::new(SummedModel {
                parts: (0..stats.num_functions()).map(|q| self.model(stats, q)).collect(),
            }),
            QoiAggregation::Max => self.model(stats, group),
        }
    }

    fn num_groups(&self, stats: &Statistics) -> usize {
        match self.aggregation {
            QoiAggregation::Sum => 1,
            QoiAggregation::Max => stats.num_functions(),
        }
    }

    /// Estimator variance of the target statistic per QoI at counts `n`.
    pub fn estimator_variances(&self, stats: &Statistics, n: &[f64]) -> Vec<f64> {
        (0..stats.num_functions())
            .map(|q| self.model(stats, q).estimator_variance(n))
            .collect()
    }

    /// Estimator variance per QoI, each at its own valid sample counts.
    pub fn current_estimator_variances(&self, stats: &Statistics) -> Vec<f64> {
        (0..stats.num_functions())
            .map(|q| self.model(stats, q).estimator_variance(&stats.qoi[q].counts()))
            .collect()
    }

    /// Estimator variance per QoI with `extra[l]` samples added to every
    /// QoI's valid count on level `l`.
    pub fn projected_estimator_variances(&self, stats: &Statistics, extra: &[usize]) -> Vec<f64> {
        (0..stats.num_functions())
            .map(|q| {
                let n: Vec<f64> = stats.qoi[q]
                    .counts()
                    .iter()
                    .zip(extra)
                    .map(|(n, &d)| n + d as f64)
                    .collect();
                self.model(stats, q).estimator_variance(&n)
            })
            .collect()
    }

    /// Target estimator variances for the variance-constrained formulation,
    /// from the per-QoI estimator variances of the first batch.
    pub fn variance_targets(&self, current: &[f64], tol: f64, kind: ConvergenceTolType) -> Vec<f64> {
        match (self.aggregation, kind) {
            (QoiAggregation::Max, ConvergenceTolType::Relative) => {
                current.iter().map(|v| tol * v).collect()
            }
            (QoiAggregation::Max, ConvergenceTolType::Absolute) => vec![tol; current.len()],
            (QoiAggregation::Sum, ConvergenceTolType::Relative) => {
                vec![tol * current.iter().sum::<f64>()]
            }
            (QoiAggregation::Sum, ConvergenceTolType::Absolute) => vec![tol],
        }
    }

    /// Computes new targets. `initial` holds the previous targets (or the
    /// current counts) per QoI and seeds the numerical solves.
    pub fn allocate(
        &self,
        stats: &Statistics,
        costs: &[f64],
        constraint: &AllocationConstraint,
        initial: &Array2<f64>,
    ) -> Result<Allocation> {
        let num_levels = costs.len();
        let num_functions = stats.num_functions();
        let mut targets = Array2::zeros((num_functions, num_levels));
        let mut warnings = Vec::new();
        for group in 0..self.num_groups(stats) {
            let row = match self.target {
                AllocationTarget::Mean => self.closed_form_mean(stats, costs, constraint, group),
                _ => {
                    let init: Vec<f64> = initial.row(group).to_vec();
                    self.optimized(stats, costs, constraint, group, &init, &mut warnings)?
                }
            };
            let row: Vec<f64> = row
                .into_iter()
                .map(|n| if n.is_finite() { n } else { 0.0 })
                .collect();
            match self.aggregation {
                QoiAggregation::Sum => {
                    for q in 0..num_functions {
                        targets.row_mut(q).assign(&ArrayView1::from(row.as_slice()));
                    }
                }
                QoiAggregation::Max => {
                    targets.row_mut(group).assign(&ArrayView1::from(row.as_slice()));
                }
            }
        }
        Ok(Allocation { targets, warnings })
    }

    /// Square-root law `N_l = sqrt(V_l / C_l) * factor`.
    fn closed_form_mean(
        &self,
        stats: &Statistics,
        costs: &[f64],
        constraint: &AllocationConstraint,
        group: usize,
    ) -> Vec<f64> {
        let level_var: Vec<f64> = (0..costs.len())
            .map(|l| match self.aggregation {
                QoiAggregation::Sum => stats.qoi.iter().map(|q| q.levels[l].var_y).sum(),
                QoiAggregation::Max => stats.qoi[group].levels[l].var_y,
            })
            .collect();
        let sum_sqrt: f64 = level_var
            .iter()
            .zip(costs)
            .map(|(v, c)| (v * c).sqrt())
            .sum();
        let factor = match constraint {
            AllocationConstraint::Variance(_) => sum_sqrt / constraint.for_group(group),
            AllocationConstraint::Budget(b) => b / sum_sqrt,
        };
        debug!(group, sum_sqrt, factor, "square-root allocation");
        level_var
            .iter()
            .zip(costs)
            .map(|(v, c)| (v / c).sqrt() * factor)
            .collect()
    }

    fn optimized(
        &self,
        stats: &Statistics,
        costs: &[f64],
        constraint: &AllocationConstraint,
        group: usize,
        initial: &[f64],
        warnings: &mut Vec<String>,
    ) -> Result<Vec<f64>> {
        let model = self.group_model(stats, group);
        let num_levels = costs.len();
        let lower = vec![MIN_OPTIMIZED_SAMPLES; num_levels];
        let upper = vec![f64::INFINITY; num_levels];
        let start: Vec<f64> = initial
            .iter()
            .map(|&n| if n.is_finite() { n.max(MIN_OPTIMIZED_SAMPLES) } else { MIN_OPTIMIZED_SAMPLES })
            .collect();

        let target = constraint.for_group(group);
        if !(target > 0.0) || model.estimator_variance(&start) <= 0.0 {
            info!(group, target, "nothing to reduce; keeping current allocation");
            return Ok(start);
        }

        let primal: Box<dyn ConstrainedProblem + '_> = match constraint {
            AllocationConstraint::Variance(_) => Box::new(VarianceConstrained {
                model: model.as_ref(),
                costs,
                target,
            }),
            AllocationConstraint::Budget(_) => Box::new(CostConstrained {
                model: model.as_ref(),
                costs,
                budget: target,
            }),
        };

        let first = self.solver.solve(primal.as_ref(), &start, &lower, &upper);
        if let Ok(solution) = &first {
            let residual = relative_residual(solution, target);
            if residual <= CONSTRAINT_REL_TOL {
                return Ok(solution.point.clone());
            }
            info!(group, residual, "constraint violated; retrying in log scale");
        }

        let log_problem = LogScaled { inner: primal.as_ref() };
        let retry = self.solver.solve(&log_problem, &start, &lower, &upper);
        let retry = retry.map(|s| NlpSolution::evaluate(primal.as_ref(), s.point));
        let best = match (first, retry) {
            (_, Ok(r)) if relative_residual(&r, target) <= CONSTRAINT_REL_TOL => return Ok(r.point),
            (Ok(f), Ok(r)) => {
                if relative_residual(&r, target) <= relative_residual(&f, target) {
                    r
                } else {
                    f
                }
            }
            (Ok(f), Err(_)) => f,
            (Err(_), Ok(r)) => r,
            (Err(e), Err(_)) => {
                let message = format!("group {group}: solver failed ({e}); keeping current allocation");
                warn!("{message}");
                warnings.push(message);
                return Ok(start);
            }
        };
        let residual = relative_residual(&best, target);
        let message = format!(
            "group {group}: allocation constraint residual {residual:.3e} exceeds {CONSTRAINT_REL_TOL:e} after log-scale retry"
        );
        warn!("{message}");
        warnings.push(message);
        Ok(best.point)
    }
}

/// `max(0, ceil(relax * (target - current)))`.
pub fn one_sided_delta(current: usize, target: f64, relax: f64) -> usize {
    let diff = relax * (target - current as f64);
    if diff.is_finite() && diff > 0.0 {
        diff.ceil() as usize
    } else {
        0
    }
}

/// Per-level increments: the largest one-sided delta over the QoI rows of
/// `targets`. With `cap_growth` an increment may not exceed
/// [`MAX_GROWTH_FACTOR`] times a nonzero current allocation.
pub fn sample_increments(
    targets: &Array2<f64>,
    allocated: &[usize],
    relax: f64,
    cap_growth: bool,
) -> Vec<usize> {
    allocated
        .iter()
        .enumerate()
        .map(|(l, &current)| {
            targets
                .column(l)
                .iter()
                .map(|&t| {
                    let delta = one_sided_delta(current, t, relax);
                    if cap_growth && current > 0 {
                        delta.min(MAX_GROWTH_FACTOR * current)
                    } else {
                        delta
                    }
                })
                .max()
                .unwrap_or(0)
        })
        .collect()
}
