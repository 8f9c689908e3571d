//! Contract for the one-constraint nonlinear programs solved during sample
//! allocation, and a default solver for it.
//!
//! The default solver is an augmented Lagrangian whose bound-constrained
//! subproblems are mapped to unconstrained ones (`x = lower + exp(z)`) and
//! minimized with L-BFGS from `argmin`, using the analytic gradients the
//! problem supplies.

use argmin::core::{CostFunction, Error, Executor, Gradient};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use tracing::{debug, warn};

use crate::config::SolverSettings;
use crate::error::{MlmcError, Result};

/// Smooth objective with a single equality constraint
/// `constraint(x) == constraint_target()`.
pub trait ConstrainedProblem {
    fn num_variables(&self) -> usize;

    fn objective(&self, x: &[f64]) -> f64;

    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]);

    fn constraint(&self, x: &[f64]) -> f64;

    fn constraint_gradient(&self, x: &[f64], grad: &mut [f64]);

    fn constraint_target(&self) -> f64;
}

#[derive(Debug, Clone, PartialEq)]
pub struct NlpSolution {
    pub point: Vec<f64>,
    pub objective: f64,
    pub constraint: f64,
}

impl NlpSolution {
    pub fn evaluate(problem: &dyn ConstrainedProblem, point: Vec<f64>) -> Self {
        Self {
            objective: problem.objective(&point),
            constraint: problem.constraint(&point),
            point,
        }
    }
}

/// Box-bounded, equality-constrained NLP solver.
///
/// Implementations are invoked synchronously, once per allocation problem;
/// they hold no state between calls.
pub trait NlpSolver {
    fn solve(
        &self,
        problem: &dyn ConstrainedProblem,
        initial: &[f64],
        lower: &[f64],
        upper: &[f64],
    ) -> Result<NlpSolution>;
}

/// Largest relative mismatch between analytic and central-difference
/// gradients of objective and constraint at `x`.
pub fn gradient_mismatch(problem: &dyn ConstrainedProblem, x: &[f64]) -> (f64, f64) {
    let n = problem.num_variables();
    let mut g_obj = vec![0.0; n];
    let mut g_con = vec![0.0; n];
    problem.objective_gradient(x, &mut g_obj);
    problem.constraint_gradient(x, &mut g_con);
    let mut worst = (0.0_f64, 0.0_f64);
    let mut probe = x.to_vec();
    for i in 0..n {
        let h = 1e-6 * x[i].abs().max(1.0);
        probe[i] = x[i] + h;
        let (fp, cp) = (problem.objective(&probe), problem.constraint(&probe));
        probe[i] = x[i] - h;
        let (fm, cm) = (problem.objective(&probe), problem.constraint(&probe));
        probe[i] = x[i];
        let rel = |analytic: f64, fd: f64| (analytic - fd).abs() / analytic.abs().max(fd.abs()).max(1e-300);
        worst.0 = worst.0.max(rel(g_obj[i], (fp - fm) / (2.0 * h)));
        worst.1 = worst.1.max(rel(g_con[i], (cp - cm) / (2.0 * h)));
    }
    worst
}

/// Upper limit on `z` for lower-bounded variables: `x - lower` stays below
/// about `1e15`, so every line-search trial point has a finite merit.
const MAX_LOG_OFFSET: f64 = 34.5;

/// Maps between the bounded variables `x` and unconstrained `z`.
struct BoundTransform<'a> {
    lower: &'a [f64],
    upper: &'a [f64],
}

impl BoundTransform<'_> {
    fn to_z(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.lower)
            .map(|(&xi, &lo)| {
                if lo.is_finite() {
                    let floor = 1e-3 * lo.abs().max(1.0);
                    (xi - lo).max(floor).ln().min(MAX_LOG_OFFSET)
                } else {
                    xi
                }
            })
            .collect()
    }

    fn to_x(&self, z: &[f64]) -> Vec<f64> {
        z.iter()
            .zip(self.lower.iter().zip(self.upper))
            .map(|(&zi, (&lo, &hi))| {
                let x = if lo.is_finite() { lo + zi.min(MAX_LOG_OFFSET).exp() } else { zi };
                x.min(hi)
            })
            .collect()
    }

    /// `dx/dz` at `z`; zero where the upper bound or the `z` limit is active.
    fn jacobian(&self, z: &[f64]) -> Vec<f64> {
        z.iter()
            .zip(self.lower.iter().zip(self.upper))
            .map(|(&zi, (&lo, &hi))| {
                if !lo.is_finite() {
                    1.0
                } else if zi >= MAX_LOG_OFFSET || lo + zi.exp() >= hi {
                    0.0
                } else {
                    zi.exp()
                }
            })
            .collect()
    }
}

/// Augmented-Lagrangian merit function for one outer iteration.
struct PenaltySubproblem<'a> {
    problem: &'a dyn ConstrainedProblem,
    transform: &'a BoundTransform<'a>,
    lambda: f64,
    mu: f64,
    objective_scale: f64,
    constraint_scale: f64,
}

impl PenaltySubproblem<'_> {
    fn residual(&self, x: &[f64]) -> f64 {
        (self.problem.constraint(x) - self.problem.constraint_target()) / self.constraint_scale
    }
}

impl CostFunction for PenaltySubproblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, z: &Self::Param) -> std::result::Result<Self::Output, Error> {
        let x = self.transform.to_x(z);
        let c = self.residual(&x);
        let value =
            self.problem.objective(&x) / self.objective_scale + self.lambda * c + 0.5 * self.mu * c * c;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(Error::msg("non-finite merit value"))
        }
    }
}

impl Gradient for PenaltySubproblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, z: &Self::Param) -> std::result::Result<Self::Gradient, Error> {
        let x = self.transform.to_x(z);
        let n = x.len();
        let mut g_obj = vec![0.0; n];
        let mut g_con = vec![0.0; n];
        self.problem.objective_gradient(&x, &mut g_obj);
        self.problem.constraint_gradient(&x, &mut g_con);
        let multiplier = (self.lambda + self.mu * self.residual(&x)) / self.constraint_scale;
        let grad: Vec<f64> = self
            .transform
            .jacobian(z)
            .iter()
            .enumerate()
            .map(|(i, dxdz)| (g_obj[i] / self.objective_scale + multiplier * g_con[i]) * dxdz)
            .collect();
        if grad.iter().all(|g| g.is_finite()) {
            Ok(grad)
        } else {
            Err(Error::msg("non-finite merit gradient"))
        }
    }
}

/// Default allocation solver.
#[derive(Debug, Clone, Default)]
pub struct AugmentedLagrangian {
    settings: SolverSettings,
}

impl AugmentedLagrangian {
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }

    fn minimize_subproblem(&self, sub: PenaltySubproblem<'_>, z: &[f64]) -> std::result::Result<Option<Vec<f64>>, Error> {
        let linesearch: MoreThuenteLineSearch<Vec<f64>, Vec<f64>, f64> = MoreThuenteLineSearch::new();
        let solver: LBFGS<_, Vec<f64>, Vec<f64>, f64> = LBFGS::new(linesearch, self.settings.lbfgs_memory)
            .with_tolerance_grad(1e-12)?
            .with_tolerance_cost(1e-15)?;
        let max_iters = self.settings.max_inner_iterations;
        let res = Executor::new(sub, solver)
            .configure(|state| state.param(z.to_vec()).max_iters(max_iters))
            .run()?;
        Ok(res.state.best_param)
    }
}

impl NlpSolver for AugmentedLagrangian {
    fn solve(
        &self,
        problem: &dyn ConstrainedProblem,
        initial: &[f64],
        lower: &[f64],
        upper: &[f64],
    ) -> Result<NlpSolution> {
        let n = problem.num_variables();
        if initial.len() != n || lower.len() != n || upper.len() != n {
            return Err(MlmcError::Solver(format!(
                "dimension mismatch: {n} variables, initial {}, bounds {}/{}",
                initial.len(),
                lower.len(),
                upper.len()
            )));
        }

        #[cfg(debug_assertions)]
        {
            let (obj, con) = gradient_mismatch(problem, initial);
            if obj > 1e-4 || con > 1e-4 {
                warn!(obj, con, "analytic gradients disagree with finite differences");
            }
        }

        let transform = BoundTransform { lower, upper };
        let mut z = transform.to_z(initial);
        let x0 = transform.to_x(&z);
        let objective_scale = problem.objective(&x0).abs().max(f64::MIN_POSITIVE);
        let constraint_scale = problem.constraint_target().abs().max(f64::MIN_POSITIVE);

        let mut lambda = 0.0;
        let mut mu = self.settings.initial_penalty;
        let mut previous = f64::INFINITY;
        for outer in 0..self.settings.max_outer_iterations {
            let sub = PenaltySubproblem {
                problem,
                transform: &transform,
                lambda,
                mu,
                objective_scale,
                constraint_scale,
            };
            match self.minimize_subproblem(sub, &z) {
                Ok(Some(best)) => z = best,
                Ok(None) => {}
                Err(e) => debug!(outer, error = %e, "subproblem stopped early"),
            }
            let x = transform.to_x(&z);
            let c = (problem.constraint(&x) - problem.constraint_target()) / constraint_scale;
            debug!(outer, residual = c, lambda, mu, "augmented Lagrangian step");
            if !c.is_finite() {
                return Err(MlmcError::Solver("constraint became non-finite".into()));
            }
            if c.abs() <= self.settings.feasibility_tol {
                break;
            }
            lambda += mu * c;
            if c.abs() > 0.25 * previous {
                mu *= self.settings.penalty_growth;
            }
            previous = c.abs();
        }
        Ok(NlpSolution::evaluate(problem, transform.to_x(&z)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// min sum(c_i x_i) s.t. sum(v_i / x_i) == t, which has the closed form
    /// x_i = sqrt(v_i / c_i) * sum(sqrt(v_j c_j)) / t.
    struct Harmonic {
        v: Vec<f64>,
        c: Vec<f64>,
        t: f64,
    }

    impl ConstrainedProblem for Harmonic {
        fn num_variables(&self) -> usize {
            self.v.len()
        }
        fn objective(&self, x: &[f64]) -> f64 {
            x.iter().zip(&self.c).map(|(x, c)| x * c).sum()
        }
        fn objective_gradient(&self, _x: &[f64], grad: &mut [f64]) {
            grad.copy_from_slice(&self.c);
        }
        fn constraint(&self, x: &[f64]) -> f64 {
            x.iter().zip(&self.v).map(|(x, v)| v / x).sum()
        }
        fn constraint_gradient(&self, x: &[f64], grad: &mut [f64]) {
            for i in 0..x.len() {
                grad[i] = -self.v[i] / (x[i] * x[i]);
            }
        }
        fn constraint_target(&self) -> f64 {
            self.t
        }
    }

    #[test]
    fn test_recovers_square_root_law() {
        let problem = Harmonic { v: vec![4.0, 1.0, 0.25], c: vec![1.0, 4.0, 16.0], t: 0.01 };
        let lower = vec![6.0; 3];
        let upper = vec![f64::INFINITY; 3];
        let solution = AugmentedLagrangian::default()
            .solve(&problem, &[10.0, 10.0, 10.0], &lower, &upper)
            .unwrap();
        let sum: f64 = problem.v.iter().zip(&problem.c).map(|(v, c)| (v * c).sqrt()).sum();
        for i in 0..3 {
            let expected = (problem.v[i] / problem.c[i]).sqrt() * sum / problem.t;
            assert!(
                (solution.point[i] - expected).abs() < 1e-3 * expected,
                "x[{i}] = {} expected {expected}",
                solution.point[i]
            );
        }
        assert!((solution.constraint - problem.t).abs() < 1e-6 * problem.t);
    }

    #[test]
    fn test_lower_bound_respected() {
        // Unconstrained optimum would put x[1] near 1.2, below the floor of 6.
        let problem = Harmonic { v: vec![100.0, 1e-4], c: vec![1.0, 1.0], t: 1.0 };
        let solution = AugmentedLagrangian::default()
            .solve(&problem, &[50.0, 50.0], &[6.0, 6.0], &[f64::INFINITY; 2])
            .unwrap();
        assert!(solution.point.iter().all(|&x| x >= 6.0));
        assert!((solution.constraint - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_target_far_from_start() {
        let problem = Harmonic { v: vec![4.0, 1.0, 0.25], c: vec![1.0, 4.0, 16.0], t: 1e-4 };
        let solution = AugmentedLagrangian::default()
            .solve(&problem, &[6.0; 3], &[6.0; 3], &[f64::INFINITY; 3])
            .unwrap();
        for (x, expected) in solution.point.iter().zip([1.2e5, 3.0e4, 7.5e3]) {
            assert!((x - expected).abs() < 1e-2 * expected, "{x} expected {expected}");
        }
        assert!((solution.constraint - problem.t).abs() < 1e-5 * problem.t);
    }

    #[test]
    fn test_overshooting_step_keeps_merit_finite() {
        let problem = Harmonic { v: vec![4.0, 1.0], c: vec![1.0, 4.0], t: 0.01 };
        let (lower, upper) = ([6.0, 6.0], [f64::INFINITY; 2]);
        let transform = BoundTransform { lower: &lower, upper: &upper };
        let sub = PenaltySubproblem {
            problem: &problem,
            transform: &transform,
            lambda: 0.0,
            mu: 1e3,
            objective_scale: 1.0,
            constraint_scale: 0.01,
        };
        let far = vec![5e3, 2.0];
        let x = transform.to_x(&far);
        assert!(x[0].is_finite() && x[0] > 1e14);
        assert!(sub.cost(&far).unwrap().is_finite());
        let grad = sub.gradient(&far).unwrap();
        assert_eq!(grad[0], 0.0);
        assert!(grad[1].is_finite());
    }

    #[test]
    fn test_dimension_mismatch() {
        let problem = Harmonic { v: vec![1.0], c: vec![1.0], t: 1.0 };
        let result = AugmentedLagrangian::default().solve(&problem, &[1.0, 2.0], &[0.0], &[1.0]);
        assert!(matches!(result, Err(MlmcError::Solver(_))));
    }

    #[test]
    fn test_gradient_mismatch_detects_consistency() {
        let problem = Harmonic { v: vec![2.0, 3.0], c: vec![1.0, 5.0], t: 1.0 };
        let (obj, con) = gradient_mismatch(&problem, &[7.0, 9.0]);
        assert!(obj < 1e-8 && con < 1e-6);
    }
}
