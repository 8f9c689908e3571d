use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MlmcError, Result};
use crate::scalarization::ScalarizationMap;

/// Statistic whose estimator variance drives the sample allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationTarget {
    #[default]
    Mean,
    Variance,
    Sigma,
    Scalarization,
}

/// How per-QoI estimator variances are combined into one allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QoiAggregation {
    #[default]
    Sum,
    Max,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PilotMgmtMode {
    #[default]
    OnlinePilot,
    OfflinePilot,
    OnlinePilotProjection,
    OfflinePilotProjection,
}

impl PilotMgmtMode {
    pub fn is_offline(self) -> bool {
        matches!(self, Self::OfflinePilot | Self::OfflinePilotProjection)
    }

    pub fn is_projection(self) -> bool {
        matches!(
            self,
            Self::OnlinePilotProjection | Self::OfflinePilotProjection
        )
    }
}

/// Which side of the cost/variance trade-off is held fixed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvergenceTolTarget {
    /// Minimize cost subject to a target estimator variance.
    #[default]
    VarianceConstraint,
    /// Minimize estimator variance subject to a total cost budget.
    CostConstraint,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvergenceTolType {
    /// Target variance is `convergence_tol` times the pilot estimator variance.
    #[default]
    Relative,
    Absolute,
}

/// Estimator of the covariance between the mean and sigma estimators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CovApproximation {
    Bootstrap,
    Pearson,
    #[default]
    CorrLift,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalMoments {
    Raw,
    Central,
    #[default]
    Standard,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CostSource {
    /// Costs supplied a priori by the evaluator.
    #[default]
    Offline,
    /// Costs measured as wall time per sample of the first batch on each level.
    Online,
}

/// Tuning of the default augmented-Lagrangian allocation solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub max_outer_iterations: usize,
    pub max_inner_iterations: u64,
    pub initial_penalty: f64,
    pub penalty_growth: f64,
    pub feasibility_tol: f64,
    pub lbfgs_memory: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_outer_iterations: 40,
            max_inner_iterations: 200,
            initial_penalty: 10.0,
            penalty_growth: 10.0,
            feasibility_tol: 1e-10,
            lbfgs_memory: 7,
        }
    }
}

/// Complete configuration of an MLMC run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MlmcConfig {
    pub allocation_target: AllocationTarget,
    pub qoi_aggregation: QoiAggregation,
    pub pilot_mgmt_mode: PilotMgmtMode,
    pub convergence_tol_target: ConvergenceTolTarget,
    pub cov_approximation: CovApproximation,
    /// Pilot sample count per level. A single entry applies to every level.
    pub pilot_samples: Vec<usize>,
    pub max_iterations: usize,
    pub convergence_tol: f64,
    pub convergence_tol_type: ConvergenceTolType,
    /// Total cost available when `convergence_tol_target` is `CostConstraint`.
    pub budget: Option<f64>,
    /// Row-major `num_functions x 2*num_functions` weights on (mean, sigma) pairs.
    pub scalarization: Option<Vec<Vec<f64>>>,
    pub final_moments: FinalMoments,
    pub cost_source: CostSource,
    /// Damping applied to sample increments; entry `k` is used on iteration `k`,
    /// the last entry repeats. Empty means no damping.
    pub relaxation_factors: Vec<f64>,
    pub bootstrap_samples: usize,
    pub seed: u64,
    pub solver: SolverSettings,
}

impl Default for MlmcConfig {
    fn default() -> Self {
        Self {
            allocation_target: AllocationTarget::default(),
            qoi_aggregation: QoiAggregation::default(),
            pilot_mgmt_mode: PilotMgmtMode::default(),
            convergence_tol_target: ConvergenceTolTarget::default(),
            cov_approximation: CovApproximation::default(),
            pilot_samples: vec![100],
            max_iterations: 25,
            convergence_tol: 1e-2,
            convergence_tol_type: ConvergenceTolType::default(),
            budget: None,
            scalarization: None,
            final_moments: FinalMoments::default(),
            cost_source: CostSource::default(),
            relaxation_factors: Vec::new(),
            bootstrap_samples: 100,
            seed: 12345,
            solver: SolverSettings::default(),
        }
    }
}

impl MlmcConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Pilot counts expanded to one entry per level.
    pub fn pilot_for(&self, num_levels: usize) -> Vec<usize> {
        match self.pilot_samples.as_slice() {
            [single] => vec![*single; num_levels],
            many => many.to_vec(),
        }
    }

    pub fn relaxation(&self, iteration: usize) -> f64 {
        match self.relaxation_factors.len() {
            0 => 1.0,
            len => self.relaxation_factors[iteration.min(len - 1)],
        }
    }

    /// Checks everything that would make the run meaningless before any
    /// sample is drawn.
    pub fn validate(&self, num_functions: usize, num_levels: usize) -> Result<()> {
        if num_levels == 0 {
            return Err(MlmcError::Config("model hierarchy has no levels".into()));
        }
        if num_functions == 0 {
            return Err(MlmcError::Config("model has no response functions".into()));
        }
        let pilot = self.pilot_for(num_levels);
        if pilot.len() != num_levels {
            return Err(MlmcError::Config(format!(
                "pilot_samples has {} entries for {} levels",
                pilot.len(),
                num_levels
            )));
        }
        if pilot.iter().all(|&n| n == 0) {
            return Err(MlmcError::EmptyPilot);
        }
        if !(self.convergence_tol.is_finite() && self.convergence_tol > 0.0) {
            return Err(MlmcError::Config(format!(
                "convergence_tol must be positive, got {}",
                self.convergence_tol
            )));
        }
        if let Some(bad) = self
            .relaxation_factors
            .iter()
            .find(|r| !(r.is_finite() && **r > 0.0 && **r <= 1.0))
        {
            return Err(MlmcError::Config(format!(
                "relaxation factors must lie in (0, 1], got {bad}"
            )));
        }
        if self.cov_approximation == CovApproximation::Bootstrap && self.bootstrap_samples < 2 {
            return Err(MlmcError::Config(
                "bootstrap covariance needs at least 2 resamples".into(),
            ));
        }
        if self.convergence_tol_target == ConvergenceTolTarget::CostConstraint {
            match self.budget {
                Some(b) if b.is_finite() && b > 0.0 => {}
                _ => {
                    return Err(MlmcError::Config(
                        "cost-constrained allocation requires a positive budget".into(),
                    ))
                }
            }
            if self.qoi_aggregation == QoiAggregation::Max {
                return Err(MlmcError::Unsupported(
                    "MAX qoi aggregation with a cost constraint".into(),
                ));
            }
        }
        self.scalarization_map(num_functions).map(|_| ())
    }

    /// The mapping used for scalarized statistics. Mean and variance/sigma
    /// targets get an identity on the matching slot when no matrix is given.
    pub fn scalarization_map(&self, num_functions: usize) -> Result<ScalarizationMap> {
        match (&self.scalarization, self.allocation_target) {
            (Some(rows), _) => ScalarizationMap::from_rows(rows, num_functions),
            (None, AllocationTarget::Scalarization) => Err(MlmcError::Config(
                "SCALARIZATION target requires a scalarization matrix".into(),
            )),
            (None, AllocationTarget::Mean) => Ok(ScalarizationMap::identity_mean(num_functions)),
            (None, AllocationTarget::Variance | AllocationTarget::Sigma) => {
                Ok(ScalarizationMap::identity_sigma(num_functions))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_pilot_broadcast() {
        let config = MlmcConfig::default();
        assert_eq!(config.pilot_for(3), vec![100, 100, 100]);
        assert_eq!(config.relaxation(7), 1.0);
        assert!(config.validate(2, 3).is_ok());
    }

    #[test]
    fn test_json_enums() {
        let config = MlmcConfig::from_json_str(
            r#"{
                "allocation_target": "SIGMA",
                "qoi_aggregation": "MAX",
                "pilot_mgmt_mode": "OFFLINE_PILOT_PROJECTION",
                "cov_approximation": "PEARSON",
                "pilot_samples": [50, 20],
                "relaxation_factors": [0.5, 1.0]
            }"#,
        )
        .unwrap();
        assert_eq!(config.allocation_target, AllocationTarget::Sigma);
        assert_eq!(config.qoi_aggregation, QoiAggregation::Max);
        assert!(config.pilot_mgmt_mode.is_offline());
        assert!(config.pilot_mgmt_mode.is_projection());
        assert_eq!(config.relaxation(0), 0.5);
        assert_eq!(config.relaxation(4), 1.0);
        assert_eq!(config.max_iterations, 25);
    }

    #[test]
    fn test_relaxation_factor_range() {
        for bad in [1.5, 0.0, -0.5, f64::NAN] {
            let config = MlmcConfig {
                relaxation_factors: vec![0.5, bad],
                ..MlmcConfig::default()
            };
            assert!(matches!(config.validate(1, 2), Err(MlmcError::Config(_))), "{bad}");
        }
        let config = MlmcConfig {
            relaxation_factors: vec![0.25, 1.0],
            ..MlmcConfig::default()
        };
        assert!(config.validate(1, 2).is_ok());
    }

    #[test]
    fn test_empty_pilot_rejected() {
        let config = MlmcConfig {
            pilot_samples: vec![0, 0],
            ..MlmcConfig::default()
        };
        assert!(matches!(config.validate(1, 2), Err(MlmcError::EmptyPilot)));
    }

    #[test]
    fn test_pilot_length_mismatch() {
        let config = MlmcConfig {
            pilot_samples: vec![10, 10],
            ..MlmcConfig::default()
        };
        assert!(matches!(config.validate(1, 3), Err(MlmcError::Config(_))));
    }

    #[test]
    fn test_scalarization_required() {
        let config = MlmcConfig {
            allocation_target: AllocationTarget::Scalarization,
            ..MlmcConfig::default()
        };
        assert!(matches!(config.validate(2, 2), Err(MlmcError::Config(_))));

        let config = MlmcConfig {
            scalarization: Some(vec![vec![1.0, 2.0, 0.0]]),
            ..config
        };
        assert!(matches!(
            config.validate(2, 2),
            Err(MlmcError::ScalarizationShape { .. })
        ));
    }

    #[test]
    fn test_cost_constraint_checks() {
        let config = MlmcConfig {
            convergence_tol_target: ConvergenceTolTarget::CostConstraint,
            ..MlmcConfig::default()
        };
        assert!(matches!(config.validate(1, 2), Err(MlmcError::Config(_))));

        let config = MlmcConfig {
            budget: Some(100.0),
            qoi_aggregation: QoiAggregation::Max,
            ..config
        };
        assert!(matches!(config.validate(1, 2), Err(MlmcError::Unsupported(_))));
    }
}
