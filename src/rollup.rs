//! Final moments and error reporting from the last accumulator snapshot.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::config::FinalMoments;
use crate::error::Result;
use crate::estimators::{clamp_nonnegative, CovarianceModel, QoiStatistics, Statistics};
use crate::mlmc::IterationRecord;
use crate::scalarization::{ScalarizationMap, StatisticTerms};
use crate::utility::log2_rate;

/// Least-squares decay and growth rates across levels, in log2 units:
/// `|E[Y_l]| ~ 2^(-alpha l)`, `Var[Y_l] ~ 2^(-beta l)`, `C_l ~ 2^(gamma l)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelRates {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QoiSummary {
    pub moments: [f64; 4],
    pub std_error_mean: f64,
    /// Standard error of the standard deviation for standardized moments,
    /// of the variance otherwise.
    pub std_error_spread: f64,
    /// Covariance of the mean estimator with the spread estimator above.
    pub cov_mean_spread: f64,
    pub scalarized_value: Option<f64>,
    pub scalarized_std_error: Option<f64>,
    /// MLMC mean-estimator variance over single-level MC on the finest
    /// level at the same cost.
    pub variance_ratio_vs_mc: Option<f64>,
    pub rates: Option<LevelRates>,
}

/// Estimator variance the allocation would reach without drawing the
/// samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projection {
    pub samples: Vec<usize>,
    pub estimator_variance: Vec<f64>,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MlmcResults {
    pub moment_kind: FinalMoments,
    pub qoi: Vec<QoiSummary>,
    /// Valid samples `[level][qoi]`.
    pub actual_counts: Vec<Vec<usize>>,
    pub allocated_counts: Vec<usize>,
    pub costs: Vec<f64>,
    pub equivalent_cost: f64,
    pub equivalent_hf_evals: f64,
    /// Estimator variance of the allocation target per QoI.
    pub estimator_variance: Vec<f64>,
    pub projection: Option<Projection>,
    pub iterations: Vec<IterationRecord>,
    pub converged: bool,
    pub allocation_warnings: Vec<String>,
}

impl MlmcResults {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path.as_ref(), self.to_json()?)?;
        info!(path = %path.as_ref().display(), "results written");
        Ok(())
    }
}

/// Telescoped mean and central moments 2-4 of the finest-level QoI.
pub fn telescoped_central_moments(stats: &QoiStatistics) -> [f64; 4] {
    let mean = stats.levels.iter().map(|s| s.mean_y).sum();
    let (cm3, cm4) = stats
        .levels
        .iter()
        .filter(|s| s.n >= 2)
        .fold((0.0, 0.0), |(m3, m4), s| {
            (m3 + s.fine.cm3 - s.coarse.cm3, m4 + s.fine.cm4 - s.coarse.cm4)
        });
    let cm4 = if cm4 == 0.0 {
        0.0
    } else {
        clamp_nonnegative(cm4, "fourth central moment")
    };
    [mean, stats.total_variance, cm3, cm4]
}

pub fn final_moments(stats: &QoiStatistics, kind: FinalMoments) -> [f64; 4] {
    let [mean, cm2, cm3, cm4] = telescoped_central_moments(stats);
    match kind {
        FinalMoments::Central => [mean, cm2, cm3, cm4],
        FinalMoments::Raw => [
            mean,
            cm2 + mean * mean,
            cm3 + 3.0 * mean * cm2 + mean.powi(3),
            cm4 + 4.0 * mean * cm3 + 6.0 * mean * mean * cm2 + mean.powi(4),
        ],
        FinalMoments::Standard => {
            if cm2 > 0.0 {
                let sigma = cm2.sqrt();
                [mean, sigma, cm3 / (cm2 * sigma), cm4 / (cm2 * cm2) - 3.0]
            } else {
                [mean, 0.0, 0.0, 0.0]
            }
        }
    }
}

/// `(SE[mean], SE[spread], Cov[mean, spread])`, where the spread is the
/// standard deviation for standardized moments and the variance otherwise.
pub fn standard_errors(
    stats: &QoiStatistics,
    kind: FinalMoments,
    cov: CovarianceModel,
) -> (f64, f64, f64) {
    let levels = 0..stats.num_levels();
    let var_mean: f64 = levels.clone().map(|l| stats.variance_of_mean(l)).sum();
    let (var_spread, cov_spread) = match kind {
        FinalMoments::Standard => (
            levels.clone().map(|l| stats.variance_of_sigma(l)).sum::<f64>(),
            levels.map(|l| stats.covariance_mean_sigma(l, cov)).sum::<f64>(),
        ),
        FinalMoments::Raw | FinalMoments::Central => (
            levels.clone().map(|l| stats.variance_of_variance(l)).sum::<f64>(),
            levels.map(|l| stats.covariance_mean_variance(l, cov)).sum::<f64>(),
        ),
    };
    (
        clamp_nonnegative(var_mean, "mean estimator variance").sqrt(),
        clamp_nonnegative(var_spread, "spread estimator variance").sqrt(),
        cov_spread,
    )
}

/// Value and standard error of row `qoi` of the scalarization map.
pub fn scalarized_statistic(
    stats: &Statistics,
    map: &ScalarizationMap,
    qoi: usize,
    cov: CovarianceModel,
) -> (f64, f64) {
    let means: Vec<f64> = stats.qoi.iter().map(|q| telescoped_central_moments(q)[0]).collect();
    let sigmas: Vec<f64> = stats.qoi.iter().map(|q| q.total_variance.sqrt()).collect();
    let value = map.scalarized_value(qoi, &means, &sigmas);
    let variance: f64 = (0..stats.num_levels())
        .map(|l| {
            let terms: Vec<StatisticTerms> = stats
                .qoi
                .iter()
                .map(|q| StatisticTerms {
                    var_mean: q.variance_of_mean(l),
                    var_sigma: q.variance_of_sigma(l),
                    cov_mean_sigma: q.covariance_mean_sigma(l, cov),
                })
                .collect();
            map.scalarized_variance(qoi, &terms)
        })
        .sum();
    (value, clamp_nonnegative(variance, "scalarized estimator variance").sqrt())
}

/// Convergence rates fitted over levels `1..L`; `None` below three levels
/// or when a fit is not possible.
pub fn level_rates(stats: &QoiStatistics, costs: &[f64]) -> Option<LevelRates> {
    if stats.num_levels() < 3 {
        return None;
    }
    let upper = &stats.levels[1..];
    let means: Vec<f64> = upper.iter().map(|s| s.mean_y.abs()).collect();
    let vars: Vec<f64> = upper.iter().map(|s| s.var_y).collect();
    Some(LevelRates {
        alpha: -log2_rate(1, &means)?,
        beta: -log2_rate(1, &vars)?,
        gamma: log2_rate(1, &costs[1..])?,
    })
}

/// `Var_MLMC[mean] / Var_MC[mean]` with the MC sample count that
/// `equivalent_cost` buys on the finest level.
pub fn variance_ratio_vs_mc(stats: &QoiStatistics, costs: &[f64], equivalent_cost: f64) -> Option<f64> {
    let top_cost = *costs.last()?;
    let mlmc: f64 = (0..stats.num_levels()).map(|l| stats.variance_of_mean(l)).sum();
    let mc_samples = equivalent_cost / top_cost;
    let mc = stats.total_variance / mc_samples;
    (mlmc > 0.0 && mc > 0.0 && mc.is_finite()).then(|| mlmc / mc)
}

/// Per-QoI summary of a finished run.
pub fn summarize(
    stats: &Statistics,
    map: &ScalarizationMap,
    cov: CovarianceModel,
    kind: FinalMoments,
    costs: &[f64],
    equivalent_cost: f64,
    scalarized: bool,
) -> Vec<QoiSummary> {
    stats
        .qoi
        .iter()
        .enumerate()
        .map(|(q, qoi)| {
            let (std_error_mean, std_error_spread, cov_mean_spread) = standard_errors(qoi, kind, cov);
            let scalar = scalarized.then(|| scalarized_statistic(stats, map, q, cov));
            QoiSummary {
                moments: final_moments(qoi, kind),
                std_error_mean,
                std_error_spread,
                cov_mean_spread,
                scalarized_value: scalar.map(|s| s.0),
                scalarized_std_error: scalar.map(|s| s.1),
                variance_ratio_vs_mc: variance_ratio_vs_mc(qoi, costs, equivalent_cost),
                rates: level_rates(qoi, costs),
            }
        })
        .collect()
}
