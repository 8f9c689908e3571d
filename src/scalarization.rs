use ndarray::Array2;

use crate::error::{MlmcError, Result};

/// Per-QoI estimator contributions that a scalarization combines.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatisticTerms {
    pub var_mean: f64,
    pub var_sigma: f64,
    pub cov_mean_sigma: f64,
}

/// Linear map from `(mean_j, sigma_j)` pairs of every QoI onto one scalar
/// per QoI. Column `2j` weights the mean of QoI `j`, column `2j + 1` its
/// sigma.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarizationMap {
    coeffs: Array2<f64>,
}

impl ScalarizationMap {
    pub fn identity_mean(num_functions: usize) -> Self {
        let mut coeffs = Array2::zeros((num_functions, 2 * num_functions));
        for q in 0..num_functions {
            coeffs[[q, 2 * q]] = 1.0;
        }
        Self { coeffs }
    }

    pub fn identity_sigma(num_functions: usize) -> Self {
        let mut coeffs = Array2::zeros((num_functions, 2 * num_functions));
        for q in 0..num_functions {
            coeffs[[q, 2 * q + 1]] = 1.0;
        }
        Self { coeffs }
    }

    pub fn from_rows(rows: &[Vec<f64>], num_functions: usize) -> Result<Self> {
        let cols = 2 * num_functions;
        let got_cols = rows.first().map_or(0, Vec::len);
        if rows.len() != num_functions || rows.iter().any(|r| r.len() != cols) {
            return Err(MlmcError::ScalarizationShape {
                rows: num_functions,
                cols,
                got_rows: rows.len(),
                got_cols,
            });
        }
        if rows.iter().flatten().any(|w| !w.is_finite()) {
            return Err(MlmcError::Config(
                "scalarization weights must be finite".into(),
            ));
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let coeffs = Array2::from_shape_vec((num_functions, cols), flat)
            .map_err(|e| MlmcError::Config(e.to_string()))?;
        Ok(Self { coeffs })
    }

    pub fn num_functions(&self) -> usize {
        self.coeffs.nrows()
    }

    pub fn mean_weight(&self, qoi: usize, other: usize) -> f64 {
        self.coeffs[[qoi, 2 * other]]
    }

    pub fn sigma_weight(&self, qoi: usize, other: usize) -> f64 {
        self.coeffs[[qoi, 2 * other + 1]]
    }

    /// Variance of the scalarized estimator for `qoi`.
    ///
    /// Covariances between estimators of different QoIs are neglected; only
    /// the mean/sigma covariance of each QoI with itself enters.
    pub fn scalarized_variance(&self, qoi: usize, terms: &[StatisticTerms]) -> f64 {
        terms
            .iter()
            .enumerate()
            .map(|(j, t)| {
                let wm = self.mean_weight(qoi, j);
                let ws = self.sigma_weight(qoi, j);
                wm * wm * t.var_mean + ws * ws * t.var_sigma + 2.0 * wm * ws * t.cov_mean_sigma
            })
            .sum()
    }

    pub fn scalarized_value(&self, qoi: usize, means: &[f64], sigmas: &[f64]) -> f64 {
        means
            .iter()
            .zip(sigmas)
            .enumerate()
            .map(|(j, (m, s))| self.mean_weight(qoi, j) * m + self.sigma_weight(qoi, j) * s)
            .sum()
    }
}
