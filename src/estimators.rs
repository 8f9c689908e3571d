//! Moment and estimator-variance formulas for accumulated level sums.
//!
//! Everything here is a pure function of a [`LevelSums`] snapshot. The
//! `*_at` methods take the sample count as a real variable so the
//! allocation optimizer can evaluate them (and their derivatives) at
//! candidate allocations while the moments stay fixed at their current
//! estimates.

use ndarray_rand::rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use crate::accumulator::{Accumulators, LevelSums};

/// Clamps a negative (or NaN) variance-type estimate to zero and reports it.
pub fn clamp_nonnegative(value: f64, what: &str) -> f64 {
    if value >= 0.0 {
        value
    } else {
        warn!(value, what, "negative estimate clamped to zero");
        0.0
    }
}

/// Unbiased central moments of one variable, plus the plug-in fourth
/// central moment used by the variance-of-variance formulas.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CentralMoments {
    pub mean: f64,
    pub var: f64,
    pub cm3: f64,
    pub cm4: f64,
    pub m4: f64,
}

impl CentralMoments {
    /// Converts raw power sums of `n` samples into unbiased central moments.
    ///
    /// Falls back to the plug-in estimate for orders the count cannot
    /// support (`cm3` needs 3 samples, `cm4` needs 4). A zero sample
    /// variance zeroes every higher moment exactly.
    pub fn from_power_sums(sums: &[f64; 4], n: usize) -> Self {
        if n == 0 {
            return Self::default();
        }
        let nf = n as f64;
        let a1 = sums[0] / nf;
        if n == 1 {
            return Self { mean: a1, ..Self::default() };
        }
        let a2 = sums[1] / nf;
        let a3 = sums[2] / nf;
        let a4 = sums[3] / nf;
        let m2 = a2 - a1 * a1;
        if m2 <= 0.0 {
            if m2 < 0.0 {
                clamp_nonnegative(m2, "second central moment");
            }
            return Self { mean: a1, ..Self::default() };
        }
        let m3 = a3 - 3.0 * a1 * a2 + 2.0 * a1 * a1 * a1;
        let m4 = a4 - 4.0 * a1 * a3 + 6.0 * a1 * a1 * a2 - 3.0 * a1.powi(4);

        let var = m2 * nf / (nf - 1.0);
        let cm3 = if n >= 3 {
            m3 * nf * nf / ((nf - 1.0) * (nf - 2.0))
        } else {
            m3
        };
        let cm4 = if n >= 4 {
            (nf * (nf * nf - 2.0 * nf + 3.0) * m4 - 3.0 * nf * (2.0 * nf - 3.0) * m2 * m2)
                / ((nf - 1.0) * (nf - 2.0) * (nf - 3.0))
        } else {
            m4
        };
        Self { mean: a1, var, cm3, cm4, m4 }
    }
}

/// `Var[S^2]` of an unbiased sample variance from `n` samples.
fn var_of_sample_variance(m4: f64, var: f64, n: f64) -> f64 {
    m4 / n - (n - 3.0) / (n * (n - 1.0)) * var * var
}

fn d_var_of_sample_variance(m4: f64, var: f64, n: f64) -> f64 {
    let nm1 = n - 1.0;
    -m4 / (n * n) - var * var * (-n * n + 6.0 * n - 3.0) / (n * n * nm1 * nm1)
}

/// `Cov[S_a^2, S_b^2]` of paired sample variances from `n` samples.
fn cov_of_sample_variances(mu22: f64, var_a: f64, var_b: f64, cov_ab: f64, n: f64) -> f64 {
    (mu22 - var_a * var_b) / n + 2.0 * cov_ab * cov_ab / (n * (n - 1.0))
}

fn d_cov_of_sample_variances(mu22: f64, var_a: f64, var_b: f64, cov_ab: f64, n: f64) -> f64 {
    let denom = n * (n - 1.0);
    -(mu22 - var_a * var_b) / (n * n) - 2.0 * cov_ab * cov_ab * (2.0 * n - 1.0) / (denom * denom)
}

/// Statistics of one level for one QoI.
///
/// On level 0 the "discrepancy" is the fine quantity itself and every
/// coarse entry is zero, which makes the level-pair formulas collapse to
/// their single-variable forms.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelStatistics {
    pub n: usize,
    pub fine: CentralMoments,
    pub coarse: CentralMoments,
    pub mean_y: f64,
    pub var_y: f64,
    pub cov_fine_coarse: f64,
    /// `E[(Q_l - m_l)^2 (Q_{l-1} - m_{l-1})^2]`.
    pub mu22: f64,
    /// `n * Cov[mean(Y), S^2_l - S^2_{l-1}]`; the third central moment on level 0.
    pub coupling: f64,
    /// Resampled covariances scaled by `n`, if computed.
    pub bootstrap_cov: Option<BootstrapCovariance>,
}

impl LevelStatistics {
    pub fn from_sums(level: usize, sums: &LevelSums) -> Self {
        let n = sums.count;
        let fine = CentralMoments::from_power_sums(&sums.ql, n);
        if level == 0 || n == 0 {
            return Self {
                n,
                fine,
                mean_y: fine.mean,
                var_y: fine.var,
                coupling: fine.cm3,
                ..Self::default()
            };
        }
        let coarse = CentralMoments::from_power_sums(&sums.qlm1, n);
        let nf = n as f64;
        let (a1, a2) = (sums.ql[0] / nf, sums.ql[1] / nf);
        let (b1, b2) = (sums.qlm1[0] / nf, sums.qlm1[1] / nf);
        let c11 = sums.cross[0][0] / nf;
        let c12 = sums.cross[0][1] / nf;
        let c21 = sums.cross[1][0] / nf;
        let c22 = sums.cross[1][1] / nf;

        let mean_y = a1 - b1;
        if n == 1 {
            return Self { n, fine, coarse, mean_y, ..Self::default() };
        }
        let bessel = nf / (nf - 1.0);
        let y2 = (sums.ql[1] - 2.0 * sums.cross[0][0] + sums.qlm1[1]) / nf;
        let m2_y = y2 - mean_y * mean_y;
        let var_y = if m2_y == 0.0 {
            0.0
        } else {
            clamp_nonnegative(m2_y * bessel, "discrepancy variance")
        };
        let cov_fine_coarse = (c11 - a1 * b1) * bessel;

        let mu22 = if fine.var > 0.0 && coarse.var > 0.0 {
            let raw = c22 - 2.0 * b1 * c21 - 2.0 * a1 * c12 + b1 * b1 * a2 + a1 * a1 * b2
                + 4.0 * a1 * b1 * c11
                - 3.0 * a1 * a1 * b1 * b1;
            clamp_nonnegative(raw, "fine/coarse fourth co-moment")
        } else {
            0.0
        };

        let coupling = if var_y > 0.0 {
            let (a3, b3) = (sums.ql[2] / nf, sums.qlm1[2] / nf);
            let m3_a = a3 - 3.0 * a1 * a2 + 2.0 * a1 * a1 * a1;
            let m3_b = b3 - 3.0 * b1 * b2 + 2.0 * b1 * b1 * b1;
            let mu21 = c21 - b1 * a2 - 2.0 * a1 * c11 + 2.0 * a1 * a1 * b1;
            let mu12 = c12 - a1 * b2 - 2.0 * b1 * c11 + 2.0 * a1 * b1 * b1;
            let plug_in = m3_a - mu21 - mu12 + m3_b;
            if n >= 3 {
                plug_in * nf * nf / ((nf - 1.0) * (nf - 2.0))
            } else {
                plug_in
            }
        } else {
            0.0
        };

        Self {
            n,
            fine,
            coarse,
            mean_y,
            var_y,
            cov_fine_coarse,
            mu22,
            coupling,
            bootstrap_cov: None,
        }
    }

    fn degenerate(&self) -> bool {
        self.n < 2
    }

    /// Variance of the level's mean estimator with `n` samples.
    pub fn variance_of_mean_at(&self, n: f64) -> f64 {
        if self.degenerate() || n <= 0.0 {
            0.0
        } else {
            self.var_y / n
        }
    }

    pub fn d_variance_of_mean(&self, n: f64) -> f64 {
        if self.degenerate() || n <= 0.0 {
            0.0
        } else {
            -self.var_y / (n * n)
        }
    }

    fn raw_variance_of_variance(&self, n: f64) -> f64 {
        let f = &self.fine;
        let c = &self.coarse;
        var_of_sample_variance(f.m4, f.var, n) + var_of_sample_variance(c.m4, c.var, n)
            - 2.0 * cov_of_sample_variances(self.mu22, f.var, c.var, self.cov_fine_coarse, n)
    }

    /// Variance of `S^2_l - S^2_{l-1}` (or `S^2_0` on level 0) with `n`
    /// samples, clamped at zero.
    pub fn variance_of_variance_at(&self, n: f64) -> f64 {
        if self.degenerate() || n <= 1.0 {
            return 0.0;
        }
        self.raw_variance_of_variance(n).max(0.0)
    }

    pub fn d_variance_of_variance(&self, n: f64) -> f64 {
        if self.degenerate() || n <= 1.0 || self.raw_variance_of_variance(n) <= 0.0 {
            return 0.0;
        }
        let f = &self.fine;
        let c = &self.coarse;
        d_var_of_sample_variance(f.m4, f.var, n) + d_var_of_sample_variance(c.m4, c.var, n)
            - 2.0 * d_cov_of_sample_variances(self.mu22, f.var, c.var, self.cov_fine_coarse, n)
    }

    /// Analytic `Cov[mean(Y), S^2_l - S^2_{l-1}]` with `n` samples; `mu3 / n`
    /// on level 0.
    pub fn covariance_mean_variance_at(&self, n: f64) -> f64 {
        if self.degenerate() || n <= 0.0 {
            0.0
        } else {
            self.coupling / n
        }
    }

    pub fn d_covariance_mean_variance(&self, n: f64) -> f64 {
        if self.degenerate() || n <= 0.0 {
            0.0
        } else {
            -self.coupling / (n * n)
        }
    }
}

/// Per-level statistics of one QoI plus the multilevel variance estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct QoiStatistics {
    pub levels: Vec<LevelStatistics>,
    /// Telescoped estimate of `Var[Q_L]`, clamped at zero.
    pub total_variance: f64,
}

impl QoiStatistics {
    pub fn new(levels: Vec<LevelStatistics>) -> Self {
        let raw: f64 = levels
            .iter()
            .filter(|s| s.n >= 2)
            .map(|s| s.fine.var - s.coarse.var)
            .sum();
        let total_variance = if raw == 0.0 {
            0.0
        } else {
            clamp_nonnegative(raw, "multilevel variance")
        };
        Self { levels, total_variance }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn counts(&self) -> Vec<f64> {
        self.levels.iter().map(|s| s.n as f64).collect()
    }

    /// `1 / (4 sigma^2)`, the delta-method factor from variance to sigma.
    pub fn sigma_factor(&self) -> f64 {
        if self.total_variance > 0.0 {
            0.25 / self.total_variance
        } else {
            0.0
        }
    }

    pub fn variance_of_mean(&self, level: usize) -> f64 {
        let s = &self.levels[level];
        s.variance_of_mean_at(s.n as f64)
    }

    /// Variance of the level's variance estimator at the sampled count.
    /// Unlike [`LevelStatistics::variance_of_variance_at`], a negative
    /// estimate is reported before it is clamped.
    pub fn variance_of_variance(&self, level: usize) -> f64 {
        let s = &self.levels[level];
        if s.degenerate() {
            return 0.0;
        }
        clamp_nonnegative(s.raw_variance_of_variance(s.n as f64), "variance of variance")
    }

    /// `N * Var[S^2]`: the per-sample contribution that follows the `1/N`
    /// scaling of the square-root allocation law.
    pub fn variance_of_variance_per_sample(&self, level: usize) -> f64 {
        self.levels[level].n as f64 * self.variance_of_variance(level)
    }

    pub fn variance_of_sigma(&self, level: usize) -> f64 {
        let s = &self.levels[level];
        self.variance_of_sigma_at(level, s.n as f64)
    }

    pub fn variance_of_sigma_at(&self, level: usize, n: f64) -> f64 {
        self.sigma_factor() * self.levels[level].variance_of_variance_at(n)
    }

    pub fn d_variance_of_sigma(&self, level: usize, n: f64) -> f64 {
        self.sigma_factor() * self.levels[level].d_variance_of_variance(n)
    }

    /// `Cov[mean(Y), S^2_l - S^2_{l-1}]` at the sampled count.
    pub fn covariance_mean_variance(&self, level: usize, model: CovarianceModel) -> f64 {
        let s = &self.levels[level];
        model.variance_covariance_at(self, level, s.n as f64)
    }

    pub fn covariance_mean_sigma(&self, level: usize, model: CovarianceModel) -> f64 {
        let s = &self.levels[level];
        model.covariance_at(self, level, s.n as f64)
    }
}

/// Estimator of `Cov[mean, sigma]` for one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovarianceModel {
    /// Resampled estimate computed once per snapshot and scaled as `1/N`.
    Bootstrap,
    /// `sqrt(Var[mean] * Var[sigma])`; an upper bound that ignores sign.
    Pearson,
    /// Third-moment expression `Cov[mean, S^2] / (2 sigma)`.
    CorrLift,
}

impl From<crate::config::CovApproximation> for CovarianceModel {
    fn from(kind: crate::config::CovApproximation) -> Self {
        use crate::config::CovApproximation;
        match kind {
            CovApproximation::Bootstrap => Self::Bootstrap,
            CovApproximation::Pearson => Self::Pearson,
            CovApproximation::CorrLift => Self::CorrLift,
        }
    }
}

impl CovarianceModel {
    pub fn covariance_at(self, stats: &QoiStatistics, level: usize, n: f64) -> f64 {
        let s = &stats.levels[level];
        if s.n < 2 || n <= 0.0 {
            return 0.0;
        }
        match self {
            Self::Bootstrap => s.bootstrap_cov.map_or(0.0, |b| b.mean_sigma) / n,
            Self::Pearson => {
                let product = s.variance_of_mean_at(n) * stats.variance_of_sigma_at(level, n);
                if product > 0.0 {
                    product.sqrt()
                } else {
                    0.0
                }
            }
            Self::CorrLift => {
                if stats.total_variance > 0.0 {
                    s.covariance_mean_variance_at(n) / (2.0 * stats.total_variance.sqrt())
                } else {
                    0.0
                }
            }
        }
    }

    pub fn derivative_at(self, stats: &QoiStatistics, level: usize, n: f64) -> f64 {
        let s = &stats.levels[level];
        if s.n < 2 || n <= 0.0 {
            return 0.0;
        }
        match self {
            Self::Bootstrap => -s.bootstrap_cov.map_or(0.0, |b| b.mean_sigma) / (n * n),
            Self::Pearson => {
                let vm = s.variance_of_mean_at(n);
                let vs = stats.variance_of_sigma_at(level, n);
                let p = (vm * vs).max(0.0).sqrt();
                if p > 0.0 {
                    (s.d_variance_of_mean(n) * vs + vm * stats.d_variance_of_sigma(level, n))
                        / (2.0 * p)
                } else {
                    0.0
                }
            }
            Self::CorrLift => {
                if stats.total_variance > 0.0 {
                    s.d_covariance_mean_variance(n) / (2.0 * stats.total_variance.sqrt())
                } else {
                    0.0
                }
            }
        }
    }

    /// Estimator of `Cov[mean(Y), S^2_l - S^2_{l-1}]` with `n` samples, the
    /// counterpart of [`covariance_at`](Self::covariance_at) for the variance.
    pub fn variance_covariance_at(self, stats: &QoiStatistics, level: usize, n: f64) -> f64 {
        let s = &stats.levels[level];
        if s.n < 2 || n <= 0.0 {
            return 0.0;
        }
        match self {
            Self::Bootstrap => s.bootstrap_cov.map_or(0.0, |b| b.mean_variance) / n,
            Self::Pearson => {
                let product = s.variance_of_mean_at(n) * s.variance_of_variance_at(n);
                if product > 0.0 {
                    product.sqrt()
                } else {
                    0.0
                }
            }
            Self::CorrLift => s.covariance_mean_variance_at(n),
        }
    }
}

/// Resampled covariances of the level mean with the two spread statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BootstrapCovariance {
    /// With `sigma_l - sigma_{l-1}`.
    pub mean_sigma: f64,
    /// With `S^2_l - S^2_{l-1}`.
    pub mean_variance: f64,
}

impl BootstrapCovariance {
    fn scaled(self, factor: f64) -> Self {
        Self {
            mean_sigma: self.mean_sigma * factor,
            mean_variance: self.mean_variance * factor,
        }
    }
}

fn sample_variance(values: impl Iterator<Item = f64> + Clone, n: f64) -> f64 {
    let mean = values.clone().sum::<f64>() / n;
    let ss: f64 = values.map(|v| (v - mean) * (v - mean)).sum();
    (ss / (n - 1.0)).max(0.0)
}

fn covariance(pairs: &[(f64, f64)]) -> f64 {
    let b = pairs.len() as f64;
    let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / b;
    let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / b;
    pairs.iter().map(|(a, c)| (a - mean_a) * (c - mean_b)).sum::<f64>() / (b - 1.0)
}

/// Bootstrap covariances of `mean(Y)` with `sigma_l - sigma_{l-1}` and with
/// `S^2_l - S^2_{l-1}` for one level at its current sample count. `coarse`
/// selects whether the paired coarse values take part (levels above 0).
pub fn bootstrap_covariances(
    samples: &[(f64, f64)],
    coarse: bool,
    resamples: usize,
    rng: &mut ChaCha8Rng,
) -> BootstrapCovariance {
    let n = samples.len();
    if n < 2 || resamples < 2 {
        return BootstrapCovariance::default();
    }
    let nf = n as f64;
    let mut with_sigma = Vec::with_capacity(resamples);
    let mut with_variance = Vec::with_capacity(resamples);
    let mut draw = vec![(0.0, 0.0); n];
    for _ in 0..resamples {
        for slot in draw.iter_mut() {
            *slot = samples[rng.gen_range(0..n)];
        }
        let mean_y = draw.iter().map(|(f, c)| f - c).sum::<f64>() / nf;
        let fine = sample_variance(draw.iter().map(|p| p.0), nf);
        let (mut sigma, mut variance) = (fine.sqrt(), fine);
        if coarse {
            let coarse = sample_variance(draw.iter().map(|p| p.1), nf);
            sigma -= coarse.sqrt();
            variance -= coarse;
        }
        with_sigma.push((mean_y, sigma));
        with_variance.push((mean_y, variance));
    }
    BootstrapCovariance {
        mean_sigma: covariance(&with_sigma),
        mean_variance: covariance(&with_variance),
    }
}

/// Snapshot of every level and QoI derived from the accumulators.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub qoi: Vec<QoiStatistics>,
}

impl Statistics {
    /// Builds the snapshot. With `bootstrap = Some((resamples, seed))` the
    /// resampled covariance is computed here once, from the retained
    /// samples.
    pub fn from_accumulators(acc: &Accumulators, bootstrap: Option<(usize, u64)>) -> Self {
        let num_levels = acc.num_levels();
        let num_functions = acc.num_functions();
        let qoi = (0..num_functions)
            .map(|q| {
                let levels = (0..num_levels)
                    .map(|l| {
                        let mut stats = LevelStatistics::from_sums(l, acc.sums(l, q));
                        if let Some((resamples, seed)) = bootstrap {
                            stats.bootstrap_cov = match acc.samples(l, q) {
                                Some(samples) => {
                                    let stream = (l * num_functions + q) as u64;
                                    let mut rng = ChaCha8Rng::seed_from_u64(seed);
                                    rng.set_stream(stream);
                                    let cov = bootstrap_covariances(samples, l > 0, resamples, &mut rng);
                                    Some(cov.scaled(samples.len() as f64))
                                }
                                None => {
                                    warn!(level = l, qoi = q, "bootstrap requested without retained samples");
                                    None
                                }
                            };
                        }
                        debug!(
                            level = l,
                            qoi = q,
                            n = stats.n,
                            mean_y = stats.mean_y,
                            var_y = stats.var_y,
                            "level statistics"
                        );
                        stats
                    })
                    .collect();
                QoiStatistics::new(levels)
            })
            .collect();
        Self { qoi }
    }

    pub fn num_functions(&self) -> usize {
        self.qoi.len()
    }

    pub fn num_levels(&self) -> usize {
        self.qoi.first().map_or(0, QoiStatistics::num_levels)
    }
}
