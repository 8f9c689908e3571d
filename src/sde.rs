use ndarray::{Array1, Array2, ArrayView1, Zip};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand_chacha::ChaCha8Rng;

use crate::error::{MlmcError, Result};
use crate::evaluator::{EvaluationMode, Evaluator, LevelResponse, SamplePoint};

/// Parameters of `dX = -X^p dt + sqrt(2) sig dW`, `X(0) = x0`, on `[0, t]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdeParams {
    pub p: f64,
    pub t: f64,
    pub sig: f64,
    pub x0: f64,
}

impl Default for SdeParams {
    fn default() -> Self {
        Self { p: 1.0, t: 0.1, sig: 1.0, x0: 1.2 }
    }
}

/// Euler–Maruyama hierarchy: level `l` takes `2^l` steps, and its coarse
/// path takes `2^(l-1)` steps driven by the summed fine increments.
///
/// QoIs are the terminal value and the time average of the path.
#[derive(Debug, Clone)]
pub struct SdeModel {
    params: SdeParams,
    num_levels: usize,
}

/// Terminal value and running sum of one batch of paths.
struct Paths {
    x: Array1<f64>,
    sum: Array1<f64>,
    steps: usize,
}

impl Paths {
    fn new(n: usize, x0: f64) -> Self {
        Self {
            x: Array1::from_elem(n, x0),
            sum: Array1::zeros(n),
            steps: 0,
        }
    }

    fn qoi(&self, i: usize) -> Vec<f64> {
        vec![self.x[i], self.sum[i] / self.steps as f64]
    }
}

impl SdeModel {
    pub fn new(params: SdeParams, num_levels: usize) -> Self {
        Self { params, num_levels }
    }

    pub fn params(&self) -> &SdeParams {
        &self.params
    }

    fn step(&self, paths: &mut Paths, h: f64, dw: ArrayView1<f64>) {
        let p = self.params.p;
        let noise = 2.0f64.sqrt() * self.params.sig;
        Zip::from(&mut paths.x)
            .and(&mut paths.sum)
            .and(&dw)
            .for_each(|x, s, &w| {
                *x = *x - x.powf(p) * h + noise * w;
                *s += *x;
            });
        paths.steps += 1;
    }

    /// Brownian increments `[point][step]`; each row comes from the point's
    /// own seed so fine and coarse paths share it.
    fn increments(&self, level: usize, points: &[SamplePoint], steps: usize, h: f64) -> Result<Array2<f64>> {
        let normal = Normal::new(0.0, h.sqrt()).map_err(|e| MlmcError::Evaluation {
            level,
            reason: e.to_string(),
        })?;
        let mut dw = Array2::zeros((points.len(), steps));
        for (mut row, point) in dw.rows_mut().into_iter().zip(points) {
            let mut rng = ChaCha8Rng::seed_from_u64(point.seed);
            row.assign(&Array1::random_using(steps, normal, &mut rng));
        }
        Ok(dw)
    }
}

impl Evaluator for SdeModel {
    fn num_levels(&self) -> usize {
        self.num_levels
    }

    fn num_functions(&self) -> usize {
        2
    }

    fn evaluate_batch(
        &mut self,
        level: usize,
        mode: EvaluationMode,
        points: &[SamplePoint],
    ) -> Result<Vec<LevelResponse>> {
        if level >= self.num_levels {
            return Err(MlmcError::Evaluation {
                level,
                reason: format!("model has {} levels", self.num_levels),
            });
        }
        let n = points.len();
        let nf = 1usize << level;
        let hf = self.params.t / nf as f64;
        let dw = self.increments(level, points, nf, hf)?;

        let mut fine = Paths::new(n, self.params.x0);
        if mode == EvaluationMode::Fine || level == 0 {
            for k in 0..nf {
                self.step(&mut fine, hf, dw.column(k));
            }
            return Ok((0..n).map(|i| LevelResponse::fine(fine.qoi(i))).collect());
        }

        let hc = 2.0 * hf;
        let mut coarse = Paths::new(n, self.params.x0);
        for k in 0..nf / 2 {
            let dwf0 = dw.column(2 * k);
            let dwf1 = dw.column(2 * k + 1);
            self.step(&mut fine, hf, dwf0);
            self.step(&mut fine, hf, dwf1);
            let dwc = &dwf0 + &dwf1;
            self.step(&mut coarse, hc, dwc.view());
        }
        Ok((0..n)
            .map(|i| LevelResponse::paired(fine.qoi(i), coarse.qoi(i)))
            .collect())
    }

    fn cost_per_level(&self) -> Option<Vec<f64>> {
        Some((0..self.num_levels).map(|l| (1usize << l) as f64).collect())
    }
}
