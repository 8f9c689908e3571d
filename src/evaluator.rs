use ndarray_rand::rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::Result;

/// One input point of a sample batch.
///
/// The seed drives any stochastic input of the model (for example a
/// Brownian path); fine and coarse evaluations of the same point must use
/// it identically so that their difference is a paired discrepancy.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePoint {
    pub seed: u64,
    pub params: Vec<f64>,
}

/// Seeded source of input points.
#[derive(Debug, Clone)]
pub struct SampleGenerator {
    rng: ChaCha8Rng,
    bounds: Vec<(f64, f64)>,
}

impl SampleGenerator {
    pub fn new(seed: u64, bounds: Vec<(f64, f64)>) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            bounds,
        }
    }

    pub fn draw(&mut self, n: usize) -> Vec<SamplePoint> {
        (0..n)
            .map(|_| {
                let seed = self.rng.gen::<u64>();
                let params = self
                    .bounds
                    .iter()
                    .map(|&(lo, hi)| if hi > lo { self.rng.gen_range(lo..hi) } else { lo })
                    .collect();
                SamplePoint { seed, params }
            })
            .collect()
    }
}

/// Which responses a level evaluation must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Level 0: the fine response only.
    Fine,
    /// Levels above 0: fine and coarse responses of the same point.
    FineCoarse,
}

impl EvaluationMode {
    pub fn for_level(level: usize) -> Self {
        if level == 0 {
            Self::Fine
        } else {
            Self::FineCoarse
        }
    }
}

/// Responses for one sample point. Any component may be NaN or infinite to
/// flag a failed evaluation of that QoI.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelResponse {
    pub fine: Vec<f64>,
    pub coarse: Option<Vec<f64>>,
}

impl LevelResponse {
    pub fn fine(fine: Vec<f64>) -> Self {
        Self { fine, coarse: None }
    }

    pub fn paired(fine: Vec<f64>, coarse: Vec<f64>) -> Self {
        Self {
            fine,
            coarse: Some(coarse),
        }
    }
}

/// Black-box model hierarchy consumed by the controller.
pub trait Evaluator {
    fn num_levels(&self) -> usize;

    fn num_functions(&self) -> usize;

    /// Ranges of the uniform parameters carried by each sample point.
    fn input_bounds(&self) -> Vec<(f64, f64)> {
        Vec::new()
    }

    /// Evaluates every point at `level`, returning one response per point in
    /// input order.
    fn evaluate_batch(
        &mut self,
        level: usize,
        mode: EvaluationMode,
        points: &[SamplePoint],
    ) -> Result<Vec<LevelResponse>>;

    /// A-priori cost per sample of each level, if known.
    fn cost_per_level(&self) -> Option<Vec<f64>>;

    fn cost_for(&self, level: usize) -> Option<f64> {
        self.cost_per_level().and_then(|c| c.get(level).copied())
    }
}
