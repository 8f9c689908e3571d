use crate::evaluator::LevelResponse;

/// Highest raw power kept by the accumulators.
pub const MAX_MOMENT: usize = 4;

/// Running power sums for one (level, QoI) pair.
///
/// `ql[k - 1]` is the sum of `Q_l^k`, `qlm1[k - 1]` the sum of `Q_{l-1}^k`
/// (always zero on level 0), and `cross[i - 1][j - 1]` the sum of
/// `Q_l^i * Q_{l-1}^j` for `i, j` in `{1, 2}`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelSums {
    pub ql: [f64; MAX_MOMENT],
    pub qlm1: [f64; MAX_MOMENT],
    pub cross: [[f64; 2]; 2],
    pub count: usize,
}

impl LevelSums {
    pub fn add_fine(&mut self, q: f64) {
        let mut p = 1.0;
        for s in self.ql.iter_mut() {
            p *= q;
            *s += p;
        }
        self.count += 1;
    }

    pub fn add_pair(&mut self, fine: f64, coarse: f64) {
        let mut pf = 1.0;
        let mut pc = 1.0;
        for k in 0..MAX_MOMENT {
            pf *= fine;
            pc *= coarse;
            self.ql[k] += pf;
            self.qlm1[k] += pc;
        }
        let f2 = fine * fine;
        let c2 = coarse * coarse;
        self.cross[0][0] += fine * coarse;
        self.cross[0][1] += fine * c2;
        self.cross[1][0] += f2 * coarse;
        self.cross[1][1] += f2 * c2;
        self.count += 1;
    }
}

/// Accumulated sums for every level and QoI, plus the retained sample
/// values when a resampling estimator needs them.
#[derive(Debug, Clone)]
pub struct Accumulators {
    num_levels: usize,
    num_functions: usize,
    sums: Vec<LevelSums>,
    samples: Option<Vec<Vec<(f64, f64)>>>,
}

impl Accumulators {
    pub fn new(num_levels: usize, num_functions: usize, retain_samples: bool) -> Self {
        let cells = num_levels * num_functions;
        Self {
            num_levels,
            num_functions,
            sums: vec![LevelSums::default(); cells],
            samples: retain_samples.then(|| vec![Vec::new(); cells]),
        }
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    pub fn num_functions(&self) -> usize {
        self.num_functions
    }

    fn index(&self, level: usize, qoi: usize) -> usize {
        level * self.num_functions + qoi
    }

    /// Folds a batch of responses for `level` into the sums.
    ///
    /// A QoI component counts only when the fine value (and, above level 0,
    /// the coarse value) is finite; anything else is dropped for that QoI.
    pub fn accumulate(&mut self, level: usize, responses: &[LevelResponse]) {
        for response in responses {
            for qoi in 0..self.num_functions {
                let Some(&fine) = response.fine.get(qoi) else {
                    continue;
                };
                if !fine.is_finite() {
                    continue;
                }
                let idx = self.index(level, qoi);
                if level == 0 {
                    self.sums[idx].add_fine(fine);
                    if let Some(samples) = self.samples.as_mut() {
                        samples[idx].push((fine, 0.0));
                    }
                    continue;
                }
                let coarse = match response.coarse.as_ref().and_then(|c| c.get(qoi)) {
                    Some(&c) if c.is_finite() => c,
                    _ => continue,
                };
                self.sums[idx].add_pair(fine, coarse);
                if let Some(samples) = self.samples.as_mut() {
                    samples[idx].push((fine, coarse));
                }
            }
        }
    }

    pub fn sums(&self, level: usize, qoi: usize) -> &LevelSums {
        &self.sums[self.index(level, qoi)]
    }

    pub fn count(&self, level: usize, qoi: usize) -> usize {
        self.sums(level, qoi).count
    }

    /// Valid sample counts indexed `[level][qoi]`.
    pub fn counts(&self) -> Vec<Vec<usize>> {
        (0..self.num_levels)
            .map(|l| (0..self.num_functions).map(|q| self.count(l, q)).collect())
            .collect()
    }

    /// Retained `(fine, coarse)` values; coarse is zero on level 0.
    pub fn samples(&self, level: usize, qoi: usize) -> Option<&[(f64, f64)]> {
        let idx = self.index(level, qoi);
        self.samples.as_ref().map(|s| s[idx].as_slice())
    }

    pub fn reset(&mut self) {
        self.sums.fill(LevelSums::default());
        if let Some(samples) = self.samples.as_mut() {
            samples.iter_mut().for_each(Vec::clear);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fine_sums() {
        let mut acc = Accumulators::new(1, 1, false);
        acc.accumulate(0, &[LevelResponse::fine(vec![2.0]), LevelResponse::fine(vec![-1.0])]);
        let s = acc.sums(0, 0);
        assert_eq!(s.count, 2);
        assert_eq!(s.ql, [1.0, 5.0, 7.0, 17.0]);
        assert_eq!(s.qlm1, [0.0; 4]);
    }

    #[test]
    fn test_pair_cross_sums() {
        let mut acc = Accumulators::new(2, 1, false);
        acc.accumulate(1, &[LevelResponse::paired(vec![2.0], vec![3.0])]);
        let s = acc.sums(1, 0);
        assert_eq!(s.count, 1);
        assert_eq!(s.cross, [[6.0, 18.0], [12.0, 36.0]]);
        assert_eq!(s.qlm1[3], 81.0);
    }

    #[test]
    fn test_non_finite_samples_are_noop() {
        let valid = vec![
            LevelResponse::paired(vec![1.0, 4.0], vec![0.5, 3.0]),
            LevelResponse::paired(vec![2.0, 5.0], vec![1.5, 4.5]),
        ];
        let mut mixed = valid.clone();
        mixed.push(LevelResponse::paired(vec![f64::NAN, f64::INFINITY], vec![1.0, 1.0]));
        mixed.push(LevelResponse::paired(vec![3.0, 3.0], vec![f64::NEG_INFINITY, f64::NAN]));
        mixed.push(LevelResponse { fine: vec![3.0, 3.0], coarse: None });

        let mut clean = Accumulators::new(2, 2, true);
        clean.accumulate(1, &valid);
        let mut dirty = Accumulators::new(2, 2, true);
        dirty.accumulate(1, &mixed);

        for q in 0..2 {
            assert_eq!(clean.sums(1, q), dirty.sums(1, q));
            assert_eq!(clean.samples(1, q), dirty.samples(1, q));
        }
        assert_eq!(dirty.counts(), vec![vec![0, 0], vec![2, 2]]);
    }

    #[test]
    fn test_partial_qoi_failure() {
        let mut acc = Accumulators::new(1, 2, false);
        acc.accumulate(0, &[LevelResponse::fine(vec![1.0, f64::NAN])]);
        assert_eq!(acc.count(0, 0), 1);
        assert_eq!(acc.count(0, 1), 0);
    }

    #[test]
    fn test_reset() {
        let mut acc = Accumulators::new(1, 1, true);
        acc.accumulate(0, &[LevelResponse::fine(vec![1.0])]);
        acc.reset();
        assert_eq!(acc.count(0, 0), 0);
        assert_eq!(acc.samples(0, 0).map(<[_]>::len), Some(0));
    }
}
