/// Least-squares line `y = intercept + slope * x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub intercept: f64,
    pub slope: f64,
}

/// Fits a straight line through `(x, y)` by ordinary least squares.
///
/// # Returns
/// - `Some(LineFit)` with the estimated parameters.
/// - `None` if the input cannot determine a line:
///     - `x` and `y` have different lengths,
///     - fewer than two points are provided,
///     - all `x` values are identical.
///
/// # Example
/// ```
/// use mlmc_alloc::utility::fit_line;
///
/// let fit = fit_line(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]).unwrap();
/// assert!((fit.slope - 2.0).abs() < 1e-10);
/// assert!(fit.intercept.abs() < 1e-10);
/// ```
pub fn fit_line(x: &[f64], y: &[f64]) -> Option<LineFit> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let (num, den) = x.iter().zip(y).fold((0.0, 0.0), |(num, den), (xi, yi)| {
        let dx = xi - mean_x;
        (num + dx * (yi - mean_y), den + dx * dx)
    });
    if den == 0.0 {
        return None;
    }
    let slope = num / den;
    Some(LineFit {
        intercept: mean_y - slope * mean_x,
        slope,
    })
}

/// Slope of `log2(values[i])` against the level index `first + i`.
///
/// Zero, negative and non-finite values carry no rate information and are
/// skipped; `None` if fewer than two usable points remain.
pub fn log2_rate(first: usize, values: &[f64]) -> Option<f64> {
    let (x, y): (Vec<f64>, Vec<f64>) = values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite() && **v > 0.0)
        .map(|(i, v)| ((first + i) as f64, v.log2()))
        .unzip();
    fit_line(&x, &y).map(|fit| fit.slope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_point_fit() {
        let fit = fit_line(&[1.0, 2.0], &[2.0, 4.0]).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-10);
        assert!(fit.intercept.abs() < 1e-10);
    }

    #[test]
    fn test_noisy_fit() {
        let fit = fit_line(&[0.0, 1.0, 2.0, 3.0], &[1.0, 2.9, 5.1, 7.0]).unwrap();
        assert!((fit.slope - 2.0).abs() < 0.05);
        assert!((fit.intercept - 1.0).abs() < 0.1);
    }

    #[test]
    fn test_invalid_fit() {
        assert!(fit_line(&[1.0], &[2.0]).is_none());
        assert!(fit_line(&[1.0, 1.0], &[2.0, 3.0]).is_none());
        assert!(fit_line(&[1.0, 2.0], &[2.0]).is_none());
    }

    #[test]
    fn test_log2_rate_skips_zeros() {
        let rate = log2_rate(1, &[0.5, 0.0, 0.125, f64::NAN]).unwrap();
        assert!((rate + 1.0).abs() < 1e-12);
        assert!(log2_rate(0, &[1.0, 0.0]).is_none());
    }
}
