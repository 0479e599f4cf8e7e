use crate::error::{EstimateError, Result};

/// Computes the empirical `q`-quantile of `values` with linear interpolation
/// between order statistics.
///
/// # Parameters
/// - `values`: Sample values, in any order. NaNs are not allowed.
/// - `q`: Quantile level in `[0, 1]`.
///
/// # Returns
/// - `Ok(x)` with `x` between the two order statistics surrounding
///   `q * (n - 1)`.
/// - `Err(EstimateError::InvalidParameter)` if `values` is empty or `q` is
///   outside `[0, 1]`.
///
/// # Example
/// ```
/// use mlmc_estimate::utility::quantile;
///
/// let x = vec![3.0, 1.0, 2.0, 4.0];
/// let median = quantile(&x, 0.5).unwrap();
/// assert!((median - 2.5).abs() < 1e-12);
/// ```
pub fn quantile(values: &[f64], q: f64) -> Result<f64> {
    if values.is_empty() {
        return Err(EstimateError::InvalidParameter(
            "quantile of an empty sample".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&q) {
        return Err(EstimateError::InvalidParameter(format!(
            "quantile level {} outside [0, 1]",
            q
        )));
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Ok(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Composite Simpson rule for `f` over `[a, b]` with `n_intervals` (rounded up
/// to an even number) sub-intervals.
///
/// # Example
/// ```
/// use mlmc_estimate::utility::simpson;
///
/// let area = simpson(|x| x * x, 0.0, 3.0, 64);
/// assert!((area - 9.0).abs() < 1e-10);
/// ```
pub fn simpson<F>(f: F, a: f64, b: f64, n_intervals: usize) -> f64
where
    F: Fn(f64) -> f64,
{
    let n = (n_intervals.max(2) + 1) / 2 * 2;
    let h = (b - a) / n as f64;

    let mut sum = f(a) + f(b);
    for i in 1..n {
        let x = a + i as f64 * h;
        sum += if i % 2 == 1 { 4.0 * f(x) } else { 2.0 * f(x) };
    }
    sum * h / 3.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_bounds() {
        let x = vec![5.0, -1.0, 2.0];
        assert_eq!(quantile(&x, 0.0).unwrap(), -1.0);
        assert_eq!(quantile(&x, 1.0).unwrap(), 5.0);
        assert!((quantile(&x, 0.25).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_quantile() {
        assert!(quantile(&[], 0.5).is_err());
        assert!(quantile(&[1.0], 1.5).is_err());
    }

    #[test]
    fn test_simpson_gaussian() {
        let pdf = |x: f64| (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt();
        let total = simpson(pdf, -10.0, 10.0, 2001);
        assert!((total - 1.0).abs() < 1e-10);
    }
}
