//! Robust statistics for aggregating per-star measurements

/// MAD to Gaussian sigma
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Smallest scale accepted when converting to a weight
const MIN_SCALE: f64 = 1e-10;

/// Median of `values` (mean of the two middle values for even counts).
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Population mean and standard deviation
pub fn mean_stddev(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

/// Sigma-clipped location.
///
/// Up to three values: the median. Otherwise the mean of the values within
/// `median ± sigma·stddev`; falls back to the median if clipping removes
/// everything.
pub fn sigma_clipped_location(values: &[f64], sigma: f64) -> Option<f64> {
    let med = median(values)?;
    if values.len() <= 3 {
        return Some(med);
    }
    let (_, stddev) = mean_stddev(values)?;
    let limit = sigma * stddev;

    let kept: Vec<f64> = values.iter().copied().filter(|v| (v - med).abs() <= limit).collect();
    if kept.is_empty() {
        return Some(med);
    }
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Median absolute deviation scaled to a Gaussian sigma
pub fn mad_sigma(values: &[f64]) -> Option<f64> {
    let med = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations).map(|mad| mad * MAD_TO_SIGMA)
}

/// Inverse-variance weight for a dispersion scale
pub fn scale_to_weight(scale: f64) -> f64 {
    let scale = if scale.is_finite() { scale.max(MIN_SCALE) } else { MIN_SCALE };
    1.0 / (scale * scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_sigma_clip_drops_outlier() {
        let values = [2.0, 2.1, 1.9, 2.05, 1.95, 2.0, 2.02, 1.98, 2.01, 9.0];
        let location = sigma_clipped_location(&values, 2.0).unwrap();
        assert!((location - 2.0).abs() < 0.02, "Outlier should be clipped, got {}", location);
    }

    #[test]
    fn test_sigma_clip_small_sets_use_median() {
        assert_eq!(sigma_clipped_location(&[1.0, 5.0, 100.0], 2.0), Some(5.0));
    }

    #[test]
    fn test_mad_sigma_and_weight() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        // Median 3, deviations 2,1,0,1,2 -> MAD 1
        assert_relative_eq!(mad_sigma(&values).unwrap(), MAD_TO_SIGMA);
        assert_relative_eq!(scale_to_weight(0.5), 4.0);
        assert!(scale_to_weight(0.0).is_finite(), "Zero spread must not yield infinity");
        assert!(scale_to_weight(0.1) > scale_to_weight(0.2), "Tighter spread should weigh more");
    }
}
