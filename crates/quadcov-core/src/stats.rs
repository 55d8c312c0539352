//! NaN-aware scalar statistics over raw f32 windows.
//!
//! All reductions skip NaN samples and return NaN when no valid sample
//! remains, matching the semantics the rest of the crate relies on.

/// Mean of the non-NaN values. NaN if the slice holds no valid sample.
pub fn nan_mean(values: &[f32]) -> f64 {
    let mut sum = 0f64;
    let mut count = 0u64;
    for &v in values {
        if !v.is_nan() {
            sum += v as f64;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Population standard deviation of the non-NaN values.
pub fn nan_std(values: &[f32]) -> f64 {
    let mean = nan_mean(values);
    if mean.is_nan() {
        return f64::NAN;
    }
    let mut sum = 0f64;
    let mut count = 0u64;
    for &v in values {
        if !v.is_nan() {
            let d = v as f64 - mean;
            sum += d * d;
            count += 1;
        }
    }
    (sum / count as f64).sqrt()
}

/// Median of the non-NaN values. NaN if the slice holds no valid sample.
pub fn nan_median(values: &[f32]) -> f64 {
    let mut valid: Vec<f64> = values
        .iter()
        .filter(|v| !v.is_nan())
        .map(|&v| v as f64)
        .collect();
    median_f64(&mut valid)
}

/// Median of an unsorted f64 slice, averaging the two central samples for
/// even lengths. NaN for an empty slice. Sorts in place.
pub fn median_f64(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_unstable_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

/// OLS slope of `ys` against `xs`. Zero slope for degenerate input.
pub fn linregress_slope(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len() as f64;
    if xs.len() < 2 {
        return 0.0;
    }
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xx: f64 = xs.iter().map(|x| x * x).sum();
    let sum_xy: f64 = xs.iter().zip(ys.iter()).map(|(x, y)| x * y).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < 1e-12 {
        0.0
    } else {
        (n * sum_xy - sum_x * sum_y) / denom
    }
}
