//! Bilinear deramping and NaN-border trimming of raster windows.
//!
//! Used twice: the `bilinear` split metric scores a tile after removing its
//! linear trend, and the noise patch is deramped before spectral analysis so
//! the long-wavelength deformation signal does not leak into the noise
//! spectrum.

use crate::stats::{linregress_slope, nan_mean};

/// Remove a bilinear ramp from a row-major window, in place.
///
/// Per-column and per-row mean profiles are centred, NaN gaps zeroed, and a
/// line is fit to each profile by simple linear regression. The two fitted
/// ramps are subtracted from every pixel. NaN pixels stay NaN.
pub fn deramp(data: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(data.len(), rows * cols);
    if rows == 0 || cols == 0 {
        return;
    }

    // Column-wise means (profile along the column axis) and row-wise means.
    let mut col_means = vec![0f64; cols];
    let mut row_means = vec![0f64; rows];
    for c in 0..cols {
        let column: Vec<f32> = (0..rows).map(|r| data[r * cols + c]).collect();
        col_means[c] = nan_mean(&column);
    }
    for r in 0..rows {
        row_means[r] = nan_mean(&data[r * cols..(r + 1) * cols]);
    }

    let center_x = nan_mean_f64(&col_means);
    let center_y = nan_mean_f64(&row_means);
    for m in col_means.iter_mut() {
        *m = if m.is_nan() { 0.0 } else { *m - center_x };
    }
    for m in row_means.iter_mut() {
        *m = if m.is_nan() { 0.0 } else { *m - center_y };
    }

    let ix: Vec<f64> = (0..cols).map(|i| i as f64).collect();
    let iy: Vec<f64> = (0..rows).map(|i| i as f64).collect();
    let dx = linregress_slope(&ix, &col_means);
    let dy = linregress_slope(&iy, &row_means);

    for r in 0..rows {
        let ramp_y = iy[r] * dy + center_y;
        for c in 0..cols {
            let ramp_x = ix[c] * dx + center_x;
            data[r * cols + c] -= (ramp_x + ramp_y) as f32;
        }
    }
}

/// Drop leading and trailing rows/columns that are entirely NaN.
///
/// Returns the trimmed copy and its shape. A fully-NaN input collapses to an
/// empty window (0 × 0).
pub fn trim_nan_border(data: &[f32], rows: usize, cols: usize) -> (Vec<f32>, usize, usize) {
    debug_assert_eq!(data.len(), rows * cols);
    let row_valid =
        |r: usize| (0..cols).any(|c| !data[r * cols + c].is_nan());
    let col_valid =
        |c: usize| (0..rows).any(|r| !data[r * cols + c].is_nan());

    let r0 = (0..rows).find(|&r| row_valid(r));
    let r0 = match r0 {
        Some(r) => r,
        None => return (Vec::new(), 0, 0),
    };
    // Row r0 is valid, so a last valid row and valid columns must exist.
    let r1 = (0..rows).rev().find(|&r| row_valid(r)).unwrap_or(r0);
    let c0 = (0..cols).find(|&c| col_valid(c)).unwrap_or(0);
    let c1 = (0..cols).rev().find(|&c| col_valid(c)).unwrap_or(cols - 1);

    let (trimmed_rows, trimmed_cols) = (r1 - r0 + 1, c1 - c0 + 1);
    let mut out = Vec::with_capacity(trimmed_rows * trimmed_cols);
    for r in r0..=r1 {
        out.extend_from_slice(&data[r * cols + c0..r * cols + c1 + 1]);
    }
    (out, trimmed_rows, trimmed_cols)
}

fn nan_mean_f64(values: &[f64]) -> f64 {
    let mut sum = 0f64;
    let mut count = 0u64;
    for &v in values {
        if !v.is_nan() {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}
