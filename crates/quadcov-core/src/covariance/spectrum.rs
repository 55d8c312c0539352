//! Empirical covariance estimation from the 2D noise spectrum.
//!
//! The deramped noise patch is transformed with a 2D DFT, the magnitude
//! spectrum is reduced to a 1D power spectrum by mean-binning over radial
//! wavenumber, and a DCT-II turns the binned spectrum into a covariance-like
//! sequence over integer lags.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Discrete sample frequencies for an `n`-point DFT with sample spacing `d`,
/// in FFT order (positive frequencies first, then negative).
pub fn fftfreq(n: usize, d: f64) -> Vec<f64> {
    let mut freqs = vec![0.0; n];
    let df = 1.0 / (n as f64 * d);
    let half = (n - 1) / 2 + 1;
    for (i, f) in freqs.iter_mut().enumerate().take(half) {
        *f = i as f64 * df;
    }
    for i in half..n {
        freqs[i] = -((n - i) as f64) * df;
    }
    freqs
}

/// 2D DFT magnitude of a row-major window, normalized by the sample count.
/// Row pass then column pass through a strided scratch buffer.
pub fn fft2_magnitude(data: &[f32], rows: usize, cols: usize) -> Vec<f64> {
    debug_assert_eq!(data.len(), rows * cols);
    let mut buf: Vec<Complex<f64>> = data
        .iter()
        .map(|&v| Complex::new(v as f64, 0.0))
        .collect();

    let mut planner = FftPlanner::new();
    let fft_rows = planner.plan_fft_forward(cols);
    for r in 0..rows {
        fft_rows.process(&mut buf[r * cols..(r + 1) * cols]);
    }
    let fft_cols = planner.plan_fft_forward(rows);
    let mut scratch = vec![Complex::new(0.0, 0.0); rows];
    for c in 0..cols {
        for r in 0..rows {
            scratch[r] = buf[r * cols + c];
        }
        fft_cols.process(&mut scratch);
        for r in 0..rows {
            buf[r * cols + c] = scratch[r];
        }
    }

    let norm = (rows * cols) as f64;
    buf.into_iter().map(|z| z.norm() / norm).collect()
}

/// Radially binned 1D power spectrum of a noise patch.
///
/// Bins are defined by the positive sample frequencies of the axis with the
/// most samples; each bin holds the mean spectral magnitude of the cells
/// whose radial wavenumber falls inside it. Empty bins are NaN (zeroed by
/// the caller before the DCT). Returns `(power, k)` with `k` the lower bin
/// edges, plus the pixel spacing of the binning axis for lag conversion.
pub fn noise_spectrum(
    noise: &[f32],
    rows: usize,
    cols: usize,
    d_e: f64,
    d_n: f64,
) -> (Vec<f64>, Vec<f64>, f64) {
    let spec = fft2_magnitude(noise, rows, cols);
    let k_rows = fftfreq(rows, d_n);
    let k_cols = fftfreq(cols, d_e);

    // Bin edges from the longer frequency axis, ascending positives.
    let (bin_axis, lag_spacing) = if k_rows.len() > k_cols.len() {
        (&k_rows, d_n)
    } else {
        (&k_cols, d_e)
    };
    let mut edges: Vec<f64> = bin_axis.iter().cloned().filter(|k| *k > 0.0).collect();
    edges.sort_unstable_by(f64::total_cmp);
    if edges.len() < 2 {
        return (Vec::new(), Vec::new(), lag_spacing);
    }

    let n_bins = edges.len() - 1;
    let mut sums = vec![0f64; n_bins];
    let mut counts = vec![0u64; n_bins];
    for r in 0..rows {
        for c in 0..cols {
            let k_rad = (k_rows[r] * k_rows[r] + k_cols[c] * k_cols[c]).sqrt();
            if k_rad < edges[0] || k_rad > edges[n_bins] {
                continue;
            }
            // Bins are half-open except the last, which is closed.
            let bin = match edges.binary_search_by(|e| e.total_cmp(&k_rad)) {
                Ok(i) => i.min(n_bins - 1),
                Err(i) => i - 1,
            };
            sums[bin] += spec[r * cols + c];
            counts[bin] += 1;
        }
    }

    let power: Vec<f64> = sums
        .iter()
        .zip(counts.iter())
        .map(|(&s, &n)| if n == 0 { f64::NAN } else { s / n as f64 })
        .collect();
    edges.truncate(n_bins);
    (power, edges, lag_spacing)
}

/// Unnormalized DCT-II: `X_k = 2 Σ_j x_j cos(π k (2j+1) / 2N)`.
pub fn dct2(xs: &[f64]) -> Vec<f64> {
    let n = xs.len();
    if n == 0 {
        return Vec::new();
    }
    let scale = std::f64::consts::PI / (2.0 * n as f64);
    (0..n)
        .map(|k| {
            2.0 * xs
                .iter()
                .enumerate()
                .map(|(j, &x)| x * ((2 * j + 1) as f64 * k as f64 * scale).cos())
                .sum::<f64>()
        })
        .collect()
}

/// Empirical covariance curve from a binned power spectrum.
///
/// NaN bins (empty) are zeroed, the DCT-II output is area-normalized by
/// `2/N`, and lag index `i` maps to distance `(i+1) * lag_spacing`.
pub fn covariance_curve(power: &[f64], lag_spacing: f64) -> (Vec<f64>, Vec<f64>) {
    let filled: Vec<f64> = power
        .iter()
        .map(|&p| if p.is_nan() { 0.0 } else { p })
        .collect();
    let mut cov = dct2(&filled);
    let n = cov.len().max(1) as f64;
    for c in cov.iter_mut() {
        *c *= 2.0 / n;
    }
    let dist: Vec<f64> = (0..cov.len())
        .map(|i| (i + 1) as f64 * lag_spacing)
        .collect();
    (cov, dist)
}

/// Structure function of the noise over the given lags, from the binned
/// power spectrum: `s(d) = 2/N * sum_k p_k * (1 - cos(2 pi k d))`. Empty
/// (NaN) bins contribute nothing.
pub fn structure_curve(power: &[f64], k: &[f64], dist: &[f64]) -> Vec<f64> {
    debug_assert_eq!(power.len(), k.len());
    let n = power.len().max(1) as f64;
    dist.iter()
        .map(|&d| {
            2.0 / n
                * power
                    .iter()
                    .zip(k.iter())
                    .filter(|(p, _)| !p.is_nan())
                    .map(|(&p, &kk)| {
                        p * (1.0 - (2.0 * std::f64::consts::PI * kk * d).cos())
                    })
                    .sum::<f64>()
        })
        .collect()
}
