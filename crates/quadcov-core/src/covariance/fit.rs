//! Nonlinear least-squares fit of the analytical covariance model
//! `cov(d) = b * exp(-d / a)` by Levenberg–Marquardt over the two
//! parameters, with externally supplied per-sample weights.

use log::debug;
use nalgebra::{Matrix2, Vector2};

use crate::error::{QuadcovError, Result};

const MAX_ITERATIONS: usize = 100;

/// Analytical exponential-decay covariance model.
#[inline]
pub fn exponential_model(distance: f64, a: f64, b: f64) -> f64 {
    b * (-distance / a).exp()
}

/// Fit `(a, b)` to `(dist, cov)` samples, weighted by `weights` (squared
/// residual scale, larger = more influential).
///
/// The caller passes weights rising linearly from 0 to 1 across the sample
/// sequence, down-weighting the first samples of the empirical curve.
pub fn fit_exponential(dist: &[f64], cov: &[f64], weights: &[f64]) -> Result<(f64, f64)> {
    debug_assert_eq!(dist.len(), cov.len());
    debug_assert_eq!(dist.len(), weights.len());
    if dist.len() < 3 {
        return Err(QuadcovError::EmptyCovarianceCurve);
    }

    // Starting point: amplitude from the curve maximum, decay length from
    // the first crossing of max/e, defaulting to a third of the span.
    let b0 = cov.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let b0 = if b0.is_finite() && b0 != 0.0 { b0 } else { 1.0 };
    let threshold = b0 / std::f64::consts::E;
    let a0 = dist
        .iter()
        .zip(cov.iter())
        .find(|(_, &c)| c < threshold)
        .map(|(&d, _)| d)
        .unwrap_or(dist[dist.len() - 1] / 3.0)
        .max(f64::EPSILON);

    let chi2 = |a: f64, b: f64| -> f64 {
        if !(a > 0.0) || !a.is_finite() || !b.is_finite() {
            return f64::INFINITY;
        }
        dist.iter()
            .zip(cov.iter())
            .zip(weights.iter())
            .map(|((&d, &c), &w)| {
                let r = exponential_model(d, a, b) - c;
                w * r * r
            })
            .sum()
    };

    let (mut a, mut b) = (a0, b0);
    let mut cost = chi2(a, b);
    let mut lambda = 1e-3;

    for iteration in 0..MAX_ITERATIONS {
        // Weighted normal equations for the 2-parameter Jacobian.
        let mut jtj = Matrix2::<f64>::zeros();
        let mut jtr = Vector2::<f64>::zeros();
        for ((&d, &c), &w) in dist.iter().zip(cov.iter()).zip(weights.iter()) {
            let e = (-d / a).exp();
            let ja = b * d / (a * a) * e;
            let jb = e;
            let r = b * e - c;
            jtj[(0, 0)] += w * ja * ja;
            jtj[(0, 1)] += w * ja * jb;
            jtj[(1, 1)] += w * jb * jb;
            jtr[0] += w * ja * r;
            jtr[1] += w * jb * r;
        }
        jtj[(1, 0)] = jtj[(0, 1)];

        // Damped step; inflate lambda until the step reduces the cost.
        let mut stepped = false;
        for _ in 0..20 {
            let mut damped = jtj;
            damped[(0, 0)] += lambda * jtj[(0, 0)].max(f64::EPSILON);
            damped[(1, 1)] += lambda * jtj[(1, 1)].max(f64::EPSILON);
            let Some(inv) = damped.try_inverse() else {
                lambda *= 10.0;
                continue;
            };
            let delta = inv * jtr;
            let (a_new, b_new) = (a - delta[0], b - delta[1]);
            let cost_new = chi2(a_new, b_new);
            if cost_new < cost {
                let converged = delta.norm() < 1e-10 * (1.0 + Vector2::new(a, b).norm())
                    || (cost - cost_new) < 1e-14 * (1.0 + cost);
                a = a_new;
                b = b_new;
                cost = cost_new;
                lambda = (lambda / 10.0).max(1e-12);
                stepped = true;
                if converged {
                    debug!(
                        "covariance fit converged after {} iterations: a={:.4}, b={:.6}",
                        iteration + 1,
                        a,
                        b
                    );
                    return Ok((a, b));
                }
                break;
            }
            lambda *= 10.0;
        }
        if !stepped {
            // Stuck at a local minimum; accept if the gradient is tiny.
            if jtr.norm() < 1e-12 * (1.0 + cost) {
                return Ok((a, b));
            }
            return Err(QuadcovError::FitDiverged {
                iterations: iteration + 1,
            });
        }
    }
    Err(QuadcovError::FitDiverged {
        iterations: MAX_ITERATIONS,
    })
}

/// Weights rising linearly from 0 to 1 across `n` samples.
pub fn ramp_weights(n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0; n];
    }
    (0..n).map(|i| i as f64 / (n - 1) as f64).collect()
}
