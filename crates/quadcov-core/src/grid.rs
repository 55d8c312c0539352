use serde::{Deserialize, Serialize};

use crate::error::{QuadcovError, Result};
use crate::stats::nan_std;

/// A 2D displacement raster with aligned per-pixel geometry, row-major.
///
/// Displacement values are f32 with NaN marking missing samples; coordinate
/// math uses f64. The grid is the read-only raster context shared by the
/// quadtree and covariance engines; it is built once by the surrounding
/// scene layer and never mutated by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplacementGrid {
    /// Row-major displacement values in metres, NaN = missing.
    pub displacement: Vec<f32>,
    /// Local east coordinate of every pixel, metres.
    pub grid_e: Vec<f64>,
    /// Local north coordinate of every pixel, metres.
    pub grid_n: Vec<f64>,
    /// Per-pixel look elevation angle, radians.
    pub theta: Vec<f32>,
    /// Per-pixel look orientation angle, radians.
    pub phi: Vec<f32>,
    pub rows: usize,
    pub cols: usize,
    /// Pixel spacing east, metres.
    pub d_e: f64,
    /// Pixel spacing north, metres.
    pub d_n: f64,
}

impl DisplacementGrid {
    /// Build a grid from fully specified arrays, validating shapes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rows: usize,
        cols: usize,
        displacement: Vec<f32>,
        grid_e: Vec<f64>,
        grid_n: Vec<f64>,
        theta: Vec<f32>,
        phi: Vec<f32>,
        d_e: f64,
        d_n: f64,
    ) -> Result<Self> {
        let expected = rows * cols;
        for got in [
            displacement.len(),
            grid_e.len(),
            grid_n.len(),
            theta.len(),
            phi.len(),
        ] {
            if got != expected {
                return Err(QuadcovError::ShapeMismatch { expected, got });
            }
        }
        Ok(Self {
            displacement,
            grid_e,
            grid_n,
            theta,
            phi,
            rows,
            cols,
            d_e,
            d_n,
        })
    }

    /// Build a grid on a regular local frame: pixel (r, c) sits at
    /// `(c * d_e, r * d_n)`, with nadir-ish look angles. Convenient for
    /// synthetic scenes and tests.
    pub fn regular(
        rows: usize,
        cols: usize,
        displacement: Vec<f32>,
        d_e: f64,
        d_n: f64,
    ) -> Result<Self> {
        let n = rows * cols;
        let mut grid_e = vec![0f64; n];
        let mut grid_n = vec![0f64; n];
        for r in 0..rows {
            for c in 0..cols {
                grid_e[r * cols + c] = c as f64 * d_e;
                grid_n[r * cols + c] = r as f64 * d_n;
            }
        }
        Self::new(
            rows,
            cols,
            displacement,
            grid_e,
            grid_n,
            vec![std::f32::consts::FRAC_PI_2; n],
            vec![0.0; n],
            d_e,
            d_n,
        )
    }

    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.displacement[self.index(row, col)]
    }

    /// True where the displacement sample is missing.
    #[inline]
    pub fn is_masked(&self, row: usize, col: usize) -> bool {
        self.get(row, col).is_nan()
    }

    /// Number of valid (non-NaN) displacement samples.
    pub fn valid_count(&self) -> usize {
        self.displacement.iter().filter(|v| !v.is_nan()).count()
    }

    /// NaN-aware standard deviation of the whole raster. Seed value for the
    /// quadtree's epsilon bounds.
    pub fn global_std(&self) -> f64 {
        nan_std(&self.displacement)
    }

    /// The larger of the two pixel spacings; used to convert physical tile
    /// size limits into pixel counts.
    pub fn max_spacing(&self) -> f64 {
        self.d_e.max(self.d_n)
    }

    /// Maximum east/north coordinate over the frame, used to clip physical
    /// tile sizes at the raster edge.
    pub fn max_e(&self) -> f64 {
        self.grid_e.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn max_n(&self) -> f64 {
        self.grid_n.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }
}
