use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::detrend::deramp;
use crate::grid::DisplacementGrid;
use crate::stats::{median_f64, nan_mean, nan_median, nan_std};

/// Deterministic tile identity: window origin and nominal side length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileId {
    pub row: u32,
    pub col: u32,
    pub length: u32,
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile_{}-{}_{}", self.row, self.col, self.length)
    }
}

/// Node-scoring metric selecting how a tile's heterogeneity is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Correction {
    /// Standard deviation around the mean.
    Mean,
    /// RMS deviation around the median.
    #[default]
    Median,
    /// Standard deviation after bilinear detrending.
    Bilinear,
    /// Raw standard deviation.
    Std,
}

/// Scalar statistics over a tile's displacement window, computed once when
/// the node is created. All reductions skip NaN samples.
#[derive(Debug, Clone, Copy)]
pub struct NodeStats {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    /// Std around the mean.
    pub corr_mean: f64,
    /// RMS deviation around the median.
    pub corr_median: f64,
    /// Std of the bilinearly detrended window.
    pub corr_bilinear: f64,
    /// Fraction of NaN pixels in the window.
    pub nan_fraction: f64,
    /// Median east coordinate of the valid pixels.
    pub focal_e: f64,
    /// Median north coordinate of the valid pixels.
    pub focal_n: f64,
    /// Median look elevation angle over valid pixels.
    pub theta: f64,
    /// Median look orientation angle over valid pixels.
    pub phi: f64,
}

/// A square tile of the raster; node in the tessellation tree.
///
/// Nodes live in the tree's arena and reference their children by arena
/// index, so there are no cyclic references back into the tree. The window
/// is clipped at the raster edge; `length` keeps the nominal power-of-two
/// side.
#[derive(Debug, Clone)]
pub struct QuadNode {
    pub id: TileId,
    pub row0: usize,
    pub col0: usize,
    /// Nominal side length in pixels, `root_length / 2^k`.
    pub length: usize,
    /// Exclusive clipped window end rows/cols.
    pub row_end: usize,
    pub col_end: usize,
    /// Quadrant children as arena indices; `None` entries are quadrants
    /// omitted for being empty or fully NaN. `None` as a whole marks an
    /// unsplit node.
    pub children: Option<[Option<usize>; 4]>,
    pub stats: NodeStats,
    /// Physical extent east, clipped at the frame edge, metres.
    pub size_e: f64,
    /// Physical extent north, clipped at the frame edge, metres.
    pub size_n: f64,
}

impl QuadNode {
    /// Evaluate the window at `(row0, col0, length)` and build a node.
    ///
    /// Returns `None` when the footprint lies outside the raster or holds
    /// no valid sample — the sparse-tree omission rule.
    pub fn evaluate(
        grid: &DisplacementGrid,
        frame_max_e: f64,
        frame_max_n: f64,
        row0: usize,
        col0: usize,
        length: usize,
    ) -> Option<Self> {
        if row0 >= grid.rows || col0 >= grid.cols || length == 0 {
            return None;
        }
        let row_end = (row0 + length).min(grid.rows);
        let col_end = (col0 + length).min(grid.cols);

        let size = (row_end - row0) * (col_end - col0);
        let mut values = Vec::with_capacity(size);
        let mut coords_e = Vec::new();
        let mut coords_n = Vec::new();
        let mut thetas = Vec::new();
        let mut phis = Vec::new();
        for r in row0..row_end {
            for c in col0..col_end {
                let i = grid.index(r, c);
                let v = grid.displacement[i];
                values.push(v);
                if !v.is_nan() {
                    coords_e.push(grid.grid_e[i]);
                    coords_n.push(grid.grid_n[i]);
                    thetas.push(grid.theta[i] as f64);
                    phis.push(grid.phi[i] as f64);
                }
            }
        }
        if coords_e.is_empty() {
            return None;
        }

        let nan_fraction = 1.0 - coords_e.len() as f64 / size as f64;
        let mean = nan_mean(&values);
        let median = nan_median(&values);
        let std = nan_std(&values);

        // RMS about the median; differs from `std` when the window is skewed.
        let corr_median = {
            let mut sum = 0f64;
            let mut count = 0u64;
            for &v in &values {
                if !v.is_nan() {
                    let d = v as f64 - median;
                    sum += d * d;
                    count += 1;
                }
            }
            (sum / count as f64).sqrt()
        };

        let corr_bilinear = {
            let mut window = values.clone();
            deramp(&mut window, row_end - row0, col_end - col0);
            nan_std(&window)
        };

        let ll_e = grid.grid_e[grid.index(row0, col0)];
        let ll_n = grid.grid_n[grid.index(row0, col0)];
        let size_e = (length as f64 * grid.d_e).min(frame_max_e - ll_e);
        let size_n = (length as f64 * grid.d_n).min(frame_max_n - ll_n);

        Some(Self {
            id: TileId {
                row: row0 as u32,
                col: col0 as u32,
                length: length as u32,
            },
            row0,
            col0,
            length,
            row_end,
            col_end,
            children: None,
            stats: NodeStats {
                mean,
                median,
                std,
                corr_mean: std,
                corr_median,
                corr_bilinear,
                nan_fraction,
                focal_e: median_f64(&mut coords_e),
                focal_n: median_f64(&mut coords_n),
                theta: median_f64(&mut thetas),
                phi: median_f64(&mut phis),
            },
            size_e,
            size_n,
        })
    }

    /// The clipped pixel rows covered by this tile.
    #[inline]
    pub fn row_range(&self) -> Range<usize> {
        self.row0..self.row_end
    }

    /// The clipped pixel columns covered by this tile.
    #[inline]
    pub fn col_range(&self) -> Range<usize> {
        self.col0..self.col_end
    }

    /// Heterogeneity score under the selected correction.
    pub fn metric(&self, correction: Correction) -> f64 {
        match correction {
            Correction::Mean => self.stats.corr_mean,
            Correction::Median => self.stats.corr_median,
            Correction::Bilinear => self.stats.corr_bilinear,
            Correction::Std => self.stats.std,
        }
    }

    /// Focal point `(east, north)` in local coordinates.
    pub fn focal_point(&self) -> (f64, f64) {
        (self.stats.focal_e, self.stats.focal_n)
    }

    /// Copy of the tile's displacement window, row-major, NaN included.
    pub fn displacement(&self, grid: &DisplacementGrid) -> Vec<f32> {
        let mut out = Vec::with_capacity(
            (self.row_end - self.row0) * (self.col_end - self.col0),
        );
        for r in self.row_range() {
            let start = grid.index(r, self.col0);
            out.extend_from_slice(&grid.displacement[start..start + self.col_end - self.col0]);
        }
        out
    }

    /// Every `step`-th valid pixel coordinate of the tile, in window
    /// row-major order. Feeds the subsampled distance strategies.
    pub fn subsampled_coords(
        &self,
        grid: &DisplacementGrid,
        step: usize,
    ) -> (Vec<f64>, Vec<f64>) {
        let step = step.max(1);
        let mut es = Vec::new();
        let mut ns = Vec::new();
        let mut n_valid = 0usize;
        for r in self.row_range() {
            for c in self.col_range() {
                let i = grid.index(r, c);
                if grid.displacement[i].is_nan() {
                    continue;
                }
                if n_valid % step == 0 {
                    es.push(grid.grid_e[i]);
                    ns.push(grid.grid_n[i]);
                }
                n_valid += 1;
            }
        }
        (es, ns)
    }
}
