//! Spatial covariance and weight model over the quadtree leaf set.
//!
//! The empirical covariance-vs-distance curve comes from the noise spectrum
//! of a representative patch; pairwise leaf distances are computed by one of
//! three interchangeable strategies and mapped through the curve to the
//! covariance matrix, whose inverse is the weight matrix used to weight
//! correlated observations in the inversion.
//!
//! All derived quantities are cached and tagged with the tree's generation
//! counter; any structural or leaf-set change invalidates them on the next
//! access.

pub mod fit;
pub mod spectrum;

use std::collections::HashMap;
use std::time::Instant;

use log::debug;
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::detrend::{deramp, trim_nan_border};
use crate::error::{QuadcovError, Result};
use crate::event::{ChangeEvent, Subject};
use crate::quadtree::{QuadNode, Quadtree, TileId};
use crate::stats::median_f64;

use fit::{exponential_model, fit_exponential, ramp_weights};
use spectrum::{covariance_curve, noise_spectrum, structure_curve};

/// Covariance model parameters and distance-computation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CovarianceConfig {
    /// Decay length placeholder, metres; replaced by the fit.
    pub a: f64,
    /// Amplitude placeholder; replaced by the fit.
    pub b: f64,
    /// Reserved oscillation coefficient; kept for config compatibility.
    pub c: f64,
    /// Fallback variance used when no empirical curve is available.
    pub variance: f64,
    /// Distances beyond this cutoff map to zero covariance, metres.
    pub distance_cutoff: f64,
    /// Stride over valid pixels for the subsampled distance strategy.
    pub subsampling: usize,
}

impl Default for CovarianceConfig {
    fn default() -> Self {
        Self {
            a: 1.0,
            b: 1.0,
            c: 1.0,
            variance: 9999.0,
            distance_cutoff: 35e3,
            subsampling: 23,
        }
    }
}

/// How pairwise leaf distances are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceStrategy {
    /// Euclidean distance between leaf focal points. Cheap, approximate.
    Focal,
    /// Median of the cross-pairwise distances between the two leaves'
    /// subsampled valid pixels; leaf pairs run in parallel.
    Matrix,
    /// Same statistic over every valid pixel of the leaf bounding boxes,
    /// straight off the shared coordinate grids. Production default.
    #[default]
    Dense,
}

#[derive(Debug, Clone)]
struct NoisePatch {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

/// Covariance/weight engine bound to a [`Quadtree`].
///
/// Methods take the tree by reference on each call; a moved generation
/// counter clears every cached product first.
pub struct Covariance {
    config: CovarianceConfig,
    noise: Option<NoisePatch>,
    noise_explicit: bool,
    generation: Option<u64>,
    /// Binned 1D power spectrum and its wavenumber bin edges.
    spectrum: Option<(Vec<f64>, Vec<f64>)>,
    curve: Option<(Vec<f64>, Vec<f64>)>,
    coeffs: Option<(f64, f64)>,
    dist_matrix: Option<DMatrix<f64>>,
    dist_matrix_focal: Option<DMatrix<f64>>,
    cov_matrix: Option<DMatrix<f64>>,
    /// Which non-focal strategy filled `cov_matrix`/`dist_matrix`.
    cov_strategy: Option<DistanceStrategy>,
    cov_matrix_focal: Option<DMatrix<f64>>,
    weight: Option<DMatrix<f64>>,
    weight_focal: Option<DMatrix<f64>>,
    index_map: HashMap<TileId, usize>,
    pub events: Subject,
}

impl Covariance {
    pub fn new(config: CovarianceConfig) -> Self {
        Self {
            config,
            noise: None,
            noise_explicit: false,
            generation: None,
            spectrum: None,
            curve: None,
            coeffs: None,
            dist_matrix: None,
            dist_matrix_focal: None,
            cov_matrix: None,
            cov_strategy: None,
            cov_matrix_focal: None,
            weight: None,
            weight_focal: None,
            index_map: HashMap::new(),
            events: Subject::new(),
        }
    }

    pub fn config(&self) -> &CovarianceConfig {
        &self.config
    }

    /// Change the subsampling stride and drop every derived product.
    pub fn set_subsampling(&mut self, value: usize) {
        self.config.subsampling = value.max(1);
        self.clear_derived(true);
        self.events.notify(ChangeEvent::ConfigChanged);
    }

    /// Drop cached derived state. Explicitly supplied noise survives unless
    /// `drop_selected_noise` also applies to it.
    fn clear_derived(&mut self, drop_selected_noise: bool) {
        self.spectrum = None;
        self.curve = None;
        self.coeffs = None;
        self.dist_matrix = None;
        self.dist_matrix_focal = None;
        self.cov_matrix = None;
        self.cov_strategy = None;
        self.cov_matrix_focal = None;
        self.weight = None;
        self.weight_focal = None;
        self.index_map.clear();
        if drop_selected_noise && !self.noise_explicit {
            self.noise = None;
        }
    }

    /// Invalidate everything derived when the tree's generation moved.
    fn sync(&mut self, tree: &Quadtree) {
        if self.generation != Some(tree.generation()) {
            self.clear_derived(true);
            self.generation = Some(tree.generation());
        }
    }

    // ── Noise patch ──────────────────────────────────────────────────────

    /// Supply noise data explicitly, bypassing leaf selection. The window
    /// is trimmed of all-NaN borders, deramped, and NaN-zeroed.
    pub fn set_noise_data(&mut self, data: Vec<f32>, rows: usize, cols: usize) -> Result<()> {
        if data.len() != rows * cols {
            return Err(QuadcovError::ShapeMismatch {
                expected: rows * cols,
                got: data.len(),
            });
        }
        let patch =
            prepare_noise(data, rows, cols).ok_or(QuadcovError::EmptyCovarianceCurve)?;
        self.noise = Some(patch);
        self.noise_explicit = true;
        self.clear_derived(false);
        self.events.notify(ChangeEvent::CovarianceCleared);
        Ok(())
    }

    fn ensure_noise(&mut self, tree: &Quadtree) -> Result<()> {
        self.sync(tree);
        if self.noise.is_some() {
            return Ok(());
        }
        // Prefer the largest, most complete leaf: presumed pure noise.
        let leaves = tree.leaves();
        let best = leaves
            .iter()
            .max_by(|a, b| {
                let score =
                    |n: &QuadNode| n.length as f64 / (n.stats.nan_fraction + 1.0);
                score(a).total_cmp(&score(b))
            })
            .ok_or(QuadcovError::NoLeaves)?;
        debug!("selected noise patch {}", best.id);
        let data = best.displacement(tree.grid());
        let rows = best.row_end - best.row0;
        let cols = best.col_end - best.col0;
        self.noise =
            Some(prepare_noise(data, rows, cols).ok_or(QuadcovError::EmptyCovarianceCurve)?);
        self.noise_explicit = false;
        Ok(())
    }

    /// The processed noise patch and its shape.
    pub fn noise_data(&mut self, tree: &Quadtree) -> Result<(&[f32], usize, usize)> {
        self.ensure_noise(tree)?;
        let patch = self.noise.as_ref().unwrap();
        Ok((&patch.data, patch.rows, patch.cols))
    }

    // ── Empirical curve and analytical fit ───────────────────────────────

    fn ensure_curve(&mut self, tree: &Quadtree) -> Result<()> {
        self.ensure_noise(tree)?;
        if self.curve.is_some() {
            return Ok(());
        }
        let grid = tree.grid();
        let patch = self.noise.as_ref().unwrap();
        let (power, k, lag_spacing) =
            noise_spectrum(&patch.data, patch.rows, patch.cols, grid.d_e, grid.d_n);
        if power.is_empty() {
            return Err(QuadcovError::EmptyCovarianceCurve);
        }
        self.curve = Some(covariance_curve(&power, lag_spacing));
        self.spectrum = Some((power, k));
        Ok(())
    }

    /// Empirical covariance curve `(covariance, distance)`.
    pub fn covariance_function(&mut self, tree: &Quadtree) -> Result<(&[f64], &[f64])> {
        self.ensure_curve(tree)?;
        let (cov, dist) = self.curve.as_ref().unwrap();
        Ok((cov, dist))
    }

    /// Structure function of the noise `(structure, distance)`, evaluated
    /// over the same lags as the empirical covariance curve.
    pub fn structure_function(&mut self, tree: &Quadtree) -> Result<(Vec<f64>, Vec<f64>)> {
        self.ensure_curve(tree)?;
        let (power, k) = self.spectrum.as_ref().unwrap();
        let (_, dist) = self.curve.as_ref().unwrap();
        Ok((structure_curve(power, k, dist), dist.clone()))
    }

    /// Fitted `(a, b)` of the analytical model `b * exp(-d/a)`.
    ///
    /// The fit weights rise linearly across the empirical samples, giving
    /// the near-field the least influence.
    pub fn coefficients(&mut self, tree: &Quadtree) -> Result<(f64, f64)> {
        self.ensure_curve(tree)?;
        if let Some(c) = self.coeffs {
            return Ok(c);
        }
        let (cov, dist) = self.curve.as_ref().unwrap();
        let weights = ramp_weights(dist.len());
        let coeffs = fit_exponential(dist, cov, &weights)?;
        self.coeffs = Some(coeffs);
        self.config.a = coeffs.0;
        self.config.b = coeffs.1;
        Ok(coeffs)
    }

    /// Analytical covariance at `distance` using the fitted coefficients.
    pub fn covariance_analytical(&mut self, tree: &Quadtree, distance: f64) -> Result<f64> {
        let (a, b) = self.coefficients(tree)?;
        Ok(exponential_model(distance, a, b))
    }

    /// Global variance: zero-lag maximum of the empirical curve, falling
    /// back to the configured value when the curve is degenerate.
    pub fn variance(&mut self, tree: &Quadtree) -> Result<f64> {
        self.ensure_curve(tree)?;
        let (cov, _) = self.curve.as_ref().unwrap();
        let max = cov.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Ok(if max.is_finite() && max > 0.0 {
            max
        } else {
            self.config.variance
        })
    }

    /// Nearest-neighbour interpolation of the empirical curve, zero outside
    /// its support and beyond the configured distance cutoff.
    pub fn covariance_of_distance(&mut self, tree: &Quadtree, distance: f64) -> Result<f64> {
        self.ensure_curve(tree)?;
        let (cov, dist) = self.curve.as_ref().unwrap();
        Ok(interp_nearest(cov, dist, distance, self.config.distance_cutoff))
    }

    // ── Distance and covariance matrices ─────────────────────────────────

    fn build_matrices(&mut self, tree: &Quadtree, strategy: DistanceStrategy) -> Result<()> {
        self.ensure_curve(tree)?;
        let t0 = Instant::now();
        let leaves = tree.leaves();
        let n = leaves.len();
        if n == 0 {
            return Err(QuadcovError::NoLeaves);
        }
        self.index_map = leaves
            .iter()
            .enumerate()
            .map(|(i, l)| (l.id, i))
            .collect();

        let grid = tree.grid();
        let step = self.config.subsampling.max(1);
        let pairs: Vec<(usize, usize)> =
            (0..n).flat_map(|i| (i..n).map(move |j| (i, j))).collect();

        let entries: Vec<(usize, usize, f64)> = match strategy {
            DistanceStrategy::Focal => pairs
                .iter()
                .map(|&(i, j)| (i, j, focal_distance(leaves[i], leaves[j])))
                .collect(),
            DistanceStrategy::Matrix => {
                debug!(
                    "preprocessing distance matrix, subsampling {}x over {} leaf pairs",
                    step,
                    pairs.len()
                );
                let coords: Vec<(Vec<f64>, Vec<f64>)> = leaves
                    .iter()
                    .map(|l| l.subsampled_coords(grid, step))
                    .collect();
                pairs
                    .par_iter()
                    .map(|&(i, j)| {
                        (i, j, median_cross_distance(&coords[i], &coords[j]))
                    })
                    .collect()
            }
            DistanceStrategy::Dense => {
                let coords: Vec<(Vec<f64>, Vec<f64>)> = leaves
                    .iter()
                    .map(|l| l.subsampled_coords(grid, 1))
                    .collect();
                pairs
                    .par_iter()
                    .map(|&(i, j)| {
                        (i, j, median_cross_distance(&coords[i], &coords[j]))
                    })
                    .collect()
            }
        };

        let mut dist = DMatrix::zeros(n, n);
        for (i, j, d) in entries {
            dist[(i, j)] = d;
            dist[(j, i)] = d;
        }

        let (cov_curve, dist_curve) = self.curve.as_ref().unwrap();
        let cutoff = self.config.distance_cutoff;
        let mut cov = dist.map(|d| interp_nearest(cov_curve, dist_curve, d, cutoff));
        let variance = {
            let max = cov_curve.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if max.is_finite() && max > 0.0 {
                max
            } else {
                self.config.variance
            }
        };
        cov.fill_diagonal(variance);

        debug!(
            "created covariance matrix, {:?} strategy, {} leaves [{:.4}s]",
            strategy,
            n,
            t0.elapsed().as_secs_f64()
        );
        match strategy {
            DistanceStrategy::Focal => {
                self.dist_matrix_focal = Some(dist);
                self.cov_matrix_focal = Some(cov);
                self.weight_focal = None;
            }
            DistanceStrategy::Matrix | DistanceStrategy::Dense => {
                self.dist_matrix = Some(dist);
                self.cov_matrix = Some(cov);
                self.cov_strategy = Some(strategy);
                self.weight = None;
            }
        }
        Ok(())
    }

    /// Full covariance matrix over the current leaf set (dense strategy).
    pub fn covariance_matrix(&mut self, tree: &Quadtree) -> Result<&DMatrix<f64>> {
        self.covariance_matrix_with(tree, DistanceStrategy::Dense)
    }

    /// Covariance matrix from focal-point distances: fast, approximate.
    pub fn covariance_matrix_focal(&mut self, tree: &Quadtree) -> Result<&DMatrix<f64>> {
        self.covariance_matrix_with(tree, DistanceStrategy::Focal)
    }

    /// Covariance matrix under an explicit distance strategy.
    pub fn covariance_matrix_with(
        &mut self,
        tree: &Quadtree,
        strategy: DistanceStrategy,
    ) -> Result<&DMatrix<f64>> {
        self.sync(tree);
        let slot_filled = match strategy {
            DistanceStrategy::Focal => self.cov_matrix_focal.is_some(),
            _ => self.cov_matrix.is_some() && self.cov_strategy == Some(strategy),
        };
        if !slot_filled {
            self.build_matrices(tree, strategy)?;
        }
        Ok(match strategy {
            DistanceStrategy::Focal => self.cov_matrix_focal.as_ref().unwrap(),
            _ => self.cov_matrix.as_ref().unwrap(),
        })
    }

    /// Weight matrix: inverse of the full covariance matrix.
    pub fn weight_matrix(&mut self, tree: &Quadtree) -> Result<&DMatrix<f64>> {
        self.sync(tree);
        if self.weight.is_none() {
            let cov = self.covariance_matrix(tree)?.clone();
            let inv = cov
                .try_inverse()
                .ok_or(QuadcovError::SingularCovariance)?;
            self.weight = Some(inv);
        }
        Ok(self.weight.as_ref().unwrap())
    }

    /// Weight matrix from the focal covariance matrix.
    pub fn weight_matrix_focal(&mut self, tree: &Quadtree) -> Result<&DMatrix<f64>> {
        self.sync(tree);
        if self.weight_focal.is_none() {
            let cov = self.covariance_matrix_focal(tree)?.clone();
            let inv = cov
                .try_inverse()
                .ok_or(QuadcovError::SingularCovariance)?;
            self.weight_focal = Some(inv);
        }
        Ok(self.weight_focal.as_ref().unwrap())
    }

    /// Scalar weight per leaf, in leaf order: column mean of the focal
    /// weight matrix at the leaf's index.
    pub fn leaf_weights(&mut self, tree: &Quadtree) -> Result<Vec<f64>> {
        let weight = self.weight_matrix_focal(tree)?;
        Ok((0..weight.ncols()).map(|c| weight.column(c).mean()).collect())
    }

    // ── Keyed lookups ────────────────────────────────────────────────────

    fn mapped_index(&self, id: TileId) -> Result<usize> {
        self.index_map
            .get(&id)
            .copied()
            .ok_or(QuadcovError::UnknownLeaf { id })
    }

    /// Covariance between two leaves by id.
    pub fn get_covariance(&mut self, tree: &Quadtree, a: TileId, b: TileId) -> Result<f64> {
        self.covariance_matrix(tree)?;
        let (i, j) = (self.mapped_index(a)?, self.mapped_index(b)?);
        Ok(self.cov_matrix.as_ref().unwrap()[(i, j)])
    }

    /// Pairwise distance between two leaves by id, metres.
    pub fn get_distance(&mut self, tree: &Quadtree, a: TileId, b: TileId) -> Result<f64> {
        self.covariance_matrix(tree)?;
        let (i, j) = (self.mapped_index(a)?, self.mapped_index(b)?);
        Ok(self.dist_matrix.as_ref().unwrap()[(i, j)])
    }

    /// Scalar weight of one leaf by id.
    pub fn get_leaf_weight(&mut self, tree: &Quadtree, id: TileId) -> Result<f64> {
        let weights = self.leaf_weights(tree)?;
        let i = self.mapped_index(id)?;
        Ok(weights[i])
    }
}

impl Default for Covariance {
    fn default() -> Self {
        Self::new(CovarianceConfig::default())
    }
}

impl std::fmt::Debug for Covariance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Covariance")
            .field("config", &self.config)
            .field("generation", &self.generation)
            .field("curve", &self.curve.is_some())
            .field("cov_matrix", &self.cov_matrix.is_some())
            .finish()
    }
}

/// Trim, deramp, and NaN-zero a candidate noise window. `None` when nothing
/// valid remains.
fn prepare_noise(data: Vec<f32>, rows: usize, cols: usize) -> Option<NoisePatch> {
    let (mut data, rows, cols) = trim_nan_border(&data, rows, cols);
    if data.is_empty() {
        return None;
    }
    deramp(&mut data, rows, cols);
    for v in data.iter_mut() {
        if v.is_nan() {
            *v = 0.0;
        }
    }
    Some(NoisePatch { data, rows, cols })
}

fn focal_distance(a: &QuadNode, b: &QuadNode) -> f64 {
    let (ae, an) = a.focal_point();
    let (be, bn) = b.focal_point();
    ((ae - be).powi(2) + (an - bn).powi(2)).sqrt()
}

/// Median of all cross-pairwise Euclidean distances between two coordinate
/// sets.
fn median_cross_distance(a: &(Vec<f64>, Vec<f64>), b: &(Vec<f64>, Vec<f64>)) -> f64 {
    let (ae, an) = a;
    let (be, bn) = b;
    let mut dists = Vec::with_capacity(ae.len() * be.len());
    for (e1, n1) in ae.iter().zip(an.iter()) {
        for (e2, n2) in be.iter().zip(bn.iter()) {
            dists.push(((e1 - e2).powi(2) + (n1 - n2).powi(2)).sqrt());
        }
    }
    median_f64(&mut dists)
}

/// Nearest-neighbour lookup over the uniformly spaced empirical curve;
/// zero outside its support and beyond the cutoff.
fn interp_nearest(cov: &[f64], dist: &[f64], d: f64, cutoff: f64) -> f64 {
    if cov.is_empty() || d > cutoff {
        return 0.0;
    }
    let lag = dist[0];
    if d < lag || d > dist[dist.len() - 1] {
        return 0.0;
    }
    let idx = ((d / lag).round() as usize).saturating_sub(1).min(cov.len() - 1);
    cov[idx]
}
