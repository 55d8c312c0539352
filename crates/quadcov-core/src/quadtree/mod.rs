//! Adaptive tessellation of a displacement raster.
//!
//! The tree is built once, to the conservative bound `epsilon_min`, and the
//! user-tunable `epsilon` only steers which existing nodes are reported as
//! the current leaf set. Re-thresholding therefore never rebuilds the tree;
//! only a change of the correction metric does.

mod node;

pub use node::{Correction, NodeStats, QuadNode, TileId};

use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{QuadcovError, Result};
use crate::event::{ChangeEvent, Subject};
use crate::grid::DisplacementGrid;

/// Nodes at or above this side length are always split during the build.
const SPLIT_LENGTH: usize = 64;
/// Nodes below this side length are never split.
const FLOOR_LENGTH: usize = 16;

/// Parameters reconstructing a particular tessellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuadtreeConfig {
    /// Node correction for splitting.
    pub correction: Correction,
    /// Threshold for leaf selection; `None` seeds from the raster's global
    /// standard deviation.
    pub epsilon: Option<f64>,
    /// Allowed NaN fraction per reported leaf, `0 < x <= 1`.
    pub nan_allowed: f64,
    /// Minimum allowed tile size in metres.
    pub tile_size_min: f64,
    /// Maximum allowed tile size in metres.
    pub tile_size_max: f64,
}

impl Default for QuadtreeConfig {
    fn default() -> Self {
        Self {
            correction: Correction::Median,
            epsilon: None,
            nan_allowed: 0.9,
            tile_size_min: 250.0,
            tile_size_max: 25e3,
        }
    }
}

/// Tessellation tree over a shared displacement raster.
///
/// Owns the node arena and the base tiles; exposes the current leaf set,
/// per-leaf aggregates, raster reconstruction, and change notification.
pub struct Quadtree {
    grid: Arc<DisplacementGrid>,
    config: QuadtreeConfig,
    arena: Vec<QuadNode>,
    base: Vec<usize>,
    epsilon: f64,
    epsilon_min: f64,
    frame_max_e: f64,
    frame_max_n: f64,
    /// Bumped on every structural or leaf-set change; cache-invalidation
    /// key for the covariance layer.
    generation: u64,
    pub events: Subject,
}

impl Quadtree {
    pub fn new(grid: Arc<DisplacementGrid>, config: QuadtreeConfig) -> Result<Self> {
        let epsilon_init = grid.global_std();
        let epsilon_init = if epsilon_init.is_nan() { 0.0 } else { epsilon_init };
        let epsilon_min = 0.2 * epsilon_init;

        let mut epsilon = epsilon_init;
        if let Some(e) = config.epsilon {
            if e < epsilon_min {
                warn!(
                    "epsilon {:.6} below epsilon_min {:.6}, using initial estimate",
                    e, epsilon_min
                );
            } else {
                epsilon = e;
            }
        }

        let mut tree = Self {
            frame_max_e: grid.max_e(),
            frame_max_n: grid.max_n(),
            grid,
            config,
            arena: Vec::new(),
            base: Vec::new(),
            epsilon,
            epsilon_min,
            generation: 0,
            events: Subject::new(),
        };
        tree.rebuild()?;
        Ok(tree)
    }

    /// Rebuild the physical tree: base tiling plus recursive split down to
    /// `epsilon_min` and the hard size floor.
    fn rebuild(&mut self) -> Result<()> {
        let t0 = Instant::now();
        self.arena.clear();
        self.base.clear();

        let grid = Arc::clone(&self.grid);
        let min_dim = grid.rows.min(grid.cols);
        if min_dim == 0 {
            return Err(QuadcovError::EmptyRaster);
        }
        // Smallest power of two covering the short raster axis.
        let init_length = (min_dim as f64).log2().ceil().exp2() as usize;
        let n_r = grid.rows.div_ceil(init_length);
        let n_c = grid.cols.div_ceil(init_length);

        let mut stack: Vec<usize> = Vec::new();
        for ir in 0..n_r {
            for ic in 0..n_c {
                let node = QuadNode::evaluate(
                    &grid,
                    self.frame_max_e,
                    self.frame_max_n,
                    ir * init_length,
                    ic * init_length,
                    init_length,
                );
                if let Some(node) = node {
                    let idx = self.arena.len();
                    self.arena.push(node);
                    self.base.push(idx);
                    stack.push(idx);
                }
            }
        }
        if self.base.is_empty() {
            return Err(QuadcovError::EmptyRaster);
        }

        let correction = self.config.correction;
        while let Some(idx) = stack.pop() {
            let (row0, col0, length, metric) = {
                let n = &self.arena[idx];
                (n.row0, n.col0, n.length, n.metric(correction))
            };
            let split = length >= FLOOR_LENGTH
                && (metric > self.epsilon_min || length >= SPLIT_LENGTH);
            if !split {
                continue;
            }
            let half = length / 2;
            let mut children = [None; 4];
            for (q, (dr, dc)) in [(0, 0), (0, 1), (1, 0), (1, 1)].into_iter().enumerate() {
                let child = QuadNode::evaluate(
                    &grid,
                    self.frame_max_e,
                    self.frame_max_n,
                    row0 + half * dr,
                    col0 + half * dc,
                    half,
                );
                if let Some(child) = child {
                    let cidx = self.arena.len();
                    self.arena.push(child);
                    children[q] = Some(cidx);
                    stack.push(cidx);
                }
            }
            self.arena[idx].children = Some(children);
        }

        debug!(
            "tree created, {} nodes [{:.4}s]",
            self.arena.len(),
            t0.elapsed().as_secs_f64()
        );
        Ok(())
    }

    // ── Configuration ────────────────────────────────────────────────────

    pub fn config(&self) -> &QuadtreeConfig {
        &self.config
    }

    pub fn grid(&self) -> &Arc<DisplacementGrid> {
        &self.grid
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Lowest allowed epsilon, derived once from the raw raster.
    pub fn epsilon_min(&self) -> f64 {
        self.epsilon_min
    }

    /// Set the leaf-selection threshold. Values below `epsilon_min` are
    /// rejected with a warning and the previous state is kept. Returns
    /// whether the value was applied.
    pub fn set_epsilon(&mut self, value: f64) -> bool {
        if value == self.epsilon {
            return true;
        }
        if value < self.epsilon_min {
            warn!(
                "epsilon {:.6} out of bounds, epsilon_min {:.6}",
                value, self.epsilon_min
            );
            return false;
        }
        self.epsilon = value;
        self.config.epsilon = Some(value);
        self.generation += 1;
        self.events.notify(ChangeEvent::LeavesChanged);
        true
    }

    /// Set the allowed NaN fraction per leaf, `0 < x <= 1`.
    pub fn set_nan_allowed(&mut self, value: f64) -> bool {
        if !(value > 0.0 && value <= 1.0) {
            warn!("NaN fraction must satisfy 0 < nan_allowed <= 1, got {}", value);
            return false;
        }
        self.config.nan_allowed = value;
        self.generation += 1;
        self.events.notify(ChangeEvent::LeavesChanged);
        true
    }

    /// Set the minimum physical tile size. Rejected when above the maximum.
    pub fn set_tile_size_min(&mut self, value: f64) -> bool {
        if value > self.config.tile_size_max {
            warn!("tile_size_min <= tile_size_max is required");
            return false;
        }
        self.config.tile_size_min = value;
        self.generation += 1;
        self.events.notify(ChangeEvent::LeavesChanged);
        true
    }

    /// Set the maximum physical tile size. Rejected when below the minimum.
    pub fn set_tile_size_max(&mut self, value: f64) -> bool {
        if value < self.config.tile_size_min {
            warn!("tile_size_min <= tile_size_max is required");
            return false;
        }
        self.config.tile_size_max = value;
        self.generation += 1;
        self.events.notify(ChangeEvent::LeavesChanged);
        true
    }

    /// Change the node-scoring metric and rebuild the physical tree.
    pub fn set_correction(&mut self, correction: Correction) -> Result<()> {
        debug!("changing split method to {:?}", correction);
        self.config.correction = correction;
        self.rebuild()?;
        self.generation += 1;
        self.events.notify(ChangeEvent::TreeRebuilt);
        Ok(())
    }

    /// Tile size limits converted to pixels along the long spacing axis.
    fn tile_size_lim_px(&self) -> (usize, usize) {
        let dpx = self.grid.max_spacing();
        (
            (self.config.tile_size_min / dpx) as usize,
            (self.config.tile_size_max / dpx) as usize,
        )
    }

    // ── Tree access ──────────────────────────────────────────────────────

    pub fn n_nodes(&self) -> usize {
        self.arena.len()
    }

    pub fn node(&self, idx: usize) -> &QuadNode {
        &self.arena[idx]
    }

    /// Arena indices of the base tiles.
    pub fn base_nodes(&self) -> &[usize] {
        &self.base
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Arena indices of the current leaf set, in deterministic depth-first
    /// order. Re-evaluated on every call; leaves over the NaN allowance are
    /// dropped from the report but stay in the tree.
    pub fn leaf_indices(&self) -> Vec<usize> {
        let t0 = Instant::now();
        let (min_px, max_px) = self.tile_size_lim_px();
        let mut out = Vec::new();
        for &b in &self.base {
            self.select(b, min_px, max_px, &mut out);
        }
        out.retain(|&i| self.arena[i].stats.nan_fraction < self.config.nan_allowed);
        debug!(
            "gathered {} leaves for epsilon {:.4} [{:.4}s]",
            out.len(),
            self.epsilon,
            t0.elapsed().as_secs_f64()
        );
        out
    }

    fn select(&self, idx: usize, min_px: usize, max_px: usize, out: &mut Vec<usize>) {
        let node = &self.arena[idx];
        let by_metric = node.metric(self.config.correction) < self.epsilon
            && node.length <= max_px;
        let children = match &node.children {
            Some(children) if !by_metric => children,
            _ => {
                out.push(idx);
                return;
            }
        };
        // Children would undercut the minimum tile size: forced leaf.
        if node.length / 2 < min_px {
            out.push(idx);
            return;
        }
        for child in children.iter().flatten() {
            self.select(*child, min_px, max_px, out);
        }
    }

    /// Current leaf set as node references.
    pub fn leaves(&self) -> Vec<&QuadNode> {
        self.leaf_indices().into_iter().map(|i| &self.arena[i]).collect()
    }

    pub fn n_leaves(&self) -> usize {
        self.leaf_indices().len()
    }

    // ── Leaf aggregation ─────────────────────────────────────────────────

    pub fn leaf_means(&self) -> Vec<f64> {
        self.leaves().iter().map(|l| l.stats.mean).collect()
    }

    pub fn leaf_medians(&self) -> Vec<f64> {
        self.leaves().iter().map(|l| l.stats.median).collect()
    }

    pub fn leaf_focal_points(&self) -> Vec<(f64, f64)> {
        self.leaves().iter().map(|l| l.focal_point()).collect()
    }

    /// Scatter one value per current leaf back onto the raster footprint.
    /// Pixels not covered by a leaf, and originally-missing pixels, stay
    /// NaN. `values` must match the current leaf count.
    pub fn leaf_raster(&self, values: &[f64]) -> Result<Vec<f32>> {
        let leaves = self.leaves();
        if values.len() != leaves.len() {
            return Err(QuadcovError::ShapeMismatch {
                expected: leaves.len(),
                got: values.len(),
            });
        }
        Ok(self.scatter(&leaves, values))
    }

    fn scatter(&self, leaves: &[&QuadNode], values: &[f64]) -> Vec<f32> {
        let mut out = vec![f32::NAN; self.grid.rows * self.grid.cols];
        for (leaf, &v) in leaves.iter().zip(values.iter()) {
            for r in leaf.row_range() {
                for c in leaf.col_range() {
                    out[self.grid.index(r, c)] = v as f32;
                }
            }
        }
        for (o, d) in out.iter_mut().zip(self.grid.displacement.iter()) {
            if d.is_nan() {
                *o = f32::NAN;
            }
        }
        out
    }

    /// Leaf mean displacements cast onto the raster shape.
    pub fn leaf_matrix_means(&self) -> Vec<f32> {
        let leaves = self.leaves();
        let values: Vec<f64> = leaves.iter().map(|l| l.stats.mean).collect();
        self.scatter(&leaves, &values)
    }

    /// Leaf median displacements cast onto the raster shape.
    pub fn leaf_matrix_medians(&self) -> Vec<f32> {
        let leaves = self.leaves();
        let values: Vec<f64> = leaves.iter().map(|l| l.stats.median).collect();
        self.scatter(&leaves, &values)
    }

    /// Data reduction of the tessellation: full pixel count over leaf count.
    pub fn reduction_efficiency(&self) -> f64 {
        (self.grid.rows * self.grid.cols) as f64 / self.n_leaves() as f64
    }

    /// RMS error between the leaf-mean reconstruction and the displacement.
    pub fn reduction_rms(&self) -> f64 {
        let recon = self.leaf_matrix_means();
        let mut sum = 0f64;
        let mut count = 0u64;
        for (&d, &m) in self.grid.displacement.iter().zip(recon.iter()) {
            if !d.is_nan() && !m.is_nan() {
                let e = (d - m) as f64;
                sum += e * e;
                count += 1;
            }
        }
        if count == 0 {
            f64::NAN
        } else {
            (sum / count as f64).sqrt()
        }
    }
}

impl std::fmt::Debug for Quadtree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quadtree")
            .field("nodes", &self.arena.len())
            .field("base", &self.base.len())
            .field("epsilon", &self.epsilon)
            .field("epsilon_min", &self.epsilon_min)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-noise in [-1, 1] from pixel position.
    fn lcg_noise(seed: u64, r: usize, c: usize) -> f32 {
        let mut s = seed
            .wrapping_add((r as u64) << 32)
            .wrapping_add(c as u64)
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        s ^= s >> 33;
        s = s.wrapping_mul(0xff51afd7ed558ccd);
        ((s >> 40) as f32 / ((1u64 << 24) as f32)) * 2.0 - 1.0
    }

    fn noise_grid(n: usize) -> Arc<DisplacementGrid> {
        let values: Vec<f32> = (0..n)
            .flat_map(|r| (0..n).map(move |c| lcg_noise(7, r, c)))
            .collect();
        Arc::new(DisplacementGrid::regular(n, n, values, 1.0, 1.0).unwrap())
    }

    fn fine_config() -> QuadtreeConfig {
        QuadtreeConfig {
            tile_size_min: 1.0,
            tile_size_max: 1e5,
            ..QuadtreeConfig::default()
        }
    }

    fn window_pixels(node: &QuadNode) -> Vec<(usize, usize)> {
        node.row_range()
            .flat_map(|r| node.col_range().map(move |c| (r, c)))
            .collect()
    }

    #[test]
    fn base_tiles_cover_raster_without_overlap() {
        // Non-square raster forces multiple clipped base tiles.
        let values: Vec<f32> = (0..48 * 100)
            .map(|i| lcg_noise(3, i / 100, i % 100))
            .collect();
        let grid = Arc::new(DisplacementGrid::regular(48, 100, values, 1.0, 1.0).unwrap());
        let tree = Quadtree::new(grid.clone(), fine_config()).unwrap();

        let mut covered = vec![0u8; 48 * 100];
        for &b in tree.base_nodes() {
            for (r, c) in window_pixels(tree.node(b)) {
                covered[r * 100 + c] += 1;
            }
        }
        assert!(covered.iter().all(|&n| n == 1), "base tiles must tile exactly");
    }

    #[test]
    fn children_partition_parent_footprint() {
        let tree = Quadtree::new(noise_grid(64), fine_config()).unwrap();
        for idx in 0..tree.n_nodes() {
            let node = tree.node(idx);
            let Some(children) = &node.children else { continue };
            let mut seen = std::collections::HashSet::new();
            for child in children.iter().flatten() {
                let child = tree.node(*child);
                assert_eq!(child.length * 2, node.length);
                for px in window_pixels(child) {
                    assert!(seen.insert(px), "child windows must be disjoint");
                }
            }
            // Omitted quadrants only happen over empty/NaN footprints; this
            // raster has none inside the parent window.
            assert_eq!(seen.len(), window_pixels(node).len());
        }
    }

    #[test]
    fn leaf_selection_is_idempotent() {
        let tree = Quadtree::new(noise_grid(64), fine_config()).unwrap();
        let a: Vec<TileId> = tree.leaves().iter().map(|l| l.id).collect();
        let b: Vec<TileId> = tree.leaves().iter().map(|l| l.id).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn raising_epsilon_never_increases_leaf_count() {
        let mut tree = Quadtree::new(noise_grid(64), fine_config()).unwrap();
        let eps_min = tree.epsilon_min();
        let mut last_count = usize::MAX;
        let mut last_min_len = 0usize;
        for step in 0..6 {
            let eps = eps_min + (step as f64) * eps_min;
            assert!(tree.set_epsilon(eps));
            let leaves = tree.leaves();
            let count = leaves.len();
            let min_len = leaves.iter().map(|l| l.length).min().unwrap();
            assert!(count <= last_count, "leaf count grew when raising epsilon");
            assert!(min_len >= last_min_len, "tiles shrank when raising epsilon");
            last_count = count;
            last_min_len = min_len;
        }
    }

    #[test]
    fn epsilon_below_min_is_rejected() {
        let mut tree = Quadtree::new(noise_grid(32), fine_config()).unwrap();
        let before = tree.epsilon();
        assert!(!tree.set_epsilon(tree.epsilon_min() / 2.0));
        assert_eq!(tree.epsilon(), before);
    }

    #[test]
    fn inverted_tile_sizes_are_rejected() {
        let mut tree = Quadtree::new(noise_grid(32), fine_config()).unwrap();
        assert!(!tree.set_tile_size_min(2e5));
        assert!(!tree.set_tile_size_max(0.5));
        assert_eq!(tree.config().tile_size_min, 1.0);
        assert_eq!(tree.config().tile_size_max, 1e5);
    }

    #[test]
    fn nan_allowed_bounds_are_enforced() {
        let mut tree = Quadtree::new(noise_grid(32), fine_config()).unwrap();
        assert!(!tree.set_nan_allowed(0.0));
        assert!(!tree.set_nan_allowed(1.5));
        assert!(tree.set_nan_allowed(0.5));
    }

    #[test]
    fn leaves_respect_nan_allowance() {
        // Mask one quadrant almost entirely.
        let n = 64;
        let values: Vec<f32> = (0..n * n)
            .map(|i| {
                let (r, c) = (i / n, i % n);
                if r < 24 && c < 24 {
                    f32::NAN
                } else {
                    lcg_noise(11, r, c)
                }
            })
            .collect();
        let grid = Arc::new(DisplacementGrid::regular(n, n, values, 1.0, 1.0).unwrap());
        let mut tree = Quadtree::new(grid, fine_config()).unwrap();
        assert!(tree.set_nan_allowed(0.3));
        for leaf in tree.leaves() {
            assert!(leaf.stats.nan_fraction < 0.3);
        }
    }

    #[test]
    fn fully_nan_raster_fails_construction() {
        let grid = Arc::new(
            DisplacementGrid::regular(32, 32, vec![f32::NAN; 32 * 32], 1.0, 1.0).unwrap(),
        );
        assert!(matches!(
            Quadtree::new(grid, QuadtreeConfig::default()),
            Err(QuadcovError::EmptyRaster)
        ));
    }

    #[test]
    fn uniform_raster_stops_at_largest_tile() {
        let grid = Arc::new(
            DisplacementGrid::regular(64, 64, vec![1.5; 64 * 64], 1.0, 1.0).unwrap(),
        );
        let tree = Quadtree::new(grid, fine_config()).unwrap();
        assert_eq!(tree.epsilon_min(), 0.0);
        // Zero-variance nodes split only through the always-split band, so
        // the finest structure is SPLIT_LENGTH / 2.
        for leaf in tree.leaves() {
            assert_eq!(leaf.length, SPLIT_LENGTH / 2);
        }
    }

    #[test]
    fn step_discontinuity_refines_near_the_step() {
        let n = 128;
        let values: Vec<f32> = (0..n * n)
            .map(|i| {
                let c = i % n;
                let base = if c < n / 2 { 0.0 } else { 10.0 };
                base + 0.01 * lcg_noise(5, i / n, c)
            })
            .collect();
        let grid = Arc::new(DisplacementGrid::regular(n, n, values, 1.0, 1.0).unwrap());
        let mut tree = Quadtree::new(grid, fine_config()).unwrap();
        // Threshold well between the noise floor and the step amplitude, so
        // step-crossing tiles recurse and flat tiles stop early.
        assert!(tree.set_epsilon(tree.epsilon_min() * 1.5));

        let mut min_near = usize::MAX;
        let mut min_far = usize::MAX;
        for leaf in tree.leaves() {
            let crosses = leaf.col0 < n / 2 && leaf.col_end > n / 2;
            let near = crosses
                || leaf.col_end.abs_diff(n / 2) <= 8
                || leaf.col0.abs_diff(n / 2) <= 8;
            if near {
                min_near = min_near.min(leaf.length);
            } else {
                min_far = min_far.min(leaf.length);
            }
        }
        assert!(
            min_near < min_far,
            "expected finer tiles at the step: near {} vs far {}",
            min_near,
            min_far
        );
    }

    #[test]
    fn leaf_raster_scatters_and_masks() {
        let tree = Quadtree::new(noise_grid(32), fine_config()).unwrap();
        let means = tree.leaf_means();
        let raster = tree.leaf_raster(&means).unwrap();
        assert_eq!(raster.len(), 32 * 32);
        assert!(raster.iter().all(|v| !v.is_nan()));

        let err = tree.leaf_raster(&means[..means.len() - 1]);
        assert!(matches!(err, Err(QuadcovError::ShapeMismatch { .. })));
    }

    #[test]
    fn reduction_rms_is_finite_and_positive() {
        let tree = Quadtree::new(noise_grid(64), fine_config()).unwrap();
        let rms = tree.reduction_rms();
        assert!(rms.is_finite() && rms > 0.0);
        assert!(tree.reduction_efficiency() > 1.0);
    }

    #[test]
    fn config_changes_move_the_generation() {
        let mut tree = Quadtree::new(noise_grid(32), fine_config()).unwrap();
        let g0 = tree.generation();
        assert!(tree.set_epsilon(tree.epsilon() * 1.5));
        assert!(tree.generation() > g0);
        let g1 = tree.generation();
        tree.set_correction(Correction::Bilinear).unwrap();
        assert!(tree.generation() > g1);
    }

    #[test]
    fn events_fire_on_leaf_set_change() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc as StdArc;

        let mut tree = Quadtree::new(noise_grid(32), fine_config()).unwrap();
        let hits = StdArc::new(AtomicUsize::new(0));
        let hits2 = StdArc::clone(&hits);
        tree.events.subscribe(move |ev| {
            if ev == ChangeEvent::LeavesChanged {
                hits2.fetch_add(1, Ordering::SeqCst);
            }
        });
        tree.set_epsilon(tree.epsilon() * 2.0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
