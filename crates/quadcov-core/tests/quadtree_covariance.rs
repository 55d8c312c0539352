//! End-to-end scenarios: raster -> quadtree -> covariance/weight matrices.

use std::sync::Arc;

use nalgebra::DMatrix;
use quadcov_core::{
    Covariance, CovarianceConfig, DisplacementGrid, DistanceStrategy, QuadcovError, Quadtree,
    QuadtreeConfig, TileId,
};

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

fn scene(n: usize) -> Arc<DisplacementGrid> {
    // Smooth bump plus noise: a displacement-like synthetic scene.
    let values: Vec<f32> = (0..n * n)
        .map(|i| {
            let (r, c) = (i / n, i % n);
            let x = (c as f64 / n as f64 - 0.5) * 6.0;
            let y = (r as f64 / n as f64 - 0.5) * 6.0;
            let bump = (-(x * x + y * y)).exp() as f32;
            bump + 0.1 * lcg_noise(13, r, c)
        })
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

fn noise_patch(n: usize) -> Vec<f32> {
    (0..n * n).map(|i| lcg_noise(99, i / n, i % n)).collect()
}

/// Superposition of low-frequency cosines with power falling as 1/k, plus a
/// little noise: a spatially correlated patch with a decaying covariance.
fn correlated_patch(n: usize) -> Vec<f32> {
    let mut patch = vec![0f32; n * n];
    for k in 1..=8usize {
        let amp = 1.0 / k as f64;
        for r in 0..n {
            for c in 0..n {
                let phase = 2.0 * std::f64::consts::PI * k as f64
                    * (r as f64 + 0.7 * c as f64)
                    / n as f64;
                patch[r * n + c] += (amp * phase.cos()) as f32;
            }
        }
    }
    for (i, v) in patch.iter_mut().enumerate() {
        *v += 0.01 * lcg_noise(3, i / n, i % n);
    }
    patch
}

fn setup() -> (Quadtree, Covariance) {
    let tree = Quadtree::new(scene(64), fine_config()).unwrap();
    let mut cov = Covariance::new(CovarianceConfig::default());
    cov.set_noise_data(noise_patch(64), 64, 64).unwrap();
    (tree, cov)
}

#[test]
fn covariance_matrix_is_symmetric_with_variance_diagonal() {
    let (tree, mut cov) = setup();
    let variance = cov.variance(&tree).unwrap();
    let matrix = cov.covariance_matrix_focal(&tree).unwrap();
    let n = matrix.nrows();
    assert_eq!(n, tree.n_leaves());
    for i in 0..n {
        assert_eq!(matrix[(i, i)], variance);
        for j in 0..i {
            assert_eq!(matrix[(i, j)], matrix[(j, i)]);
        }
    }
}

#[test]
fn weight_matrix_inverts_the_covariance_matrix() {
    let (tree, mut cov) = setup();
    let c = cov.covariance_matrix_focal(&tree).unwrap().clone();
    let w = cov.weight_matrix_focal(&tree).unwrap().clone();
    let n = c.nrows();
    let residual = (&c * &w - DMatrix::<f64>::identity(n, n)).abs().max();
    assert!(residual < 1e-8, "C * W deviates from identity by {}", residual);
}

#[test]
fn covariance_lookup_is_symmetric() {
    let (tree, mut cov) = setup();
    let ids: Vec<TileId> = tree.leaves().iter().map(|l| l.id).collect();
    let (a, b) = (ids[0], ids[ids.len() / 2]);
    let ab = cov.get_covariance(&tree, a, b).unwrap();
    let ba = cov.get_covariance(&tree, b, a).unwrap();
    assert_eq!(ab, ba);
    let dab = cov.get_distance(&tree, a, b).unwrap();
    let dba = cov.get_distance(&tree, b, a).unwrap();
    assert_eq!(dab, dba);
    assert!(dab > 0.0);
}

#[test]
fn unknown_leaf_lookup_names_the_id() {
    let (tree, mut cov) = setup();
    let bogus = TileId {
        row: 999,
        col: 999,
        length: 4,
    };
    let known = tree.leaves()[0].id;
    let err = cov.get_covariance(&tree, known, bogus).unwrap_err();
    assert!(matches!(err, QuadcovError::UnknownLeaf { .. }));
    assert!(err.to_string().contains("tile_999-999_4"), "got: {}", err);
}

#[test]
fn subsampled_and_dense_strategies_agree_at_full_resolution() {
    let tree = Quadtree::new(scene(64), fine_config()).unwrap();

    let mut cov_a = Covariance::new(CovarianceConfig::default());
    cov_a.set_noise_data(noise_patch(64), 64, 64).unwrap();
    cov_a.set_subsampling(1);
    let a = cov_a
        .covariance_matrix_with(&tree, DistanceStrategy::Matrix)
        .unwrap()
        .clone();

    let mut cov_b = Covariance::new(CovarianceConfig::default());
    cov_b.set_noise_data(noise_patch(64), 64, 64).unwrap();
    let b = cov_b
        .covariance_matrix_with(&tree, DistanceStrategy::Dense)
        .unwrap()
        .clone();

    assert_eq!(a.nrows(), b.nrows());
    let diff = (&a - &b).abs().max();
    assert!(diff < 1e-12, "strategies diverge by {}", diff);
}

#[test]
fn switching_strategies_recomputes_the_matrix() {
    // Matrix and Dense share a cache slot; a Matrix request after a Dense
    // build must not be served from the Dense result.
    let (tree, mut cov) = setup();
    let dense = cov
        .covariance_matrix_with(&tree, DistanceStrategy::Dense)
        .unwrap()
        .clone();
    let matrix = cov
        .covariance_matrix_with(&tree, DistanceStrategy::Matrix)
        .unwrap()
        .clone();

    let mut fresh = Covariance::new(CovarianceConfig::default());
    fresh.set_noise_data(noise_patch(64), 64, 64).unwrap();
    let expected = fresh
        .covariance_matrix_with(&tree, DistanceStrategy::Matrix)
        .unwrap()
        .clone();

    assert_eq!((&matrix - &expected).abs().max(), 0.0);
    assert!(
        (&dense - &matrix).abs().max() > 0.0,
        "subsampled distances must differ from dense distances"
    );
}

#[test]
fn leaf_set_change_invalidates_matrices() {
    let (mut tree, mut cov) = setup();
    // Finest selection first, then a much coarser threshold.
    assert!(tree.set_epsilon(tree.epsilon_min()));
    let n_before = cov.covariance_matrix_focal(&tree).unwrap().nrows();
    assert!(tree.set_epsilon(tree.epsilon_min() * 12.0));
    let n_after = cov.covariance_matrix_focal(&tree).unwrap().nrows();
    assert_eq!(n_after, tree.n_leaves());
    assert!(n_after < n_before, "coarser epsilon must shrink the leaf set");
}

#[test]
fn leaf_weights_cover_every_leaf() {
    let (tree, mut cov) = setup();
    let weights = cov.leaf_weights(&tree).unwrap();
    assert_eq!(weights.len(), tree.n_leaves());
    assert!(weights.iter().all(|w| w.is_finite()));

    // Weight raster reconstructs onto the scene footprint.
    let raster = tree.leaf_raster(&weights).unwrap();
    assert_eq!(raster.len(), 64 * 64);
}

#[test]
fn noise_patch_prefers_large_complete_leaves() {
    // Mask a corner so some leaves are gappy; the selected patch must come
    // from a clean region at the coarsest leaf size.
    let n = 64;
    let values: Vec<f32> = (0..n * n)
        .map(|i| {
            let (r, c) = (i / n, i % n);
            if r < 20 && c < 20 {
                f32::NAN
            } else {
                lcg_noise(21, r, c)
            }
        })
        .collect();
    let grid = Arc::new(DisplacementGrid::regular(n, n, values, 1.0, 1.0).unwrap());
    let tree = Quadtree::new(grid, fine_config()).unwrap();
    let mut cov = Covariance::new(CovarianceConfig::default());

    let max_leaf_len = tree.leaves().iter().map(|l| l.length).max().unwrap();
    let (patch, rows, cols) = cov.noise_data(&tree).unwrap();
    assert_eq!(rows.max(cols), max_leaf_len);
    assert!(patch.iter().all(|v| !v.is_nan()));
}

#[test]
fn analytical_fit_produces_positive_decay() {
    let n = 64;
    let tree = Quadtree::new(scene(64), fine_config()).unwrap();
    let mut cov = Covariance::new(CovarianceConfig::default());
    cov.set_noise_data(correlated_patch(n), n, n).unwrap();
    let (a, b) = cov.coefficients(&tree).unwrap();
    assert!(a > 0.0, "decay length a = {}", a);
    assert!(b > 0.0, "amplitude b = {}", b);
}

#[test]
fn structure_function_grows_from_the_shortest_lag() {
    let n = 64;
    let tree = Quadtree::new(scene(64), fine_config()).unwrap();
    let mut cov = Covariance::new(CovarianceConfig::default());
    cov.set_noise_data(correlated_patch(n), n, n).unwrap();

    let (structure, dist) = cov.structure_function(&tree).unwrap();
    let (curve_cov, curve_dist) = cov.covariance_function(&tree).unwrap();
    assert_eq!(structure.len(), dist.len());
    assert_eq!(dist, curve_dist);
    assert_eq!(curve_cov.len(), structure.len());
    assert!(structure.iter().all(|v| v.is_finite() && *v >= 0.0));
    // Low-wavenumber power: near-zero at the shortest lag, larger mid-curve.
    assert!(structure[0] < structure[structure.len() / 2]);
}
