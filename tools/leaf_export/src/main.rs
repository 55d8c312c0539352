/// Leaf export tool: reads a displacement scene as JSON, builds the adaptive
/// quadtree and its covariance model, and writes the leaf table as CSV.
///
/// The CSV carries one row per selected leaf with its focal point, look
/// angles, corrected displacement statistics and inverse-covariance weight.
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use quadcov_core::{
    Correction, Covariance, CovarianceConfig, DisplacementGrid, DistanceStrategy, Quadtree,
    QuadtreeConfig,
};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "leaf_export",
    about = "Build a quadtree over a displacement scene and export the leaf table as CSV"
)]
struct Args {
    /// Input scene JSON (a serialized DisplacementGrid)
    #[arg(short, long)]
    input: PathBuf,

    /// Output CSV path
    #[arg(short, long, default_value = "leaves.csv")]
    output: PathBuf,

    /// Leaf-selection threshold; omit to use the scene's own estimate
    #[arg(long)]
    epsilon: Option<f64>,

    /// Tile correction applied before the split metric: mean, median, bilinear, std
    #[arg(long, default_value = "median")]
    correction: String,

    /// Maximum NaN fraction tolerated in a leaf
    #[arg(long, default_value = "0.9")]
    nan_allowed: f64,

    /// Minimum leaf size in scene units
    #[arg(long, default_value = "250.0")]
    tile_size_min: f64,

    /// Maximum leaf size in scene units
    #[arg(long, default_value = "25000.0")]
    tile_size_max: f64,

    /// Distance strategy for the leaf covariance matrix: focal, matrix, dense
    #[arg(long, default_value = "dense")]
    strategy: String,

    /// Pixel subsampling step for the matrix strategy
    #[arg(long, default_value = "23")]
    subsampling: usize,

    /// Skip covariance weighting (the weight column is left empty)
    #[arg(long)]
    no_weights: bool,
}

fn parse_correction(name: &str) -> Result<Correction> {
    Ok(match name {
        "mean" => Correction::Mean,
        "median" => Correction::Median,
        "bilinear" => Correction::Bilinear,
        "std" => Correction::Std,
        other => bail!("unknown correction '{other}' (expected mean, median, bilinear or std)"),
    })
}

fn parse_strategy(name: &str) -> Result<DistanceStrategy> {
    Ok(match name {
        "focal" => DistanceStrategy::Focal,
        "matrix" => DistanceStrategy::Matrix,
        "dense" => DistanceStrategy::Dense,
        other => bail!("unknown strategy '{other}' (expected focal, matrix or dense)"),
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let raw = fs::read_to_string(&args.input)
        .with_context(|| format!("reading scene {}", args.input.display()))?;
    let grid: DisplacementGrid =
        serde_json::from_str(&raw).context("parsing scene JSON")?;

    let config = QuadtreeConfig {
        correction: parse_correction(&args.correction)?,
        epsilon: args.epsilon,
        nan_allowed: args.nan_allowed,
        tile_size_min: args.tile_size_min,
        tile_size_max: args.tile_size_max,
    };
    let tree = Quadtree::new(Arc::new(grid), config)?;
    eprintln!(
        "quadtree: {} leaves (epsilon {:.4}, reduction factor {:.1})",
        tree.n_leaves(),
        tree.epsilon(),
        tree.reduction_efficiency()
    );

    let weights = if args.no_weights {
        None
    } else {
        let mut cov = Covariance::new(CovarianceConfig {
            subsampling: args.subsampling,
            ..CovarianceConfig::default()
        });
        cov.covariance_matrix_with(&tree, parse_strategy(&args.strategy)?)?;
        Some(cov.leaf_weights(&tree)?)
    };

    let mut out = fs::File::create(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;
    writeln!(
        out,
        "# id, focal_point_E, focal_point_N, theta, phi, mean, median, weight"
    )?;
    for (i, leaf) in tree.leaves().iter().enumerate() {
        let (fe, fn_) = leaf.focal_point();
        write!(
            out,
            "{}, {:.6}, {:.6}, {:.6}, {:.6}, {:.6}, {:.6}",
            leaf.id, fe, fn_, leaf.stats.theta, leaf.stats.phi, leaf.stats.mean, leaf.stats.median
        )?;
        match &weights {
            Some(w) => writeln!(out, ", {:.6}", w[i])?,
            None => writeln!(out, ",")?,
        }
    }
    eprintln!("wrote {}", args.output.display());
    Ok(())
}
