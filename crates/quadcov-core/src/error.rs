use thiserror::Error;

use crate::quadtree::TileId;

/// Errors surfaced by the quadtree and covariance engines.
#[derive(Debug, Error)]
pub enum QuadcovError {
    /// The raster produced zero valid base tiles (empty or fully NaN).
    #[error("could not construct base tiles: raster is empty or fully masked")]
    EmptyRaster,

    /// An input array does not match the expected element count.
    #[error("shape mismatch: expected {expected} values, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    /// A covariance/distance query named a leaf absent from the current
    /// leaf mapping.
    #[error("unknown quadtree leaf with id {id}")]
    UnknownLeaf { id: TileId },

    /// No leaves are available under the current thresholds, so a noise
    /// patch cannot be selected.
    #[error("no leaves available for noise patch selection")]
    NoLeaves,

    /// The covariance matrix could not be inverted.
    #[error("covariance matrix is singular, cannot compute weight matrix")]
    SingularCovariance,

    /// The nonlinear covariance-model fit failed to converge.
    #[error("exponential covariance fit did not converge after {iterations} iterations")]
    FitDiverged { iterations: usize },

    /// The empirical covariance curve is empty (noise patch too small).
    #[error("empirical covariance curve is empty, noise patch too small")]
    EmptyCovarianceCurve,
}

pub type Result<T> = std::result::Result<T, QuadcovError>;
