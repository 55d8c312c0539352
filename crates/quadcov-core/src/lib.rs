//! Adaptive quadtree tessellation and spatial covariance weighting for 2D
//! surface-displacement rasters.
//!
//! A displacement scene is reduced to a small set of variable-resolution
//! tiles by [`quadtree::Quadtree`]; [`covariance::Covariance`] estimates a
//! covariance/weight model over the reported leaves so that downstream
//! inversion can account for spatially correlated noise.

pub mod covariance;
pub mod error;
pub mod event;
pub mod grid;
pub mod quadtree;

mod detrend;
mod stats;

pub use covariance::{Covariance, CovarianceConfig, DistanceStrategy};
pub use error::QuadcovError;
pub use event::{ChangeEvent, Subject};
pub use grid::DisplacementGrid;
pub use quadtree::{Correction, QuadNode, Quadtree, QuadtreeConfig, TileId};
