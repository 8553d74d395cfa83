//! arborspace: analysis and transformation of reconstructed tree skeletons.
//!
//! A tree here is a rooted hierarchy of tapered cylindrical segments, typically
//! recovered from a LiDAR point cloud by an upstream reconstruction stage. This
//! crate provides the branch-structure core that operates on such trees:
//!
//! - [`model`]: the shared segment-arena representation (`Segment`, `Tree`,
//!   `Forest`) with integer parent indices and per-tree attribute schemas.
//! - [`powerlaw`]: weighted log-log least-squares fit of rank-size
//!   distributions, `count(size ≥ x) ≈ c·x^d`.
//! - [`allometry`]: traversal passes deriving branch lengths, bifurcation
//!   dominance and angle, trunk bend, DBH, monocotal score and fractal
//!   dimension.
//! - [`transform`]: diameter pruning, length pruning and decimation, all
//!   preserving the rooted-tree topology invariant.
//! - [`growth`]: procedural extension of every leaf into plausible new
//!   bifurcations, with optional power-law shedding of excess branches.
//! - [`overlap`]: approximate intersection volume of two near-parallel
//!   cylinder sets, used to compare two versions of a tree.
//! - [`smooth`]: radius-proportional straightening of noisy segment chains.
//!
//! All operations are pure functions over in-memory trees; loading, saving,
//! meshing and rendering are external collaborators. Forest-level operations
//! parallelize across trees with rayon, since trees are independent.
//!
//! Logging uses the `log` facade throughout; mount `env_logger` or any other
//! backend in the host application to see it.

pub mod allometry;
pub mod growth;
pub mod model;
pub mod overlap;
pub mod powerlaw;
pub mod smooth;
pub mod transform;

#[cfg(test)]
mod tests;
