//! EvidMap Core - Evidential Multi-Resolution 3D Occupancy Mapping
//!
//! Each cell of a sparse octree carries a Dempster-Shafer belief mass over
//! {free, occupied, ignorance} instead of a single probability. This keeps
//! two states apart that a probabilistic map conflates:
//! 1. **No evidence**: full ignorance, never observed
//! 2. **Contradictory evidence**: high conflict, e.g. moving objects or noise
//!
//! Observations are fused with Dempster's rule, optionally after an
//! exponential time decay of the stored belief.

pub mod config;
pub mod conflict_registry;
pub mod error;
pub mod evid_fusion;
pub mod evid_mass;
pub mod evid_node;
pub mod evid_tree;
pub mod occupancy;
pub mod octree_key;
pub mod octree_node;
pub mod tree_registry;

// Re-export key types for convenience
pub use config::{MapConfig, TimeModel};
pub use conflict_registry::ConflictRegistry;
pub use error::MapError;
pub use evid_fusion::{FusionOutcome, LeafFusion};
pub use evid_mass::{BeliefAssignment, Combination, EvidMass};
pub use evid_node::{EvidNode, EvidPayload};
pub use evid_tree::{EvidOcTree, LeafRef, MapStats, Observation};
pub use octree_key::{KeyConverter, KeySet, OcTreeKey, TREE_DEPTH};
pub use octree_node::OcTreeNode;
pub use tree_registry::TreeRegistry;
