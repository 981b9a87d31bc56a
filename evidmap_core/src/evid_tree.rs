//! The "MAP" Engine - Evidential Occupancy Octree
//!
//! Keeps a Dempster-Shafer belief mass in every node of a sparse octree:
//! - Leaves fuse observations with Dempster's rule (after optional decay)
//! - Inner nodes hold the average mass of their children
//! - Uniform sibling groups collapse into their parent (pruning) and are
//!   re-materialized on demand (expansion)
//!
//! Updates run in one of two consistency modes:
//! 1. **Eager**: every update re-averages and re-prunes along its own path
//! 2. **Lazy**: updates only touch leaves; call
//!    [`EvidOcTree::update_inner_occupancy`] once after the batch

use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::MapConfig;
use crate::conflict_registry::ConflictRegistry;
use crate::error::MapError;
use crate::evid_fusion::LeafFusion;
use crate::evid_mass::{BeliefAssignment, EvidMass};
use crate::evid_node::{EvidNode, EvidPayload};
use crate::occupancy::{clamp_log_odds, to_log_odds};
use crate::octree_key::{
    adjust_key_at_depth, child_key_prefix, compute_child_index, KeyConverter, KeySet, OcTreeKey,
    TREE_DEPTH,
};

/// Type tag of the non-temporal tree kind.
pub const TREE_TYPE_STATIC: &str = "EvidOcTree";

/// Type tag of the temporal (decaying) tree kind.
pub const TREE_TYPE_STAMPED: &str = "EvidOcTreeStamped";

// ============================================================================
// OBSERVATIONS & RESULTS
// ============================================================================

/// One observation of a cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Sensor return ended in the cell (configured occupied belief)
    Occupied,

    /// Ray passed through the cell (configured free belief)
    Free,

    /// Caller-supplied belief assignment
    Belief(BeliefAssignment),
}

impl From<bool> for Observation {
    fn from(occupied: bool) -> Self {
        if occupied {
            Observation::Occupied
        } else {
            Observation::Free
        }
    }
}

/// A leaf of the tree together with its address.
#[derive(Debug, Clone, Copy)]
pub struct LeafRef<'a> {
    /// Key of the leaf's center at its depth
    pub key: OcTreeKey,

    /// Depth of the leaf (16 for full-resolution voxels)
    pub depth: u8,

    pub node: &'a EvidNode,
}

/// Statistics about the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapStats {
    pub tree_type: String,
    pub resolution: f64,
    pub total_nodes: usize,
    pub leaf_nodes: usize,
    pub inner_nodes: usize,
    pub occupied_leaves: usize,
    pub pending_conflicts: usize,
}

// ============================================================================
// TREE
// ============================================================================

/// Evidential occupancy octree.
#[derive(Debug, Clone)]
pub struct EvidOcTree {
    root: Option<Box<EvidNode>>,

    /// Number of allocated nodes (root included)
    tree_size: usize,

    config: MapConfig,
    converter: KeyConverter,
    fusion: LeafFusion,

    /// Keys flagged as conflicted since the last drain
    conflicts: ConflictRegistry,
}

/// Borrowed state threaded through one recursive update.
struct UpdateCtx<'a> {
    key: OcTreeKey,
    observation: EvidMass,
    timestamp: Option<u64>,
    lazy_eval: bool,
    fusion: &'a LeafFusion,
    prune_epsilon: f64,
    tree_size: &'a mut usize,
    conflicts: &'a mut ConflictRegistry,
}

impl EvidOcTree {
    /// Create an empty tree.
    pub fn new(config: MapConfig) -> Result<Self, MapError> {
        config.validate()?;
        Ok(Self {
            root: None,
            tree_size: 0,
            converter: KeyConverter::new(config.resolution),
            fusion: LeafFusion::from(&config),
            conflicts: ConflictRegistry::new(),
            config,
        })
    }

    /// Create an empty static tree with default parameters.
    pub fn with_resolution(resolution: f64) -> Result<Self, MapError> {
        Self::new(MapConfig::with_resolution(resolution))
    }

    /// Type tag of this tree kind.
    pub fn tree_type(&self) -> &'static str {
        if self.config.time_model.is_decaying() {
            TREE_TYPE_STAMPED
        } else {
            TREE_TYPE_STATIC
        }
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn converter(&self) -> &KeyConverter {
        &self.converter
    }

    pub fn resolution(&self) -> f64 {
        self.config.resolution
    }

    pub fn root(&self) -> Option<&EvidNode> {
        self.root.as_deref()
    }

    /// Number of allocated nodes.
    pub fn size(&self) -> usize {
        self.tree_size
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Drop every node and pending conflict.
    pub fn clear(&mut self) {
        self.root = None;
        self.tree_size = 0;
        self.conflicts.clear();
    }

    /// Belief mass of an observation under this tree's configuration.
    pub fn observation_mass(&self, observation: &Observation) -> EvidMass {
        match observation {
            Observation::Occupied => BeliefAssignment::occupied(self.config.occupied_belief).to_mass(),
            Observation::Free => BeliefAssignment::free(self.config.free_belief).to_mass(),
            Observation::Belief(bba) => bba.to_mass(),
        }
    }

    // ========================================================================
    // UPDATES
    // ========================================================================

    /// Integrate an observation at a metric coordinate.
    ///
    /// Returns `Ok(None)` without touching the tree if the coordinate is
    /// outside the representable volume.
    pub fn update_node(
        &mut self,
        point: &Point3<f64>,
        observation: Observation,
        timestamp: Option<u64>,
        lazy_eval: bool,
    ) -> Result<Option<&EvidNode>, MapError> {
        let key = match self.converter.coord_to_key(point) {
            Ok(key) => key,
            Err(e) => {
                debug!(error = %e, "skipping update");
                return Ok(None);
            }
        };
        self.update_node_key(&key, observation, timestamp, lazy_eval)
            .map(Some)
    }

    /// Integrate an observation at a key.
    ///
    /// # Arguments
    /// * `key` - Leaf voxel to update
    /// * `observation` - Occupied / free reading or explicit belief
    /// * `timestamp` - Observation time in ms (used by the decaying model)
    /// * `lazy_eval` - Skip inner-node consistency; the caller must run
    ///   [`update_inner_occupancy`](Self::update_inner_occupancy) after the batch
    ///
    /// # Returns
    /// The deepest node covering `key` after the update: the leaf itself, or
    /// the ancestor it was collapsed into.
    pub fn update_node_key(
        &mut self,
        key: &OcTreeKey,
        observation: Observation,
        timestamp: Option<u64>,
        lazy_eval: bool,
    ) -> Result<&EvidNode, MapError> {
        let observation = self.observation_mass(&observation);
        if !observation.is_valid() {
            return Err(MapError::mass(format!("{observation:?}")));
        }
        self.check_monotonic(key, timestamp)?;

        let created_root = self.root.is_none();
        let Self {
            root,
            tree_size,
            config,
            fusion,
            conflicts,
            ..
        } = self;

        let root = root.get_or_insert_with(|| {
            *tree_size += 1;
            Box::default()
        });

        let mut ctx = UpdateCtx {
            key: *key,
            observation,
            timestamp,
            lazy_eval,
            fusion,
            prune_epsilon: config.prune_epsilon,
            tree_size,
            conflicts,
        };
        Self::update_node_recurs(root, created_root, 0, &mut ctx)?;

        self.search_key(key, 0).ok_or_else(|| {
            MapError::StructuralInconsistency(format!("updated key {key:?} not reachable"))
        })
    }

    fn update_node_recurs(
        node: &mut EvidNode,
        node_just_created: bool,
        depth: u8,
        ctx: &mut UpdateCtx<'_>,
    ) -> Result<(), MapError> {
        if depth >= TREE_DEPTH {
            return Self::fuse_leaf(node, ctx);
        }

        let pos = compute_child_index(&ctx.key, depth);
        let mut created_node = false;

        if !node.child_exists(pos) {
            if !node.has_children() && !node_just_created {
                // Previously collapsed: re-materialize before descending
                trace!(depth, "expanding collapsed node");
                Self::expand_node_inner(node, ctx.tree_size);
            } else {
                node.create_child(pos, EvidPayload::default());
                *ctx.tree_size += 1;
                created_node = true;
            }
        }

        debug_assert!(node.child_exists(pos), "child {pos} missing at depth {depth}");
        match node.child_mut(pos) {
            Some(child) => Self::update_node_recurs(child, created_node, depth + 1, ctx)?,
            None => {
                return Err(MapError::StructuralInconsistency(format!(
                    "child {pos} missing at depth {depth}"
                )));
            }
        }

        if ctx.lazy_eval {
            return Ok(());
        }

        if !Self::prune_node_inner(node, ctx.prune_epsilon, ctx.tree_size) {
            Self::refresh_inner_node(node, ctx.fusion, None);
        }
        Ok(())
    }

    fn fuse_leaf(node: &mut EvidNode, ctx: &mut UpdateCtx<'_>) -> Result<(), MapError> {
        let payload = node.payload_mut();
        let outcome = ctx.fusion.fuse(
            &payload.mass,
            payload.timestamp,
            ctx.timestamp,
            &ctx.observation,
        )?;

        payload.mass = outcome.mass;
        payload.log_odds = outcome.log_odds;
        payload.timestamp = outcome.timestamp;

        if outcome.saturated {
            debug!(key = ?ctx.key, "total conflict at leaf, saturated to occupied");
        }
        if outcome.conflicted {
            ctx.conflicts.record(ctx.key);
        }
        Ok(())
    }

    /// Reject observations older than the state they would be fused into.
    ///
    /// Runs before any mutation so a rejected update leaves the tree intact.
    fn check_monotonic(&self, key: &OcTreeKey, timestamp: Option<u64>) -> Result<(), MapError> {
        if !self.config.time_model.is_decaying() {
            return Ok(());
        }
        let Some(now) = timestamp else {
            return Ok(());
        };
        // The covering node is either the leaf or the node it was collapsed into
        if let Some(last) = self.search_key(key, 0).and_then(EvidNode::timestamp) {
            self.fusion.decay_alpha(Some(last), Some(now))?;
        }
        Ok(())
    }

    /// Integrate one externally ray-cast scan.
    ///
    /// Free keys that are also occupied are skipped; free keys are applied
    /// before occupied ones. With `lazy_eval` the consistency pass runs once
    /// at the end. Returns the number of leaf updates performed.
    ///
    /// The timestamp is checked against every key first: a batch older than
    /// any of its cells is rejected whole and the tree is left untouched.
    pub fn insert_key_sets(
        &mut self,
        free: &KeySet,
        occupied: &KeySet,
        timestamp: Option<u64>,
        lazy_eval: bool,
    ) -> Result<usize, MapError> {
        let mut free_keys: Vec<OcTreeKey> = free.difference(occupied).copied().collect();
        let mut occupied_keys: Vec<OcTreeKey> = occupied.iter().copied().collect();
        free_keys.sort_unstable();
        occupied_keys.sort_unstable();

        for key in free_keys.iter().chain(&occupied_keys) {
            self.check_monotonic(key, timestamp)?;
        }

        for key in &free_keys {
            self.update_node_key(key, Observation::Free, timestamp, lazy_eval)?;
        }
        for key in &occupied_keys {
            self.update_node_key(key, Observation::Occupied, timestamp, lazy_eval)?;
        }

        if lazy_eval {
            self.update_inner_occupancy(timestamp);
        }

        Ok(free_keys.len() + occupied_keys.len())
    }

    // ========================================================================
    // INNER CONSISTENCY
    // ========================================================================

    /// Recompute every inner node bottom-up and prune uniform subtrees.
    ///
    /// Must run once after each batch of lazy updates; until then inner
    /// masses and ancestor occupancy are stale.
    ///
    /// # Arguments
    /// * `timestamp` - Batch time stamped on every inner node (decaying model)
    pub fn update_inner_occupancy(&mut self, timestamp: Option<u64>) {
        let size_before = self.tree_size;
        let Self {
            root,
            tree_size,
            config,
            fusion,
            ..
        } = self;
        let stamp = if config.time_model.is_decaying() {
            timestamp
        } else {
            None
        };

        if let Some(root) = root.as_deref_mut() {
            Self::update_inner_recurs(root, 0, stamp, fusion, config.prune_epsilon, tree_size);
        }
        debug!(
            pruned = size_before.saturating_sub(self.tree_size),
            size = self.tree_size,
            "inner occupancy updated"
        );
    }

    fn update_inner_recurs(
        node: &mut EvidNode,
        depth: u8,
        stamp: Option<u64>,
        fusion: &LeafFusion,
        prune_epsilon: f64,
        tree_size: &mut usize,
    ) {
        if !node.has_children() {
            return;
        }
        debug_assert!(depth < TREE_DEPTH, "node with children at leaf depth");

        for (_, child) in node.children_mut() {
            Self::update_inner_recurs(child, depth + 1, stamp, fusion, prune_epsilon, tree_size);
        }

        Self::refresh_inner_node(node, fusion, stamp);
        Self::prune_node_inner(node, prune_epsilon, tree_size);
    }

    /// Set an inner node's mass to its children's mean and re-derive log-odds.
    fn refresh_inner_node(node: &mut EvidNode, fusion: &LeafFusion, stamp: Option<u64>) {
        let Some(mass) = node.average_child_mass() else {
            return;
        };
        let newest_child = Self::newest_child_timestamp(node);
        let payload = node.payload_mut();
        payload.mass = mass;
        payload.log_odds = clamp_log_odds(to_log_odds(&mass), fusion.clamping_min, fusion.clamping_max);
        payload.timestamp = stamp.or(newest_child);
    }

    fn newest_child_timestamp(node: &EvidNode) -> Option<u64> {
        node.children().filter_map(|(_, child)| child.timestamp()).max()
    }

    // ========================================================================
    // PRUNING & EXPANSION
    // ========================================================================

    /// True if all 8 children exist, are leaves and share one log-odds value.
    ///
    /// Only the scalar occupancy is compared, not the full mass.
    pub fn is_node_collapsible(&self, node: &EvidNode) -> bool {
        Self::collapsible(node, self.config.prune_epsilon)
    }

    fn collapsible(node: &EvidNode, epsilon: f64) -> bool {
        let Some(first) = node.child(0) else {
            return false;
        };
        if first.has_children() {
            return false;
        }
        let reference = first.log_odds();

        (1..8).all(|i| match node.child(i) {
            Some(child) => {
                !child.has_children() && log_odds_equal(child.log_odds(), reference, epsilon)
            }
            None => false,
        })
    }

    /// Collapse a node's children into it. Returns false (and does nothing)
    /// if the node is not collapsible.
    fn prune_node_inner(node: &mut EvidNode, epsilon: f64, tree_size: &mut usize) -> bool {
        if !Self::collapsible(node, epsilon) {
            return false;
        }
        let log_odds = node.child(0).map(EvidNode::log_odds).unwrap_or_default();
        let mass = node.average_child_mass().unwrap_or_default();
        let timestamp = Self::newest_child_timestamp(node);

        node.take_children();
        *node.payload_mut() = EvidPayload {
            mass,
            log_odds,
            timestamp,
        };
        *tree_size -= 8;
        true
    }

    /// Give a childless node 8 children that copy its payload.
    fn expand_node_inner(node: &mut EvidNode, tree_size: &mut usize) {
        debug_assert!(!node.has_children(), "expanding a node that has children");
        let payload = *node.payload();
        node.set_all_children(|_| payload);
        *tree_size += 8;
    }

    /// Node at exactly `depth` on the path to `key`, if it exists.
    fn node_at_depth_mut(&mut self, key: &OcTreeKey, depth: u8) -> Option<&mut EvidNode> {
        let mut node = self.root.as_deref_mut()?;
        for d in 0..depth.min(TREE_DEPTH) {
            node = node.child_mut(compute_child_index(key, d))?;
        }
        Some(node)
    }

    /// Prune the node at `depth` on the path to `key`.
    pub fn prune_node_at(&mut self, key: &OcTreeKey, depth: u8) -> bool {
        let epsilon = self.config.prune_epsilon;
        let mut size = self.tree_size;
        let pruned = match self.node_at_depth_mut(key, depth) {
            Some(node) => Self::prune_node_inner(node, epsilon, &mut size),
            None => false,
        };
        self.tree_size = size;
        pruned
    }

    /// Expand the childless node at `depth` on the path to `key`.
    ///
    /// Returns false if the node does not exist, already has children or
    /// sits at leaf depth.
    pub fn expand_node_at(&mut self, key: &OcTreeKey, depth: u8) -> bool {
        if depth >= TREE_DEPTH {
            return false;
        }
        let mut size = self.tree_size;
        let expanded = match self.node_at_depth_mut(key, depth) {
            Some(node) if !node.has_children() => {
                Self::expand_node_inner(node, &mut size);
                true
            }
            _ => false,
        };
        self.tree_size = size;
        expanded
    }

    /// Bottom-up pruning pass over the whole tree.
    pub fn prune(&mut self) {
        let epsilon = self.config.prune_epsilon;
        let size_before = self.tree_size;
        if let Some(root) = self.root.as_deref_mut() {
            Self::prune_recurs(root, epsilon, &mut self.tree_size);
        }
        debug!(pruned = size_before - self.tree_size, "prune pass complete");
    }

    fn prune_recurs(node: &mut EvidNode, epsilon: f64, tree_size: &mut usize) {
        if !node.has_children() {
            return;
        }
        for (_, child) in node.children_mut() {
            Self::prune_recurs(child, epsilon, tree_size);
        }
        Self::prune_node_inner(node, epsilon, tree_size);
    }

    /// Expand every collapsed node down to leaf depth.
    ///
    /// A node collapsed at depth `d` becomes `8^(16 - d)` leaves.
    pub fn expand(&mut self) {
        let Some(root) = self.root.as_deref_mut() else {
            return;
        };
        // A childless root is a never-updated tree, not a collapsed one
        if !root.has_children() {
            return;
        }
        Self::expand_recurs(root, 0, &mut self.tree_size);
    }

    fn expand_recurs(node: &mut EvidNode, depth: u8, tree_size: &mut usize) {
        if depth >= TREE_DEPTH {
            return;
        }
        if !node.has_children() {
            Self::expand_node_inner(node, tree_size);
        }
        for (_, child) in node.children_mut() {
            Self::expand_recurs(child, depth + 1, tree_size);
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Deepest node covering `point`, down to `depth` (0 = full depth).
    pub fn search(&self, point: &Point3<f64>, depth: u8) -> Option<&EvidNode> {
        let key = self.converter.coord_to_key(point).ok()?;
        self.search_key(&key, depth)
    }

    /// Deepest node covering `key`, down to `depth` (0 = full depth).
    ///
    /// Returns `None` if the path ends at an inner node whose child for
    /// `key` was never created (unknown space).
    pub fn search_key(&self, key: &OcTreeKey, depth: u8) -> Option<&EvidNode> {
        let depth = if depth == 0 || depth > TREE_DEPTH {
            TREE_DEPTH
        } else {
            depth
        };
        let mut node = self.root.as_deref()?;
        for d in 0..depth {
            match node.child(compute_child_index(key, d)) {
                Some(child) => node = child,
                None if !node.has_children() => return Some(node),
                None => return None,
            }
        }
        Some(node)
    }

    /// True if the node's log-odds is above the occupancy threshold.
    pub fn is_node_occupied(&self, node: &EvidNode) -> bool {
        node.log_odds() > self.config.occupancy_threshold
    }

    /// Every leaf (childless node) with its key and depth.
    pub fn leaves(&self) -> Vec<LeafRef<'_>> {
        let mut leaves = Vec::new();
        if let Some(root) = self.root.as_deref() {
            Self::collect_leaves(root, OcTreeKey::new(0, 0, 0), 0, &mut leaves);
        }
        leaves
    }

    fn collect_leaves<'a>(
        node: &'a EvidNode,
        prefix: OcTreeKey,
        depth: u8,
        out: &mut Vec<LeafRef<'a>>,
    ) {
        if !node.has_children() {
            out.push(LeafRef {
                key: adjust_key_at_depth(&prefix, depth),
                depth,
                node,
            });
            return;
        }
        for (i, child) in node.children() {
            let child_prefix = child_key_prefix(&prefix, i, depth);
            Self::collect_leaves(child, child_prefix, depth + 1, out);
        }
    }

    pub fn num_leaf_nodes(&self) -> usize {
        self.leaves().len()
    }

    pub fn stats(&self) -> MapStats {
        let leaves = self.leaves();
        let occupied_leaves = leaves
            .iter()
            .filter(|leaf| self.is_node_occupied(leaf.node))
            .count();
        MapStats {
            tree_type: self.tree_type().to_string(),
            resolution: self.config.resolution,
            total_nodes: self.tree_size,
            leaf_nodes: leaves.len(),
            inner_nodes: self.tree_size - leaves.len(),
            occupied_leaves,
            pending_conflicts: self.conflicts.len(),
        }
    }

    // ========================================================================
    // CONFLICTS
    // ========================================================================

    /// Keys flagged since the last drain, without clearing.
    pub fn pending_conflicts(&self) -> &[OcTreeKey] {
        self.conflicts.pending()
    }

    /// Take every flagged key and reset the registry.
    pub fn drain_conflicts(&mut self) -> Vec<OcTreeKey> {
        self.conflicts.drain()
    }
}

#[inline]
fn log_odds_equal(a: f64, b: f64, epsilon: f64) -> bool {
    a == b || (a - b).abs() <= epsilon
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeModel;
    use crate::occupancy::logit;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const CENTER: u16 = 32768;

    fn tree() -> EvidOcTree {
        EvidOcTree::with_resolution(0.1).unwrap()
    }

    fn bba(free: f64, occupied: f64, ignorance: f64) -> Observation {
        Observation::Belief(BeliefAssignment::new(free, occupied, ignorance).unwrap())
    }

    /// The 8 leaf keys sharing one depth-15 parent.
    fn sibling_keys() -> Vec<OcTreeKey> {
        (0..8u16)
            .map(|i| OcTreeKey::new(CENTER + (i & 1), CENTER + ((i >> 1) & 1), CENTER + ((i >> 2) & 1)))
            .collect()
    }

    #[test]
    fn test_first_update_on_fresh_tree() {
        let mut tree = tree();
        let key = OcTreeKey::new(CENTER, CENTER, CENTER);

        let leaf = tree
            .update_node_key(&key, bba(0.0, 0.7, 0.3), None, false)
            .unwrap();
        assert_relative_eq!(leaf.mass().free, 0.0, epsilon = 1e-12);
        assert_relative_eq!(leaf.mass().occupied, 0.7, epsilon = 1e-12);
        assert_relative_eq!(leaf.mass().ignorance, 0.3, epsilon = 1e-12);
        assert_relative_eq!(leaf.log_odds(), logit(0.85), epsilon = 1e-12);

        // Root plus one node per level
        assert_eq!(tree.size(), 1 + TREE_DEPTH as usize);
        // Eager mode keeps ancestors consistent
        let root = tree.root().unwrap();
        assert_relative_eq!(root.mass().occupied, 0.7, epsilon = 1e-12);
        assert_relative_eq!(root.log_odds(), logit(0.85), epsilon = 1e-12);
    }

    #[test]
    fn test_opposing_update_records_conflict() {
        let mut tree = tree();
        let key = OcTreeKey::new(CENTER, CENTER, CENTER);

        tree.update_node_key(&key, bba(0.0, 0.7, 0.3), None, false).unwrap();
        assert!(tree.pending_conflicts().is_empty());

        let leaf = tree
            .update_node_key(&key, bba(0.7, 0.0, 0.3), None, false)
            .unwrap();
        let mass = *leaf.mass();
        assert_relative_eq!(mass.free + mass.occupied + mass.ignorance, 1.0, epsilon = 1e-12);
        assert!(mass.free >= 0.0 && mass.occupied >= 0.0 && mass.ignorance >= 0.0);

        assert_eq!(tree.drain_conflicts(), vec![key]);
        assert!(tree.pending_conflicts().is_empty());
    }

    #[test]
    fn test_occupied_run_clamps_to_max() {
        let mut tree = tree();
        let point = Point3::new(0.42, -1.3, 2.0);
        for _ in 0..30 {
            tree.update_node(&point, Observation::Occupied, None, false).unwrap();
        }
        let leaf = tree.search(&point, 0).unwrap();
        assert_eq!(leaf.log_odds(), tree.config().clamping_max);
        assert!(tree.is_node_occupied(leaf));

        for _ in 0..60 {
            tree.update_node(&point, Observation::Free, None, false).unwrap();
        }
        let leaf = tree.search(&point, 0).unwrap();
        assert_eq!(leaf.log_odds(), tree.config().clamping_min);
    }

    #[test]
    fn test_invalid_coordinate_is_not_found() {
        let mut tree = tree();
        let far = Point3::new(1.0e6, 0.0, 0.0);
        let result = tree.update_node(&far, Observation::Occupied, None, false).unwrap();
        assert!(result.is_none());
        assert!(tree.is_empty());
        assert_eq!(tree.size(), 0);
    }

    #[test]
    fn test_invalid_belief_rejected() {
        let mut tree = tree();
        let key = OcTreeKey::new(CENTER, CENTER, CENTER);
        let bad = Observation::Belief(BeliefAssignment {
            free: 0.8,
            occupied: 0.8,
            ignorance: 0.0,
        });
        assert!(matches!(
            tree.update_node_key(&key, bad, None, false),
            Err(MapError::InvalidMass(_))
        ));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_eager_pruning_collapses_uniform_siblings() {
        let mut tree = tree();
        let keys = sibling_keys();

        for key in &keys[..7] {
            tree.update_node_key(key, Observation::Occupied, None, false).unwrap();
        }
        assert_eq!(tree.size(), TREE_DEPTH as usize + 7);

        let node = tree
            .update_node_key(&keys[7], Observation::Occupied, None, false)
            .unwrap();
        assert!(!node.has_children());
        assert_relative_eq!(node.log_odds(), logit(0.85), epsilon = 1e-12);

        // Root + 15 inner levels; the depth-15 node is now a leaf
        assert_eq!(tree.size(), TREE_DEPTH as usize);
        assert_eq!(tree.num_leaf_nodes(), 1);
        assert_eq!(tree.leaves()[0].depth, TREE_DEPTH - 1);
    }

    #[test]
    fn test_update_into_collapsed_node_expands_it() {
        let mut tree = tree();
        let keys = sibling_keys();
        for key in &keys {
            tree.update_node_key(key, Observation::Occupied, None, false).unwrap();
        }
        let collapsed_log_odds = tree.search_key(&keys[0], 0).unwrap().log_odds();

        let leaf = tree
            .update_node_key(&keys[3], Observation::Free, None, false)
            .unwrap();
        assert!(leaf.log_odds() < collapsed_log_odds);
        assert_eq!(tree.size(), TREE_DEPTH as usize + 8);

        // Untouched siblings inherited the collapsed value
        for (i, key) in keys.iter().enumerate().filter(|(i, _)| *i != 3) {
            let sibling = tree.search_key(key, 0).unwrap();
            assert_eq!(sibling.log_odds(), collapsed_log_odds, "sibling {i}");
        }
        let parent = tree.search_key(&keys[0], TREE_DEPTH - 1).unwrap();
        assert!(parent.has_children());
        assert!(!tree.is_node_collapsible(parent));
    }

    #[test]
    fn test_lazy_updates_defer_inner_consistency() {
        let mut tree = tree();
        let key = OcTreeKey::new(CENTER, CENTER + 5, CENTER - 9);

        tree.update_node_key(&key, Observation::Occupied, None, true).unwrap();
        assert!(!tree.root().unwrap().is_mass_set(), "root stale before the pass");

        tree.update_inner_occupancy(None);
        let root = tree.root().unwrap();
        assert!(root.is_mass_set());
        assert_relative_eq!(root.log_odds(), logit(0.85), epsilon = 1e-12);
    }

    #[test]
    fn test_collapsibility_tracks_child_occupancy() {
        let mut tree = tree();
        let keys = sibling_keys();
        for key in &keys {
            tree.update_node_key(key, Observation::Occupied, None, true).unwrap();
        }
        let parent = tree.search_key(&keys[0], TREE_DEPTH - 1).unwrap();
        assert!(tree.is_node_collapsible(parent));

        tree.update_node_key(&keys[5], Observation::Occupied, None, true).unwrap();
        let parent = tree.search_key(&keys[0], TREE_DEPTH - 1).unwrap();
        assert!(!tree.is_node_collapsible(parent));

        // Leaves are never collapsible
        let leaf = tree.search_key(&keys[0], 0).unwrap();
        assert!(!tree.is_node_collapsible(leaf));
    }

    #[test]
    fn test_prune_and_expand_by_key() {
        let mut tree = tree();
        let keys = sibling_keys();
        for key in &keys {
            tree.update_node_key(key, Observation::Free, None, true).unwrap();
        }
        let size = tree.size();

        assert!(tree.prune_node_at(&keys[0], TREE_DEPTH - 1));
        assert_eq!(tree.size(), size - 8);
        assert!(!tree.prune_node_at(&keys[0], TREE_DEPTH - 1), "idempotent");

        assert!(tree.expand_node_at(&keys[0], TREE_DEPTH - 1));
        assert_eq!(tree.size(), size);
        assert!(!tree.expand_node_at(&keys[0], TREE_DEPTH - 1));
        assert!(!tree.expand_node_at(&keys[0], TREE_DEPTH));
    }

    #[test]
    fn test_whole_tree_prune_and_expand() {
        let mut tree = tree();
        for key in sibling_keys() {
            tree.update_node_key(&key, Observation::Occupied, None, true).unwrap();
        }
        let full = tree.size();

        tree.prune();
        assert_eq!(tree.size(), full - 8);

        tree.expand();
        assert_eq!(tree.size(), full);
        assert_eq!(tree.num_leaf_nodes(), 8);
        for leaf in tree.leaves() {
            assert_eq!(leaf.depth, TREE_DEPTH);
            assert!(sibling_keys().contains(&leaf.key));
        }
    }

    #[test]
    fn test_lazy_batch_matches_eager_updates() {
        let mut eager = tree();
        let mut lazy = tree();

        // A full sibling block guarantees pruning happens in both runs
        let mut updates: Vec<(OcTreeKey, Observation)> = sibling_keys()
            .into_iter()
            .map(|k| (k, Observation::Occupied))
            .collect();

        let mut seen: std::collections::HashSet<OcTreeKey> = updates.iter().map(|(k, _)| *k).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        while updates.len() < 100 {
            let key = OcTreeKey::new(
                CENTER + rng.gen_range(2..8),
                CENTER - 3 + rng.gen_range(0..6),
                CENTER + rng.gen_range(0..6),
            );
            if seen.insert(key) {
                updates.push((key, Observation::from(rng.gen_bool(0.67))));
            }
        }

        for (key, obs) in &updates {
            eager.update_node_key(key, *obs, None, false).unwrap();
            lazy.update_node_key(key, *obs, None, true).unwrap();
        }
        lazy.update_inner_occupancy(None);

        assert_eq!(eager.size(), lazy.size());
        for (key, _) in &updates {
            let a = eager.search_key(key, 0).unwrap();
            let b = lazy.search_key(key, 0).unwrap();
            assert_relative_eq!(a.log_odds(), b.log_odds(), epsilon = 1e-9);
            for depth in 1..TREE_DEPTH {
                let a = eager.search_key(key, depth).unwrap();
                let b = lazy.search_key(key, depth).unwrap();
                assert_relative_eq!(a.log_odds(), b.log_odds(), epsilon = 1e-9);
            }
        }
        let (ra, rb) = (eager.root().unwrap(), lazy.root().unwrap());
        assert_relative_eq!(ra.log_odds(), rb.log_odds(), epsilon = 1e-9);
        assert_relative_eq!(ra.mass().occupied, rb.mass().occupied, epsilon = 1e-9);
        assert_relative_eq!(ra.mass().free, rb.mass().free, epsilon = 1e-9);
    }

    #[test]
    fn test_decaying_tree_rejects_backward_time() {
        let mut tree = EvidOcTree::new(MapConfig::decaying(0.1, 1000.0)).unwrap();
        let key = OcTreeKey::new(CENTER, CENTER, CENTER);

        tree.update_node_key(&key, Observation::Occupied, Some(1_000), false).unwrap();
        let size = tree.size();
        let before = *tree.search_key(&key, 0).unwrap().payload();

        let err = tree
            .update_node_key(&key, Observation::Free, Some(500), false)
            .unwrap_err();
        assert_eq!(err, MapError::NonMonotonicTime { last: 1_000, new: 500 });
        assert_eq!(tree.size(), size);
        assert_eq!(*tree.search_key(&key, 0).unwrap().payload(), before);
    }

    #[test]
    fn test_stale_evidence_decays_before_fusion() {
        let mut tree = EvidOcTree::new(MapConfig::decaying(0.1, 1000.0)).unwrap();
        let key = OcTreeKey::new(CENTER, CENTER, CENTER);

        for t in 0..5 {
            tree.update_node_key(&key, Observation::Occupied, Some(t * 100), false).unwrap();
        }
        assert!(tree.search_key(&key, 0).unwrap().log_odds() > 0.0);

        // A minute later the old evidence is gone; one free reading wins
        let leaf = tree
            .update_node_key(&key, Observation::Free, Some(60_400), false)
            .unwrap();
        assert!(leaf.log_odds() < 0.0);
        assert_eq!(leaf.timestamp(), Some(60_400));
        assert!(tree.pending_conflicts().is_empty());
    }

    #[test]
    fn test_total_conflict_saturates_leaf() {
        let mut tree = tree();
        let key = OcTreeKey::new(CENTER, CENTER, CENTER);

        let max = tree.config().clamping_max;

        tree.update_node_key(&key, bba(1.0, 0.0, 0.0), None, false).unwrap();
        let leaf = tree
            .update_node_key(&key, bba(0.0, 1.0, 0.0), None, false)
            .unwrap();
        assert_eq!(leaf.log_odds(), max);
        assert!(leaf.mass().is_valid());
        assert_eq!(tree.drain_conflicts(), vec![key]);
    }

    #[test]
    fn test_insert_key_sets_prefers_occupied() {
        let mut tree = tree();
        let shared = OcTreeKey::new(CENTER, CENTER, CENTER);
        let free_only = OcTreeKey::new(CENTER + 40, CENTER, CENTER);

        let free: KeySet = [shared, free_only].into_iter().collect();
        let occupied: KeySet = [shared].into_iter().collect();

        let applied = tree.insert_key_sets(&free, &occupied, None, true).unwrap();
        assert_eq!(applied, 2);
        assert!(tree.is_node_occupied(tree.search_key(&shared, 0).unwrap()));
        assert!(!tree.is_node_occupied(tree.search_key(&free_only, 0).unwrap()));
        assert!(tree.root().unwrap().is_mass_set());
    }

    #[test]
    fn test_stale_batch_is_rejected_whole() {
        let mut tree = EvidOcTree::new(MapConfig::decaying(0.1, 1000.0)).unwrap();
        let seen = OcTreeKey::new(CENTER, CENTER, CENTER);
        let fresh = OcTreeKey::new(CENTER + 40, CENTER, CENTER);

        tree.update_node_key(&seen, Observation::Occupied, Some(1_000), false).unwrap();
        let size = tree.size();
        let root_before = *tree.root().unwrap().payload();

        let free: KeySet = [fresh].into_iter().collect();
        let occupied: KeySet = [seen].into_iter().collect();
        let err = tree.insert_key_sets(&free, &occupied, Some(500), true).unwrap_err();
        assert_eq!(err, MapError::NonMonotonicTime { last: 1_000, new: 500 });

        // Nothing from the batch landed, so the inner nodes still agree
        assert_eq!(tree.size(), size);
        assert!(tree.search_key(&fresh, 0).is_none());
        assert_eq!(*tree.root().unwrap().payload(), root_before);

        assert_eq!(tree.insert_key_sets(&free, &occupied, Some(1_500), true).unwrap(), 2);
        let root = tree.root().unwrap();
        assert_relative_eq!(root.mass().free, 0.3, epsilon = 1e-12);
        assert_eq!(root.timestamp(), Some(1_500));
    }

    #[test]
    fn test_collapsed_stamp_carries_into_expansion() {
        let mut tree = EvidOcTree::new(MapConfig::decaying(0.1, 1000.0)).unwrap();
        let keys = sibling_keys();
        for (i, key) in keys.iter().enumerate() {
            let t = 100 * (i as u64 + 1);
            tree.update_node_key(key, Observation::Occupied, Some(t), false).unwrap();
        }

        let collapsed = tree.search_key(&keys[0], 0).unwrap();
        assert!(!collapsed.has_children());
        assert_eq!(collapsed.timestamp(), Some(800));
        assert_eq!(tree.size(), TREE_DEPTH as usize);

        // The collapsed node guards every key it covers
        let err = tree
            .update_node_key(&keys[0], Observation::Free, Some(700), false)
            .unwrap_err();
        assert_eq!(err, MapError::NonMonotonicTime { last: 800, new: 700 });
        assert_eq!(tree.size(), TREE_DEPTH as usize);

        let leaf = tree
            .update_node_key(&keys[3], Observation::Free, Some(900), false)
            .unwrap();
        assert_eq!(leaf.timestamp(), Some(900));
        assert_eq!(tree.size(), TREE_DEPTH as usize + 8);

        for (i, key) in keys.iter().enumerate().filter(|(i, _)| *i != 3) {
            assert_eq!(tree.search_key(key, 0).unwrap().timestamp(), Some(800), "sibling {i}");
        }
        let parent = tree.search_key(&keys[0], TREE_DEPTH - 1).unwrap();
        assert_eq!(parent.timestamp(), Some(900));

        let err = tree
            .update_node_key(&keys[5], Observation::Occupied, Some(750), false)
            .unwrap_err();
        assert_eq!(err, MapError::NonMonotonicTime { last: 800, new: 750 });
    }

    #[test]
    fn test_lazy_pass_stamps_inner_nodes_with_batch_time() {
        let a = OcTreeKey::new(CENTER, CENTER, CENTER);
        let b = OcTreeKey::new(CENTER + 1, CENTER, CENTER);

        let mut tree = EvidOcTree::new(MapConfig::decaying(0.1, 1000.0)).unwrap();
        tree.update_node_key(&a, Observation::Occupied, Some(100), true).unwrap();
        tree.update_node_key(&b, Observation::Free, Some(200), true).unwrap();
        tree.update_inner_occupancy(Some(500));

        let parent = tree.search_key(&a, TREE_DEPTH - 1).unwrap();
        assert!(parent.has_children());
        assert!(!tree.is_node_collapsible(parent));
        assert_eq!(parent.timestamp(), Some(500));
        assert_eq!(tree.root().unwrap().timestamp(), Some(500));
        assert_eq!(tree.search_key(&a, 0).unwrap().timestamp(), Some(100));
        assert_eq!(tree.search_key(&b, 0).unwrap().timestamp(), Some(200));

        // Leaves keep their own clock
        tree.update_node_key(&a, Observation::Occupied, Some(300), true).unwrap();

        let mut fixed = EvidOcTree::new(MapConfig::default()).unwrap();
        fixed.update_node_key(&a, Observation::Occupied, Some(100), true).unwrap();
        fixed.update_inner_occupancy(Some(500));
        assert_eq!(fixed.root().unwrap().timestamp(), None);
    }

    #[test]
    fn test_search_unknown_space() {
        let mut tree = tree();
        assert!(tree.search_key(&OcTreeKey::new(0, 0, 0), 0).is_none());

        tree.update_node_key(&OcTreeKey::new(CENTER, CENTER, CENTER), Observation::Free, None, false)
            .unwrap();
        assert!(tree.search_key(&OcTreeKey::new(0, 0, 0), 0).is_none());
        assert!(tree.search(&Point3::new(0.01, 0.01, 0.01), 0).is_some());
    }

    #[test]
    fn test_stats_and_tree_type() {
        let mut tree = tree();
        assert_eq!(tree.tree_type(), TREE_TYPE_STATIC);
        tree.update_node(&Point3::new(0.0, 0.0, 0.0), Observation::Occupied, None, false)
            .unwrap();
        tree.update_node(&Point3::new(5.0, 0.0, 0.0), Observation::Free, None, false)
            .unwrap();

        let stats = tree.stats();
        assert_eq!(stats.leaf_nodes, 2);
        assert_eq!(stats.occupied_leaves, 1);
        assert_eq!(stats.total_nodes, tree.size());
        assert_eq!(stats.inner_nodes + stats.leaf_nodes, stats.total_nodes);

        let stamped = EvidOcTree::new(MapConfig {
            time_model: TimeModel::Decaying { tau_ms: 500.0 },
            ..MapConfig::default()
        })
        .unwrap();
        assert_eq!(stamped.tree_type(), TREE_TYPE_STAMPED);

        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.num_leaf_nodes(), 0);
    }
}
