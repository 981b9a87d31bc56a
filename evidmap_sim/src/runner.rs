//! Scenario runner - executes mapping scenarios against the octree.

use std::collections::HashSet;

use evidmap_core::{
    EvidOcTree, MapConfig, MapError, Observation, OcTreeKey, TimeModel, TREE_DEPTH,
};
use nalgebra::Point3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SimError;
use crate::oracle::{cube_points, SceneOracle};
use crate::scenarios::ScenarioId;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Leaf updates applied
    pub updates: u64,

    /// Conflicted keys drained from the map
    pub conflicts_detected: u64,

    /// Nodes in the final tree
    pub tree_size: usize,

    pub leaf_nodes: usize,
    pub occupied_leaves: usize,

    /// Updates refused (out of bounds or non-monotonic)
    pub rejected_updates: u64,

    /// Largest log-odds gap between two maps that should agree
    pub max_log_odds_diff: f64,
}

impl ScenarioMetrics {
    fn record_tree(&mut self, tree: &EvidOcTree) {
        let stats = tree.stats();
        self.tree_size = stats.total_nodes;
        self.leaf_nodes = stats.leaf_nodes;
        self.occupied_leaves = stats.occupied_leaves;
    }
}

/// Runs mapping scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Map parameters shared by every scenario
    config: MapConfig,

    /// Range noise standard deviation (meters)
    noise_std: f64,

    /// Scan ticks for the moving object scenario
    ticks: u64,
}

const KEY_CENTER: u16 = 32768;

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            config: MapConfig::default(),
            noise_std: 0.005,
            ticks: 30,
        }
    }

    /// Sets the map configuration.
    pub fn with_config(mut self, config: MapConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the range noise.
    pub fn with_noise(mut self, noise_std: f64) -> Self {
        self.noise_std = noise_std;
        self
    }

    /// Sets the number of scan ticks.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut metrics = ScenarioMetrics::default();
        let outcome = match scenario {
            ScenarioId::Cube => self.run_cube(&mut metrics),
            ScenarioId::MovingObject => self.run_moving_object(&mut metrics),
            ScenarioId::Decay => self.run_decay(&mut metrics),
            ScenarioId::LazyVsEager => self.run_lazy_vs_eager(&mut metrics),
        };

        let failure_reason = match outcome {
            Ok(None) => None,
            Ok(Some(reason)) => Some(reason),
            Err(e) => {
                warn!("Scenario {} aborted: {}", scenario.name(), e);
                Some(e.to_string())
            }
        };

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            failure_reason,
            metrics,
        }
    }

    /// SIM-001: Cube - occupied block, overlapping free block, one lazy pass.
    ///
    /// Returns `Ok(Some(reason))` if an assertion fails.
    fn run_cube(&self, metrics: &mut ScenarioMetrics) -> Result<Option<String>, SimError> {
        let mut tree = EvidOcTree::new(self.config.clone())?;

        let occupied = cube_points(Point3::new(-1.0, -1.0, -1.0), 40, 0.05);
        let free = cube_points(Point3::new(-1.6, -1.6, -1.6), 60, 0.02);

        for point in &occupied {
            self.apply(&mut tree, point, Observation::Occupied, metrics)?;
        }
        for point in &free {
            self.apply(&mut tree, point, Observation::Free, metrics)?;
        }
        tree.update_inner_occupancy(None);
        metrics.conflicts_detected += tree.drain_conflicts().len() as u64;
        metrics.record_tree(&tree);

        for query in [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(-0.5, -0.5, -0.5),
            Point3::new(-1.0, -1.0, -1.0),
            Point3::new(0.5, 0.5, 0.5),
            Point3::new(1.0, 1.0, 1.0),
        ] {
            match tree.search(&query, 0) {
                Some(node) => debug!(
                    "  {:?}: mass={:?} occupancy={:.3}",
                    query.coords.as_slice(),
                    node.mass(),
                    node.occupancy()
                ),
                None => debug!("  {:?}: unknown", query.coords.as_slice()),
            }
        }

        let inside = tree.search(&Point3::new(0.0, 0.0, 0.0), 0);
        if !inside.is_some_and(|n| tree.is_node_occupied(n)) {
            return Ok(Some("center of the occupied cube is not occupied".into()));
        }
        let overlap = tree.search(&Point3::new(-1.0, -1.0, -1.0), 0);
        if !overlap.is_some_and(|n| n.is_mass_set() && !tree.is_node_occupied(n)) {
            return Ok(Some("overlap corner did not turn free".into()));
        }
        if tree.search(&Point3::new(1.0, 1.0, 1.0), 0).is_some() {
            return Ok(Some("space outside both cubes is not unknown".into()));
        }
        if metrics.conflicts_detected == 0 {
            return Ok(Some("free block over occupied cells raised no conflict".into()));
        }

        info!(
            "  nodes={} leaves={} occupied={} conflicts={}",
            metrics.tree_size, metrics.leaf_nodes, metrics.occupied_leaves, metrics.conflicts_detected
        );
        Ok(None)
    }

    /// SIM-002: MovingObject - a box slides in front of a wall.
    ///
    /// Conflicts must appear, and only in the slab the box sweeps.
    fn run_moving_object(
        &self,
        metrics: &mut ScenarioMetrics,
    ) -> Result<Option<String>, SimError> {
        let mut tree = EvidOcTree::new(self.config.clone())?;
        let mut oracle = SceneOracle::new(self.seed, self.noise_std)?;
        let object = *oracle.object();
        let mut stray = Vec::new();

        for _ in 0..self.ticks {
            let scan = oracle.scan(tree.converter())?;
            let timestamp = oracle.tick() * 100;
            metrics.updates +=
                tree.insert_key_sets(&scan.free, &scan.occupied, Some(timestamp), true)? as u64;

            let conflicts = tree.drain_conflicts();
            if !conflicts.is_empty() {
                debug!(
                    "  tick={} box_hits={} conflicts={}",
                    oracle.tick(),
                    scan.box_hits,
                    conflicts.len()
                );
            }
            metrics.conflicts_detected += conflicts.len() as u64;
            stray.extend(
                conflicts
                    .into_iter()
                    .filter(|key| !object.in_slab(tree.converter().key_to_coord(key).x)),
            );
            oracle.step();
        }
        metrics.record_tree(&tree);

        if metrics.conflicts_detected == 0 {
            return Ok(Some("moving box produced no conflicts".into()));
        }
        if let Some(key) = stray.first() {
            return Ok(Some(format!(
                "{} conflicts outside the box path, first at {:?}",
                stray.len(),
                tree.converter().key_to_coord(key)
            )));
        }
        let wall = tree.search(&Point3::new(2.05, 1.05, 0.25), 0);
        if !wall.is_some_and(|n| tree.is_node_occupied(n)) {
            return Ok(Some("wall is not mapped as occupied".into()));
        }
        Ok(None)
    }

    /// SIM-003: Decay - stale occupied evidence flips on one free reading.
    ///
    /// The same sequence on a static map keeps the cell occupied and flags
    /// a conflict instead.
    fn run_decay(&self, metrics: &mut ScenarioMetrics) -> Result<Option<String>, SimError> {
        let point = Point3::new(0.55, 0.55, 0.55);
        let sequence = [
            (0, Observation::Occupied),
            (100, Observation::Occupied),
            (200, Observation::Occupied),
            (10_000, Observation::Free),
        ];

        let mut decaying = EvidOcTree::new(MapConfig {
            time_model: TimeModel::Decaying { tau_ms: 1000.0 },
            ..self.config.clone()
        })?;
        let mut fixed = EvidOcTree::new(MapConfig {
            time_model: TimeModel::Static,
            ..self.config.clone()
        })?;

        for (timestamp, observation) in sequence {
            self.apply_at(&mut decaying, &point, observation, timestamp, metrics)?;
            self.apply_at(&mut fixed, &point, observation, timestamp, metrics)?;
        }

        let decayed_conflicts = decaying.drain_conflicts().len();
        let fixed_conflicts = fixed.drain_conflicts().len();
        metrics.conflicts_detected += (decayed_conflicts + fixed_conflicts) as u64;
        metrics.record_tree(&decaying);

        match decaying.search(&point, 0) {
            Some(node) if !decaying.is_node_occupied(node) => {}
            _ => return Ok(Some("stale occupied cell did not flip free".into())),
        }
        if decayed_conflicts != 0 {
            return Ok(Some("decayed evidence still conflicted".into()));
        }
        match fixed.search(&point, 0) {
            Some(node) if fixed.is_node_occupied(node) => {}
            _ => return Ok(Some("static map lost occupied evidence".into())),
        }
        if fixed_conflicts == 0 {
            return Ok(Some("static map raised no conflict".into()));
        }

        // Going back in time must be refused without touching the cell
        let before = decaying.search(&point, 0).map(|n| *n.payload());
        match decaying.update_node(&point, Observation::Occupied, Some(5_000), false) {
            Err(MapError::NonMonotonicTime { .. }) => metrics.rejected_updates += 1,
            Err(e) => return Err(e.into()),
            Ok(_) => return Ok(Some("backward timestamp was accepted".into())),
        }
        if decaying.search(&point, 0).map(|n| *n.payload()) != before {
            return Ok(Some("rejected update modified the cell".into()));
        }
        Ok(None)
    }

    /// SIM-004: LazyVsEager - same updates, both consistency modes.
    fn run_lazy_vs_eager(
        &self,
        metrics: &mut ScenarioMetrics,
    ) -> Result<Option<String>, SimError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut eager = EvidOcTree::new(self.config.clone())?;
        let mut lazy = EvidOcTree::new(self.config.clone())?;

        // One full sibling block so pruning is exercised in every run
        let mut updates: Vec<(OcTreeKey, Observation)> = (0..8u16)
            .map(|i| {
                let key = OcTreeKey::new(
                    KEY_CENTER + (i & 1),
                    KEY_CENTER + ((i >> 1) & 1),
                    KEY_CENTER + ((i >> 2) & 1),
                );
                (key, Observation::Occupied)
            })
            .collect();
        let mut seen: HashSet<OcTreeKey> = updates.iter().map(|(k, _)| *k).collect();
        while updates.len() < 500 {
            let key = OcTreeKey::new(
                KEY_CENTER + rng.gen_range(2..18),
                KEY_CENTER + rng.gen_range(0..16),
                KEY_CENTER + rng.gen_range(0..16),
            );
            if seen.insert(key) {
                updates.push((key, Observation::from(rng.gen_bool(0.7))));
            }
        }

        for (key, observation) in &updates {
            eager.update_node_key(key, *observation, None, false)?;
            lazy.update_node_key(key, *observation, None, true)?;
            metrics.updates += 1;
        }
        lazy.update_inner_occupancy(None);
        metrics.record_tree(&lazy);

        if eager.size() != lazy.size() {
            return Ok(Some(format!(
                "tree sizes differ: eager={} lazy={}",
                eager.size(),
                lazy.size()
            )));
        }

        let mut max_diff: f64 = 0.0;
        for (key, _) in &updates {
            for depth in 1..=TREE_DEPTH {
                match (eager.search_key(key, depth), lazy.search_key(key, depth)) {
                    (Some(a), Some(b)) => max_diff = max_diff.max((a.log_odds() - b.log_odds()).abs()),
                    _ => return Ok(Some(format!("key {:?} missing at depth {}", key, depth))),
                }
            }
        }
        if let (Some(a), Some(b)) = (eager.root(), lazy.root()) {
            max_diff = max_diff.max((a.log_odds() - b.log_odds()).abs());
        }
        metrics.max_log_odds_diff = max_diff;

        if max_diff > 1e-9 {
            return Ok(Some(format!("log-odds diverged by {:.3e}", max_diff)));
        }
        Ok(None)
    }

    /// Lazy update at a point; out-of-bounds points count as rejected.
    fn apply(
        &self,
        tree: &mut EvidOcTree,
        point: &Point3<f64>,
        observation: Observation,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), SimError> {
        match tree.update_node(point, observation, None, true)? {
            Some(_) => metrics.updates += 1,
            None => metrics.rejected_updates += 1,
        }
        Ok(())
    }

    /// Eager update at a point with a timestamp.
    fn apply_at(
        &self,
        tree: &mut EvidOcTree,
        point: &Point3<f64>,
        observation: Observation,
        timestamp: u64,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), SimError> {
        match tree.update_node(point, observation, Some(timestamp), false)? {
            Some(_) => metrics.updates += 1,
            None => metrics.rejected_updates += 1,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::Cube);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.updates, 40 * 40 * 40 + 60 * 60 * 60);
        assert_eq!(result.metrics.rejected_updates, 0);
        assert!(result.metrics.occupied_leaves > 0);
    }

    #[test]
    fn test_moving_object_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::MovingObject);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.conflicts_detected > 0);
    }

    #[test]
    fn test_moving_object_needs_motion_to_conflict() {
        // Box never moves within two ticks
        let result = ScenarioRunner::new(42).with_ticks(2).run(ScenarioId::MovingObject);
        assert!(!result.passed);
        assert_eq!(result.metrics.conflicts_detected, 0);
    }

    #[test]
    fn test_decay_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::Decay);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.rejected_updates, 1);
        assert_eq!(result.metrics.conflicts_detected, 1);
    }

    #[test]
    fn test_lazy_vs_eager_across_seeds() {
        for seed in [1, 42, 1234] {
            let result = ScenarioRunner::new(seed).run(ScenarioId::LazyVsEager);
            assert!(result.passed, "seed {}: {:?}", seed, result.failure_reason);
            assert_eq!(result.metrics.updates, 500);
            assert!(result.metrics.max_log_odds_diff <= 1e-9);
        }
    }

    #[test]
    fn test_invalid_config_fails_cleanly() {
        let config = MapConfig {
            resolution: -1.0,
            ..MapConfig::default()
        };
        let result = ScenarioRunner::new(42).with_config(config).run(ScenarioId::Cube);
        assert!(!result.passed);
        assert!(result.failure_reason.unwrap().contains("Invalid configuration"));
    }
}
