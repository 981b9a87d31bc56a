//! Map configuration.

use serde::{Deserialize, Serialize};

use crate::error::MapError;

/// How stale evidence is treated before fusion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeModel {
    /// Timestamps are ignored and evidence never decays
    Static,

    /// Evidence decays with `exp(-dt / tau_ms)`; timestamps are milliseconds
    Decaying { tau_ms: f64 },
}

impl TimeModel {
    /// True for the temporal variant.
    pub fn is_decaying(&self) -> bool {
        matches!(self, TimeModel::Decaying { .. })
    }
}

/// Tunable parameters of an [`EvidOcTree`](crate::EvidOcTree).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Edge length of a leaf voxel in meters (default: 0.1)
    pub resolution: f64,

    /// Belief strength assigned to an "occupied" observation (default: 0.7)
    pub occupied_belief: f64,

    /// Belief strength assigned to a "free" observation (default: 0.6)
    pub free_belief: f64,

    /// Temporal decay model (default: Static)
    pub time_model: TimeModel,

    /// Pre-normalization conflict above which a cell is flagged (default: 0.4)
    ///
    /// Two opposing 0.7 readings produce 0.49, which must be flagged.
    pub conflict_threshold: f64,

    /// Lower log-odds clamping bound (default: -2.0, ~0.12 probability)
    pub clamping_min: f64,

    /// Upper log-odds clamping bound (default: 3.5, ~0.97 probability)
    pub clamping_max: f64,

    /// Log-odds above which a node counts as occupied (default: 0.0)
    pub occupancy_threshold: f64,

    /// Max log-odds difference for children to count as equal when pruning
    pub prune_epsilon: f64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            resolution: 0.1,
            occupied_belief: 0.7,
            free_belief: 0.6,
            time_model: TimeModel::Static,
            conflict_threshold: 0.4,
            clamping_min: -2.0,
            clamping_max: 3.5,
            occupancy_threshold: 0.0,
            prune_epsilon: 1e-6,
        }
    }
}

impl MapConfig {
    /// Default configuration with the given resolution.
    pub fn with_resolution(resolution: f64) -> Self {
        Self {
            resolution,
            ..Self::default()
        }
    }

    /// Default configuration using the decaying time model.
    pub fn decaying(resolution: f64, tau_ms: f64) -> Self {
        Self {
            resolution,
            time_model: TimeModel::Decaying { tau_ms },
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, MapError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| MapError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every parameter is in range.
    pub fn validate(&self) -> Result<(), MapError> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(MapError::config(format!(
                "resolution must be positive, got {}",
                self.resolution
            )));
        }
        for (name, value) in [
            ("occupied_belief", self.occupied_belief),
            ("free_belief", self.free_belief),
            ("conflict_threshold", self.conflict_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MapError::config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if !(self.clamping_min < self.clamping_max) {
            return Err(MapError::config(format!(
                "clamping_min ({}) must be below clamping_max ({})",
                self.clamping_min, self.clamping_max
            )));
        }
        if !(self.prune_epsilon >= 0.0) {
            return Err(MapError::config("prune_epsilon must be non-negative"));
        }
        if let TimeModel::Decaying { tau_ms } = self.time_model {
            if !(tau_ms.is_finite() && tau_ms > 0.0) {
                return Err(MapError::config(format!(
                    "decay time constant must be positive, got {tau_ms}"
                )));
            }
        }
        Ok(())
    }
}
