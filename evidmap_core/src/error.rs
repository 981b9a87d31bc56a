//! Error types for the evidential occupancy map.

use thiserror::Error;

/// Errors surfaced by map construction, configuration and updates.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapError {
    /// Coordinate falls outside the representable key range (or is not finite)
    #[error("Invalid coordinate: ({x}, {y}, {z})")]
    InvalidCoordinate { x: f64, y: f64, z: f64 },

    /// Observation timestamp precedes the cell's last update
    #[error("Non-monotonic time: observation at {new}ms precedes last update at {last}ms")]
    NonMonotonicTime { last: u64, new: u64 },

    /// Belief assignment has negative components or does not sum to one
    #[error("Invalid mass: {0}")]
    InvalidMass(String),

    /// Inner node missing a child the update path requires
    #[error("Structural inconsistency: {0}")]
    StructuralInconsistency(String),

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration document could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(String),

    /// Tree kind tag not present in the registry
    #[error("Unknown tree kind: {0}")]
    UnknownTreeKind(String),

    /// Tree kind tag registered twice
    #[error("Tree kind already registered: {0}")]
    DuplicateTreeKind(String),
}

impl MapError {
    /// Creates an invalid-config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Creates an invalid-mass error.
    pub fn mass(msg: impl Into<String>) -> Self {
        Self::InvalidMass(msg.into())
    }
}
