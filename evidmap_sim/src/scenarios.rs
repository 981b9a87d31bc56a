//! Mapping scenarios for the evidential octree.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScenarioId {
    /// SIM-001: Occupied cube overlapped by a free cube, lazy batch + queries
    Cube,

    /// SIM-002: Object moving in front of a static wall, conflict detection
    MovingObject,

    /// SIM-003: Stale occupied evidence decays before a free reading
    Decay,

    /// SIM-004: Lazy batch vs eager updates must agree
    LazyVsEager,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Cube,
            ScenarioId::MovingObject,
            ScenarioId::Decay,
            ScenarioId::LazyVsEager,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Cube => "cube",
            ScenarioId::MovingObject => "moving_object",
            ScenarioId::Decay => "decay",
            ScenarioId::LazyVsEager => "lazy_vs_eager",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Cube => "40^3 occupied points, 60^3 free points, one consistency pass",
            ScenarioId::MovingObject => "Box sliding past a wall; conflicts must stay on its path",
            ScenarioId::Decay => "Occupied cell left alone for 10s flips free on one reading",
            ScenarioId::LazyVsEager => "500 random updates, both consistency modes, same map",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cube" | "sim-001" => Ok(ScenarioId::Cube),
            "moving_object" | "movingobject" | "sim-002" => Ok(ScenarioId::MovingObject),
            "decay" | "sim-003" => Ok(ScenarioId::Decay),
            "lazy_vs_eager" | "lazyvseager" | "sim-004" => Ok(ScenarioId::LazyVsEager),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
