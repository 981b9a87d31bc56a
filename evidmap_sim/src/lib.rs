//! Deterministic scenario harness for the evidential occupancy octree.
//!
//! Every scenario builds its maps from scratch and derives all randomness
//! from a single 64-bit seed, so a failing seed reproduces exactly.
//!
//! # Usage
//!
//! ```ignore
//! use evidmap_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::MovingObject);
//! assert!(result.passed);
//! ```

mod error;
mod oracle;
mod runner;
pub mod scenarios;

pub use error::SimError;
pub use oracle::{cube_points, MovingBox, Scan, SceneOracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
