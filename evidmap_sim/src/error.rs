//! Error types for the scenario harness.

use evidmap_core::MapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// Map rejected an update or configuration
    #[error("Map error: {0}")]
    Map(#[from] MapError),

    /// Sensor noise model could not be built
    #[error("Noise model error: {0}")]
    Noise(String),

    /// Scenario configuration file could not be read
    #[error("Config file error: {0}")]
    ConfigFile(String),
}
