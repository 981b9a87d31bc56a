//! Leaf fusion: decay the stored belief, combine it with a new observation,
//! flag conflict and derive clamped log-odds.

use tracing::{trace, warn};

use crate::config::{MapConfig, TimeModel};
use crate::error::MapError;
use crate::evid_mass::{decay_factor, EvidMass};
use crate::occupancy::{clamp_log_odds, to_log_odds};

/// Parameters of the fusion operator, extracted from [`MapConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafFusion {
    pub time_model: TimeModel,
    pub conflict_threshold: f64,
    pub clamping_min: f64,
    pub clamping_max: f64,
}

impl From<&MapConfig> for LeafFusion {
    fn from(config: &MapConfig) -> Self {
        Self {
            time_model: config.time_model,
            conflict_threshold: config.conflict_threshold,
            clamping_min: config.clamping_min,
            clamping_max: config.clamping_max,
        }
    }
}

/// Everything a leaf needs to store after one fusion step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionOutcome {
    /// Decayed-and-fused, normalized mass
    pub mass: EvidMass,

    /// Clamped log-odds of the fused mass
    pub log_odds: f64,

    /// Pre-normalization conflict mass
    pub conflict: f64,

    /// True if `conflict` exceeded the configured threshold
    pub conflicted: bool,

    /// True if the combination hit total conflict
    pub saturated: bool,

    /// Timestamp to store on the leaf
    pub timestamp: Option<u64>,
}

impl LeafFusion {
    /// Decay factor for the time elapsed since `last`.
    ///
    /// Fails with [`MapError::NonMonotonicTime`] if `now` precedes `last`.
    /// Under [`TimeModel::Static`], or when either stamp is missing, no decay
    /// is applied.
    pub fn decay_alpha(&self, last: Option<u64>, now: Option<u64>) -> Result<f64, MapError> {
        let TimeModel::Decaying { tau_ms } = self.time_model else {
            return Ok(1.0);
        };
        match (last, now) {
            (Some(last), Some(now)) => {
                if now < last {
                    warn!(last, now, "rejecting observation older than cell state");
                    return Err(MapError::NonMonotonicTime { last, new: now });
                }
                Ok(decay_factor(now - last, tau_ms))
            }
            _ => Ok(1.0),
        }
    }

    /// Fuse `observation` into `current`.
    ///
    /// # Arguments
    /// * `current` - The leaf's stored mass
    /// * `last` - The leaf's last update time (ms), if any
    /// * `now` - The observation time (ms), if any
    /// * `observation` - The observation's belief mass
    pub fn fuse(
        &self,
        current: &EvidMass,
        last: Option<u64>,
        now: Option<u64>,
        observation: &EvidMass,
    ) -> Result<FusionOutcome, MapError> {
        let alpha = self.decay_alpha(last, now)?;
        let decayed = current.decay(alpha);
        let combination = decayed.combine(observation);

        let log_odds = clamp_log_odds(
            to_log_odds(&combination.mass),
            self.clamping_min,
            self.clamping_max,
        );

        let timestamp = if self.time_model.is_decaying() {
            now.or(last)
        } else {
            last
        };

        trace!(
            alpha,
            conflict = combination.conflict,
            log_odds,
            "fused observation into leaf"
        );

        Ok(FusionOutcome {
            mass: combination.mass,
            log_odds,
            conflict: combination.conflict,
            conflicted: combination.conflict > self.conflict_threshold,
            saturated: combination.saturated,
            timestamp,
        })
    }
}
