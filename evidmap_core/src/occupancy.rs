//! Occupancy projection: evidential mass -> scalar log-odds.
//!
//! The authoritative state of a cell is its [`EvidMass`]; the log-odds value
//! exists for consumers that only understand scalar occupancy (threshold
//! queries, pruning comparisons, visualization).

use crate::evid_mass::EvidMass;

/// `log(p / (1 - p))`. Returns +/- infinity at the endpoints.
#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Inverse of [`logit`].
#[inline]
pub fn probability(log_odds: f64) -> f64 {
    1.0 - 1.0 / (1.0 + log_odds.exp())
}

/// Pignistic probability of "occupied": ignorance is split evenly.
#[inline]
pub fn pignistic_occupancy(mass: &EvidMass) -> f64 {
    (mass.occupied + mass.ignorance / 2.0).clamp(0.0, 1.0)
}

/// Log-odds of the pignistic occupancy.
pub fn to_log_odds(mass: &EvidMass) -> f64 {
    logit(pignistic_occupancy(mass))
}

/// Saturating clamp to `[min, max]`.
///
/// Infinite values land exactly on the bound.
#[inline]
pub fn clamp_log_odds(log_odds: f64, min: f64, max: f64) -> f64 {
    if log_odds.is_nan() {
        return 0.0;
    }
    log_odds.clamp(min, max)
}
