//! The "EVIDENCE" Algebra - Dempster-Shafer masses over {free, occupied}
//!
//! A cell's belief is a mass distribution over the power set of
//! {free, occupied}: the singletons `free` and `occupied`, the whole frame
//! `ignorance` (either could be true), and `conflict` (the empty set). Only
//! the conflict bucket is transient - it is produced by combination and
//! removed again by Dempster normalization.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MapError;

/// Tolerance used when checking that a mass sums to one.
pub const MASS_TOLERANCE: f64 = 1e-6;

/// Below this normalization denominator, combination is treated as total conflict.
pub const TOTAL_CONFLICT_EPSILON: f64 = 1e-9;

// ============================================================================
// EVIDENTIAL MASS
// ============================================================================

/// Four-component belief mass of a cell.
///
/// After normalization `free + occupied + ignorance == 1` and `conflict == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvidMass {
    /// Mass committed to "the cell is free"
    pub free: f64,

    /// Mass committed to "the cell is occupied"
    pub occupied: f64,

    /// Mass left uncommitted (no evidence either way)
    pub ignorance: f64,

    /// Mass on contradictory hypotheses (zero outside of combination)
    pub conflict: f64,
}

impl Default for EvidMass {
    fn default() -> Self {
        Self::ignorance()
    }
}

impl EvidMass {
    /// The "no evidence yet" state.
    pub const fn ignorance() -> Self {
        Self {
            free: 0.0,
            occupied: 0.0,
            ignorance: 1.0,
            conflict: 0.0,
        }
    }

    /// Certainty that the cell is occupied.
    pub const fn certain_occupied() -> Self {
        Self {
            free: 0.0,
            occupied: 1.0,
            ignorance: 0.0,
            conflict: 0.0,
        }
    }

    /// Create a validated, conflict-free mass.
    pub fn new(free: f64, occupied: f64, ignorance: f64) -> Result<Self, MapError> {
        let mass = Self {
            free,
            occupied,
            ignorance,
            conflict: 0.0,
        };
        if mass.is_valid() {
            Ok(mass)
        } else {
            Err(MapError::mass(format!(
                "free={free}, occupied={occupied}, ignorance={ignorance}"
            )))
        }
    }

    /// Sum of all four components.
    #[inline]
    pub fn total(&self) -> f64 {
        self.free + self.occupied + self.ignorance + self.conflict
    }

    /// True if every component is finite and non-negative and the total is one.
    pub fn is_valid(&self) -> bool {
        let components = [self.free, self.occupied, self.ignorance, self.conflict];
        components
            .iter()
            .all(|m| m.is_finite() && *m >= -MASS_TOLERANCE)
            && (self.total() - 1.0).abs() <= MASS_TOLERANCE
    }

    /// True if this is (numerically) the full-ignorance state.
    pub fn is_full_ignorance(&self) -> bool {
        (self.ignorance - 1.0).abs() <= MASS_TOLERANCE
    }

    /// Bleed mass toward ignorance.
    ///
    /// `alpha = 1` keeps the mass unchanged, `alpha = 0` forgets it entirely.
    /// Values outside `[0, 1]` are clamped.
    pub fn decay(&self, alpha: f64) -> Self {
        let alpha = alpha.clamp(0.0, 1.0);
        Self {
            free: alpha * self.free,
            occupied: alpha * self.occupied,
            ignorance: alpha * self.ignorance + (1.0 - alpha),
            conflict: alpha * self.conflict,
        }
    }

    /// Dempster's rule of combination.
    ///
    /// Products of `free` with `occupied` go to the conflict bucket, which is
    /// then removed by normalization. The pre-normalization conflict is
    /// returned alongside the fused mass. On total conflict (`1 - conflict`
    /// numerically zero) the result saturates to [`EvidMass::certain_occupied`].
    pub fn combine(&self, other: &EvidMass) -> Combination {
        let conflict = self.free * other.occupied + self.occupied * other.free;

        let unnormalized = Self {
            free: self.free * other.free
                + self.free * other.ignorance
                + self.ignorance * other.free,
            occupied: self.occupied * other.occupied
                + self.occupied * other.ignorance
                + self.ignorance * other.occupied,
            ignorance: self.ignorance * other.ignorance,
            conflict,
        };

        match unnormalized.normalize() {
            Some(mass) => Combination {
                mass,
                conflict,
                saturated: false,
            },
            None => {
                debug!(conflict, "total conflict in combination, saturating to occupied");
                Combination {
                    mass: Self::certain_occupied(),
                    conflict,
                    saturated: true,
                }
            }
        }
    }

    /// Dempster normalization: scale by `1 / (1 - conflict)` and drop conflict.
    ///
    /// Returns `None` when the denominator vanishes (total conflict).
    pub fn normalize(&self) -> Option<Self> {
        let denominator = 1.0 - self.conflict;
        if denominator.abs() < TOTAL_CONFLICT_EPSILON || !denominator.is_finite() {
            return None;
        }
        let k = 1.0 / denominator;
        Some(Self {
            free: k * self.free,
            occupied: k * self.occupied,
            ignorance: k * self.ignorance,
            conflict: 0.0,
        })
    }

    /// Component-wise arithmetic mean.
    ///
    /// Returns `None` for an empty input.
    pub fn average<'a, I>(masses: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a EvidMass>,
    {
        let mut sum = Self {
            free: 0.0,
            occupied: 0.0,
            ignorance: 0.0,
            conflict: 0.0,
        };
        let mut count = 0usize;

        for mass in masses {
            sum.free += mass.free;
            sum.occupied += mass.occupied;
            sum.ignorance += mass.ignorance;
            sum.conflict += mass.conflict;
            count += 1;
        }

        if count == 0 {
            return None;
        }

        let n = count as f64;
        Some(Self {
            free: sum.free / n,
            occupied: sum.occupied / n,
            ignorance: sum.ignorance / n,
            conflict: sum.conflict / n,
        })
    }
}

/// Decay factor `exp(-dt / tau)` for an elapsed time in milliseconds.
///
/// A non-positive `tau_ms` means "forget instantly" for any positive `dt_ms`.
pub fn decay_factor(dt_ms: u64, tau_ms: f64) -> f64 {
    if dt_ms == 0 {
        return 1.0;
    }
    if tau_ms <= 0.0 {
        return 0.0;
    }
    (-(dt_ms as f64) / tau_ms).exp()
}

/// Result of [`EvidMass::combine`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Combination {
    /// Normalized fused mass (conflict component is zero)
    pub mass: EvidMass,

    /// Conflict mass before normalization
    pub conflict: f64,

    /// True if the combination hit total conflict and was saturated
    pub saturated: bool,
}

// ============================================================================
// BELIEF ASSIGNMENT (Observation)
// ============================================================================

/// Caller-supplied basic belief assignment for one observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeliefAssignment {
    pub free: f64,
    pub occupied: f64,
    pub ignorance: f64,
}

impl BeliefAssignment {
    /// Create a validated assignment from explicit components.
    pub fn new(free: f64, occupied: f64, ignorance: f64) -> Result<Self, MapError> {
        EvidMass::new(free, occupied, ignorance)?;
        Ok(Self {
            free,
            occupied,
            ignorance,
        })
    }

    /// "Occupied" reading with the given strength; the rest is ignorance.
    pub fn occupied(strength: f64) -> Self {
        let strength = strength.clamp(0.0, 1.0);
        Self {
            free: 0.0,
            occupied: strength,
            ignorance: 1.0 - strength,
        }
    }

    /// "Free" reading with the given strength; the rest is ignorance.
    pub fn free(strength: f64) -> Self {
        let strength = strength.clamp(0.0, 1.0);
        Self {
            free: strength,
            occupied: 0.0,
            ignorance: 1.0 - strength,
        }
    }

    /// The assignment as a conflict-free mass.
    pub fn to_mass(&self) -> EvidMass {
        EvidMass {
            free: self.free,
            occupied: self.occupied,
            ignorance: self.ignorance,
            conflict: 0.0,
        }
    }
}

impl From<BeliefAssignment> for EvidMass {
    fn from(bba: BeliefAssignment) -> Self {
        bba.to_mass()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn assert_mass_eq(a: &EvidMass, b: &EvidMass) {
        assert_relative_eq!(a.free, b.free, epsilon = 1e-9);
        assert_relative_eq!(a.occupied, b.occupied, epsilon = 1e-9);
        assert_relative_eq!(a.ignorance, b.ignorance, epsilon = 1e-9);
        assert_relative_eq!(a.conflict, b.conflict, epsilon = 1e-9);
    }

    fn valid_mass() -> impl Strategy<Value = EvidMass> {
        (0.0f64..1.0, 0.0f64..1.0, 0.01f64..1.0).prop_map(|(f, o, i)| {
            let total = f + o + i;
            EvidMass {
                free: f / total,
                occupied: o / total,
                ignorance: i / total,
                conflict: 0.0,
            }
        })
    }

    #[test]
    fn test_default_is_full_ignorance() {
        let mass = EvidMass::default();
        assert!(mass.is_full_ignorance());
        assert!(mass.is_valid());
        assert_eq!(mass.occupied, 0.0);
        assert_eq!(mass.free, 0.0);
    }

    #[test]
    fn test_new_rejects_invalid_mass() {
        assert!(EvidMass::new(0.5, 0.6, 0.0).is_err());
        assert!(EvidMass::new(-0.1, 0.6, 0.5).is_err());
        assert!(EvidMass::new(f64::NAN, 0.5, 0.5).is_err());
        assert!(EvidMass::new(0.2, 0.3, 0.5).is_ok());
    }

    #[test]
    fn test_decay_bleeds_toward_ignorance() {
        let mass = EvidMass::new(0.2, 0.6, 0.2).unwrap();

        let half = mass.decay(0.5);
        assert_relative_eq!(half.free, 0.1, epsilon = 1e-12);
        assert_relative_eq!(half.occupied, 0.3, epsilon = 1e-12);
        assert_relative_eq!(half.ignorance, 0.6, epsilon = 1e-12);

        let forgotten = mass.decay(0.0);
        assert!(forgotten.is_full_ignorance());
    }

    #[test]
    fn test_decay_factor() {
        assert_eq!(decay_factor(0, 1000.0), 1.0);
        assert_relative_eq!(decay_factor(1000, 1000.0), (-1.0f64).exp(), epsilon = 1e-12);
        assert_eq!(decay_factor(10, 0.0), 0.0);
    }

    #[test]
    fn test_conflicting_beliefs_produce_conflict() {
        let occupied = BeliefAssignment::occupied(0.9).to_mass();
        let free = BeliefAssignment::free(0.9).to_mass();

        let result = occupied.combine(&free);
        assert!(result.conflict > 0.5);
        assert_relative_eq!(result.conflict, 0.81, epsilon = 1e-12);
        assert!(!result.saturated);
        assert!(result.mass.is_valid());
    }

    #[test]
    fn test_opposing_readings_after_occupied() {
        // (0, 0.7, 0.3) then (0.7, 0, 0.3) -> conflict = 0.49
        let prior = BeliefAssignment::occupied(0.7).to_mass();
        let obs = BeliefAssignment::free(0.7).to_mass();

        let result = prior.combine(&obs);
        assert_relative_eq!(result.conflict, 0.49, epsilon = 1e-12);
        assert_relative_eq!(result.mass.total(), 1.0, epsilon = 1e-12);
        assert!(result.mass.free >= 0.0);
        assert!(result.mass.occupied >= 0.0);
        assert!(result.mass.ignorance >= 0.0);
        assert_relative_eq!(result.mass.free, 0.21 / 0.51, epsilon = 1e-12);
        assert_relative_eq!(result.mass.occupied, 0.21 / 0.51, epsilon = 1e-12);
    }

    #[test]
    fn test_total_conflict_saturates() {
        let free = EvidMass::new(1.0, 0.0, 0.0).unwrap();
        let occupied = EvidMass::certain_occupied();

        let result = free.combine(&occupied);
        assert!(result.saturated);
        assert_relative_eq!(result.conflict, 1.0, epsilon = 1e-12);
        assert_eq!(result.mass, EvidMass::certain_occupied());
        assert!(result.mass.is_valid());
    }

    #[test]
    fn test_average() {
        let a = EvidMass::new(0.2, 0.6, 0.2).unwrap();
        let b = EvidMass::ignorance();

        let avg = EvidMass::average([a, b].iter()).unwrap();
        assert_relative_eq!(avg.free, 0.1, epsilon = 1e-12);
        assert_relative_eq!(avg.occupied, 0.3, epsilon = 1e-12);
        assert_relative_eq!(avg.ignorance, 0.6, epsilon = 1e-12);
        assert!(EvidMass::average(std::iter::empty()).is_none());
    }

    #[test]
    fn test_belief_assignment_constructors() {
        let occ = BeliefAssignment::occupied(0.7);
        assert_relative_eq!(occ.ignorance, 0.3, epsilon = 1e-12);
        assert!(BeliefAssignment::new(0.5, 0.5, 0.5).is_err());
        assert!(BeliefAssignment::new(0.1, 0.2, 0.7).is_ok());
    }

    proptest! {
        #[test]
        fn prop_decay_one_is_identity(m in valid_mass()) {
            assert_mass_eq(&m.decay(1.0), &m);
        }

        #[test]
        fn prop_combination_conserves_mass(a in valid_mass(), b in valid_mass()) {
            let result = a.combine(&b);
            prop_assert!((result.mass.total() - 1.0).abs() < 1e-9);
            prop_assert_eq!(result.mass.conflict, 0.0);
        }

        #[test]
        fn prop_full_ignorance_is_identity(m in valid_mass()) {
            let result = m.combine(&EvidMass::ignorance());
            assert_mass_eq(&result.mass, &m);
            prop_assert_eq!(result.conflict, 0.0);
        }

        #[test]
        fn prop_combination_commutes(a in valid_mass(), b in valid_mass()) {
            let ab = a.combine(&b);
            let ba = b.combine(&a);
            assert_mass_eq(&ab.mass, &ba.mass);
            prop_assert!((ab.conflict - ba.conflict).abs() < 1e-12);
        }
    }
}
