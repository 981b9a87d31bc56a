//! Evidential payload carried by every octree node.

use serde::{Deserialize, Serialize};

use crate::evid_mass::EvidMass;
use crate::occupancy::probability;
use crate::octree_node::OcTreeNode;

/// Per-node state: belief mass, derived log-odds, last update time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvidPayload {
    /// Authoritative belief mass
    pub mass: EvidMass,

    /// Clamped log-odds derived from `mass` (or copied in by pruning)
    pub log_odds: f64,

    /// Time of the last update in milliseconds (temporal variant only)
    pub timestamp: Option<u64>,
}

impl Default for EvidPayload {
    fn default() -> Self {
        Self {
            mass: EvidMass::ignorance(),
            log_odds: 0.0,
            timestamp: None,
        }
    }
}

/// A node of the evidential octree.
pub type EvidNode = OcTreeNode<EvidPayload>;

impl OcTreeNode<EvidPayload> {
    #[inline]
    pub fn mass(&self) -> &EvidMass {
        &self.payload().mass
    }

    #[inline]
    pub fn log_odds(&self) -> f64 {
        self.payload().log_odds
    }

    /// Occupancy probability derived from the stored log-odds.
    pub fn occupancy(&self) -> f64 {
        probability(self.log_odds())
    }

    #[inline]
    pub fn timestamp(&self) -> Option<u64> {
        self.payload().timestamp
    }

    /// True once the node holds any evidence.
    pub fn is_mass_set(&self) -> bool {
        !self.mass().is_full_ignorance()
    }

    /// Mean mass of the existing children, if any.
    pub fn average_child_mass(&self) -> Option<EvidMass> {
        let masses: Vec<EvidMass> = self.children().map(|(_, child)| *child.mass()).collect();
        EvidMass::average(masses.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fresh_node_has_no_evidence() {
        let node = EvidNode::default();
        assert!(!node.is_mass_set());
        assert_eq!(node.log_odds(), 0.0);
        assert_relative_eq!(node.occupancy(), 0.5, epsilon = 1e-12);
        assert_eq!(node.timestamp(), None);
        assert!(node.average_child_mass().is_none());
    }

    #[test]
    fn test_average_child_mass_over_existing_children() {
        let mut node = EvidNode::default();
        let occupied = EvidPayload {
            mass: EvidMass::new(0.0, 0.8, 0.2).unwrap(),
            ..EvidPayload::default()
        };
        node.create_child(0, occupied);
        node.create_child(6, EvidPayload::default());

        let avg = node.average_child_mass().unwrap();
        assert_relative_eq!(avg.occupied, 0.4, epsilon = 1e-12);
        assert_relative_eq!(avg.ignorance, 0.6, epsilon = 1e-12);
    }
}
