//! Keys whose most recent fusion exceeded the conflict threshold.

use crate::octree_key::OcTreeKey;

/// Append-only list of conflicted keys for the current batch.
///
/// Keys are kept in the order they were flagged; a key flagged twice in one
/// batch appears twice.
#[derive(Debug, Clone, Default)]
pub struct ConflictRegistry {
    keys: Vec<OcTreeKey>,
}

impl ConflictRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: OcTreeKey) {
        self.keys.push(key);
    }

    /// Keys recorded so far, without clearing.
    pub fn pending(&self) -> &[OcTreeKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Return every recorded key and reset the registry.
    pub fn drain(&mut self) -> Vec<OcTreeKey> {
        std::mem::take(&mut self.keys)
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}
