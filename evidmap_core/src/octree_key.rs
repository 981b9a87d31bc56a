//! Discrete spatial keys for the octree and coordinate <-> key conversion.
//!
//! Each axis is quantized to a `u16`. The tree has a fixed depth of 16, so a
//! key addresses one leaf voxel and its prefix bits select the path from the
//! root. Key `2^15` sits at coordinate 0.

use std::collections::HashSet;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::error::MapError;

/// Depth of the tree; leaves live at this depth.
pub const TREE_DEPTH: u8 = 16;

/// Key value of the coordinate origin on every axis.
pub const TREE_MAX_VAL: u32 = 1 << (TREE_DEPTH - 1);

/// A discrete voxel address `[x, y, z]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OcTreeKey(pub [u16; 3]);

impl OcTreeKey {
    pub const fn new(x: u16, y: u16, z: u16) -> Self {
        Self([x, y, z])
    }

    #[inline]
    pub fn x(&self) -> u16 {
        self.0[0]
    }

    #[inline]
    pub fn y(&self) -> u16 {
        self.0[1]
    }

    #[inline]
    pub fn z(&self) -> u16 {
        self.0[2]
    }
}

/// De-duplicated set of keys, e.g. the free or occupied cells of one scan.
pub type KeySet = HashSet<OcTreeKey>;

/// Octant (0..8) of the child containing `key` below a node at `depth`.
///
/// Bit 0 of the index comes from x, bit 1 from y, bit 2 from z.
#[inline]
pub fn compute_child_index(key: &OcTreeKey, depth: u8) -> usize {
    debug_assert!(depth < TREE_DEPTH);
    let bit = TREE_DEPTH - 1 - depth;
    let mut pos = 0;
    for axis in 0..3 {
        if key.0[axis] & (1 << bit) != 0 {
            pos |= 1 << axis;
        }
    }
    pos
}

/// Key of the child at `index` below a node whose key prefix is `parent`.
///
/// `parent` holds the path bits above `depth`; the child's bit at `depth`
/// is set from `index`.
pub fn child_key_prefix(parent: &OcTreeKey, index: usize, depth: u8) -> OcTreeKey {
    debug_assert!(depth < TREE_DEPTH && index < 8);
    let bit = TREE_DEPTH - 1 - depth;
    let mut key = *parent;
    for axis in 0..3 {
        if index & (1 << axis) != 0 {
            key.0[axis] |= 1 << bit;
        }
    }
    key
}

/// Snap a key to the center of its containing node at `depth`.
pub fn adjust_key_at_depth(key: &OcTreeKey, depth: u8) -> OcTreeKey {
    if depth >= TREE_DEPTH {
        return *key;
    }
    let diff = u32::from(TREE_DEPTH - depth);
    let mut adjusted = *key;
    for axis in 0..3 {
        let k = u32::from(key.0[axis]);
        // diff <= 16, so the result fits in u16 for every depth > 0
        let snapped = ((k >> diff) << diff) + (1 << (diff - 1));
        adjusted.0[axis] = snapped.min(u32::from(u16::MAX)) as u16;
    }
    adjusted
}

/// Converts between metric coordinates and keys at a fixed resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyConverter {
    resolution: f64,
}

impl KeyConverter {
    pub fn new(resolution: f64) -> Self {
        Self { resolution }
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Edge length of a node at `depth` (the root is depth 0).
    pub fn node_size(&self, depth: u8) -> f64 {
        let depth = depth.min(TREE_DEPTH);
        self.resolution * f64::from(1u32 << (TREE_DEPTH - depth))
    }

    /// Half the metric extent of the tree along each axis.
    pub fn half_extent(&self) -> f64 {
        self.resolution * f64::from(TREE_MAX_VAL)
    }

    fn axis_to_key(&self, coordinate: f64) -> Option<u16> {
        if !coordinate.is_finite() {
            return None;
        }
        let scaled = (coordinate / self.resolution).floor();
        let max = f64::from(TREE_MAX_VAL);
        if scaled >= -max && scaled < max {
            Some((scaled + max) as u16)
        } else {
            None
        }
    }

    /// Key of the leaf voxel containing `point`.
    pub fn coord_to_key(&self, point: &Point3<f64>) -> Result<OcTreeKey, MapError> {
        match (
            self.axis_to_key(point.x),
            self.axis_to_key(point.y),
            self.axis_to_key(point.z),
        ) {
            (Some(x), Some(y), Some(z)) => Ok(OcTreeKey::new(x, y, z)),
            _ => Err(MapError::InvalidCoordinate {
                x: point.x,
                y: point.y,
                z: point.z,
            }),
        }
    }

    /// Key of the node at `depth` containing `point`.
    pub fn coord_to_key_at_depth(
        &self,
        point: &Point3<f64>,
        depth: u8,
    ) -> Result<OcTreeKey, MapError> {
        let key = self.coord_to_key(point)?;
        Ok(adjust_key_at_depth(&key, depth))
    }

    fn axis_to_coord(&self, key: u16, depth: u8) -> f64 {
        if depth == 0 {
            return 0.0;
        }
        if depth >= TREE_DEPTH {
            return (f64::from(key) - f64::from(TREE_MAX_VAL) + 0.5) * self.resolution;
        }
        let cells = f64::from(1u32 << (TREE_DEPTH - depth));
        (((f64::from(key) - f64::from(TREE_MAX_VAL)) / cells).floor() + 0.5)
            * self.node_size(depth)
    }

    /// Center of the leaf voxel addressed by `key`.
    pub fn key_to_coord(&self, key: &OcTreeKey) -> Point3<f64> {
        self.key_to_coord_at_depth(key, TREE_DEPTH)
    }

    /// Center of the node at `depth` containing `key`.
    pub fn key_to_coord_at_depth(&self, key: &OcTreeKey, depth: u8) -> Point3<f64> {
        Point3::new(
            self.axis_to_coord(key.x(), depth),
            self.axis_to_coord(key.y(), depth),
            self.axis_to_coord(key.z(), depth),
        )
    }
}
