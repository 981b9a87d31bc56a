//! Explicit registry of tree kinds.
//!
//! Maps a type tag to a constructor. Callers build the registry once at
//! startup (usually via [`TreeRegistry::with_defaults`]) and create trees by
//! tag, e.g. when the tag comes from a stored map header.

use std::collections::BTreeMap;

use crate::config::{MapConfig, TimeModel};
use crate::error::MapError;
use crate::evid_tree::{EvidOcTree, TREE_TYPE_STAMPED, TREE_TYPE_STATIC};

/// Constructs a tree of one kind from a configuration.
pub type TreeConstructor = fn(MapConfig) -> Result<EvidOcTree, MapError>;

/// Tag -> constructor mapping.
#[derive(Debug, Clone, Default)]
pub struct TreeRegistry {
    constructors: BTreeMap<&'static str, TreeConstructor>,
}

fn create_static(mut config: MapConfig) -> Result<EvidOcTree, MapError> {
    config.time_model = TimeModel::Static;
    EvidOcTree::new(config)
}

fn create_stamped(config: MapConfig) -> Result<EvidOcTree, MapError> {
    if !config.time_model.is_decaying() {
        return Err(MapError::config(format!(
            "{TREE_TYPE_STAMPED} requires a decaying time model"
        )));
    }
    EvidOcTree::new(config)
}

impl TreeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in static and stamped kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.constructors.insert(TREE_TYPE_STATIC, create_static);
        registry.constructors.insert(TREE_TYPE_STAMPED, create_stamped);
        registry
    }

    /// Register a new kind. Fails if the tag is taken.
    pub fn register(&mut self, tag: &'static str, constructor: TreeConstructor) -> Result<(), MapError> {
        if self.constructors.contains_key(tag) {
            return Err(MapError::DuplicateTreeKind(tag.to_string()));
        }
        self.constructors.insert(tag, constructor);
        Ok(())
    }

    /// Create a tree of the kind registered under `tag`.
    pub fn create(&self, tag: &str, config: MapConfig) -> Result<EvidOcTree, MapError> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| MapError::UnknownTreeKind(tag.to_string()))?;
        constructor(config)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    /// Registered tags in sorted order.
    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_create_both_kinds() {
        let registry = TreeRegistry::with_defaults();
        assert_eq!(registry.tags().collect::<Vec<_>>(), vec![TREE_TYPE_STATIC, TREE_TYPE_STAMPED]);

        let tree = registry.create(TREE_TYPE_STATIC, MapConfig::decaying(0.1, 100.0)).unwrap();
        assert_eq!(tree.tree_type(), TREE_TYPE_STATIC);

        let tree = registry.create(TREE_TYPE_STAMPED, MapConfig::decaying(0.1, 100.0)).unwrap();
        assert_eq!(tree.tree_type(), TREE_TYPE_STAMPED);
        assert!(registry.create(TREE_TYPE_STAMPED, MapConfig::default()).is_err());
    }

    #[test]
    fn test_unknown_and_duplicate_tags() {
        let mut registry = TreeRegistry::new();
        assert!(!registry.contains(TREE_TYPE_STATIC));
        assert_eq!(
            registry.create("OcTree", MapConfig::default()).unwrap_err(),
            MapError::UnknownTreeKind("OcTree".to_string())
        );

        registry.register("coarse", |config| {
            EvidOcTree::new(MapConfig {
                resolution: 1.0,
                ..config
            })
        })
        .unwrap();
        assert_eq!(
            registry.register("coarse", create_static),
            Err(MapError::DuplicateTreeKind("coarse".to_string()))
        );
        let tree = registry.create("coarse", MapConfig::default()).unwrap();
        assert_eq!(tree.resolution(), 1.0);
    }
}
