//! Target registry: name to connection settings.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::config::TargetConfig;
use crate::error::{GatewayError, Result};
use crate::path::WILDCARD;

/// Known targets, guarded by a single reader/writer lock.
///
/// The lock is only held while the map is read or written; callers get
/// clones and never keep it across an await.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: RwLock<BTreeMap<String, TargetConfig>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated from configuration.
    pub fn from_targets(targets: impl IntoIterator<Item = TargetConfig>) -> Self {
        let registry = Self::new();
        for target in targets {
            registry.insert(target);
        }
        registry
    }

    /// Add or replace a target. Returns the previous entry.
    pub fn insert(&self, target: TargetConfig) -> Option<TargetConfig> {
        self.targets.write().insert(target.name.clone(), target)
    }

    pub fn remove(&self, name: &str) -> Option<TargetConfig> {
        self.targets.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<TargetConfig> {
        self.targets.read().get(name).cloned()
    }

    /// Sorted target names.
    pub fn names(&self) -> Vec<String> {
        self.targets.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    /// Resolve a target selector to concrete targets.
    ///
    /// `""` and `"*"` select every target; otherwise the selector is a name
    /// or a comma-separated list of names, all of which must be known.
    pub fn resolve(&self, selector: &str) -> Result<Vec<TargetConfig>> {
        let targets = self.targets.read();
        let selector = selector.trim();

        if selector.is_empty() || selector == WILDCARD {
            if targets.is_empty() {
                return Err(GatewayError::TargetNotFound(WILDCARD.to_string()));
            }
            return Ok(targets.values().cloned().collect());
        }

        let mut resolved: Vec<TargetConfig> = Vec::new();
        for name in selector.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if resolved.iter().any(|t| t.name == name) {
                continue;
            }
            let target = targets
                .get(name)
                .ok_or_else(|| GatewayError::TargetNotFound(name.to_string()))?;
            resolved.push(target.clone());
        }

        if resolved.is_empty() {
            return Err(GatewayError::TargetNotFound(selector.to_string()));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TargetRegistry {
        TargetRegistry::from_targets([
            TargetConfig::new("r1", "10.0.0.1:9339"),
            TargetConfig::new("r2", "10.0.0.2:9339"),
            TargetConfig::new("r3", "10.0.0.3:9339"),
        ])
    }

    fn names(targets: Vec<TargetConfig>) -> Vec<String> {
        targets.into_iter().map(|t| t.name).collect()
    }

    #[test]
    fn test_resolve_all() {
        let registry = registry();
        assert_eq!(names(registry.resolve("*").unwrap()), ["r1", "r2", "r3"]);
        assert_eq!(names(registry.resolve("").unwrap()), ["r1", "r2", "r3"]);
    }

    #[test]
    fn test_resolve_list() {
        let registry = registry();
        assert_eq!(names(registry.resolve("r2").unwrap()), ["r2"]);
        assert_eq!(names(registry.resolve("r3, r1,r3").unwrap()), ["r3", "r1"]);
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = registry();
        let err = registry.resolve("r1,r9").unwrap_err();
        assert!(matches!(err, GatewayError::TargetNotFound(name) if name == "r9"));

        let empty = TargetRegistry::new();
        assert!(matches!(
            empty.resolve("*"),
            Err(GatewayError::TargetNotFound(_))
        ));
        assert!(registry.resolve(",").is_err());
    }

    #[test]
    fn test_insert_remove() {
        let registry = registry();
        assert!(registry.insert(TargetConfig::new("r1", "10.0.0.9:9339")).is_some());
        assert_eq!(registry.get("r1").unwrap().address, "10.0.0.9:9339");

        assert!(registry.remove("r2").is_some());
        assert!(registry.remove("r2").is_none());
        assert_eq!(registry.names(), ["r1", "r3"]);
        assert_eq!(registry.len(), 2);
    }
}
