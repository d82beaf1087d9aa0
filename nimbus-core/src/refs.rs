//! The resolved-reference map.
//!
//! As providers start they register the concrete local value behind each
//! logical identifier (`MyQueue -> local-my-queue`) and its attributes
//! (`MyQueue.Arn -> arn:...`). Keys are write-once: the first writer wins
//! and later writes are ignored, so reads need no coordination once startup
//! has finished.

use std::collections::HashMap;

use dashmap::DashMap;

/// Concurrent logical-id -> concrete-value map, write-once per key.
#[derive(Default)]
pub struct ReferenceMap {
    entries: DashMap<String, String>,
}

impl ReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value for a logical identifier. Returns `false` if the key
    /// was already registered (the existing value is kept).
    pub fn register(&self, logical_id: impl Into<String>, value: impl Into<String>) -> bool {
        let logical_id = logical_id.into();
        match self.entries.entry(logical_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(value.into());
                true
            }
        }
    }

    /// Register a `LogicalId.Attribute` composite key.
    pub fn register_attribute(
        &self,
        logical_id: &str,
        attribute: &str,
        value: impl Into<String>,
    ) -> bool {
        self.register(format!("{logical_id}.{attribute}"), value)
    }

    /// Look up the concrete value behind a logical identifier or composite
    /// key.
    pub fn resolve(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A point-in-time copy for batch substitution (e.g. resolving a
    /// function's environment).
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let refs = ReferenceMap::new();
        assert!(refs.register("MyQueue", "local-my-queue"));
        assert!(!refs.register("MyQueue", "other-value"));
        assert_eq!(refs.resolve("MyQueue").as_deref(), Some("local-my-queue"));
    }

    #[test]
    fn attribute_keys_are_composite() {
        let refs = ReferenceMap::new();
        refs.register_attribute("MyQueue", "Arn", "arn:nimbus:queue:local:000000000000:my-queue");
        assert!(refs.contains("MyQueue.Arn"));
        assert!(!refs.contains("MyQueue"));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let refs = ReferenceMap::new();
        refs.register("A", "1");
        let snap = refs.snapshot();
        refs.register("B", "2");
        assert_eq!(snap.len(), 1);
        assert_eq!(refs.len(), 2);
    }
}
