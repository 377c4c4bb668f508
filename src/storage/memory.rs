//! In-memory `LocalStore` for tests and ephemeral runs.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;

use super::LocalStore;
use crate::types::Result;

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key).cloned()))
    }

    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn get_all(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn get_all_keys(&self, collection: &str) -> Result<Vec<String>> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        Ok(self
            .collections
            .get_mut(collection)
            .is_some_and(|mut docs| docs.remove(key).is_some()))
    }
}
