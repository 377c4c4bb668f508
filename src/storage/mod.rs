//! Local persistence
//!
//! A small collection/key document store: `threads`, `message_bodies`,
//! `ai_state` and `run_logs` all live behind the same `LocalStore` trait.

pub mod database;
pub mod memory;
pub mod threads;

pub use database::{Database, PoolConfig, SharedDatabase};
pub use memory::MemoryStore;
pub use threads::ThreadRepository;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use crate::types::Result;

/// Collection/key document store
pub trait LocalStore: Send + Sync {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Insert or replace a document
    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()>;

    /// All documents of a collection, ordered by key
    fn get_all(&self, collection: &str) -> Result<Vec<(String, Value)>>;

    fn get_all_keys(&self, collection: &str) -> Result<Vec<String>>;

    /// Returns whether a document was removed
    fn delete(&self, collection: &str, key: &str) -> Result<bool>;
}

pub type SharedStore = Arc<dyn LocalStore>;

/// Typed helpers over any `LocalStore`
pub trait StoreExt {
    fn get_json<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>>;

    fn put_json<T: Serialize + ?Sized>(&self, collection: &str, key: &str, value: &T) -> Result<()>;
}

impl<S: LocalStore + ?Sized> StoreExt for S {
    fn get_json<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        self.get(collection, key)?
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .transpose()
    }

    fn put_json<T: Serialize + ?Sized>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
        self.put(collection, key, &serde_json::to_value(value)?)
    }
}
