//! Typed access to thread records and cached message bodies.

use std::sync::{Arc, Mutex};

use super::{SharedStore, StoreExt};
use crate::constants::collections;
use crate::mail::MessageBody;
use crate::types::{Result, ThreadRecord, log_filter_warn};

/// Thread dataset on top of a `LocalStore`.
///
/// `update` serializes read-modify-write cycles so concurrent writers in
/// this process never interleave between the read and the write.
#[derive(Clone)]
pub struct ThreadRepository {
    store: SharedStore,
    write_lock: Arc<Mutex<()>>,
}

impl ThreadRepository {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn get(&self, id: &str) -> Result<Option<ThreadRecord>> {
        self.store.get_json(collections::THREADS, id)
    }

    pub fn put(&self, record: &ThreadRecord) -> Result<()> {
        let _guard = self.lock();
        self.store.put_json(collections::THREADS, &record.id, record)
    }

    /// Every record; undecodable documents are logged and skipped
    pub fn all(&self) -> Result<Vec<ThreadRecord>> {
        Ok(self
            .store
            .get_all(collections::THREADS)?
            .into_iter()
            .filter_map(|(key, value)| {
                log_filter_warn(
                    serde_json::from_value::<ThreadRecord>(value),
                    &format!("Skipping unreadable thread record {}", key),
                )
            })
            .collect())
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        self.store.get_all_keys(collections::THREADS)
    }

    /// Re-read, mutate and write back atomically with respect to other
    /// `update`/`put` calls. The closure returns whether to write.
    /// Returns the record as stored afterwards, or `None` if it is missing.
    pub fn update<F>(&self, id: &str, f: F) -> Result<Option<ThreadRecord>>
    where
        F: FnOnce(&mut ThreadRecord) -> bool,
    {
        let _guard = self.lock();
        let Some(mut record) = self.get(id)? else {
            return Ok(None);
        };
        if f(&mut record) {
            self.store.put_json(collections::THREADS, id, &record)?;
        }
        Ok(Some(record))
    }

    /// Insert a record unless one already exists; returns whether it was written
    pub fn insert_if_absent(&self, record: &ThreadRecord) -> Result<bool> {
        let _guard = self.lock();
        if self.get(&record.id)?.is_some() {
            return Ok(false);
        }
        self.store.put_json(collections::THREADS, &record.id, record)?;
        Ok(true)
    }

    // =========================================================================
    // Message bodies
    // =========================================================================

    pub fn cached_body(&self, message_id: &str) -> Result<Option<MessageBody>> {
        self.store.get_json(collections::MESSAGE_BODIES, message_id)
    }

    pub fn cache_body(&self, body: &MessageBody) -> Result<()> {
        self.store
            .put_json(collections::MESSAGE_BODIES, &body.message_id, body)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ThreadRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRepository").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::AiFieldStatus;

    fn repo() -> ThreadRepository {
        ThreadRepository::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_put_get_all() {
        let repo = repo();
        repo.put(&ThreadRecord::new("t2").with_labels(["INBOX"])).unwrap();
        repo.put(&ThreadRecord::new("t1")).unwrap();

        assert!(repo.get("t1").unwrap().is_some());
        assert_eq!(repo.ids().unwrap(), vec!["t1", "t2"]);
        assert_eq!(repo.all().unwrap().len(), 2);
    }

    #[test]
    fn test_update_writes_only_when_asked() {
        let repo = repo();
        repo.put(&ThreadRecord::new("t1")).unwrap();

        let updated = repo
            .update("t1", |r| {
                r.summary_status = AiFieldStatus::Error;
                false
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.summary_status, AiFieldStatus::Error);
        assert_eq!(
            repo.get("t1").unwrap().unwrap().summary_status,
            AiFieldStatus::None
        );

        repo.update("t1", |r| {
            r.summary_status = AiFieldStatus::Ready;
            true
        })
        .unwrap();
        assert_eq!(
            repo.get("t1").unwrap().unwrap().summary_status,
            AiFieldStatus::Ready
        );

        assert!(repo.update("missing", |_| true).unwrap().is_none());
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let repo = repo();
        let mut first = ThreadRecord::new("t1");
        first.summary_text = Some("keep".to_string());
        assert!(repo.insert_if_absent(&first).unwrap());
        assert!(!repo.insert_if_absent(&ThreadRecord::new("t1")).unwrap());
        assert_eq!(
            repo.get("t1").unwrap().unwrap().summary_text.as_deref(),
            Some("keep")
        );
    }

    #[test]
    fn test_corrupt_record_skipped() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_json(collections::THREADS, "bad", &serde_json::json!({"label_set": 5}))
            .unwrap();
        let repo = ThreadRepository::new(store);
        repo.put(&ThreadRecord::new("good")).unwrap();
        assert_eq!(repo.all().unwrap().len(), 1);
    }

    #[test]
    fn test_body_cache() {
        let repo = repo();
        let body = MessageBody {
            message_id: "m1".to_string(),
            body_text: Some("hi".to_string()),
            ..Default::default()
        };
        repo.cache_body(&body).unwrap();
        assert_eq!(repo.cached_body("m1").unwrap(), Some(body));
        assert_eq!(repo.cached_body("m2").unwrap(), None);
    }
}
