//! Label name → ID resolution, creating missing labels on demand.

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::mail::SharedMailApi;
use crate::types::Result;

pub struct LabelResolver {
    mail: SharedMailApi,
    ids: DashMap<String, String>,
    /// Serializes list/create so two rules never create the same label twice
    refresh: Mutex<()>,
}

impl LabelResolver {
    pub fn new(mail: SharedMailApi) -> Self {
        Self {
            mail,
            ids: DashMap::new(),
            refresh: Mutex::new(()),
        }
    }

    fn cached(&self, name: &str) -> Option<String> {
        self.ids.get(&name.to_lowercase()).map(|id| id.value().clone())
    }

    /// Label ID for `name` (case-insensitive), creating the label if the
    /// mailbox has none by that name.
    pub async fn resolve(&self, name: &str) -> Result<String> {
        if let Some(id) = self.cached(name) {
            return Ok(id);
        }

        let _guard = self.refresh.lock().await;
        if let Some(id) = self.cached(name) {
            return Ok(id);
        }

        for label in self.mail.list_labels().await? {
            self.ids.insert(label.name.to_lowercase(), label.id);
        }
        if let Some(id) = self.cached(name) {
            debug!(label = name, "Resolved label");
            return Ok(id);
        }

        let created = self.mail.create_label(name).await?;
        info!(label = name, id = %created.id, "Created label");
        self.ids.insert(created.name.to_lowercase(), created.id.clone());
        self.ids.insert(name.to_lowercase(), created.id.clone());
        Ok(created.id)
    }
}

impl std::fmt::Debug for LabelResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelResolver")
            .field("cached", &self.ids.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{InboxPage, MailApi, MailLabel, MessageBody, MessageMetadata};
    use crate::types::PilotError;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Labels {
        lists: AtomicUsize,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl MailApi for Labels {
        async fn list_inbox_ids(&self, _page_token: Option<&str>) -> Result<InboxPage> {
            Ok(InboxPage::default())
        }
        async fn get_message_metadata(&self, id: &str) -> Result<MessageMetadata> {
            Err(PilotError::NotFound(id.to_string()))
        }
        async fn get_message_full(&self, id: &str) -> Result<MessageBody> {
            Err(PilotError::NotFound(id.to_string()))
        }
        async fn apply_labels(&self, _: &str, _: &[String], _: &[String]) -> Result<()> {
            Ok(())
        }
        async fn list_labels(&self) -> Result<Vec<MailLabel>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(vec![MailLabel {
                id: "Label_1".into(),
                name: "AI/Promo".into(),
            }])
        }
        async fn create_label(&self, name: &str) -> Result<MailLabel> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(MailLabel {
                id: format!("Label_new_{}", n),
                name: name.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_resolve_existing_then_cached() {
        let mail = Arc::new(Labels::default());
        let resolver = LabelResolver::new(mail.clone());

        assert_eq!(resolver.resolve("ai/promo").await.unwrap(), "Label_1");
        assert_eq!(resolver.resolve("AI/Promo").await.unwrap(), "Label_1");
        assert_eq!(mail.lists.load(Ordering::SeqCst), 1);
        assert_eq!(mail.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_create_missing_once() {
        let mail = Arc::new(Labels::default());
        let resolver = LabelResolver::new(mail.clone());

        let id = resolver.resolve("AI/Newsletter").await.unwrap();
        assert_eq!(id, "Label_new_0");
        assert_eq!(resolver.resolve("AI/Newsletter").await.unwrap(), id);
        assert_eq!(mail.creates.load(Ordering::SeqCst), 1);
    }
}
