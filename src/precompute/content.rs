//! Content preparation: the text a thread contributes to a prompt.

use tracing::{debug, warn};

use crate::mail::{MailApi, MessageBody};
use crate::storage::ThreadRepository;
use crate::types::{ThreadRecord, content_fingerprint, html_to_text, truncate_to_token_limit};

/// Prompt-ready view of a thread's latest message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadContent {
    pub thread_id: String,
    pub subject: String,
    pub from: String,
    pub body: String,
    pub attachments: Vec<String>,
    /// Change-detection hash of everything above
    pub fingerprint: String,
}

impl ThreadContent {
    pub fn render(&self) -> String {
        let mut out = format!("From: {}\nSubject: {}\n", self.from, self.subject);
        if !self.attachments.is_empty() {
            out.push_str(&format!("Attachments: {}\n", self.attachments.join(", ")));
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }
}

/// Plain text of a body, falling back to stripped HTML
pub fn body_text(body: &MessageBody) -> Option<String> {
    if let Some(text) = body.body_text.as_deref().filter(|t| !t.trim().is_empty()) {
        return Some(text.trim().to_string());
    }
    body.body_html
        .as_deref()
        .map(html_to_text)
        .filter(|t| !t.is_empty())
}

/// Latest message body, from the local cache when present, otherwise fetched
/// and cached. Failures fall back to `None`.
pub async fn load_body(
    repo: &ThreadRepository,
    mail: &dyn MailApi,
    message_id: &str,
) -> Option<MessageBody> {
    match repo.cached_body(message_id) {
        Ok(Some(body)) => return Some(body),
        Ok(None) => {}
        Err(e) => warn!(message_id, "Failed to read cached body: {}", e),
    }

    match mail.get_message_full(message_id).await {
        Ok(body) => {
            debug!(message_id, "Fetched message body");
            if let Err(e) = repo.cache_body(&body) {
                warn!(message_id, "Failed to cache body: {}", e);
            }
            Some(body)
        }
        Err(e) => {
            warn!(message_id, "Failed to fetch message body: {}", e);
            None
        }
    }
}

pub async fn prepare(
    repo: &ThreadRepository,
    mail: &dyn MailApi,
    record: &ThreadRecord,
    max_body_tokens: usize,
) -> ThreadContent {
    let body = match record.latest_message_id.as_deref() {
        Some(message_id) => load_body(repo, mail, message_id).await,
        None => None,
    };

    let text = body
        .as_ref()
        .and_then(body_text)
        .or_else(|| record.snippet.clone())
        .unwrap_or_default();
    let attachments = body
        .map(|b| b.attachments.into_iter().map(|a| a.filename).collect())
        .unwrap_or_default();

    let mut content = ThreadContent {
        thread_id: record.id.clone(),
        subject: record.subject.clone().unwrap_or_default(),
        from: record.from.clone().unwrap_or_default(),
        body: truncate_to_token_limit(&text, max_body_tokens),
        attachments,
        fingerprint: String::new(),
    };
    content.fingerprint = content_fingerprint(&content.render());
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{Attachment, InboxPage, MailLabel, MessageMetadata};
    use crate::storage::MemoryStore;
    use crate::types::{PilotError, Result};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BodyOnly {
        fetches: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MailApi for BodyOnly {
        async fn list_inbox_ids(&self, _page_token: Option<&str>) -> Result<InboxPage> {
            Ok(InboxPage::default())
        }

        async fn get_message_metadata(&self, thread_id: &str) -> Result<MessageMetadata> {
            Err(PilotError::NotFound(thread_id.to_string()))
        }

        async fn get_message_full(&self, message_id: &str) -> Result<MessageBody> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PilotError::Mail("offline".into()));
            }
            Ok(MessageBody {
                message_id: message_id.to_string(),
                body_text: None,
                body_html: Some("<p>Hello <b>there</b></p>".to_string()),
                attachments: vec![Attachment {
                    filename: "invoice.pdf".into(),
                    mime_type: "application/pdf".into(),
                    size: 10,
                }],
            })
        }

        async fn apply_labels(&self, _t: &str, _a: &[String], _r: &[String]) -> Result<()> {
            Ok(())
        }

        async fn list_labels(&self) -> Result<Vec<MailLabel>> {
            Ok(Vec::new())
        }

        async fn create_label(&self, name: &str) -> Result<MailLabel> {
            Ok(MailLabel {
                id: name.into(),
                name: name.into(),
            })
        }
    }

    fn record() -> ThreadRecord {
        let mut record = ThreadRecord::new("t1");
        record.latest_message_id = Some("m1".into());
        record.subject = Some("Invoice".into());
        record.from = Some("billing@example.com".into());
        record.snippet = Some("snippet text".into());
        record
    }

    #[tokio::test]
    async fn test_prepare_fetches_once_then_uses_cache() {
        let repo = ThreadRepository::new(Arc::new(MemoryStore::new()));
        let mail = BodyOnly {
            fetches: AtomicUsize::new(0),
            fail: false,
        };

        let first = prepare(&repo, &mail, &record(), 100).await;
        let second = prepare(&repo, &mail, &record(), 100).await;

        assert_eq!(first.body, "Hello there");
        assert_eq!(first.attachments, vec!["invoice.pdf"]);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(mail.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prepare_falls_back_to_snippet() {
        let repo = ThreadRepository::new(Arc::new(MemoryStore::new()));
        let mail = BodyOnly {
            fetches: AtomicUsize::new(0),
            fail: true,
        };
        let content = prepare(&repo, &mail, &record(), 100).await;
        assert_eq!(content.body, "snippet text");
        assert!(content.render().starts_with("From: billing@example.com\nSubject: Invoice\n"));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = ThreadContent {
            thread_id: "t".into(),
            subject: "s".into(),
            from: "f".into(),
            body: "one".into(),
            attachments: vec![],
            fingerprint: String::new(),
        };
        let b = ThreadContent {
            body: "two".into(),
            ..a.clone()
        };
        assert_ne!(content_fingerprint(&a.render()), content_fingerprint(&b.render()));
    }
}
