//! Mail provider collaborator
//!
//! The precompute pipeline only needs listing, metadata, bodies and label
//! mutation. Inbox entries are thread IDs; metadata describes the latest
//! message of that thread.

mod gmail;

pub use gmail::{GmailApi, GmailConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::Result;

/// One page of inbox thread IDs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboxPage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Header-level view of a thread's latest message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub thread_id: String,
    pub message_id: String,
    pub label_ids: Vec<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub snippet: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

/// Full message content; cached in `message_bodies`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub message_id: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl MessageBody {
    pub fn is_empty(&self) -> bool {
        self.body_text.as_deref().is_none_or(|t| t.trim().is_empty())
            && self.body_html.as_deref().is_none_or(|h| h.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailLabel {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait MailApi: Send + Sync {
    /// Thread IDs currently in the inbox view
    async fn list_inbox_ids(&self, page_token: Option<&str>) -> Result<InboxPage>;

    /// Metadata of the latest message of a thread
    async fn get_message_metadata(&self, thread_id: &str) -> Result<MessageMetadata>;

    async fn get_message_full(&self, message_id: &str) -> Result<MessageBody>;

    async fn apply_labels(&self, thread_id: &str, add: &[String], remove: &[String]) -> Result<()>;

    async fn list_labels(&self) -> Result<Vec<MailLabel>>;

    async fn create_label(&self, name: &str) -> Result<MailLabel>;
}

pub type SharedMailApi = Arc<dyn MailApi>;
