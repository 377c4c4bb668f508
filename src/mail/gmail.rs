//! Gmail REST adapter
//!
//! Thin `MailApi` over the Gmail v1 REST API with a caller-supplied bearer
//! token. Token acquisition and refresh happen elsewhere.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Attachment, InboxPage, MailApi, MailLabel, MessageBody, MessageMetadata};
use crate::constants::{labels, network};
use crate::types::{PilotError, Result};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const PAGE_SIZE: u32 = 100;

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    pub api_base: Option<String>,
    /// OAuth access token; never serialized. Falls back to `GMAIL_ACCESS_TOKEN`.
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
}

impl std::fmt::Debug for GmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GmailConfig")
            .field("api_base", &self.api_base)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

pub struct GmailApi {
    api_base: String,
    token: SecretString,
    client: reqwest::Client,
}

impl std::fmt::Debug for GmailApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GmailApi")
            .field("api_base", &self.api_base)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl GmailApi {
    pub fn new(config: GmailConfig) -> Result<Self> {
        let token = config
            .access_token
            .or_else(|| std::env::var("GMAIL_ACCESS_TOKEN").ok())
            .ok_or_else(|| {
                PilotError::Config(
                    "Gmail access token not found. Set GMAIL_ACCESS_TOKEN or mail.access_token"
                        .to_string(),
                )
            })?;

        let api_base = config
            .api_base
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        url::Url::parse(&api_base)
            .map_err(|e| PilotError::Config(format!("Invalid mail api_base '{}': {}", api_base, e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(network::CONNECTION_TIMEOUT_SECS))
            .build()
            .map_err(|e| PilotError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_base,
            token: SecretString::from(token),
            client,
        })
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder, what: &str) -> Result<T> {
        let response = request
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| PilotError::Mail(format!("{} failed: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PilotError::Mail(format!("{} failed ({}): {}", what, status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| PilotError::Mail(format!("{}: invalid response: {}", what, e)))
    }
}

#[async_trait]
impl MailApi for GmailApi {
    async fn list_inbox_ids(&self, page_token: Option<&str>) -> Result<InboxPage> {
        let mut query = vec![
            ("labelIds", labels::INBOX.to_string()),
            ("maxResults", PAGE_SIZE.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let request = self
            .client
            .get(format!("{}/threads", self.api_base))
            .query(&query);
        let list: ThreadList = self.send(request, "list threads").await?;
        debug!(count = list.threads.len(), "Listed inbox threads");

        Ok(InboxPage {
            ids: list.threads.into_iter().map(|t| t.id).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn get_message_metadata(&self, thread_id: &str) -> Result<MessageMetadata> {
        let request = self
            .client
            .get(format!("{}/threads/{}", self.api_base, thread_id))
            .query(&[
                ("format", "metadata"),
                ("metadataHeaders", "Subject"),
                ("metadataHeaders", "From"),
            ]);
        let thread: GmailThread = self.send(request, "get thread").await?;
        let latest = thread
            .messages
            .into_iter()
            .last()
            .ok_or_else(|| PilotError::NotFound(format!("thread {} has no messages", thread_id)))?;

        Ok(latest.into_metadata(thread_id))
    }

    async fn get_message_full(&self, message_id: &str) -> Result<MessageBody> {
        let request = self
            .client
            .get(format!("{}/messages/{}", self.api_base, message_id))
            .query(&[("format", "full")]);
        let message: GmailMessage = self.send(request, "get message").await?;

        let mut body = MessageBody {
            message_id: message_id.to_string(),
            ..Default::default()
        };
        if let Some(payload) = &message.payload {
            collect_parts(payload, &mut body);
        }
        Ok(body)
    }

    async fn apply_labels(&self, thread_id: &str, add: &[String], remove: &[String]) -> Result<()> {
        let request = self
            .client
            .post(format!("{}/threads/{}/modify", self.api_base, thread_id))
            .json(&ModifyRequest {
                add_label_ids: add,
                remove_label_ids: remove,
            });
        let _: serde_json::Value = self.send(request, "modify thread").await?;
        Ok(())
    }

    async fn list_labels(&self) -> Result<Vec<MailLabel>> {
        let request = self.client.get(format!("{}/labels", self.api_base));
        let list: LabelList = self.send(request, "list labels").await?;
        Ok(list.labels)
    }

    async fn create_label(&self, name: &str) -> Result<MailLabel> {
        let request = self
            .client
            .post(format!("{}/labels", self.api_base))
            .json(&serde_json::json!({
                "name": name,
                "labelListVisibility": "labelShow",
                "messageListVisibility": "show",
            }));
        self.send(request, "create label").await
    }
}

/// Walk a MIME tree: first text/plain and text/html bodies win,
/// named parts become attachments
fn collect_parts(part: &GmailPart, body: &mut MessageBody) {
    let filename = part.filename.as_deref().unwrap_or_default();
    if !filename.is_empty() {
        body.attachments.push(Attachment {
            filename: filename.to_string(),
            mime_type: part.mime_type.clone(),
            size: part.body.as_ref().map(|b| b.size).unwrap_or(0),
        });
    } else if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
        let slot = match part.mime_type.as_str() {
            "text/plain" => Some(&mut body.body_text),
            "text/html" => Some(&mut body.body_html),
            _ => None,
        };
        if let Some(slot) = slot
            && slot.is_none()
        {
            *slot = decode_body(data);
        }
    }

    for child in &part.parts {
        collect_parts(child, body);
    }
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('=').as_bytes())
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

// Wire types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadList {
    #[serde(default)]
    threads: Vec<ThreadRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailThread {
    #[serde(default)]
    messages: Vec<GmailMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    snippet: Option<String>,
    internal_date: Option<String>,
    payload: Option<GmailPart>,
}

impl GmailMessage {
    fn header(&self, name: &str) -> Option<String> {
        self.payload
            .as_ref()?
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    }

    fn into_metadata(self, thread_id: &str) -> MessageMetadata {
        let received_at = self
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        MessageMetadata {
            thread_id: thread_id.to_string(),
            subject: self.header("Subject"),
            from: self.header("From"),
            message_id: self.id,
            label_ids: self.label_ids,
            snippet: self.snippet,
            received_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    #[serde(default)]
    mime_type: String,
    filename: Option<String>,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    body: Option<GmailPartBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailPartBody {
    #[serde(default)]
    size: u64,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<MailLabel>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest<'a> {
    add_label_ids: &'a [String],
    remove_label_ids: &'a [String],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(s: &str) -> String {
        URL_SAFE_NO_PAD.encode(s.as_bytes())
    }

    #[test]
    fn test_collect_parts_from_multipart() {
        let json = serde_json::json!({
            "mimeType": "multipart/mixed",
            "parts": [
                {
                    "mimeType": "multipart/alternative",
                    "parts": [
                        {"mimeType": "text/plain", "body": {"size": 5, "data": encode("hello")}},
                        {"mimeType": "text/html", "body": {"size": 12, "data": encode("<p>hello</p>")}}
                    ]
                },
                {"mimeType": "application/pdf", "filename": "invoice.pdf", "body": {"size": 2048, "attachmentId": "a1"}}
            ]
        });
        let part: GmailPart = serde_json::from_value(json).unwrap();
        let mut body = MessageBody::default();
        collect_parts(&part, &mut body);

        assert_eq!(body.body_text.as_deref(), Some("hello"));
        assert_eq!(body.body_html.as_deref(), Some("<p>hello</p>"));
        assert_eq!(body.attachments.len(), 1);
        assert_eq!(body.attachments[0].filename, "invoice.pdf");
        assert_eq!(body.attachments[0].size, 2048);
    }

    #[test]
    fn test_decode_body_accepts_padding() {
        assert_eq!(decode_body("aGk=").as_deref(), Some("hi"));
        assert_eq!(decode_body("aGk").as_deref(), Some("hi"));
        assert_eq!(decode_body("***"), None);
    }

    #[test]
    fn test_metadata_from_latest_message() {
        let json = serde_json::json!({
            "messages": [
                {"id": "m1", "labelIds": ["INBOX"]},
                {
                    "id": "m2",
                    "labelIds": ["INBOX", "UNREAD"],
                    "snippet": "Lunch?",
                    "internalDate": "1700000000000",
                    "payload": {"headers": [
                        {"name": "Subject", "value": "Friday"},
                        {"name": "from", "value": "a@example.com"}
                    ]}
                }
            ]
        });
        let thread: GmailThread = serde_json::from_value(json).unwrap();
        let meta = thread.messages.into_iter().last().unwrap().into_metadata("t1");

        assert_eq!(meta.thread_id, "t1");
        assert_eq!(meta.message_id, "m2");
        assert_eq!(meta.subject.as_deref(), Some("Friday"));
        assert_eq!(meta.from.as_deref(), Some("a@example.com"));
        assert_eq!(meta.label_ids, vec!["INBOX", "UNREAD"]);
        assert_eq!(meta.received_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_config_debug_redacts_token() {
        let config = GmailConfig {
            api_base: None,
            access_token: Some("ya29.secret".to_string()),
        };
        assert!(!format!("{:?}", config).contains("ya29"));
    }
}
