//! Shared fakes for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use inboxpilot::ai::provider::{CompletionProvider, CompletionResult};
use inboxpilot::mail::{InboxPage, MailApi, MailLabel, MessageBody, MessageMetadata};
use inboxpilot::types::{Payload, PilotError, Result, ThreadRecord};

type Responder = Box<dyn Fn(&Payload) -> CompletionResult + Send + Sync>;

/// Provider that records every call and answers through a closure
pub struct FakeProvider {
    respond: Responder,
    delay: Duration,
    combined: bool,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    in_flight_interactive: AtomicUsize,
    pub peak: AtomicUsize,
    pub peak_interactive: AtomicUsize,
    pub payloads: Mutex<Vec<Payload>>,
}

impl FakeProvider {
    pub fn new(respond: impl Fn(&Payload) -> CompletionResult + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            delay: Duration::from_millis(5),
            combined: false,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            in_flight_interactive: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            peak_interactive: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_combined(mut self) -> Self {
        self.combined = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payload_text(&self, index: usize) -> String {
        self.payloads.lock().unwrap()[index]
            .to_parts()
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn is_interactive(payload: &Payload) -> bool {
    payload
        .to_parts()
        .iter()
        .any(|p| p.text.starts_with("interactive"))
}

#[async_trait]
impl CompletionProvider for FakeProvider {
    async fn complete(&self, payload: &Payload, _model: &str) -> CompletionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.clone());

        let interactive = is_interactive(payload);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if interactive {
            let now = self.in_flight_interactive.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_interactive.fetch_max(now, Ordering::SeqCst);
        }

        tokio::time::sleep(self.delay).await;
        let result = (self.respond)(payload);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if interactive {
            self.in_flight_interactive.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    fn name(&self) -> &str {
        "fake"
    }

    fn default_model(&self) -> &str {
        "fake-model"
    }

    fn supports_combined(&self) -> bool {
        self.combined
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// In-memory mailbox
#[derive(Default)]
pub struct FakeMail {
    pub inbox: Mutex<Vec<String>>,
    pub metadata: Mutex<HashMap<String, MessageMetadata>>,
    pub applied: Mutex<Vec<(String, Vec<String>)>>,
    pub fail_apply: AtomicBool,
}

#[async_trait]
impl MailApi for FakeMail {
    async fn list_inbox_ids(&self, _page_token: Option<&str>) -> Result<InboxPage> {
        Ok(InboxPage {
            ids: self.inbox.lock().unwrap().clone(),
            next_page_token: None,
        })
    }

    async fn get_message_metadata(&self, thread_id: &str) -> Result<MessageMetadata> {
        self.metadata
            .lock()
            .unwrap()
            .get(thread_id)
            .cloned()
            .ok_or_else(|| PilotError::NotFound(thread_id.to_string()))
    }

    async fn get_message_full(&self, message_id: &str) -> Result<MessageBody> {
        Ok(MessageBody {
            message_id: message_id.to_string(),
            body_text: Some(format!("Body of {}", message_id)),
            ..Default::default()
        })
    }

    async fn apply_labels(&self, thread_id: &str, add: &[String], _remove: &[String]) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(PilotError::Mail("label service unavailable".into()));
        }
        self.applied
            .lock()
            .unwrap()
            .push((thread_id.to_string(), add.to_vec()));
        Ok(())
    }

    async fn list_labels(&self) -> Result<Vec<MailLabel>> {
        Ok(vec![MailLabel {
            id: "Label_promo".into(),
            name: "AI/Promo".into(),
        }])
    }

    async fn create_label(&self, name: &str) -> Result<MailLabel> {
        Ok(MailLabel {
            id: format!("Label_{}", name),
            name: name.to_string(),
        })
    }
}

/// Inbox thread with metadata, no AI fields
pub fn inbox_thread(id: &str, subject: &str) -> ThreadRecord {
    let mut record = ThreadRecord::new(id).with_labels(["INBOX", "UNREAD"]);
    record.latest_message_id = Some(format!("m-{}", id));
    record.subject = Some(subject.to_string());
    record.from = Some("sender@example.com".to_string());
    record.received_at = Some(chrono::Utc::now());
    record
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
