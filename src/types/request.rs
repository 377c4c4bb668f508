//! AI request types shared by the scheduler and its callers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::utils::estimate_tokens;

/// Type-safe wrapper for request IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Scheduling class of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Issued in direct response to a user action
    Interactive,
    /// Issued by the precompute pipeline; batchable
    #[default]
    Background,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Interactive => write!(f, "interactive"),
            Priority::Background => write!(f, "background"),
        }
    }
}

/// Speaker of a content part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One part of a structured payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPart {
    pub role: Role,
    pub text: String,
}

impl ContentPart {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }
}

/// Request content: a plain prompt or structured multi-part messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Payload {
    /// Total characters of content
    pub fn content_len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Parts(parts) => parts.iter().map(|p| p.text.len()).sum(),
        }
    }

    /// Payload as role-tagged messages
    pub fn to_parts(&self) -> Vec<ContentPart> {
        match self {
            Payload::Text(text) => vec![ContentPart::user(text.clone())],
            Payload::Parts(parts) => parts.clone(),
        }
    }

    /// Estimated token cost (content length / 4)
    pub fn token_estimate(&self) -> u64 {
        match self {
            Payload::Text(text) => estimate_tokens(text) as u64,
            Payload::Parts(parts) => parts.iter().map(|p| estimate_tokens(&p.text) as u64).sum(),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

/// A request for one completion. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiRequest {
    pub id: RequestId,
    pub model: String,
    pub payload: Payload,
    pub priority: Priority,
    pub streaming_allowed: bool,
    /// Skip the cache lookup; the fresh answer is still cached
    #[serde(default)]
    pub bypass_cache: bool,
    /// Keep out of combined calls
    #[serde(default)]
    pub no_batch: bool,
}

impl AiRequest {
    pub fn new(model: impl Into<String>, payload: impl Into<Payload>, priority: Priority) -> Self {
        Self {
            id: RequestId::generate(),
            model: model.into(),
            payload: payload.into(),
            priority,
            streaming_allowed: false,
            bypass_cache: false,
            no_batch: false,
        }
    }

    pub fn interactive(model: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self::new(model, payload, Priority::Interactive)
    }

    pub fn background(model: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self::new(model, payload, Priority::Background)
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_streaming(mut self, allowed: bool) -> Self {
        self.streaming_allowed = allowed;
        self
    }

    pub fn with_cache_bypass(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn without_batching(mut self) -> Self {
        self.no_batch = true;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.priority == Priority::Interactive
    }

    /// Eligible for folding into a combined call
    pub fn is_batchable(&self) -> bool {
        self.priority == Priority::Background && !self.streaming_allowed && !self.no_batch
    }

    pub fn token_estimate(&self) -> u64 {
        self.payload.token_estimate()
    }

    /// Cache key derived from model and content only (the ID is excluded)
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update([0u8]);
        match &self.payload {
            Payload::Text(text) => {
                hasher.update(b"text");
                hasher.update([0u8]);
                hasher.update(text.as_bytes());
            }
            Payload::Parts(parts) => {
                hasher.update(b"parts");
                for part in parts {
                    hasher.update([0u8]);
                    hasher.update(format!("{:?}", part.role).as_bytes());
                    hasher.update([0u8]);
                    hasher.update(part.text.as_bytes());
                }
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Successful completion result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiResponse {
    pub text: String,
    /// Served from the response cache without a network call
    pub from_cache: bool,
}

impl AiResponse {
    pub fn fresh(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            from_cache: false,
        }
    }

    pub fn cached(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            from_cache: true,
        }
    }
}
