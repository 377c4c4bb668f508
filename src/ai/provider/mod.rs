//! Completion Provider Abstraction
//!
//! Defines the `CompletionProvider` trait: one text-completion call for one
//! payload. Providers classify failures into the generic taxonomy and never
//! retry; retry policy lives in the scheduler.
//!
//! ## Modules
//!
//! - `openai`: OpenAI-compatible Chat Completions endpoint
//! - `ollama`: locally-running Ollama models
//! - `quota_guard`: per-provider rate-limit cooldown

mod ollama;
mod openai;
mod quota_guard;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use quota_guard::{QuotaGuard, QuotaGuardConfig, QuotaSnapshot, QuotaState};

// Re-export error types from centralized location
pub use crate::types::{ErrorCategory, ErrorClassifier, ProviderError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::network;
use crate::types::{Payload, PilotError, Result};

/// Outcome of a single provider call
pub type CompletionResult = std::result::Result<String, ProviderError>;

/// Shared provider type for concurrent access from the scheduler.
pub type SharedProvider = Arc<dyn CompletionProvider>;

// =============================================================================
// Provider Configuration
// =============================================================================

/// Configuration for completion providers
///
/// API keys are never serialized and are redacted in debug output. Each
/// provider converts the key to `SecretString` internally.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider type: "openai", "ollama"
    pub kind: String,
    /// Default model name (provider-specific)
    pub model: Option<String>,
    /// Optional whole-request timeout in seconds (none by default)
    pub timeout_secs: Option<u64>,
    /// Sampling temperature
    pub temperature: f32,
    /// API key; never serialized to output
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,
    /// Maximum tokens to generate
    pub max_tokens: usize,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_base", &self.api_base)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "openai".to_string(),
            model: None,
            timeout_secs: None,
            temperature: 0.2,
            api_key: None,
            api_base: None,
            max_tokens: 1024,
        }
    }
}

impl ProviderConfig {
    /// HTTP client with connect timeout and optional request timeout
    pub(crate) fn http_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(network::CONNECTION_TIMEOUT_SECS));
        if let Some(secs) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder
            .build()
            .map_err(|e| PilotError::Config(format!("Failed to create HTTP client: {}", e)))
    }
}

// =============================================================================
// Completion Provider Trait
// =============================================================================

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Issue one completion call. Never retries internally.
    async fn complete(&self, payload: &Payload, model: &str) -> CompletionResult;

    /// Provider name, also the quota guard key
    fn name(&self) -> &str;

    /// Model used when a request does not name one
    fn default_model(&self) -> &str;

    /// Whether several logical requests may share one combined call
    fn supports_combined(&self) -> bool {
        true
    }

    /// Check if the provider is reachable
    async fn health_check(&self) -> bool;
}

/// Create a shared provider from configuration
pub fn create_provider(config: &ProviderConfig) -> Result<SharedProvider> {
    match config.kind.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config.clone())?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config.clone())?)),
        _ => Err(PilotError::Config(format!(
            "Unknown provider: {}. Supported: openai, ollama",
            config.kind
        ))),
    }
}
