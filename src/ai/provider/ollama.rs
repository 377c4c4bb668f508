//! Ollama Local LLM Provider
//!
//! Completion provider for locally-running Ollama models via `/api/chat`.
//! Small local models are unreliable at keyed multi-item output, so combined
//! calls are disabled and the scheduler issues individual calls instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{CompletionProvider, CompletionResult, ProviderConfig};
use crate::types::{
    ContentPart, ErrorCategory, ErrorClassifier, Payload, PilotError, ProviderError, Result, Role,
};

const PROVIDER_NAME: &str = "ollama";
const DEFAULT_API_BASE: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3:latest";

/// Ollama Local LLM Provider
pub struct OllamaProvider {
    api_base: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = config.http_client()?;
        let api_base = config
            .api_base
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let api_base = Self::validate_endpoint(&api_base)?;

        Ok(Self {
            api_base,
            model: config.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: config.temperature,
            client,
        })
    }

    /// Only http/https; warns for non-localhost endpoints
    fn validate_endpoint(endpoint: &str) -> Result<String> {
        let url = url::Url::parse(endpoint).map_err(|e| {
            PilotError::Config(format!("Invalid Ollama endpoint URL '{}': {}", endpoint, e))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(PilotError::Config(format!(
                "Ollama endpoint must use http or https scheme, got: {}",
                url.scheme()
            )));
        }

        if let Some(host) = url.host_str()
            && !matches!(host, "localhost" | "127.0.0.1" | "::1")
        {
            warn!(
                "Ollama endpoint is not localhost: {}. Mail content will leave this machine.",
                host
            );
        }

        Ok(url.to_string().trim_end_matches('/').to_string())
    }

    fn build_request(&self, payload: &Payload, model: &str) -> OllamaChatRequest {
        OllamaChatRequest {
            model: model.to_string(),
            messages: payload.to_parts().into_iter().map(OllamaMessage::from).collect(),
            stream: false,
            options: Some(OllamaOptions {
                temperature: self.temperature,
            }),
        }
    }
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    async fn complete(&self, payload: &Payload, model: &str) -> CompletionResult {
        let model = if model.is_empty() { self.model.as_str() } else { model };
        debug!(model, chars = payload.content_len(), "Sending request to Ollama API");

        let url = format!("{}/api/chat", self.api_base);
        let response = self
            .client
            .post(&url)
            .json(&self.build_request(payload, model))
            .send()
            .await
            .map_err(|e| {
                let err = ErrorClassifier::classify_transport(&e, PROVIDER_NAME);
                if e.is_connect() {
                    err.message(format!("cannot reach Ollama at {}", self.api_base))
                } else {
                    err
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ErrorClassifier::classify_http_status(
                status.as_u16(),
                &body,
                PROVIDER_NAME,
                None,
            ));
        }

        let body: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| ErrorClassifier::classify_transport(&e, PROVIDER_NAME))?;

        debug!(
            prompt_tokens = body.prompt_eval_count.unwrap_or(0),
            completion_tokens = body.eval_count.unwrap_or(0),
            "Ollama usage"
        );

        body.message
            .map(|m| m.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ProviderError::new(ErrorCategory::TransientServer, "No content in Ollama response")
                    .provider(PROVIDER_NAME)
            })
    }

    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn supports_combined(&self) -> bool {
        false
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.api_base);

        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let Ok(tags) = resp.json::<OllamaTagsResponse>().await else {
                    info!("Ollama is available");
                    return true;
                };
                let base = self.model.trim_end_matches(":latest");
                let available = tags
                    .models
                    .iter()
                    .any(|m| m.name == self.model || m.name.starts_with(base));
                if available {
                    info!("Ollama is available with model: {}", self.model);
                } else {
                    warn!(
                        "Ollama is running but model '{}' not found. Pull with: ollama pull {}",
                        self.model, self.model
                    );
                }
                available
            }
            Ok(resp) => {
                warn!("Ollama API check failed: {}", resp.status());
                false
            }
            Err(e) => {
                warn!("Ollama not available: {}. Start with: ollama serve", e);
                false
            }
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

impl From<ContentPart> for OllamaMessage {
    fn from(part: ContentPart) -> Self {
        let role = match part.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        Self {
            role: role.to_string(),
            content: part.text,
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}
