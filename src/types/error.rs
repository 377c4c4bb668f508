//! Unified Error Type System
//!
//! Centralized error types for the scheduler, providers, storage and the
//! precompute pipeline. Provider failures carry an `ErrorCategory` so the
//! scheduler can decide between retry, deferral and immediate failure.
//!
//! ## Error Categories
//!
//! - **InvalidCredentials**: fatal, surfaced to the caller
//! - **RateLimited**: retryable, honors retry-after
//! - **TransientServer**: 5xx, retryable with backoff
//! - **MalformedRequest**: fatal, fix the request
//! - **NetworkFailure**: retryable with backoff
//! - **BudgetExceeded**: local, defers admission instead of failing

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Categories
// =============================================================================

/// Provider failure categories driving retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Credentials rejected (401/403)
    InvalidCredentials,
    /// Rate limited (429)
    RateLimited,
    /// Server-side failure (5xx)
    TransientServer,
    /// Request rejected as invalid, or unknown model/endpoint
    MalformedRequest,
    /// Connection, DNS, timeout or body read failure
    NetworkFailure,
    /// Local token budget would be exceeded
    BudgetExceeded,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCredentials => write!(f, "INVALID_CREDENTIALS"),
            Self::RateLimited => write!(f, "RATE_LIMITED"),
            Self::TransientServer => write!(f, "TRANSIENT_SERVER"),
            Self::MalformedRequest => write!(f, "MALFORMED_REQUEST"),
            Self::NetworkFailure => write!(f, "NETWORK_FAILURE"),
            Self::BudgetExceeded => write!(f, "BUDGET_EXCEEDED"),
        }
    }
}

impl ErrorCategory {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::TransientServer | Self::NetworkFailure
        )
    }

    /// Stable, vendor-independent description
    pub fn stable_message(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid credentials",
            Self::RateLimited => "rate limited",
            Self::TransientServer => "provider temporarily unavailable",
            Self::MalformedRequest => "malformed request",
            Self::NetworkFailure => "network failure",
            Self::BudgetExceeded => "token budget exceeded",
        }
    }
}

// =============================================================================
// Provider Error
// =============================================================================

/// Classified failure of a single completion call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Category for retry routing
    pub category: ErrorCategory,
    /// HTTP status, when the endpoint answered
    pub status: Option<u16>,
    /// Server-provided retry hint
    pub retry_after: Option<Duration>,
    /// Stable message for callers
    pub message: String,
    /// Raw provider body or transport detail (diagnostics only)
    pub provider_message: String,
    /// Provider that produced the error
    pub provider: Option<String>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.provider, self.status) {
            (Some(provider), Some(status)) => write!(
                f,
                "[{}:{}] {} (HTTP {})",
                provider, self.category, self.message, status
            ),
            (Some(provider), None) => {
                write!(f, "[{}:{}] {}", provider, self.category, self.message)
            }
            (None, Some(status)) => {
                write!(f, "[{}] {} (HTTP {})", self.category, self.message, status)
            }
            (None, None) => write!(f, "[{}] {}", self.category, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    pub fn new(category: ErrorCategory, provider_message: impl Into<String>) -> Self {
        Self {
            category,
            status: None,
            retry_after: None,
            message: category.stable_message().to_string(),
            provider_message: provider_message.into(),
            provider: None,
        }
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    /// Override the stable message (e.g. 404 → unknown model)
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.category == ErrorCategory::RateLimited
    }
}

// =============================================================================
// Error Classifier
// =============================================================================

/// Maps transport outcomes to the generic taxonomy
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify a non-success HTTP status
    pub fn classify_http_status(
        status: u16,
        body: &str,
        provider: &str,
        retry_after: Option<Duration>,
    ) -> ProviderError {
        let err = match status {
            401 | 403 => ProviderError::new(ErrorCategory::InvalidCredentials, body),
            404 => ProviderError::new(ErrorCategory::MalformedRequest, body)
                .message("unknown model or endpoint"),
            408 => ProviderError::new(ErrorCategory::NetworkFailure, body),
            429 => ProviderError::new(ErrorCategory::RateLimited, body),
            500..=599 => ProviderError::new(ErrorCategory::TransientServer, body),
            _ => ProviderError::new(ErrorCategory::MalformedRequest, body),
        }
        .provider(provider)
        .status(status);

        match retry_after {
            Some(hint) => err.retry_after(hint),
            None => err,
        }
    }

    /// Classify a transport-level failure from reqwest
    pub fn classify_transport(err: &reqwest::Error, provider: &str) -> ProviderError {
        if let Some(status) = err.status() {
            return Self::classify_http_status(status.as_u16(), &err.to_string(), provider, None);
        }
        if err.is_builder() {
            return ProviderError::new(ErrorCategory::MalformedRequest, err.to_string())
                .provider(provider);
        }
        ProviderError::new(ErrorCategory::NetworkFailure, err.to_string()).provider(provider)
    }

    /// Parse a `Retry-After` header value (delta-seconds or HTTP date)
    pub fn parse_retry_after(value: &str) -> Option<Duration> {
        let value = value.trim();
        if let Ok(secs) = value.parse::<f64>() {
            if secs.is_finite() && secs >= 0.0 {
                return Some(Duration::from_secs_f64(secs));
            }
            return None;
        }
        let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
        let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
        Some(delta.to_std().unwrap_or(Duration::ZERO))
    }
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum PilotError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // AI Errors
    // -------------------------------------------------------------------------
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Budget exceeded: request needs {requested} tokens, {available} of {budget} available")]
    BudgetExceeded {
        requested: u64,
        available: u64,
        budget: u64,
    },

    /// The scheduler dropped the request before completing it
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    // -------------------------------------------------------------------------
    // Domain Errors
    // -------------------------------------------------------------------------
    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Mail API error: {0}")]
    Mail(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<anyhow::Error> for PilotError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return PilotError::Io(std::io::Error::new(io_err.kind(), io_err.to_string()));
        }
        PilotError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;

impl PilotError {
    /// Category of the underlying provider failure, if any
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Provider(e) => Some(e.category),
            Self::BudgetExceeded { .. } => Some(ErrorCategory::BudgetExceeded),
            _ => None,
        }
    }

    /// Whether the scheduler may retry this failure
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Provider(e) if e.is_rate_limited())
    }
}

/// Context extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<C: Into<String>>(self, context: C) -> Result<T>;

    /// Add context using a closure (lazy evaluation)
    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| PilotError::Storage(format!("{}: {}", context.into(), e)))
    }

    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| PilotError::Storage(format!("{}: {}", f().into(), e)))
    }
}

// =============================================================================
// Tests
// =============================================================================
