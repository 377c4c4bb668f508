pub mod error;
pub mod request;
pub mod thread;
pub mod utils;

pub use error::{
    ErrorCategory, ErrorClassifier, PilotError, ProviderError, Result, ResultExt,
};
pub use request::{AiRequest, AiResponse, ContentPart, Payload, Priority, RequestId, Role};
pub use thread::{
    AiFieldStatus, ModerationAction, ModerationEntry, ModerationStatus, ThreadRecord,
};
pub use utils::{
    content_fingerprint, enum_to_str, estimate_tokens, html_to_text, log_filter_error,
    log_filter_warn, truncate_to_token_limit,
};

// =============================================================================
// Domain Newtypes
// =============================================================================

use std::fmt;

/// Type-safe wrapper for precompute run IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Time-ordered ID so lexical order of stored run logs follows run order
    pub fn generate() -> Self {
        let now = chrono::Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}",
            now.format("%Y%m%dT%H%M%S%3f"),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Type-safe wrapper for token counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenCount(u64);

impl TokenCount {
    pub const ZERO: Self = Self(0);

    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Whether adding `cost` keeps the total within `budget`
    pub fn fits(self, cost: Self, budget: Self) -> bool {
        self.0.checked_add(cost.0).is_some_and(|total| total <= budget.0)
    }

    /// Utilization as a fraction of a budget (0.0 - 1.0)
    pub fn utilization(self, budget: Self) -> f64 {
        if budget.0 == 0 {
            0.0
        } else {
            self.0 as f64 / budget.0 as f64
        }
    }
}

impl fmt::Display for TokenCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TokenCount {
    fn from(count: u64) -> Self {
        Self(count)
    }
}

#[cfg(test)]
mod newtype_tests {
    use super::*;

    #[test]
    fn test_token_count_fits() {
        let used = TokenCount::new(60_000);
        let budget = TokenCount::new(100_000);

        assert!(used.fits(TokenCount::new(40_000), budget));
        assert!(!used.fits(TokenCount::new(40_001), budget));
        assert!(!TokenCount::ZERO.fits(TokenCount::new(150_000), budget));
        assert!(!TokenCount::new(u64::MAX).fits(TokenCount::new(1), TokenCount::new(u64::MAX)));
    }

    #[test]
    fn test_token_count_saturating() {
        let a = TokenCount::new(100);
        assert_eq!(a.saturating_sub(TokenCount::new(200)), TokenCount::ZERO);
        assert_eq!(a.saturating_add(TokenCount::new(50)).get(), 150);
        assert!((a.utilization(TokenCount::new(400)) - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_run_ids_sort_by_time() {
        let first = RunId::generate();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = RunId::generate();
        assert!(first.as_str() < second.as_str());
    }
}
