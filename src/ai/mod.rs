//! AI Integration Layer
//!
//! Completion providers, the per-provider quota guard and the request
//! scheduler that every AI call goes through.

pub mod json_repair;
pub mod provider;
pub mod scheduler;

pub use provider::{
    CompletionProvider, CompletionResult, OllamaProvider, OpenAiProvider, ProviderConfig,
    QuotaGuard, QuotaGuardConfig, QuotaSnapshot, QuotaState, SharedProvider, create_provider,
};
pub use scheduler::{
    CacheConfig, PendingResponse, ResponseCache, RetryPolicy, Scheduler, SchedulerConfig,
    SchedulerEvent, SchedulerStats,
};
