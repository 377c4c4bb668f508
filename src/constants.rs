//! Global Constants
//!
//! Centralized defaults for scheduling, retry, caching and precompute tuning.
//! All magic numbers should be defined here with documentation.

/// Request scheduler constants
pub mod scheduler {
    /// Maximum requests in flight at once (global)
    pub const MAX_CONCURRENT: usize = 3;

    /// Maximum interactive requests in flight at once
    pub const MAX_CONCURRENT_INTERACTIVE: usize = 2;

    /// Upper bound on the summed token estimate of in-flight requests
    pub const MAX_OUTSTANDING_TOKENS: u64 = 100_000;

    /// Maximum requests folded into one combined call
    pub const MAX_BATCH_SIZE: usize = 16;

    /// Delay before a deferred (over-budget) item is reconsidered (milliseconds)
    pub const DEFER_DELAY_MS: u64 = 250;

    /// Characters per estimated token
    pub const CHARS_PER_TOKEN: usize = 4;
}

/// Retry policy constants
pub mod retry {
    /// Maximum retries after the first attempt
    pub const MAX_RETRIES: u32 = 5;

    /// Base delay for exponential backoff (milliseconds)
    pub const BASE_BACKOFF_MS: u64 = 500;

    /// Maximum backoff delay (milliseconds)
    pub const MAX_BACKOFF_MS: u64 = 30_000;

    /// Extra jitter added on top of a server retry-after hint (milliseconds)
    pub const RETRY_AFTER_JITTER_MS: u64 = 250;
}

/// Quota guard constants
pub mod quota {
    /// Cooldown applied after the first rate-limit signal (milliseconds)
    pub const BASE_COOLDOWN_MS: u64 = 1_000;

    /// Cooldown ceiling (milliseconds)
    pub const MAX_COOLDOWN_MS: u64 = 60_000;
}

/// Response cache constants
pub mod cache {
    /// Cache entry lifetime (seconds)
    pub const TTL_SECS: u64 = 24 * 60 * 60;

    /// Upper bound on in-memory entries
    pub const MAX_ENTRIES: usize = 1_000;

    /// Maximum entries written on a persistence flush
    pub const MAX_PERSISTED_ENTRIES: usize = 100;

    /// Minimum time between persistence flushes (milliseconds)
    pub const FLUSH_DEBOUNCE_MS: u64 = 1_000;
}

/// Precompute orchestrator constants
pub mod precompute {
    /// Items per combined summary/subject prompt
    pub const CHUNK_SIZE: usize = 8;

    /// Concurrent individual fallback or moderation calls per dispatch
    pub const PER_CALL_CONCURRENCY: usize = 2;

    /// Default items processed per tick
    pub const TICK_LIMIT: usize = 25;

    /// Maximum estimated tokens of message body sent per item
    pub const MAX_BODY_TOKENS: usize = 1_500;

    /// Retained run log entries
    pub const MAX_RUN_LOGS: usize = 50;

    /// A pending marker older than this is treated as abandoned (seconds)
    pub const STALE_PENDING_SECS: i64 = 15 * 60;

    /// Subject prompt version; bump to force subject regeneration
    pub const SUBJECT_VERSION: u32 = 1;

    /// Inbox listing pages read per sync
    pub const MAX_SYNC_PAGES: usize = 20;

    /// Concurrent metadata/body fetches
    pub const FETCH_CONCURRENCY: usize = 4;

    /// Upper bound on ticks in one `precompute_now` call
    pub const MAX_TICKS_PER_RUN: usize = 100;
}

/// Mail label constants
pub mod labels {
    /// Label marking a thread as visible in the inbox view
    pub const INBOX: &str = "INBOX";

    /// Labels that exclude a thread from processing
    pub const EXCLUDED: &[&str] = &["TRASH", "SPAM"];
}

/// Local store collection names
pub mod collections {
    pub const THREADS: &str = "threads";
    pub const MESSAGE_BODIES: &str = "message_bodies";
    pub const AI_STATE: &str = "ai_state";
    pub const RUN_LOGS: &str = "run_logs";

    /// Key of the persisted response cache snapshot in `AI_STATE`
    pub const RESPONSE_CACHE_KEY: &str = "response_cache";

    /// Key of the persisted quota state snapshot in `AI_STATE`
    pub const QUOTA_STATE_KEY: &str = "quota_state";
}

/// HTTP/Network constants
pub mod network {
    /// Connection timeout (seconds)
    pub const CONNECTION_TIMEOUT_SECS: u64 = 30;
}
