//! CLI Common Utilities
//!
//! Shared initialization and context management for CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use crate::ai::provider::{QuotaGuard, create_provider};
use crate::ai::scheduler::{ResponseCache, Scheduler};
use crate::config::{Config, ConfigLoader};
use crate::mail::{GmailApi, SharedMailApi};
use crate::precompute::{Orchestrator, RunLog};
use crate::storage::{Database, SharedDatabase, SharedStore, ThreadRepository};
use crate::types::Result;

/// Command execution context
///
/// Loaded configuration plus the opened local database. Network-facing
/// pieces (provider, mail API) are only built by the commands that need them.
#[derive(Clone)]
pub struct CommandContext {
    pub config: Config,
    pub db: SharedDatabase,
    pub db_path: PathBuf,
}

impl CommandContext {
    pub fn load() -> Result<Self> {
        let config = ConfigLoader::load()?;
        let db_path = ConfigLoader::database_path(&config)?;
        let db = Database::open(&db_path)?;

        Ok(Self {
            config,
            db: Arc::new(db),
            db_path,
        })
    }

    pub fn store(&self) -> SharedStore {
        self.db.clone()
    }

    pub fn threads(&self) -> ThreadRepository {
        ThreadRepository::new(self.store())
    }

    pub fn run_log(&self) -> RunLog {
        RunLog::default().with_store(self.store())
    }

    /// Scheduler with persisted cache and quota state. Needs a Tokio runtime.
    pub fn scheduler(&self) -> Result<Scheduler> {
        let provider = create_provider(&self.config.provider)?;
        let quota = QuotaGuard::new(self.config.quota.to_guard_config()).with_store(self.store());
        let cache = ResponseCache::new(self.config.cache.to_cache_config()).with_store(self.store());

        Ok(Scheduler::new(
            provider,
            Arc::new(quota),
            cache,
            self.config.scheduler.to_scheduler_config(),
        ))
    }

    pub fn mail(&self) -> Result<SharedMailApi> {
        Ok(Arc::new(GmailApi::new(self.config.mail.clone())?))
    }

    pub fn orchestrator(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::new(
            self.scheduler()?,
            self.threads(),
            self.mail()?,
            self.config.precompute.clone(),
            self.config.moderation.rules.clone(),
        )
        .with_run_log(self.run_log()))
    }
}
