//! Configuration Loader (Figment-based)
//!
//! Loads and merges configuration from multiple sources using Figment:
//! 1. Built-in defaults (Serialized)
//! 2. Global config (~/.config/inboxpilot/config.toml)
//! 3. Project config (.inboxpilot/config.toml)
//! 4. Environment variables (INBOXPILOT_* prefix, nested keys split on `__`)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::types::{PilotError, Result};

const APP_NAME: &str = "inboxpilot";
const PROJECT_DIR: &str = ".inboxpilot";

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with full resolution chain using Figment:
    /// defaults → global → project → env vars
    pub fn load() -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            debug!("Loading global config from: {}", global_path.display());
            figment = figment.merge(Toml::file(&global_path));
        }

        let project_path = Self::project_config_path();
        if project_path.exists() {
            debug!("Loading project config from: {}", project_path.display());
            figment = figment.merge(Toml::file(&project_path));
        }

        // INBOXPILOT_SCHEDULER__MAX_CONCURRENT -> scheduler.max_concurrent
        figment = figment.merge(Env::prefixed("INBOXPILOT_").split("__").lowercase(true));

        let config: Config = figment
            .extract()
            .map_err(|e| PilotError::Config(format!("Configuration error: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file only
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| PilotError::Config(format!("Configuration error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    // =========================================================================
    // Path Management
    // =========================================================================

    fn dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("", "", APP_NAME)
    }

    /// Global config directory (~/.config/inboxpilot/ on Linux)
    pub fn global_dir() -> Option<PathBuf> {
        Self::dirs().map(|d| d.config_dir().to_path_buf())
    }

    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join("config.toml"))
    }

    /// Default location of the local database
    pub fn default_database_path() -> Option<PathBuf> {
        Self::dirs().map(|d| d.data_dir().join("inboxpilot.db"))
    }

    pub fn project_config_path() -> PathBuf {
        Self::project_dir().join("config.toml")
    }

    pub fn project_dir() -> PathBuf {
        PathBuf::from(PROJECT_DIR)
    }

    /// Database path from config, falling back to the platform data directory
    pub fn database_path(config: &Config) -> Result<PathBuf> {
        config
            .storage
            .database_path
            .clone()
            .or_else(Self::default_database_path)
            .ok_or_else(|| PilotError::Config("Cannot determine database path".to_string()))
    }

    // =========================================================================
    // Config Commands
    // =========================================================================

    pub fn show_path() {
        println!("Configuration paths:");
        println!();

        if let Some(global) = Self::global_config_path() {
            let exists = if global.exists() { "✓" } else { "✗" };
            println!("  Global:   {} {}", exists, global.display());
        } else {
            println!("  Global:   (not available)");
        }

        let project = Self::project_config_path();
        let exists = if project.exists() { "✓" } else { "✗" };
        println!("  Project:  {} {}", exists, project.display());

        if let Some(db) = Self::default_database_path() {
            let exists = if db.exists() { "✓" } else { "✗" };
            println!("  Database: {} {}", exists, db.display());
        }
    }

    /// Print the effective configuration (secrets are never serialized)
    pub fn show_config(as_json: bool) -> Result<()> {
        let config = Self::load()?;

        if as_json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| PilotError::Config(e.to_string()))?
            );
        }

        Ok(())
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Write a starter config. Global when `global`, else `.inboxpilot/`.
    pub fn init(global: bool, force: bool) -> Result<PathBuf> {
        let dir = if global {
            Self::global_dir().ok_or_else(|| {
                PilotError::Config("Cannot determine global config directory".to_string())
            })?
        } else {
            Self::project_dir()
        };
        fs::create_dir_all(&dir)?;

        let config_path = dir.join("config.toml");
        if !config_path.exists() || force {
            fs::write(&config_path, Self::default_config())?;
            info!("Created config: {}", config_path.display());
        } else {
            info!("Config exists: {}", config_path.display());
        }

        Ok(config_path)
    }

    fn default_config() -> &'static str {
        r#"# InboxPilot Configuration
# Project settings in .inboxpilot/config.toml override ~/.config/inboxpilot/.
# Environment: INBOXPILOT_<SECTION>__<KEY>, e.g. INBOXPILOT_SCHEDULER__MAX_CONCURRENT=4

version = "1.0"

[provider]
kind = "openai"
# model = "gpt-4o-mini"
# api_base = "https://api.openai.com/v1"
# API key: OPENAI_API_KEY

[scheduler]
max_concurrent = 3
max_concurrent_interactive = 2
max_outstanding_tokens = 100000
max_batch_size = 16
max_retries = 5

[precompute]
chunk_size = 8
per_call_concurrency = 2
tick_limit = 25
priority = "summary_first"

# [[moderation.rules]]
# id = "newsletters"
# label = "AI/Newsletter"
# prompt = "Recurring newsletters and marketing digests"
# reevaluate_after_secs = 604800

# Gmail access token: GMAIL_ACCESS_TOKEN
"#
    }
}
