//! Configuration Management
//!
//! Unified configuration system with hierarchical resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/inboxpilot/config.toml)
//! 3. Project config (.inboxpilot/config.toml)
//! 4. Environment variables (INBOXPILOT_*)
//! 5. CLI arguments (highest priority)

mod loader;
mod types;

pub use loader::ConfigLoader;
pub use types::*;
