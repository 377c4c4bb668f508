pub mod config;
pub mod logs;
pub mod precompute;
pub mod status;
