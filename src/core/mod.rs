//! Core - configuration shared by the CLI and the control loop

pub mod config;

pub use config::{ConfigError, ConfigManager, ModelProvider, PvtConfig};
