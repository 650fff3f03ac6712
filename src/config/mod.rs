//! Layered configuration
//!
//! Four layers, later ones winning:
//! 1. Built-in defaults
//! 2. Host config (`~/.config/agent-launch/config.toml`)
//! 3. Project config (`.agent-launch.toml`)
//! 4. CLI flags

mod effective;
mod launch;
mod merge;

use std::path::PathBuf;

pub use effective::{ConfigOrigin, ConfigSource, EffectiveConfig};
pub use launch::{
    BuildSection, BundleSection, DeploySection, LaunchConfig, MonitorSection, ProvisionSection,
    RetrySection,
};
pub use merge::{deep_merge, merge_layers};

/// Project config file name, looked up in the working directory
pub const PROJECT_CONFIG_FILE: &str = ".agent-launch.toml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Host config path, honoring `XDG_CONFIG_HOME`
pub fn host_config_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(std::env::var_os("HOME")?).join(".config"),
    };
    Some(base.join("agent-launch").join("config.toml"))
}
