//! Typed launch configuration
//!
//! The merged configuration layers deserialize into [`LaunchConfig`].
//! Every field has a built-in default, so an empty document is valid.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::build::BuildSpecOptions;
use crate::cloud::{AwsCliConfig, RetryPolicy, DEFAULT_REGION};
use crate::deploy::DeployConfig;
use crate::monitor::MonitorConfig;
use crate::provision::{naming, ProvisionConfig};
use crate::timeout::TimeoutConfig;

/// Complete launch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    /// Agent name; required for `launch`
    pub agent: Option<String>,
    pub region: String,
    /// Source directory holding the Dockerfile
    pub source: PathBuf,
    /// Named credentials profile
    pub profile: Option<String>,
    /// Deploy this image instead of building one
    pub prebuilt_image: Option<String>,
    pub auto_update_on_conflict: bool,
    /// Environment variables of the deployed runtime
    pub env: BTreeMap<String, String>,
    pub bundle: BundleSection,
    pub build: BuildSection,
    pub monitor: MonitorSection,
    pub deploy: DeploySection,
    pub provision: ProvisionSection,
    pub retry: RetrySection,
    pub timeouts: TimeoutConfig,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            agent: None,
            region: DEFAULT_REGION.to_string(),
            source: PathBuf::from("."),
            profile: None,
            prebuilt_image: None,
            auto_update_on_conflict: false,
            env: BTreeMap::new(),
            bundle: BundleSection::default(),
            build: BuildSection::default(),
            monitor: MonitorSection::default(),
            deploy: DeploySection::default(),
            provision: ProvisionSection::default(),
            retry: RetrySection::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// `[bundle]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BundleSection {
    /// Ignore file relative to the source directory
    pub ignore_file: String,
    /// Archive size ceiling in bytes (0 = unlimited)
    pub max_bytes: u64,
    /// Extra exclude globs
    pub exclude: Vec<String>,
}

impl Default for BundleSection {
    fn default() -> Self {
        Self {
            ignore_file: crate::bundle::DEFAULT_IGNORE_FILE.to_string(),
            max_bytes: 500 * 1024 * 1024,
            exclude: Vec::new(),
        }
    }
}

/// `[build]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSection {
    /// Build environment image
    pub image: String,
    pub compute_type: String,
    pub environment_type: String,
    pub project_timeout_minutes: u32,
    pub dockerfile: String,
    pub use_layer_cache: bool,
}

impl Default for BuildSection {
    fn default() -> Self {
        let provision = ProvisionConfig::default();
        let spec = BuildSpecOptions::default();
        Self {
            image: provision.build_image,
            compute_type: provision.compute_type,
            environment_type: provision.environment_type,
            project_timeout_minutes: provision.project_timeout_minutes,
            dockerfile: spec.dockerfile,
            use_layer_cache: spec.use_layer_cache,
        }
    }
}

/// `[monitor]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorSection {
    pub poll_interval_ms: u64,
    pub jitter_ms: u64,
    pub max_consecutive_poll_failures: u32,
    pub log_tail_lines: usize,
    pub excerpt_max_bytes: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            jitter_ms: 1_000,
            max_consecutive_poll_failures: 5,
            log_tail_lines: 50,
            excerpt_max_bytes: 8_192,
        }
    }
}

/// `[deploy]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploySection {
    /// Interval between readiness checks
    pub poll_interval_ms: u64,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

/// `[provision]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionSection {
    pub role_propagation_seconds: u64,
    /// Source archive expiry
    pub lifecycle_days: u32,
}

impl Default for ProvisionSection {
    fn default() -> Self {
        Self {
            role_propagation_seconds: 10,
            lifecycle_days: 7,
        }
    }
}

/// `[retry]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 500,
            max_delay_ms: 20_000,
        }
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl LaunchConfig {
    /// Validate bounds and names
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(agent) = &self.agent {
            naming::validate_agent_name(agent).map_err(|e| ConfigError::Validation(e.to_string()))?;
        }
        if self.region.trim().is_empty() {
            return Err(ConfigError::Validation("region must not be empty".to_string()));
        }
        if let Some(image) = &self.prebuilt_image {
            if image.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "prebuilt_image must not be empty".to_string(),
                ));
            }
        }
        if let Some(bad) = self.env.keys().find(|k| !is_env_name(k)) {
            return Err(ConfigError::Validation(format!(
                "invalid environment variable name: {:?}",
                bad
            )));
        }

        self.timeouts
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        let retry = &self.retry;
        if retry.max_retries > 10 {
            return Err(ConfigError::Validation(
                "retry.max_retries must be at most 10".to_string(),
            ));
        }
        if retry.max_delay_ms > 300_000 || retry.initial_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::Validation(
                "retry delays must satisfy initial_delay_ms <= max_delay_ms <= 300000".to_string(),
            ));
        }

        let monitor = &self.monitor;
        if monitor.poll_interval_ms == 0 || monitor.poll_interval_ms > 300_000 {
            return Err(ConfigError::Validation(
                "monitor.poll_interval_ms must be in (0, 300000]".to_string(),
            ));
        }
        if monitor.jitter_ms > monitor.poll_interval_ms {
            return Err(ConfigError::Validation(
                "monitor.jitter_ms must not exceed monitor.poll_interval_ms".to_string(),
            ));
        }
        if monitor.max_consecutive_poll_failures == 0 {
            return Err(ConfigError::Validation(
                "monitor.max_consecutive_poll_failures must be at least 1".to_string(),
            ));
        }
        if monitor.log_tail_lines == 0 || monitor.excerpt_max_bytes < 256 {
            return Err(ConfigError::Validation(
                "monitor.log_tail_lines must be positive and monitor.excerpt_max_bytes at least 256"
                    .to_string(),
            ));
        }

        if self.deploy.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "deploy.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.provision.lifecycle_days == 0 {
            return Err(ConfigError::Validation(
                "provision.lifecycle_days must be at least 1".to_string(),
            ));
        }
        if self.build.project_timeout_minutes == 0 || self.build.project_timeout_minutes > 480 {
            return Err(ConfigError::Validation(
                "build.project_timeout_minutes must be in (0, 480]".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn provision_config(&self) -> ProvisionConfig {
        ProvisionConfig {
            role_propagation_wait: Duration::from_secs(self.provision.role_propagation_seconds),
            lifecycle_days: self.provision.lifecycle_days,
            retry: self.retry_policy(),
            build_image: self.build.image.clone(),
            compute_type: self.build.compute_type.clone(),
            environment_type: self.build.environment_type.clone(),
            project_timeout_minutes: self.build.project_timeout_minutes,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(self.monitor.poll_interval_ms),
            jitter: Duration::from_millis(self.monitor.jitter_ms),
            max_consecutive_poll_failures: self.monitor.max_consecutive_poll_failures,
            build_timeout: self.timeouts.build_limit(),
            log_tail_lines: self.monitor.log_tail_lines,
            excerpt_max_bytes: self.monitor.excerpt_max_bytes,
            retry: self.retry_policy(),
        }
    }

    pub fn deploy_config(&self) -> DeployConfig {
        DeployConfig {
            ready_timeout: self.timeouts.deploy_ready_limit(),
            poll_interval: Duration::from_millis(self.deploy.poll_interval_ms),
            retry: self.retry_policy(),
        }
    }

    pub fn buildspec_options(&self) -> BuildSpecOptions {
        BuildSpecOptions {
            dockerfile: self.build.dockerfile.clone(),
            use_layer_cache: self.build.use_layer_cache,
        }
    }

    /// Backend settings for the `aws` CLI
    pub fn aws_cli_config(&self) -> AwsCliConfig {
        AwsCliConfig {
            profile: self.profile.clone(),
            region: self.region.clone(),
            connect_timeout_seconds: self.timeouts.connect_seconds,
            read_timeout_seconds: self.timeouts.request_seconds,
            ..AwsCliConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_document_is_defaults() {
        let config: LaunchConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config, LaunchConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config: LaunchConfig = serde_json::from_value(json!({
            "agent": "my_agent",
            "monitor": { "poll_interval_ms": 2000 },
            "timeouts": { "build_seconds": 600 }
        }))
        .unwrap();

        assert_eq!(config.monitor.poll_interval_ms, 2000);
        assert_eq!(config.monitor.jitter_ms, 1000);
        assert_eq!(config.timeouts.build_seconds, 600);
        assert_eq!(config.timeouts.request_seconds, 60);
        assert_eq!(config.monitor_config().build_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: Result<LaunchConfig, _> = serde_json::from_value(json!({ "regoin": "x" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_agent_name() {
        let config = LaunchConfig {
            agent: Some("my-agent".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_env_name() {
        let mut config = LaunchConfig::default();
        config.env.insert("1BAD".to_string(), "x".to_string());
        assert!(config.validate().is_err());

        let mut config = LaunchConfig::default();
        config.env.insert("GOOD_NAME".to_string(), "x".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_bounds() {
        let mut config = LaunchConfig::default();
        config.retry.initial_delay_ms = 30_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_bounds() {
        let mut config = LaunchConfig::default();
        config.timeouts.build_seconds = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("build_seconds"));
    }

    #[test]
    fn test_derived_component_configs() {
        let config = LaunchConfig::default();
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(
            config.provision_config().role_propagation_wait,
            Duration::from_secs(10)
        );
        assert_eq!(config.deploy_config().ready_timeout, Duration::from_secs(600));
        assert_eq!(config.aws_cli_config().read_timeout_seconds, 60);
    }
}
