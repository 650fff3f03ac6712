//! Effective configuration with provenance
//!
//! Records the merged configuration together with the sources that
//! contributed to it. Secret-looking values are redacted in the recorded
//! document; the typed [`LaunchConfig`] keeps the real values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use super::launch::LaunchConfig;
use super::merge::merge_layers;
use super::ConfigError;

/// Schema version for effective_config
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "agent-launch/effective_config@1";

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Project,
    Cli,
}

/// A contributing config source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the raw file bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Merged configuration plus where it came from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,

    /// Merged document, redacted
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,

    /// Redacted key paths
    pub redactions: Vec<String>,

    /// Typed view of the unredacted document
    #[serde(skip)]
    pub launch: LaunchConfig,
}

/// Key fragments whose values are never printed
const SECRET_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "private_key",
    "api_key",
    "credential",
];

impl EffectiveConfig {
    /// Merge builtin defaults, the host file, the project file and CLI overrides
    ///
    /// Missing files are skipped. The result is validated.
    pub fn build(
        host_config_path: Option<&Path>,
        project_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        let mut sources = Vec::new();

        let builtin = serde_json::to_value(LaunchConfig::default())
            .map_err(|e| ConfigError::Parse(format!("builtin defaults: {}", e)))?;
        layers.push(builtin);
        sources.push(ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        });

        for (origin, path) in [
            (ConfigOrigin::Host, host_config_path),
            (ConfigOrigin::Project, project_config_path),
        ] {
            let Some(path) = path.filter(|p| p.exists()) else {
                continue;
            };
            let (value, digest) = Self::load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let mut merged = merge_layers(layers);
        let launch: LaunchConfig = serde_json::from_value(merged.clone())
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        launch.validate()?;

        let redactions = Self::redact_secrets(&mut merged);

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config: merged,
            sources,
            redactions,
            launch,
        })
    }

    /// Load and parse a TOML file, returning the value and digest
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path).map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let digest = hex::encode(Sha256::digest(&bytes));

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::Parse(format!("{}: invalid UTF-8: {}", path.display(), e)))?;
        let toml_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;

        Ok((toml_to_json(toml_value), digest))
    }

    /// Redact secrets in place, returning the redacted paths
    fn redact_secrets(value: &mut Value) -> Vec<String> {
        let mut redactions = Vec::new();
        redact_recursive(value, String::new(), &mut redactions);
        redactions
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Look up a value by dot-separated path
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.config;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }
}

fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

fn redact_recursive(value: &mut Value, path: String, redactions: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let current_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };

                let key_lower = key.to_lowercase();
                let is_secret = SECRET_KEYS.iter().any(|s| key_lower.contains(s));
                if is_secret && !val.is_object() && !val.is_array() {
                    *val = Value::String("[REDACTED]".to_string());
                    redactions.push(current_path);
                } else {
                    redact_recursive(val, current_path, redactions);
                }
            }
        }
        Value::Array(arr) => {
            for (i, val) in arr.iter_mut().enumerate() {
                redact_recursive(val, format!("{}[{}]", path, i), redactions);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_build_with_defaults_only() {
        let config = EffectiveConfig::build(None, None, None).unwrap();

        assert_eq!(config.schema_version, SCHEMA_VERSION);
        assert_eq!(config.get("region"), Some(&json!("us-east-1")));
        assert_eq!(config.launch, LaunchConfig::default());
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_cli_overrides_project_file() {
        let mut project = NamedTempFile::new().unwrap();
        writeln!(project, "agent = \"from_file\"").unwrap();
        writeln!(project, "region = \"eu-west-1\"").unwrap();
        writeln!(project, "[monitor]").unwrap();
        writeln!(project, "poll_interval_ms = 2000").unwrap();

        let cli = json!({"agent": "from_cli"});
        let config = EffectiveConfig::build(None, Some(project.path()), Some(cli)).unwrap();

        assert_eq!(config.launch.agent.as_deref(), Some("from_cli"));
        assert_eq!(config.launch.region, "eu-west-1");
        assert_eq!(config.launch.monitor.poll_interval_ms, 2000);
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[1].origin, ConfigOrigin::Project);
        assert_eq!(config.sources[1].digest.as_ref().map(String::len), Some(64));
    }

    #[test]
    fn test_host_file_below_project_file() {
        let mut host = NamedTempFile::new().unwrap();
        writeln!(host, "region = \"us-west-2\"").unwrap();
        writeln!(host, "profile = \"dev\"").unwrap();
        let mut project = NamedTempFile::new().unwrap();
        writeln!(project, "region = \"ap-south-1\"").unwrap();

        let config = EffectiveConfig::build(Some(host.path()), Some(project.path()), None).unwrap();
        assert_eq!(config.launch.region, "ap-south-1");
        assert_eq!(config.launch.profile.as_deref(), Some("dev"));
    }

    #[test]
    fn test_missing_files_skipped() {
        let config = EffectiveConfig::build(
            Some(Path::new("/nonexistent/host.toml")),
            Some(Path::new("/nonexistent/.agent-launch.toml")),
            None,
        )
        .unwrap();
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn test_validation_failure() {
        let cli = json!({"timeouts": {"connect_seconds": 500}});
        let err = EffectiveConfig::build(None, None, Some(cli)).unwrap_err();
        assert!(err.to_string().contains("connect_seconds"));
    }

    #[test]
    fn test_malformed_toml() {
        let mut project = NamedTempFile::new().unwrap();
        writeln!(project, "region = ").unwrap();
        let err = EffectiveConfig::build(None, Some(project.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_secrets_redacted_but_kept_typed() {
        let cli = json!({"env": {"OPENAI_API_KEY": "sk-123", "LOG_LEVEL": "debug"}});
        let config = EffectiveConfig::build(None, None, Some(cli)).unwrap();

        assert_eq!(config.get("env.OPENAI_API_KEY"), Some(&json!("[REDACTED]")));
        assert_eq!(config.get("env.LOG_LEVEL"), Some(&json!("debug")));
        assert_eq!(config.redactions, vec!["env.OPENAI_API_KEY".to_string()]);
        assert_eq!(config.launch.env["OPENAI_API_KEY"], "sk-123");
        assert!(!config.to_json().unwrap().contains("sk-123"));
    }
}
