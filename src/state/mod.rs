//! Persisted launch state
//!
//! `.agent-launch/state.json` maps each agent name to what the last
//! launch provisioned and deployed. A later launch in the same region
//! reuses the recorded roles and repository instead of looking them up.
//!
//! Writes go to a temp file that is then renamed over the old state.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provision::{InfrastructureSet, ProvisionHints};

/// Schema version for state.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "agent-launch/state@1";

/// State directory, relative to the source directory
pub const STATE_DIR: &str = ".agent-launch";

/// State file name inside [`STATE_DIR`]
pub const STATE_FILE: &str = "state.json";

/// Default state path for a source directory
pub fn state_path(source_dir: &Path) -> PathBuf {
    source_dir.join(STATE_DIR).join(STATE_FILE)
}

/// What was provisioned and deployed for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub region: String,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_role_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_role_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Last build that succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_arn: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account_id: account_id.into(),
            runtime_role_arn: None,
            build_role_arn: None,
            repository_uri: None,
            bucket: None,
            project_name: None,
            last_build_job_id: None,
            last_image: None,
            runtime_id: None,
            runtime_arn: None,
            updated_at: Utc::now(),
        }
    }

    /// Copy the provisioned resources into the record
    pub fn set_infrastructure(&mut self, infra: &InfrastructureSet) {
        self.runtime_role_arn = Some(infra.runtime_role_arn.clone());
        self.build_role_arn = Some(infra.build_role_arn.clone());
        self.repository_uri = Some(infra.repository_uri.clone());
        self.bucket = Some(infra.bucket.clone());
        self.project_name = Some(infra.project_name.clone());
    }
}

/// Errors for state file operations
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed state file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported state schema version {found} (expected {})", SCHEMA_VERSION)]
    UnsupportedVersion { found: u32 },
}

/// Contents of state.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchState {
    pub schema_version: u32,
    pub schema_id: String,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentRecord>,
}

impl Default for LaunchState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            agents: BTreeMap::new(),
        }
    }
}

impl LaunchState {
    /// Load the state file; a missing file is an empty state
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let state: Self = serde_json::from_str(&json).map_err(|source| StateError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if state.schema_version != SCHEMA_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: state.schema_version,
            });
        }
        Ok(state)
    }

    /// Write atomically (write-then-rename), creating the directory
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| StateError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json).map_err(io_err)?;
        fs::rename(&temp_path, path).map_err(io_err)?;
        Ok(())
    }

    pub fn record(&self, agent: &str) -> Option<&AgentRecord> {
        self.agents.get(agent)
    }

    /// Reusable resources for `agent` in `region`
    ///
    /// Records from another region hint nothing.
    pub fn hints_for(&self, agent: &str, region: &str) -> ProvisionHints {
        match self.agents.get(agent) {
            Some(record) if record.region == region => ProvisionHints {
                runtime_role_arn: record.runtime_role_arn.clone(),
                build_role_arn: record.build_role_arn.clone(),
                repository_uri: record.repository_uri.clone(),
            },
            _ => ProvisionHints::default(),
        }
    }

    /// Replace the record of `agent`, stamping the update time
    pub fn upsert(&mut self, agent: &str, mut record: AgentRecord) {
        record.updated_at = Utc::now();
        self.agents.insert(agent.to_string(), record);
    }
}
