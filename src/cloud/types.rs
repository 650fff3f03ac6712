//! Value types exchanged with cloud services

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An IAM role as returned by the identity service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub name: String,
    pub arn: String,
}

/// A container image repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub uri: String,
}

/// Desired (or observed) definition of a remote build project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub name: String,
    pub role_arn: String,
    /// Bucket the project reads source archives from
    pub source_bucket: String,
    /// Build spec path inside the source archive
    pub buildspec_path: String,
    /// Build environment image
    pub image: String,
    pub compute_type: String,
    pub environment_type: String,
    /// Docker-in-docker requires a privileged environment
    pub privileged: bool,
    pub timeout_minutes: u32,
}

/// Request to start a build of an uploaded source archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartBuildRequest {
    pub project_name: String,
    pub source_bucket: String,
    pub source_key: String,
    pub environment: BTreeMap<String, String>,
}

/// Overall build status as reported by the build service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteBuildStatus {
    InProgress,
    Succeeded,
    Failed,
    Fault,
    TimedOut,
    Stopped,
}

impl RemoteBuildStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "FAULT" => Some(Self::Fault),
            "TIMED_OUT" => Some(Self::TimedOut),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Fault => "FAULT",
            Self::TimedOut => "TIMED_OUT",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Phase status as reported by the build service
///
/// The service omits the status of the phase that is currently running;
/// backends report that as `InProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemotePhaseStatus {
    InProgress,
    Succeeded,
    Failed,
    Fault,
    TimedOut,
    Stopped,
}

impl RemotePhaseStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "FAULT" => Some(Self::Fault),
            "TIMED_OUT" => Some(Self::TimedOut),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Fault => "FAULT",
            Self::TimedOut => "TIMED_OUT",
            Self::Stopped => "STOPPED",
        }
    }
}

/// One phase entry of a build snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePhase {
    pub name: String,
    pub status: RemotePhaseStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Context messages attached by the service (usually only on failure)
    #[serde(default)]
    pub messages: Vec<String>,
}

/// Where the detailed build log lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPointer {
    pub group: String,
    pub stream: String,
}

impl std::fmt::Display for LogPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.stream)
    }
}

/// Point-in-time view of a remote build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub job_id: String,
    pub status: RemoteBuildStatus,
    /// Phases in whatever order the service returned them
    pub phases: Vec<RemotePhase>,
    pub log: Option<LogPointer>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Lifecycle status of a deployed agent runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuntimeStatus {
    Creating,
    Updating,
    Ready,
    CreateFailed,
    UpdateFailed,
    Deleting,
    Other(String),
}

impl From<String> for RuntimeStatus {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<RuntimeStatus> for String {
    fn from(status: RuntimeStatus) -> Self {
        status.to_string()
    }
}

impl RuntimeStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CREATING" => Self::Creating,
            "UPDATING" => Self::Updating,
            "READY" => Self::Ready,
            "CREATE_FAILED" => Self::CreateFailed,
            "UPDATE_FAILED" => Self::UpdateFailed,
            "DELETING" => Self::Deleting,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::CreateFailed | Self::UpdateFailed)
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready) || self.is_failed()
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Updating => "UPDATING",
            Self::Ready => "READY",
            Self::CreateFailed => "CREATE_FAILED",
            Self::UpdateFailed => "UPDATE_FAILED",
            Self::Deleting => "DELETING",
            Self::Other(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

/// A deployed agent runtime as described by the runtime service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub id: String,
    pub arn: String,
    pub name: String,
    pub status: RuntimeStatus,
    pub image_reference: String,
    pub role_reference: String,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}
