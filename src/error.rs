//! Terminal error taxonomy and stable exit codes
//!
//! Every stage folds its failures into [`LaunchError`]; the CLI turns the
//! variant into a category, an exit code and a remediation hint.

use std::time::Duration;

use crate::bundle::BundleError;
use crate::cloud::{CloudError, CloudOp};
use crate::config::ConfigError;

/// Terminal launch errors
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("packaging failed: {0}")]
    Packaging(#[from] BundleError),

    #[error("infrastructure error on {resource}: {message}")]
    Infrastructure { resource: String, message: String },

    #[error("permission denied: missing `{action}` on {resource}: {message}")]
    Permission {
        action: String,
        resource: String,
        message: String,
    },

    #[error("build {job_id} failed in phase {phase}")]
    BuildFailure {
        job_id: String,
        phase: String,
        excerpt: String,
    },

    #[error("build {job_id} did not finish within {}s", .limit.as_secs())]
    Timeout { job_id: String, limit: Duration },

    #[error(
        "agent runtime `{name}` already exists{}",
        .runtime_id.as_deref().map(|id| format!(" (id {})", id)).unwrap_or_default()
    )]
    Conflict {
        name: String,
        /// Unknown when the existing runtime could not be looked up
        runtime_id: Option<String>,
    },

    #[error("deploying runtime `{name}` failed: {message}")]
    Deployment { name: String, message: String },

    #[error("stopped monitoring build {job_id}")]
    Cancelled { job_id: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl LaunchError {
    /// Translate a cloud error raised while handling `resource`
    ///
    /// Access denials become [`LaunchError::Permission`] naming the missing
    /// action (falling back to the action `op` requires); everything else
    /// becomes [`LaunchError::Infrastructure`].
    pub fn from_cloud(resource: impl Into<String>, op: CloudOp, err: CloudError) -> Self {
        let resource = resource.into();
        match err {
            CloudError::AccessDenied { action, message } => LaunchError::Permission {
                action: action.unwrap_or_else(|| op.iam_action().to_string()),
                resource,
                message,
            },
            other => LaunchError::Infrastructure {
                resource,
                message: format!("{} failed: {}", op.name(), other),
            },
        }
    }

    /// Stable category name printed by the CLI
    pub fn category(&self) -> &'static str {
        match self {
            LaunchError::Packaging(_) => "PackagingError",
            LaunchError::Infrastructure { .. } => "InfrastructureError",
            LaunchError::Permission { .. } => "PermissionError",
            LaunchError::BuildFailure { .. } => "BuildFailure",
            LaunchError::Timeout { .. } => "TimeoutError",
            LaunchError::Conflict { .. } => "ConflictError",
            LaunchError::Deployment { .. } => "DeploymentError",
            LaunchError::Cancelled { .. } => "Cancelled",
            LaunchError::Config(_) => "ConfigError",
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Config(_) => 2,
            LaunchError::Infrastructure { .. } => 20,
            LaunchError::Permission { .. } => 21,
            LaunchError::BuildFailure { .. } => 50,
            LaunchError::Conflict { .. } => 60,
            LaunchError::Deployment { .. } => 61,
            LaunchError::Cancelled { .. } => 80,
            LaunchError::Timeout { .. } => 81,
            LaunchError::Packaging(_) => 92,
        }
    }

    /// Human-readable next step
    pub fn remediation(&self) -> String {
        match self {
            LaunchError::Packaging(BundleError::SizeExceeded { .. }) => {
                "Add large or generated paths to the ignore file, or raise bundle.max_bytes".into()
            }
            LaunchError::Packaging(_) => {
                "Check that the source directory exists, is readable and contains a Dockerfile".into()
            }
            LaunchError::Infrastructure { resource, .. } => format!(
                "Inspect {} in the cloud console; re-running launch is safe and reuses existing resources",
                resource
            ),
            LaunchError::Permission { action, .. } => format!(
                "Grant `{}` to the calling identity and re-run launch",
                action
            ),
            LaunchError::BuildFailure { .. } => {
                "Fix the failing step shown in the log excerpt and re-run launch".into()
            }
            LaunchError::Timeout { job_id, .. } => format!(
                "The build may still finish; check it with `agent-launch status {}` or raise --timeout",
                job_id
            ),
            LaunchError::Conflict { .. } => {
                "Re-run with --auto-update-on-conflict to update the existing runtime in place".into()
            }
            LaunchError::Deployment { .. } => {
                "Correct the runtime configuration reported by the service and re-run launch".into()
            }
            LaunchError::Cancelled { job_id } => format!(
                "The remote build keeps running; check it with `agent-launch status {}`",
                job_id
            ),
            LaunchError::Config(_) => "Fix .agent-launch.toml or the command-line flags".into(),
        }
    }
}

impl From<ConfigError> for LaunchError {
    fn from(err: ConfigError) -> Self {
        LaunchError::Config(err.to_string())
    }
}

/// Result type for orchestrator operations
pub type LaunchResult<T> = Result<T, LaunchError>;
