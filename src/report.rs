//! Final launch report (stdout)
//!
//! One report per invocation, rendered either as text or as JSON.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::LaunchError;
use crate::pipeline::LaunchOutcome;

/// Schema version for the JSON report
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for the JSON report
pub const REPORT_SCHEMA_ID: &str = "agent-launch/launch_report@1";

/// Overall result of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Failed,
    Cancelled,
}

/// Error section of a report
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub category: String,
    pub message: String,
    pub remediation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Bounded log excerpt of a failed build
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl ErrorReport {
    pub fn from_error(err: &LaunchError) -> Self {
        let (job_id, phase, excerpt) = match err {
            LaunchError::BuildFailure {
                job_id,
                phase,
                excerpt,
            } => (Some(job_id.clone()), Some(phase.clone()), Some(excerpt.clone())),
            LaunchError::Timeout { job_id, .. } | LaunchError::Cancelled { job_id } => {
                (Some(job_id.clone()), None, None)
            }
            _ => (None, None, None),
        };
        Self {
            category: err.category().to_string(),
            message: err.to_string(),
            remediation: err.remediation(),
            job_id,
            phase,
            excerpt,
        }
    }
}

/// Report printed when an invocation ends
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    pub status: ReportStatus,
    pub exit_code: i32,
    pub human_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<LaunchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl LaunchReport {
    pub fn success(outcome: LaunchOutcome) -> Self {
        let human_summary = format!(
            "{} {} runtime {} ({}) in {}",
            outcome.deploy.action.label(),
            outcome.agent_name,
            outcome.deploy.runtime_id,
            outcome.deploy.status,
            outcome.region
        );
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            schema_id: REPORT_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            status: ReportStatus::Success,
            exit_code: 0,
            human_summary,
            outcome: Some(outcome),
            error: None,
        }
    }

    pub fn failure(err: &LaunchError) -> Self {
        let status = match err {
            LaunchError::Cancelled { .. } => ReportStatus::Cancelled,
            _ => ReportStatus::Failed,
        };
        let error = ErrorReport::from_error(err);
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            schema_id: REPORT_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            status,
            exit_code: err.exit_code(),
            human_summary: format!("{}: {}", error.category, error.message),
            outcome: None,
            error: Some(error),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Plain text rendering
    pub fn to_human(&self) -> String {
        let mut out = vec![self.human_summary.clone()];

        if let Some(outcome) = &self.outcome {
            out.push(format!("  Runtime ARN: {}", outcome.deploy.runtime_arn));
            out.push(format!("  Image: {}", outcome.image_reference));
            out.push(format!("  Execution role: {}", outcome.runtime_role_arn));
            if let Some(bundle) = &outcome.bundle {
                out.push(format!(
                    "  Source: {} files, {} bytes, s3 key {} ({:?})",
                    bundle.file_count, bundle.size_bytes, bundle.storage_key, bundle.upload
                ));
            }
            if let Some(build) = &outcome.build {
                out.push(format!("  Build: {}", build.job_id));
            }
            if let crate::deploy::DeployAction::Updated(delta) = &outcome.deploy.action {
                out.push(format!("  Changes: {}", delta));
            }
        }

        if let Some(error) = &self.error {
            if let Some(job_id) = &error.job_id {
                out.push(format!("  Build: {}", job_id));
            }
            if let Some(phase) = &error.phase {
                out.push(format!("  Failed phase: {}", phase));
            }
            if let Some(excerpt) = error.excerpt.as_deref().filter(|e| !e.is_empty()) {
                out.push("  Log excerpt:".to_string());
                out.extend(excerpt.lines().map(|line| format!("    {}", line)));
            }
            out.push(format!("  Hint: {}", error.remediation));
            out.push(format!("  Exit code: {}", self.exit_code));
        }

        out.join("\n")
    }
}
