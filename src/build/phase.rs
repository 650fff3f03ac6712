//! Build phase tracking
//!
//! Phase states: NOT_STARTED → IN_PROGRESS → {SUCCEEDED | FAILED}
//!
//! Polls may miss the IN_PROGRESS window of a short phase, so a phase may
//! also jump straight from NOT_STARTED to a terminal status. Nothing ever
//! moves backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cloud::{LogPointer, RemotePhase, RemotePhaseStatus};

/// Phases the build service reports, in execution order
pub const STANDARD_PHASES: &[&str] = &[
    "SUBMITTED",
    "QUEUED",
    "PROVISIONING",
    "DOWNLOAD_SOURCE",
    "INSTALL",
    "PRE_BUILD",
    "BUILD",
    "POST_BUILD",
    "UPLOAD_ARTIFACTS",
    "FINALIZING",
    "COMPLETED",
];

/// Phase status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseStatus::Succeeded | PhaseStatus::Failed)
    }

    /// Check if transition from this status to target is valid
    pub fn can_transition_to(&self, target: PhaseStatus) -> bool {
        match (self, target) {
            (PhaseStatus::NotStarted, PhaseStatus::InProgress) => true,
            (PhaseStatus::NotStarted, PhaseStatus::Succeeded) => true,
            (PhaseStatus::NotStarted, PhaseStatus::Failed) => true,

            (PhaseStatus::InProgress, PhaseStatus::Succeeded) => true,
            (PhaseStatus::InProgress, PhaseStatus::Failed) => true,

            // Terminal statuses are final
            _ => false,
        }
    }
}

impl From<RemotePhaseStatus> for PhaseStatus {
    fn from(status: RemotePhaseStatus) -> Self {
        match status {
            RemotePhaseStatus::InProgress => PhaseStatus::InProgress,
            RemotePhaseStatus::Succeeded => PhaseStatus::Succeeded,
            RemotePhaseStatus::Failed
            | RemotePhaseStatus::Fault
            | RemotePhaseStatus::TimedOut
            | RemotePhaseStatus::Stopped => PhaseStatus::Failed,
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::NotStarted => "NOT_STARTED",
            PhaseStatus::InProgress => "IN_PROGRESS",
            PhaseStatus::Succeeded => "SUCCEEDED",
            PhaseStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One phase of a build job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_pointer: Option<LogPointer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: PhaseStatus::NotStarted,
            started_at: None,
            ended_at: None,
            log_pointer: None,
            messages: Vec::new(),
        }
    }

    /// Apply a remote observation
    ///
    /// Returns the previous status when the observation moved the phase
    /// forward; regressions and repeats leave it untouched.
    pub fn apply(&mut self, remote: &RemotePhase, log: Option<&LogPointer>) -> Option<PhaseStatus> {
        let target = PhaseStatus::from(remote.status);
        if !self.status.can_transition_to(target) {
            return None;
        }

        let previous = self.status;
        self.status = target;
        if self.started_at.is_none() {
            self.started_at = remote.start_time;
        }
        if target.is_terminal() {
            self.ended_at = remote.end_time;
            self.messages = remote.messages.clone();
        }
        if self.log_pointer.is_none() {
            self.log_pointer = log.cloned();
        }
        Some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(status: RemotePhaseStatus) -> RemotePhase {
        RemotePhase {
            name: "BUILD".into(),
            status,
            start_time: None,
            end_time: None,
            messages: vec!["ctx".into()],
        }
    }

    #[test]
    fn test_forward_transitions() {
        let mut phase = Phase::new("BUILD");
        assert_eq!(
            phase.apply(&remote(RemotePhaseStatus::InProgress), None),
            Some(PhaseStatus::NotStarted)
        );
        assert_eq!(
            phase.apply(&remote(RemotePhaseStatus::Succeeded), None),
            Some(PhaseStatus::InProgress)
        );
        assert_eq!(phase.status, PhaseStatus::Succeeded);
    }

    #[test]
    fn test_regression_ignored() {
        let mut phase = Phase::new("BUILD");
        phase.apply(&remote(RemotePhaseStatus::Failed), None);
        assert!(phase.apply(&remote(RemotePhaseStatus::InProgress), None).is_none());
        assert!(phase.apply(&remote(RemotePhaseStatus::Succeeded), None).is_none());
        assert_eq!(phase.status, PhaseStatus::Failed);
    }

    #[test]
    fn test_duplicate_ignored() {
        let mut phase = Phase::new("BUILD");
        phase.apply(&remote(RemotePhaseStatus::InProgress), None);
        assert!(phase.apply(&remote(RemotePhaseStatus::InProgress), None).is_none());
    }

    #[test]
    fn test_remote_fault_counts_as_failed() {
        assert_eq!(PhaseStatus::from(RemotePhaseStatus::Fault), PhaseStatus::Failed);
        assert_eq!(PhaseStatus::from(RemotePhaseStatus::Stopped), PhaseStatus::Failed);
        assert_eq!(PhaseStatus::from(RemotePhaseStatus::TimedOut), PhaseStatus::Failed);
    }

    #[test]
    fn test_failure_keeps_messages() {
        let mut phase = Phase::new("BUILD");
        phase.apply(&remote(RemotePhaseStatus::Failed), None);
        assert_eq!(phase.messages, vec!["ctx".to_string()]);
    }
}
