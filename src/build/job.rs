//! Build job state machine
//!
//! Job states: PENDING → IN_PROGRESS → {SUCCEEDED | FAILED | TIMED_OUT}
//!
//! A job is created by the trigger and mutated only by the monitor. It
//! enters a terminal status exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phase::{Phase, PhaseStatus};
use crate::cloud::{BuildSnapshot, LogPointer, RemoteBuildStatus};

/// Overall job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    TimedOut,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::TimedOut
        )
    }

    /// Check if transition from this status to target is valid
    pub fn can_transition_to(&self, target: BuildStatus) -> bool {
        match (self, target) {
            // From PENDING (a build may finish before the first poll)
            (BuildStatus::Pending, BuildStatus::InProgress) => true,
            (BuildStatus::Pending, BuildStatus::Succeeded) => true,
            (BuildStatus::Pending, BuildStatus::Failed) => true,
            (BuildStatus::Pending, BuildStatus::TimedOut) => true,

            // From IN_PROGRESS
            (BuildStatus::InProgress, BuildStatus::Succeeded) => true,
            (BuildStatus::InProgress, BuildStatus::Failed) => true,
            (BuildStatus::InProgress, BuildStatus::TimedOut) => true,

            // Terminal states cannot transition
            _ => false,
        }
    }
}

impl From<RemoteBuildStatus> for BuildStatus {
    fn from(status: RemoteBuildStatus) -> Self {
        match status {
            RemoteBuildStatus::InProgress => BuildStatus::InProgress,
            RemoteBuildStatus::Succeeded => BuildStatus::Succeeded,
            RemoteBuildStatus::Failed
            | RemoteBuildStatus::Fault
            | RemoteBuildStatus::Stopped
            | RemoteBuildStatus::TimedOut => BuildStatus::Failed,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStatus::Pending => "PENDING",
            BuildStatus::InProgress => "IN_PROGRESS",
            BuildStatus::Succeeded => "SUCCEEDED",
            BuildStatus::Failed => "FAILED",
            BuildStatus::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// Location of the uploaded source archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub bucket: String,
    pub key: String,
}

/// Why a build failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Root-cause phase
    pub phase: String,
    /// Bounded excerpt of phase messages and log tail
    pub excerpt: String,
}

/// A forward phase transition observed by a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransition {
    pub phase: String,
    pub from: PhaseStatus,
    pub to: PhaseStatus,
}

/// Errors for job state operations
#[derive(Debug, thiserror::Error)]
pub enum BuildJobError {
    #[error("invalid build status transition from {from} to {to}")]
    InvalidTransition { from: BuildStatus, to: BuildStatus },
}

/// A remote build job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_bundle_ref: Option<SourceRef>,
    /// Phases in order of first observation
    pub phases: Vec<Phase>,
    pub overall_status: BuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Image the build pushes
    pub image_reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_pointer: Option<LogPointer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
}

impl BuildJob {
    /// Create a job in PENDING state
    pub fn new(job_id: impl Into<String>, source: Option<SourceRef>, image_reference: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            source_bundle_ref: source,
            phases: Vec::new(),
            overall_status: BuildStatus::Pending,
            started_at: None,
            ended_at: None,
            image_reference: image_reference.into(),
            log_pointer: None,
            failure: None,
        }
    }

    /// Transition to a new status
    pub fn transition(&mut self, status: BuildStatus) -> Result<(), BuildJobError> {
        if !self.overall_status.can_transition_to(status) {
            return Err(BuildJobError::InvalidTransition {
                from: self.overall_status,
                to: status,
            });
        }
        self.overall_status = status;
        if status.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Enter a terminal status, recording when it ended
    pub fn finish(
        &mut self,
        status: BuildStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), BuildJobError> {
        if !status.is_terminal() || !self.overall_status.can_transition_to(status) {
            return Err(BuildJobError::InvalidTransition {
                from: self.overall_status,
                to: status,
            });
        }
        self.ended_at = ended_at.or_else(|| Some(Utc::now()));
        self.transition(status)
    }

    /// Fold a snapshot into the job
    ///
    /// Phases are matched by name, never by position. Only forward
    /// transitions are applied. The overall status is left to the caller.
    pub fn observe(&mut self, snapshot: &BuildSnapshot) -> Vec<PhaseTransition> {
        if self.overall_status.is_terminal() {
            return Vec::new();
        }
        if self.started_at.is_none() {
            self.started_at = snapshot.start_time;
        }
        if self.log_pointer.is_none() {
            self.log_pointer = snapshot.log.clone();
        }

        let mut transitions = Vec::new();
        for remote in &snapshot.phases {
            let index = match self.phases.iter().position(|p| p.name == remote.name) {
                Some(index) => index,
                None => {
                    self.phases.push(Phase::new(remote.name.clone()));
                    self.phases.len() - 1
                }
            };
            let phase = &mut self.phases[index];
            if let Some(from) = phase.apply(remote, snapshot.log.as_ref()) {
                transitions.push(PhaseTransition {
                    phase: phase.name.clone(),
                    from,
                    to: phase.status,
                });
            }
        }
        transitions
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// The FAILED phase that started first
    ///
    /// Phases without a start time rank after timed ones; ties keep
    /// observation order.
    pub fn root_cause(&self) -> Option<&Phase> {
        self.phases
            .iter()
            .enumerate()
            .filter(|(_, p)| p.status == PhaseStatus::Failed)
            .min_by_key(|(index, p)| (p.started_at.is_none(), p.started_at, *index))
            .map(|(_, p)| p)
    }

    /// Last phase that was observed running or finished
    pub fn last_active_phase(&self) -> Option<&Phase> {
        self.phases
            .iter()
            .rev()
            .find(|p| p.status != PhaseStatus::NotStarted)
    }
}
