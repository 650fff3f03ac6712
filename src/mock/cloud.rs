//! In-memory cloud used by tests
//!
//! Emulates the behaviors the pipeline depends on: region rules for
//! bucket creation, "already exists" on duplicate creates, name conflicts
//! for runtimes and scripted build progressions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use crate::build::STANDARD_PHASES;
use crate::cloud::{
    AccountService, BuildService, BuildSnapshot, CloudError, CloudOp, CloudResult,
    IdentityService, ImageRegistry, LogPointer, ObjectStore, ProjectSpec, RemoteBuildStatus,
    RemotePhase, RemotePhaseStatus, RepositoryInfo, RoleInfo, RuntimeInfo, RuntimeService,
    RuntimeStatus, StartBuildRequest, DEFAULT_REGION,
};
use crate::deploy::RuntimeTarget;

use super::failure::{FailureConfig, FailureInjector};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn script_time(offset_secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(1_704_067_200, 0)
        .single()
        .map(|t| t + ChronoDuration::seconds(offset_secs))
}

/// Scripted progression of a build, one frame per poll
#[derive(Debug, Clone)]
pub struct BuildScript {
    frames: Vec<(RemoteBuildStatus, Vec<RemotePhase>)>,
    log_lines: Vec<String>,
}

impl BuildScript {
    /// Script from explicit frames
    pub fn from_frames(frames: Vec<(RemoteBuildStatus, Vec<RemotePhase>)>) -> Self {
        Self {
            frames,
            log_lines: Vec::new(),
        }
    }

    /// Every standard phase succeeds in order
    pub fn succeeding() -> Self {
        let mut frames = Vec::new();
        let mut done: Vec<RemotePhase> = Vec::new();
        for (i, name) in STANDARD_PHASES.iter().enumerate() {
            let mut running = done.clone();
            running.push(phase(name, RemotePhaseStatus::InProgress, i as i64, &[]));
            frames.push((RemoteBuildStatus::InProgress, running));
            done.push(phase(name, RemotePhaseStatus::Succeeded, i as i64, &[]));
        }
        frames.push((RemoteBuildStatus::Succeeded, done));
        Self::from_frames(frames)
    }

    /// Phases succeed up to `failed_phase`, which fails with `message`
    pub fn failing_in(failed_phase: &str, message: &str) -> Self {
        let mut frames = Vec::new();
        let mut done: Vec<RemotePhase> = Vec::new();
        let mut offset = 0i64;
        for name in STANDARD_PHASES.iter().copied() {
            let mut running = done.clone();
            running.push(phase(name, RemotePhaseStatus::InProgress, offset, &[]));
            frames.push((RemoteBuildStatus::InProgress, running));

            if name == failed_phase {
                done.push(phase(name, RemotePhaseStatus::Failed, offset, &[message]));
                frames.push((RemoteBuildStatus::InProgress, done.clone()));
                break;
            }
            done.push(phase(name, RemotePhaseStatus::Succeeded, offset, &[]));
            offset += 1;
        }
        offset += 1;
        for name in ["FINALIZING", "COMPLETED"] {
            done.push(phase(name, RemotePhaseStatus::Succeeded, offset, &[]));
            offset += 1;
        }
        frames.push((RemoteBuildStatus::Failed, done));
        Self::from_frames(frames)
    }

    /// A build that stays in its first phase forever
    pub fn never_finishing() -> Self {
        Self::from_frames(vec![(
            RemoteBuildStatus::InProgress,
            vec![phase("QUEUED", RemotePhaseStatus::InProgress, 0, &[])],
        )])
    }

    /// Insert a second failed phase into the terminal frame
    ///
    /// The phase is placed first in the reported list even though it
    /// started later, the way a service may order a cascade failure.
    pub fn then_failing(mut self, later_phase: &str, message: &str) -> Self {
        if let Some((_, phases)) = self.frames.last_mut() {
            let latest = phases.len() as i64 + 100;
            phases.insert(0, phase(later_phase, RemotePhaseStatus::Failed, latest, &[message]));
        }
        self
    }

    /// Replace the terminal build status
    pub fn ending_with(mut self, status: RemoteBuildStatus) -> Self {
        if let Some((last, _)) = self.frames.last_mut() {
            *last = status;
        }
        self
    }

    /// Log lines returned by the log service
    pub fn with_log<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log_lines = lines.into_iter().map(Into::into).collect();
        self
    }
}

/// Build a scripted phase entry
pub fn phase(name: &str, status: RemotePhaseStatus, start_offset: i64, messages: &[&str]) -> RemotePhase {
    let settled = status != RemotePhaseStatus::InProgress;
    RemotePhase {
        name: name.to_string(),
        status,
        start_time: script_time(start_offset),
        end_time: if settled { script_time(start_offset + 1) } else { None },
        messages: messages.iter().map(|m| m.to_string()).collect(),
    }
}

/// A bucket in the mock object store
#[derive(Debug, Clone, Default)]
pub struct MockBucket {
    /// `None` for the default region
    pub location_constraint: Option<String>,
    pub lifecycle_days: Option<u32>,
    pub objects: BTreeMap<String, Vec<u8>>,
}

/// A role in the mock identity service
#[derive(Debug, Clone)]
pub struct MockRole {
    pub info: RoleInfo,
    pub trust_policy: String,
    pub policies: BTreeMap<String, String>,
}

#[derive(Debug)]
struct MockBuild {
    request: StartBuildRequest,
    script: BuildScript,
    cursor: usize,
    log: LogPointer,
}

#[derive(Debug, Default)]
struct MockCloudState {
    buckets: BTreeMap<String, MockBucket>,
    roles: BTreeMap<String, MockRole>,
    repositories: BTreeMap<String, RepositoryInfo>,
    projects: BTreeMap<String, ProjectSpec>,
    builds: BTreeMap<String, MockBuild>,
    build_order: Vec<String>,
    runtimes: BTreeMap<String, RuntimeInfo>,
    next_id: u64,
}

/// In-memory implementation of every cloud service seam
pub struct MockCloud {
    region: String,
    account_id: String,
    state: Mutex<MockCloudState>,
    failures: Mutex<FailureInjector>,
    calls: Mutex<BTreeMap<CloudOp, u32>>,
    scripts: Mutex<Vec<BuildScript>>,
    races: Mutex<BTreeSet<CloudOp>>,
    runtime_settle: Mutex<RuntimeStatus>,
}

impl MockCloud {
    /// Create a mock cloud for `region` with a fixed account id
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            account_id: "123456789012".to_string(),
            state: Mutex::new(MockCloudState::default()),
            failures: Mutex::new(FailureInjector::new()),
            calls: Mutex::new(BTreeMap::new()),
            scripts: Mutex::new(Vec::new()),
            races: Mutex::new(BTreeSet::new()),
            runtime_settle: Mutex::new(RuntimeStatus::Ready),
        }
    }

    // === Public API for test configuration ===

    pub fn account(&self) -> &str {
        &self.account_id
    }

    /// Inject a failure for an operation
    pub fn inject(&self, op: CloudOp, config: FailureConfig) {
        lock(&self.failures).inject(op, config);
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Queue the script for the next started build (FIFO)
    pub fn queue_build(&self, script: BuildScript) {
        lock(&self.scripts).push(script);
    }

    /// Make the next create of `op` lose a race: another writer creates
    /// the resource first and the call reports "already exists"
    pub fn race_next_create(&self, op: CloudOp) {
        lock(&self.races).insert(op);
    }

    /// Status runtimes reach after CREATING/UPDATING
    pub fn set_runtime_settle_status(&self, status: RuntimeStatus) {
        *lock(&self.runtime_settle) = status;
    }

    /// Insert an already deployed runtime
    pub fn seed_runtime(&self, target: &RuntimeTarget) -> RuntimeInfo {
        let mut state = lock(&self.state);
        let info = self.new_runtime(&mut state, target, RuntimeStatus::Ready);
        state.runtimes.insert(info.id.clone(), info.clone());
        info
    }

    // === Inspection ===

    /// Number of calls issued for `op`
    pub fn calls(&self, op: CloudOp) -> u32 {
        lock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    /// Number of resource-creating calls issued so far
    pub fn create_calls(&self) -> u32 {
        [
            CloudOp::CreateBucket,
            CloudOp::CreateRole,
            CloudOp::CreateRepository,
            CloudOp::CreateProject,
        ]
        .iter()
        .map(|op| self.calls(*op))
        .sum()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn bucket(&self, name: &str) -> Option<MockBucket> {
        lock(&self.state).buckets.get(name).cloned()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        lock(&self.state).buckets.keys().cloned().collect()
    }

    pub fn role(&self, name: &str) -> Option<MockRole> {
        lock(&self.state).roles.get(name).cloned()
    }

    /// Remove a role behind the provisioner's back
    pub fn delete_role(&self, name: &str) -> bool {
        lock(&self.state).roles.remove(name).is_some()
    }

    pub fn delete_repository(&self, name: &str) -> bool {
        lock(&self.state).repositories.remove(name).is_some()
    }

    pub fn role_count(&self) -> usize {
        lock(&self.state).roles.len()
    }

    pub fn project(&self, name: &str) -> Option<ProjectSpec> {
        lock(&self.state).projects.get(name).cloned()
    }

    /// Requests of every started build, in start order
    pub fn started_builds(&self) -> Vec<StartBuildRequest> {
        let state = lock(&self.state);
        state
            .build_order
            .iter()
            .filter_map(|id| state.builds.get(id).map(|b| b.request.clone()))
            .collect()
    }

    pub fn runtime_by_name(&self, name: &str) -> Option<RuntimeInfo> {
        lock(&self.state)
            .runtimes
            .values()
            .find(|r| r.name == name)
            .cloned()
    }

    pub fn runtime_count(&self) -> usize {
        lock(&self.state).runtimes.len()
    }

    // === Internals ===

    /// Count the call and apply any injected failure
    fn enter(&self, op: CloudOp) -> CloudResult<()> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;

        let injected = lock(&self.failures).check(op).cloned();
        if let Some(config) = injected {
            if let Some(delay) = config.delay {
                thread::sleep(delay);
            }
            if let Some(error) = config.error {
                return Err(error);
            }
        }
        Ok(())
    }

    fn take_race(&self, op: CloudOp) -> bool {
        lock(&self.races).remove(&op)
    }

    fn next_id(state: &mut MockCloudState) -> u64 {
        state.next_id += 1;
        state.next_id
    }

    fn new_runtime(&self, state: &mut MockCloudState, target: &RuntimeTarget, status: RuntimeStatus) -> RuntimeInfo {
        let id = format!("{}-{:010x}", target.name, Self::next_id(state));
        RuntimeInfo {
            arn: format!(
                "arn:aws:bedrock-agentcore:{}:{}:runtime/{}",
                self.region, self.account_id, id
            ),
            id,
            name: target.name.clone(),
            status,
            image_reference: target.image_reference.clone(),
            role_reference: target.role_reference.clone(),
            environment_variables: target.environment_variables.clone(),
        }
    }

    fn role_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", self.account_id, name)
    }

    fn repository_uri(&self, name: &str) -> String {
        format!("{}.dkr.ecr.{}.amazonaws.com/{}", self.account_id, self.region, name)
    }
}

impl AccountService for MockCloud {
    fn account_id(&self) -> CloudResult<String> {
        self.enter(CloudOp::GetCallerIdentity)?;
        Ok(self.account_id.clone())
    }
}

impl ObjectStore for MockCloud {
    fn head_bucket(&self, bucket: &str) -> CloudResult<()> {
        self.enter(CloudOp::HeadBucket)?;
        if lock(&self.state).buckets.contains_key(bucket) {
            Ok(())
        } else {
            Err(CloudError::not_found(format!("bucket {}", bucket)))
        }
    }

    fn create_bucket(&self, bucket: &str, location_constraint: Option<&str>) -> CloudResult<()> {
        self.enter(CloudOp::CreateBucket)?;

        match (self.region.as_str(), location_constraint) {
            (DEFAULT_REGION, Some(_)) => {
                return Err(CloudError::Validation {
                    message: "InvalidLocationConstraint: The specified location-constraint is not valid"
                        .to_string(),
                })
            }
            (_, None) if self.region != DEFAULT_REGION => {
                return Err(CloudError::Validation {
                    message: "IllegalLocationConstraintException: The unspecified location constraint is incompatible for the region specific endpoint this request was sent to."
                        .to_string(),
                })
            }
            (region, Some(constraint)) if region != constraint => {
                return Err(CloudError::Validation {
                    message: format!(
                        "IllegalLocationConstraintException: The {} location constraint is incompatible for the region specific endpoint this request was sent to.",
                        constraint
                    ),
                })
            }
            _ => {}
        }

        let mut state = lock(&self.state);
        if state.buckets.contains_key(bucket) {
            return Err(CloudError::already_exists(format!("bucket {}", bucket)));
        }
        state.buckets.insert(
            bucket.to_string(),
            MockBucket {
                location_constraint: location_constraint.map(str::to_string),
                ..Default::default()
            },
        );
        if self.take_race(CloudOp::CreateBucket) {
            return Err(CloudError::already_exists(format!("bucket {}", bucket)));
        }
        Ok(())
    }

    fn put_lifecycle_expiration(&self, bucket: &str, days: u32) -> CloudResult<()> {
        self.enter(CloudOp::PutBucketLifecycle)?;
        let mut state = lock(&self.state);
        let entry = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| CloudError::not_found(format!("bucket {}", bucket)))?;
        entry.lifecycle_days = Some(days);
        Ok(())
    }

    fn object_exists(&self, bucket: &str, key: &str) -> CloudResult<bool> {
        self.enter(CloudOp::HeadObject)?;
        let state = lock(&self.state);
        let entry = state
            .buckets
            .get(bucket)
            .ok_or_else(|| CloudError::not_found(format!("bucket {}", bucket)))?;
        Ok(entry.objects.contains_key(key))
    }

    fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> CloudResult<()> {
        self.enter(CloudOp::PutObject)?;
        let mut state = lock(&self.state);
        let entry = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| CloudError::not_found(format!("bucket {}", bucket)))?;
        entry.objects.insert(key.to_string(), body.to_vec());
        Ok(())
    }
}

impl IdentityService for MockCloud {
    fn get_role(&self, name: &str) -> CloudResult<RoleInfo> {
        self.enter(CloudOp::GetRole)?;
        lock(&self.state)
            .roles
            .get(name)
            .map(|r| r.info.clone())
            .ok_or_else(|| CloudError::not_found(format!("role {}", name)))
    }

    fn create_role(&self, name: &str, trust_policy: &str, _description: &str) -> CloudResult<RoleInfo> {
        self.enter(CloudOp::CreateRole)?;
        let mut state = lock(&self.state);
        if state.roles.contains_key(name) {
            return Err(CloudError::already_exists(format!("role {}", name)));
        }
        let info = RoleInfo {
            name: name.to_string(),
            arn: self.role_arn(name),
        };
        state.roles.insert(
            name.to_string(),
            MockRole {
                info: info.clone(),
                trust_policy: trust_policy.to_string(),
                policies: BTreeMap::new(),
            },
        );
        if self.take_race(CloudOp::CreateRole) {
            return Err(CloudError::already_exists(format!("role {}", name)));
        }
        Ok(info)
    }

    fn attach_role_policy(&self, role: &str, policy_name: &str, document: &str) -> CloudResult<()> {
        self.enter(CloudOp::PutRolePolicy)?;
        let mut state = lock(&self.state);
        let entry = state
            .roles
            .get_mut(role)
            .ok_or_else(|| CloudError::not_found(format!("role {}", role)))?;
        entry.policies.insert(policy_name.to_string(), document.to_string());
        Ok(())
    }
}

impl ImageRegistry for MockCloud {
    fn describe_repository(&self, name: &str) -> CloudResult<RepositoryInfo> {
        self.enter(CloudOp::DescribeRepository)?;
        lock(&self.state)
            .repositories
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("repository {}", name)))
    }

    fn create_repository(&self, name: &str) -> CloudResult<RepositoryInfo> {
        self.enter(CloudOp::CreateRepository)?;
        let mut state = lock(&self.state);
        if state.repositories.contains_key(name) {
            return Err(CloudError::already_exists(format!("repository {}", name)));
        }
        let info = RepositoryInfo {
            name: name.to_string(),
            uri: self.repository_uri(name),
        };
        state.repositories.insert(name.to_string(), info.clone());
        if self.take_race(CloudOp::CreateRepository) {
            return Err(CloudError::already_exists(format!("repository {}", name)));
        }
        Ok(info)
    }
}

impl BuildService for MockCloud {
    fn get_project(&self, name: &str) -> CloudResult<ProjectSpec> {
        self.enter(CloudOp::GetProject)?;
        lock(&self.state)
            .projects
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("project {}", name)))
    }

    fn create_project(&self, spec: &ProjectSpec) -> CloudResult<()> {
        self.enter(CloudOp::CreateProject)?;
        let mut state = lock(&self.state);
        if state.projects.contains_key(&spec.name) {
            return Err(CloudError::already_exists(format!("project {}", spec.name)));
        }
        state.projects.insert(spec.name.clone(), spec.clone());
        if self.take_race(CloudOp::CreateProject) {
            return Err(CloudError::already_exists(format!("project {}", spec.name)));
        }
        Ok(())
    }

    fn update_project(&self, spec: &ProjectSpec) -> CloudResult<()> {
        self.enter(CloudOp::UpdateProject)?;
        let mut state = lock(&self.state);
        match state.projects.get_mut(&spec.name) {
            Some(existing) => {
                *existing = spec.clone();
                Ok(())
            }
            None => Err(CloudError::not_found(format!("project {}", spec.name))),
        }
    }

    fn start_build(&self, request: &StartBuildRequest) -> CloudResult<BuildSnapshot> {
        self.enter(CloudOp::StartBuild)?;

        let script = {
            let mut scripts = lock(&self.scripts);
            if scripts.is_empty() {
                BuildScript::succeeding()
            } else {
                scripts.remove(0)
            }
        };

        let mut state = lock(&self.state);
        if !state.projects.contains_key(&request.project_name) {
            return Err(CloudError::not_found(format!("project {}", request.project_name)));
        }
        let source_present = state
            .buckets
            .get(&request.source_bucket)
            .map(|b| b.objects.contains_key(&request.source_key))
            .unwrap_or(false);
        if !source_present {
            return Err(CloudError::Validation {
                message: format!(
                    "source {}/{} does not exist",
                    request.source_bucket, request.source_key
                ),
            });
        }

        let build_number = Self::next_id(&mut state);
        let job_id = format!("{}:build-{:04}", request.project_name, build_number);
        let log = LogPointer {
            group: format!("/aws/codebuild/{}", request.project_name),
            stream: format!("build-{:04}", build_number),
        };
        state.builds.insert(
            job_id.clone(),
            MockBuild {
                request: request.clone(),
                script,
                cursor: 0,
                log: log.clone(),
            },
        );
        state.build_order.push(job_id.clone());

        Ok(BuildSnapshot {
            job_id,
            status: RemoteBuildStatus::InProgress,
            phases: Vec::new(),
            log: Some(log),
            start_time: script_time(0),
            end_time: None,
        })
    }

    fn get_build(&self, job_id: &str) -> CloudResult<BuildSnapshot> {
        self.enter(CloudOp::GetBuild)?;
        let mut state = lock(&self.state);
        let build = state
            .builds
            .get_mut(job_id)
            .ok_or_else(|| CloudError::not_found(format!("build {}", job_id)))?;

        let frames = &build.script.frames;
        let (status, phases) = match frames.get(build.cursor).or_else(|| frames.last()) {
            Some((status, phases)) => (*status, phases.clone()),
            None => (RemoteBuildStatus::InProgress, Vec::new()),
        };
        if build.cursor < frames.len() {
            build.cursor += 1;
        }

        Ok(BuildSnapshot {
            job_id: job_id.to_string(),
            status,
            end_time: if status.is_terminal() {
                phases.iter().filter_map(|p| p.end_time).max()
            } else {
                None
            },
            phases,
            log: Some(build.log.clone()),
            start_time: script_time(0),
        })
    }

    fn fetch_log_tail(&self, log: &LogPointer, max_lines: usize) -> CloudResult<Vec<String>> {
        self.enter(CloudOp::GetLogEvents)?;
        let state = lock(&self.state);
        let build = state
            .builds
            .values()
            .find(|b| &b.log == log)
            .ok_or_else(|| CloudError::not_found(format!("log stream {}", log)))?;
        let lines = &build.script.log_lines;
        let start = lines.len().saturating_sub(max_lines);
        Ok(lines[start..].to_vec())
    }
}

impl RuntimeService for MockCloud {
    fn create_runtime(&self, target: &RuntimeTarget) -> CloudResult<RuntimeInfo> {
        self.enter(CloudOp::CreateRuntime)?;
        let mut state = lock(&self.state);
        if let Some(existing) = state.runtimes.values().find(|r| r.name == target.name) {
            return Err(CloudError::Conflict {
                resource: format!("runtime {}", target.name),
                message: format!("An agent runtime named {} already exists ({})", target.name, existing.id),
            });
        }
        let info = self.new_runtime(&mut state, target, RuntimeStatus::Creating);
        state.runtimes.insert(info.id.clone(), info.clone());
        Ok(info)
    }

    fn find_runtime(&self, name: &str) -> CloudResult<RuntimeInfo> {
        self.enter(CloudOp::FindRuntime)?;
        lock(&self.state)
            .runtimes
            .values()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("runtime {}", name)))
    }

    fn get_runtime(&self, runtime_id: &str) -> CloudResult<RuntimeInfo> {
        self.enter(CloudOp::GetRuntime)?;
        let settle = lock(&self.runtime_settle).clone();
        let mut state = lock(&self.state);
        let info = state
            .runtimes
            .get_mut(runtime_id)
            .ok_or_else(|| CloudError::not_found(format!("runtime {}", runtime_id)))?;
        if matches!(info.status, RuntimeStatus::Creating | RuntimeStatus::Updating) {
            info.status = match (&info.status, settle) {
                (RuntimeStatus::Updating, RuntimeStatus::CreateFailed) => RuntimeStatus::UpdateFailed,
                (_, status) => status,
            };
        }
        Ok(info.clone())
    }

    fn update_runtime(&self, runtime_id: &str, target: &RuntimeTarget) -> CloudResult<RuntimeInfo> {
        self.enter(CloudOp::UpdateRuntime)?;
        let mut state = lock(&self.state);
        let info = state
            .runtimes
            .get_mut(runtime_id)
            .ok_or_else(|| CloudError::not_found(format!("runtime {}", runtime_id)))?;
        info.image_reference = target.image_reference.clone();
        info.role_reference = target.role_reference.clone();
        info.environment_variables = target.environment_variables.clone();
        info.status = RuntimeStatus::Updating;
        Ok(info.clone())
    }
}
