//! Runtime deployment with conflict resolution
//!
//! A deploy always tries CREATE first. A name conflict is either reported
//! to the caller or, when auto-update is enabled, resolved by updating the
//! existing runtime in place. Either way the deployer then waits for the
//! runtime to settle.

use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cloud::{CloudContext, CloudError, CloudOp, RetryPolicy, RuntimeInfo, RuntimeStatus};
use crate::error::{LaunchError, LaunchResult};

/// Network exposure of a runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkMode {
    #[default]
    Public,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Public => "PUBLIC",
        }
    }
}

/// Desired state of the managed runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeTarget {
    pub name: String,
    pub image_reference: String,
    pub role_reference: String,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

impl RuntimeTarget {
    pub fn new(
        name: impl Into<String>,
        image_reference: impl Into<String>,
        role_reference: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image_reference: image_reference.into(),
            role_reference: role_reference.into(),
            network_mode: NetworkMode::Public,
            environment_variables: BTreeMap::new(),
        }
    }

    /// Add environment variables; a repeated key keeps the last value
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.environment_variables.insert(k.into(), v.into());
        }
        self
    }
}

/// Difference between an existing runtime and the target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDelta {
    /// `(old, new)` image reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<(String, String)>,
    /// `(old, new)` role reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<(String, String)>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env_added: BTreeMap<String, String>,
    /// Key → `(old, new)`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env_changed: BTreeMap<String, (String, String)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env_removed: Vec<String>,
}

impl RuntimeDelta {
    pub fn compute(existing: &RuntimeInfo, target: &RuntimeTarget) -> Self {
        let mut delta = RuntimeDelta::default();

        if existing.image_reference != target.image_reference {
            delta.image = Some((existing.image_reference.clone(), target.image_reference.clone()));
        }
        if existing.role_reference != target.role_reference {
            delta.role = Some((existing.role_reference.clone(), target.role_reference.clone()));
        }

        for (key, new) in &target.environment_variables {
            match existing.environment_variables.get(key) {
                None => {
                    delta.env_added.insert(key.clone(), new.clone());
                }
                Some(old) if old != new => {
                    delta.env_changed.insert(key.clone(), (old.clone(), new.clone()));
                }
                Some(_) => {}
            }
        }
        delta.env_removed = existing
            .environment_variables
            .keys()
            .filter(|k| !target.environment_variables.contains_key(*k))
            .cloned()
            .collect();

        delta
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_none()
            && self.role.is_none()
            && self.env_added.is_empty()
            && self.env_changed.is_empty()
            && self.env_removed.is_empty()
    }
}

impl fmt::Display for RuntimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "no changes");
        }
        let mut parts = Vec::new();
        if let Some((_, new)) = &self.image {
            parts.push(format!("image -> {}", new));
        }
        if let Some((_, new)) = &self.role {
            parts.push(format!("role -> {}", new));
        }
        for key in self.env_added.keys() {
            parts.push(format!("+env {}", key));
        }
        for key in self.env_changed.keys() {
            parts.push(format!("~env {}", key));
        }
        for key in &self.env_removed {
            parts.push(format!("-env {}", key));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// What the deployer did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "delta", rename_all = "snake_case")]
pub enum DeployAction {
    Created,
    Updated(RuntimeDelta),
}

impl DeployAction {
    pub fn label(&self) -> &'static str {
        match self {
            DeployAction::Created => "CREATE",
            DeployAction::Updated(_) => "UPDATE",
        }
    }
}

/// Outcome of a deploy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResult {
    pub runtime_id: String,
    pub runtime_arn: String,
    pub action: DeployAction,
    pub status: RuntimeStatus,
}

/// Deployer tuning
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Upper bound on the wait for READY
    pub ready_timeout: Duration,
    /// Interval between readiness checks
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Creates or updates the managed runtime
pub struct RuntimeDeployer<'a> {
    ctx: &'a CloudContext,
    config: DeployConfig,
}

impl<'a> RuntimeDeployer<'a> {
    pub fn new(ctx: &'a CloudContext, config: DeployConfig) -> Self {
        Self { ctx, config }
    }

    /// Create the runtime, resolving a name conflict per `auto_update_on_conflict`
    pub fn deploy(&self, target: &RuntimeTarget, auto_update_on_conflict: bool) -> LaunchResult<DeployResult> {
        let retry = &self.config.retry;
        let runtimes = &self.ctx.runtimes;

        // CREATE is not idempotent; only retry when the service throttled it
        let created = retry.run_when(
            CloudOp::CreateRuntime,
            |e| matches!(e, CloudError::Throttled { .. }),
            || runtimes.create_runtime(target),
        );

        let (info, action) = match created {
            Ok(info) => {
                info!(runtime = %target.name, runtime_id = %info.id, "runtime created");
                (info, DeployAction::Created)
            }
            Err(CloudError::Conflict { .. }) | Err(CloudError::AlreadyExists { .. }) => {
                let found = retry.run(CloudOp::FindRuntime, || runtimes.find_runtime(&target.name));

                if !auto_update_on_conflict {
                    let runtime_id = match found {
                        Ok(existing) => Some(existing.id),
                        Err(e) => {
                            warn!(runtime = %target.name, error = %e, "could not look up the existing runtime");
                            None
                        }
                    };
                    return Err(LaunchError::Conflict {
                        name: target.name.clone(),
                        runtime_id,
                    });
                }

                let existing = found.map_err(|e| self.deploy_error(target, CloudOp::FindRuntime, e))?;

                let delta = RuntimeDelta::compute(&existing, target);
                info!(
                    runtime = %target.name,
                    runtime_id = %existing.id,
                    changes = %delta,
                    "runtime exists, updating in place"
                );
                let updated = retry
                    .run_when(
                        CloudOp::UpdateRuntime,
                        |e| matches!(e, CloudError::Throttled { .. }),
                        || runtimes.update_runtime(&existing.id, target),
                    )
                    .map_err(|e| self.deploy_error(target, CloudOp::UpdateRuntime, e))?;
                (updated, DeployAction::Updated(delta))
            }
            Err(e) => return Err(self.deploy_error(target, CloudOp::CreateRuntime, e)),
        };

        let status = self.wait_ready(target, &info)?;
        Ok(DeployResult {
            runtime_id: info.id,
            runtime_arn: info.arn,
            action,
            status,
        })
    }

    /// Poll until the runtime settles or the readiness bound elapses
    fn wait_ready(&self, target: &RuntimeTarget, info: &RuntimeInfo) -> LaunchResult<RuntimeStatus> {
        let started = Instant::now();
        let mut status = info.status.clone();

        loop {
            if status == RuntimeStatus::Ready {
                info!(runtime = %target.name, runtime_id = %info.id, "runtime ready");
                return Ok(status);
            }
            if status.is_failed() {
                return Err(LaunchError::Deployment {
                    name: target.name.clone(),
                    message: format!("runtime {} reported {}", info.id, status),
                });
            }
            if started.elapsed() >= self.config.ready_timeout {
                warn!(runtime = %target.name, status = %status, "runtime not ready in time");
                return Err(LaunchError::Deployment {
                    name: target.name.clone(),
                    message: format!(
                        "runtime {} still {} after {}s",
                        info.id,
                        status,
                        self.config.ready_timeout.as_secs()
                    ),
                });
            }

            thread::sleep(self.config.poll_interval);
            status = self
                .config
                .retry
                .run(CloudOp::GetRuntime, || self.ctx.runtimes.get_runtime(&info.id))
                .map_err(|e| self.deploy_error(target, CloudOp::GetRuntime, e))?
                .status;
        }
    }

    fn deploy_error(&self, target: &RuntimeTarget, op: CloudOp, err: CloudError) -> LaunchError {
        match err {
            CloudError::AccessDenied { .. } => {
                LaunchError::from_cloud(format!("runtime {}", target.name), op, err)
            }
            other => LaunchError::Deployment {
                name: target.name.clone(),
                message: format!("{} failed: {}", op.name(), other),
            },
        }
    }
}
