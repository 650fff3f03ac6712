//! Idempotent infrastructure provisioning
//!
//! Every resource goes through the same sequence: look it up, create it
//! when missing, and look it up again when the create lost a race to
//! another writer. Running [`Provisioner::ensure`] twice in a row issues
//! no create calls the second time.

pub mod naming;
pub mod policy;

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::build::BUILDSPEC_FILE;
use crate::cloud::{
    CloudContext, CloudOp, CloudResult, ProjectSpec, RetryPolicy, RoleInfo, DEFAULT_REGION,
};
use crate::error::{LaunchError, LaunchResult};

/// Provisioner tuning
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Wait after creating a role before anything assumes it
    pub role_propagation_wait: Duration,
    /// Source archives expire after this many days
    pub lifecycle_days: u32,
    pub retry: RetryPolicy,
    /// Build environment image
    pub build_image: String,
    pub compute_type: String,
    pub environment_type: String,
    pub project_timeout_minutes: u32,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            role_propagation_wait: Duration::from_secs(10),
            lifecycle_days: 7,
            retry: RetryPolicy::default(),
            build_image: "aws/codebuild/amazonlinux2-aarch64-standard:3.0".to_string(),
            compute_type: "BUILD_GENERAL1_LARGE".to_string(),
            environment_type: "ARM_CONTAINER".to_string(),
            project_timeout_minutes: 60,
        }
    }
}

/// Previously provisioned resources that may be reused without calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionHints {
    pub runtime_role_arn: Option<String>,
    pub build_role_arn: Option<String>,
    pub repository_uri: Option<String>,
}

/// Everything a build and deployment of one agent needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureSet {
    pub agent_name: String,
    pub region: String,
    pub account_id: String,
    pub bucket: String,
    pub runtime_role_arn: String,
    pub build_role_arn: String,
    pub repository_uri: String,
    pub project_name: String,
}

/// A resource that now exists, and whether this run created it
struct Ensured<T> {
    value: T,
    created: bool,
}

/// Ensures the per-agent cloud resources exist
pub struct Provisioner<'a> {
    ctx: &'a CloudContext,
    config: ProvisionConfig,
}

impl<'a> Provisioner<'a> {
    pub fn new(ctx: &'a CloudContext, config: ProvisionConfig) -> Self {
        Self { ctx, config }
    }

    /// Ensure every resource for `agent_name` exists in `region`
    pub fn ensure(&self, agent_name: &str, region: &str) -> LaunchResult<InfrastructureSet> {
        self.ensure_with(agent_name, region, &ProvisionHints::default())
    }

    /// Like [`Provisioner::ensure`], reusing hinted roles and repository
    ///
    /// A hinted resource costs one lookup instead of the full ensure
    /// sequence. Hints for resources deleted since are dropped and the
    /// resource is provisioned again.
    pub fn ensure_with(
        &self,
        agent_name: &str,
        region: &str,
        hints: &ProvisionHints,
    ) -> LaunchResult<InfrastructureSet> {
        self.check_target(agent_name, region)?;
        let account_id = self.ctx.account_id.as_str();
        info!(agent = %agent_name, region = %region, "provisioning infrastructure");

        let bucket = naming::bucket_name(account_id, region);
        self.ensure_bucket(&bucket, region)?;

        let repository_name = naming::repository_name(agent_name);
        let mut role_created = false;

        let runtime_role_name = naming::runtime_role_name(agent_name, region);
        let runtime_role_arn = match self.recorded_role(&runtime_role_name, hints.runtime_role_arn.as_deref())? {
            Some(arn) => arn,
            None => {
                let role = self.ensure_runtime_role_named(agent_name, region, &repository_name)?;
                role_created |= role.created;
                role.value.arn
            }
        };

        let project_name = naming::project_name(agent_name);
        let build_role_name = naming::build_role_name(agent_name, region);
        let build_role_arn = match self.recorded_role(&build_role_name, hints.build_role_arn.as_deref())? {
            Some(arn) => arn,
            None => {
                let role = self.ensure_role(
                    &build_role_name,
                    &policy::build_trust_policy(account_id).to_string(),
                    "Builds agent-launch container images",
                    policy::BUILD_POLICY_NAME,
                    &policy::build_permissions(region, account_id, &bucket, &repository_name, &project_name)
                        .to_string(),
                )?;
                role_created |= role.created;
                role.value.arn
            }
        };

        let repository_uri = match self.recorded_repository(&repository_name, hints.repository_uri.as_deref())? {
            Some(uri) => uri,
            None => self.ensure_repository(&repository_name)?,
        };

        if role_created {
            self.wait_for_role_propagation();
        }

        self.ensure_project(&ProjectSpec {
            name: project_name.clone(),
            role_arn: build_role_arn.clone(),
            source_bucket: bucket.clone(),
            buildspec_path: BUILDSPEC_FILE.to_string(),
            image: self.config.build_image.clone(),
            compute_type: self.config.compute_type.clone(),
            environment_type: self.config.environment_type.clone(),
            privileged: true,
            timeout_minutes: self.config.project_timeout_minutes,
        })?;

        info!(agent = %agent_name, bucket = %bucket, project = %project_name, "infrastructure ready");
        Ok(InfrastructureSet {
            agent_name: agent_name.to_string(),
            region: region.to_string(),
            account_id: account_id.to_string(),
            bucket,
            runtime_role_arn,
            build_role_arn,
            repository_uri,
            project_name,
        })
    }

    /// Ensure only the runtime role (deploying a prebuilt image)
    pub fn ensure_runtime_role(&self, agent_name: &str, region: &str) -> LaunchResult<String> {
        self.check_target(agent_name, region)?;
        // The image may live in any repository of the account
        let role = self.ensure_runtime_role_named(agent_name, region, "*")?;
        if role.created {
            self.wait_for_role_propagation();
        }
        Ok(role.value.arn)
    }

    fn check_target(&self, agent_name: &str, region: &str) -> LaunchResult<()> {
        naming::validate_agent_name(agent_name).map_err(|e| LaunchError::Config(e.to_string()))?;
        if region != self.ctx.region {
            return Err(LaunchError::Config(format!(
                "region {} does not match the cloud context region {}",
                region, self.ctx.region
            )));
        }
        Ok(())
    }

    /// ARN of a hinted role that still exists
    fn recorded_role(&self, name: &str, hint: Option<&str>) -> LaunchResult<Option<String>> {
        let Some(arn) = hint else {
            return Ok(None);
        };
        let identity = &self.ctx.identity;
        match self.config.retry.run(CloudOp::GetRole, || identity.get_role(name)) {
            Ok(role) => {
                debug!(role = %role.arn, "reusing recorded role");
                Ok(Some(role.arn))
            }
            Err(e) if e.is_not_found() => {
                warn!(role = %arn, "recorded role no longer exists, provisioning it again");
                Ok(None)
            }
            Err(e) => Err(LaunchError::from_cloud(&format!("role {}", name), CloudOp::GetRole, e)),
        }
    }

    /// URI of a hinted repository that still exists
    fn recorded_repository(&self, name: &str, hint: Option<&str>) -> LaunchResult<Option<String>> {
        let Some(uri) = hint else {
            return Ok(None);
        };
        let registry = &self.ctx.registry;
        match self
            .config
            .retry
            .run(CloudOp::DescribeRepository, || registry.describe_repository(name))
        {
            Ok(repository) => {
                debug!(repository = %repository.uri, "reusing recorded repository");
                Ok(Some(repository.uri))
            }
            Err(e) if e.is_not_found() => {
                warn!(repository = %uri, "recorded repository no longer exists, creating it again");
                Ok(None)
            }
            Err(e) => Err(LaunchError::from_cloud(
                &format!("repository {}", name),
                CloudOp::DescribeRepository,
                e,
            )),
        }
    }

    fn wait_for_role_propagation(&self) {
        let wait = self.config.role_propagation_wait;
        if !wait.is_zero() {
            info!(wait_secs = wait.as_secs(), "waiting for new roles to propagate");
            thread::sleep(wait);
        }
    }

    /// Get, create when missing, get again when the create lost a race
    fn fetch_or_create<T>(
        &self,
        resource: &str,
        fetch_op: CloudOp,
        create_op: CloudOp,
        fetch: impl Fn() -> CloudResult<T>,
        create: impl Fn() -> CloudResult<T>,
    ) -> LaunchResult<Ensured<T>> {
        let retry = &self.config.retry;
        match retry.run(fetch_op, &fetch) {
            Ok(value) => {
                debug!(resource = %resource, "already exists");
                return Ok(Ensured { value, created: false });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(LaunchError::from_cloud(resource, fetch_op, e)),
        }

        match retry.run(create_op, &create) {
            Ok(value) => {
                info!(resource = %resource, "created");
                Ok(Ensured { value, created: true })
            }
            Err(e) if e.is_already_exists() => {
                debug!(resource = %resource, "created concurrently, fetching");
                let value = retry
                    .run(fetch_op, &fetch)
                    .map_err(|e| LaunchError::from_cloud(resource, fetch_op, e))?;
                Ok(Ensured { value, created: false })
            }
            Err(e) => Err(LaunchError::from_cloud(resource, create_op, e)),
        }
    }

    fn ensure_bucket(&self, bucket: &str, region: &str) -> LaunchResult<()> {
        let storage = &self.ctx.storage;
        // The default region rejects an explicit constraint
        let constraint = (region != DEFAULT_REGION).then_some(region);
        let resource = format!("bucket {}", bucket);

        let ensured = self.fetch_or_create(
            &resource,
            CloudOp::HeadBucket,
            CloudOp::CreateBucket,
            || storage.head_bucket(bucket),
            || storage.create_bucket(bucket, constraint),
        )?;

        if ensured.created {
            let days = self.config.lifecycle_days;
            self.config
                .retry
                .run(CloudOp::PutBucketLifecycle, || {
                    storage.put_lifecycle_expiration(bucket, days)
                })
                .map_err(|e| LaunchError::from_cloud(&resource, CloudOp::PutBucketLifecycle, e))?;
        }
        Ok(())
    }

    fn ensure_runtime_role_named(
        &self,
        agent_name: &str,
        region: &str,
        repository: &str,
    ) -> LaunchResult<Ensured<RoleInfo>> {
        let account_id = self.ctx.account_id.as_str();
        self.ensure_role(
            &naming::runtime_role_name(agent_name, region),
            &policy::runtime_trust_policy(region, account_id).to_string(),
            "Execution role for an agent-launch agent runtime",
            policy::RUNTIME_POLICY_NAME,
            &policy::runtime_permissions(region, account_id, repository).to_string(),
        )
    }

    fn ensure_role(
        &self,
        name: &str,
        trust_policy: &str,
        description: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> LaunchResult<Ensured<RoleInfo>> {
        let identity = &self.ctx.identity;
        let resource = format!("role {}", name);

        let role = self.fetch_or_create(
            &resource,
            CloudOp::GetRole,
            CloudOp::CreateRole,
            || identity.get_role(name),
            || identity.create_role(name, trust_policy, description),
        )?;

        let attached = self.config.retry.run(CloudOp::PutRolePolicy, || {
            identity.attach_role_policy(name, policy_name, policy_document)
        });
        match attached {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => debug!(role = %name, policy = %policy_name, "policy already attached"),
            Err(e) => return Err(LaunchError::from_cloud(&resource, CloudOp::PutRolePolicy, e)),
        }
        Ok(role)
    }

    fn ensure_repository(&self, name: &str) -> LaunchResult<String> {
        let registry = &self.ctx.registry;
        let ensured = self.fetch_or_create(
            &format!("repository {}", name),
            CloudOp::DescribeRepository,
            CloudOp::CreateRepository,
            || registry.describe_repository(name),
            || registry.create_repository(name),
        )?;
        Ok(ensured.value.uri)
    }

    fn ensure_project(&self, desired: &ProjectSpec) -> LaunchResult<()> {
        let builds = &self.ctx.builds;
        let resource = format!("project {}", desired.name);

        let ensured = self.fetch_or_create(
            &resource,
            CloudOp::GetProject,
            CloudOp::CreateProject,
            || builds.get_project(&desired.name),
            || builds.create_project(desired).map(|()| desired.clone()),
        )?;
        if ensured.created {
            return Ok(());
        }

        let drift = project_drift(&ensured.value, desired);
        if drift.is_empty() {
            return Ok(());
        }
        warn!(project = %desired.name, fields = %drift.join(","), "project drifted, updating");
        self.config
            .retry
            .run(CloudOp::UpdateProject, || builds.update_project(desired))
            .map_err(|e| LaunchError::from_cloud(&resource, CloudOp::UpdateProject, e))
    }
}

/// Names of the fields where `existing` differs from `desired`
fn project_drift(existing: &ProjectSpec, desired: &ProjectSpec) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if existing.role_arn != desired.role_arn {
        fields.push("role");
    }
    if existing.image != desired.image {
        fields.push("image");
    }
    if existing.compute_type != desired.compute_type {
        fields.push("compute_type");
    }
    if existing.environment_type != desired.environment_type {
        fields.push("environment_type");
    }
    if existing.source_bucket != desired.source_bucket {
        fields.push("source_bucket");
    }
    if existing.buildspec_path != desired.buildspec_path {
        fields.push("buildspec");
    }
    if existing.privileged != desired.privileged {
        fields.push("privileged");
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailureConfig, MockCloud};
    use std::sync::Arc;

    fn fast_config() -> ProvisionConfig {
        ProvisionConfig {
            role_propagation_wait: Duration::ZERO,
            retry: RetryPolicy::immediate(3),
            ..Default::default()
        }
    }

    fn context(mock: &Arc<MockCloud>, region: &str) -> CloudContext {
        CloudContext::with_account(mock.clone(), region, mock.account())
    }

    #[test]
    fn test_ensure_creates_everything() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");

        let infra = Provisioner::new(&ctx, fast_config())
            .ensure("my_agent", "us-west-2")
            .unwrap();

        assert_eq!(infra.bucket, "agent-launch-sources-123456789012-us-west-2");
        assert_eq!(mock.role_count(), 2);
        assert!(infra.repository_uri.ends_with("/agent-launch-my-agent"));
        let project = mock.project(&infra.project_name).unwrap();
        assert_eq!(project.role_arn, infra.build_role_arn);
        assert_eq!(project.buildspec_path, BUILDSPEC_FILE);
        assert_eq!(mock.create_calls(), 5);
    }

    #[test]
    fn test_second_run_creates_nothing() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");
        let provisioner = Provisioner::new(&ctx, fast_config());

        let first = provisioner.ensure("my_agent", "us-west-2").unwrap();
        mock.reset_calls();
        let second = provisioner.ensure("my_agent", "us-west-2").unwrap();

        assert_eq!(first, second);
        assert_eq!(mock.create_calls(), 0);
        assert_eq!(mock.calls(CloudOp::UpdateProject), 0);
    }

    #[test]
    fn test_default_region_bucket_has_no_constraint() {
        let mock = Arc::new(MockCloud::new("us-east-1"));
        let ctx = context(&mock, "us-east-1");
        let infra = Provisioner::new(&ctx, fast_config())
            .ensure("my_agent", "us-east-1")
            .unwrap();

        let bucket = mock.bucket(&infra.bucket).unwrap();
        assert_eq!(bucket.location_constraint, None);
        assert_eq!(bucket.lifecycle_days, Some(7));
    }

    #[test]
    fn test_other_region_bucket_has_constraint() {
        let mock = Arc::new(MockCloud::new("eu-west-1"));
        let ctx = context(&mock, "eu-west-1");
        let infra = Provisioner::new(&ctx, fast_config())
            .ensure("my_agent", "eu-west-1")
            .unwrap();

        let bucket = mock.bucket(&infra.bucket).unwrap();
        assert_eq!(bucket.location_constraint.as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn test_lost_create_race_is_tolerated() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");
        mock.race_next_create(CloudOp::CreateRole);
        mock.race_next_create(CloudOp::CreateRepository);

        let infra = Provisioner::new(&ctx, fast_config())
            .ensure("my_agent", "us-west-2")
            .unwrap();
        assert!(infra.runtime_role_arn.contains("AgentLaunchRuntime-"));
        assert!(!infra.repository_uri.is_empty());
    }

    #[test]
    fn test_access_denied_aborts_without_retry() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");
        mock.inject(CloudOp::CreateRole, FailureConfig::access_denied("iam:CreateRole"));

        let err = Provisioner::new(&ctx, fast_config())
            .ensure("my_agent", "us-west-2")
            .unwrap_err();

        match err {
            LaunchError::Permission { action, resource, .. } => {
                assert_eq!(action, "iam:CreateRole");
                assert!(resource.starts_with("role AgentLaunchRuntime-"));
            }
            other => panic!("expected Permission, got {:?}", other),
        }
        assert_eq!(mock.calls(CloudOp::CreateRole), 1);
    }

    #[test]
    fn test_throttling_is_retried() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");
        mock.inject(
            CloudOp::CreateRepository,
            FailureConfig::throttled().with_fail_count(2),
        );

        Provisioner::new(&ctx, fast_config())
            .ensure("my_agent", "us-west-2")
            .unwrap();
        assert_eq!(mock.calls(CloudOp::CreateRepository), 3);
    }

    #[test]
    fn test_exhausted_retries_are_infrastructure_errors() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");
        mock.inject(CloudOp::CreateProject, FailureConfig::transient());

        let err = Provisioner::new(&ctx, fast_config())
            .ensure("my_agent", "us-west-2")
            .unwrap_err();
        assert_eq!(err.category(), "InfrastructureError");
        assert!(err.to_string().contains("project agent-launch-my_agent-builder"));
        assert_eq!(mock.calls(CloudOp::CreateProject), 4);
    }

    #[test]
    fn test_drifted_project_is_updated() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");
        Provisioner::new(&ctx, fast_config())
            .ensure("my_agent", "us-west-2")
            .unwrap();

        let bigger = ProvisionConfig {
            compute_type: "BUILD_GENERAL1_XLARGE".to_string(),
            ..fast_config()
        };
        let infra = Provisioner::new(&ctx, bigger)
            .ensure("my_agent", "us-west-2")
            .unwrap();

        assert_eq!(mock.calls(CloudOp::UpdateProject), 1);
        assert_eq!(
            mock.project(&infra.project_name).unwrap().compute_type,
            "BUILD_GENERAL1_XLARGE"
        );
    }

    #[test]
    fn test_hints_replace_ensure_with_lookups() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");
        let provisioner = Provisioner::new(&ctx, fast_config());
        let first = provisioner.ensure("my_agent", "us-west-2").unwrap();
        mock.reset_calls();

        let hints = ProvisionHints {
            runtime_role_arn: Some(first.runtime_role_arn.clone()),
            build_role_arn: Some(first.build_role_arn.clone()),
            repository_uri: Some(first.repository_uri.clone()),
        };
        let second = provisioner.ensure_with("my_agent", "us-west-2", &hints).unwrap();

        assert_eq!(first, second);
        assert_eq!(mock.calls(CloudOp::GetRole), 2);
        assert_eq!(mock.calls(CloudOp::PutRolePolicy), 0);
        assert_eq!(mock.calls(CloudOp::DescribeRepository), 1);
        assert_eq!(mock.calls(CloudOp::HeadBucket), 1);
        assert_eq!(mock.calls(CloudOp::GetProject), 1);
        assert_eq!(mock.create_calls(), 0);
    }

    #[test]
    fn test_deleted_hinted_resources_are_recreated() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");
        let provisioner = Provisioner::new(&ctx, fast_config());
        let first = provisioner.ensure("my_agent", "us-west-2").unwrap();

        let runtime_role = naming::runtime_role_name("my_agent", "us-west-2");
        assert!(mock.delete_role(&runtime_role));
        assert!(mock.delete_repository(&naming::repository_name("my_agent")));
        mock.reset_calls();

        let hints = ProvisionHints {
            runtime_role_arn: Some(first.runtime_role_arn.clone()),
            build_role_arn: Some(first.build_role_arn.clone()),
            repository_uri: Some(first.repository_uri.clone()),
        };
        let second = provisioner.ensure_with("my_agent", "us-west-2", &hints).unwrap();

        assert_eq!(first, second);
        assert_eq!(mock.calls(CloudOp::CreateRole), 1);
        assert_eq!(mock.calls(CloudOp::CreateRepository), 1);
        let role = mock.role(&runtime_role).unwrap();
        assert!(role.policies.contains_key(policy::RUNTIME_POLICY_NAME));
    }

    #[test]
    fn test_hint_lookup_denied_is_permission_error() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");
        let provisioner = Provisioner::new(&ctx, fast_config());
        let first = provisioner.ensure("my_agent", "us-west-2").unwrap();
        mock.inject(CloudOp::GetRole, FailureConfig::access_denied("iam:GetRole"));

        let hints = ProvisionHints {
            runtime_role_arn: Some(first.runtime_role_arn),
            ..Default::default()
        };
        let err = provisioner.ensure_with("my_agent", "us-west-2", &hints).unwrap_err();
        assert_eq!(err.category(), "PermissionError");
    }

    #[test]
    fn test_runtime_role_only() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");

        let arn = Provisioner::new(&ctx, fast_config())
            .ensure_runtime_role("my_agent", "us-west-2")
            .unwrap();

        assert!(arn.contains("AgentLaunchRuntime-us-west-2-"));
        assert_eq!(mock.role_count(), 1);
        assert!(mock.bucket_names().is_empty());
    }

    #[test]
    fn test_invalid_agent_name_is_config_error() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = context(&mock, "us-west-2");
        let err = Provisioner::new(&ctx, fast_config())
            .ensure("bad-name", "us-west-2")
            .unwrap_err();
        assert_eq!(err.category(), "ConfigError");
        assert_eq!(mock.create_calls(), 0);
    }
}
