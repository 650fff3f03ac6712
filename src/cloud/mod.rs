//! Cloud service seams
//!
//! Each remote service the orchestrator talks to is a trait so that the
//! pipeline can run against the `aws` CLI in production and against the
//! in-process [`crate::mock::MockCloud`] in tests. Components never reach
//! for an ambient client: they receive a [`CloudContext`] explicitly.

pub mod aws_cli;
mod error;
mod retry;
mod types;

use std::sync::Arc;

pub use aws_cli::{AwsCliConfig, AwsCliProvider};
pub use error::{CloudError, CloudResult};
pub use retry::RetryPolicy;
pub use types::{
    BuildSnapshot, LogPointer, ProjectSpec, RemoteBuildStatus, RemotePhase, RemotePhaseStatus,
    RepositoryInfo, RoleInfo, RuntimeInfo, RuntimeStatus, StartBuildRequest,
};

use crate::deploy::RuntimeTarget;

/// The provider's default region
///
/// Bucket creation in this region must not carry a location constraint.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Every remote operation the orchestrator issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CloudOp {
    GetCallerIdentity,
    HeadBucket,
    CreateBucket,
    PutBucketLifecycle,
    HeadObject,
    PutObject,
    GetRole,
    CreateRole,
    PutRolePolicy,
    DescribeRepository,
    CreateRepository,
    GetProject,
    CreateProject,
    UpdateProject,
    StartBuild,
    GetBuild,
    GetLogEvents,
    CreateRuntime,
    FindRuntime,
    GetRuntime,
    UpdateRuntime,
}

impl CloudOp {
    /// Operation name as it appears in logs
    pub fn name(&self) -> &'static str {
        match self {
            CloudOp::GetCallerIdentity => "GetCallerIdentity",
            CloudOp::HeadBucket => "HeadBucket",
            CloudOp::CreateBucket => "CreateBucket",
            CloudOp::PutBucketLifecycle => "PutBucketLifecycleConfiguration",
            CloudOp::HeadObject => "HeadObject",
            CloudOp::PutObject => "PutObject",
            CloudOp::GetRole => "GetRole",
            CloudOp::CreateRole => "CreateRole",
            CloudOp::PutRolePolicy => "PutRolePolicy",
            CloudOp::DescribeRepository => "DescribeRepositories",
            CloudOp::CreateRepository => "CreateRepository",
            CloudOp::GetProject => "BatchGetProjects",
            CloudOp::CreateProject => "CreateProject",
            CloudOp::UpdateProject => "UpdateProject",
            CloudOp::StartBuild => "StartBuild",
            CloudOp::GetBuild => "BatchGetBuilds",
            CloudOp::GetLogEvents => "GetLogEvents",
            CloudOp::CreateRuntime => "CreateAgentRuntime",
            CloudOp::FindRuntime => "ListAgentRuntimes",
            CloudOp::GetRuntime => "GetAgentRuntime",
            CloudOp::UpdateRuntime => "UpdateAgentRuntime",
        }
    }

    /// IAM action required to issue this operation
    ///
    /// Used to name the missing permission when a service denies access
    /// without saying which action it checked.
    pub fn iam_action(&self) -> &'static str {
        match self {
            CloudOp::GetCallerIdentity => "sts:GetCallerIdentity",
            CloudOp::HeadBucket => "s3:ListBucket",
            CloudOp::CreateBucket => "s3:CreateBucket",
            CloudOp::PutBucketLifecycle => "s3:PutLifecycleConfiguration",
            CloudOp::HeadObject => "s3:GetObject",
            CloudOp::PutObject => "s3:PutObject",
            CloudOp::GetRole => "iam:GetRole",
            CloudOp::CreateRole => "iam:CreateRole",
            CloudOp::PutRolePolicy => "iam:PutRolePolicy",
            CloudOp::DescribeRepository => "ecr:DescribeRepositories",
            CloudOp::CreateRepository => "ecr:CreateRepository",
            CloudOp::GetProject => "codebuild:BatchGetProjects",
            CloudOp::CreateProject => "codebuild:CreateProject",
            CloudOp::UpdateProject => "codebuild:UpdateProject",
            CloudOp::StartBuild => "codebuild:StartBuild",
            CloudOp::GetBuild => "codebuild:BatchGetBuilds",
            CloudOp::GetLogEvents => "logs:GetLogEvents",
            CloudOp::CreateRuntime => "bedrock-agentcore:CreateAgentRuntime",
            CloudOp::FindRuntime => "bedrock-agentcore:ListAgentRuntimes",
            CloudOp::GetRuntime => "bedrock-agentcore:GetAgentRuntime",
            CloudOp::UpdateRuntime => "bedrock-agentcore:UpdateAgentRuntime",
        }
    }
}

/// Caller identity lookup
pub trait AccountService: Send + Sync {
    fn account_id(&self) -> CloudResult<String>;
}

/// Object storage for source archives
pub trait ObjectStore: Send + Sync {
    /// `Err(NotFound)` when the bucket does not exist
    fn head_bucket(&self, bucket: &str) -> CloudResult<()>;

    /// Create a bucket; `location_constraint` must be `None` in the default region
    fn create_bucket(&self, bucket: &str, location_constraint: Option<&str>) -> CloudResult<()>;

    /// Expire every object in the bucket after `days`
    fn put_lifecycle_expiration(&self, bucket: &str, days: u32) -> CloudResult<()>;

    fn object_exists(&self, bucket: &str, key: &str) -> CloudResult<bool>;

    fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> CloudResult<()>;
}

/// Execution roles and their policies
pub trait IdentityService: Send + Sync {
    fn get_role(&self, name: &str) -> CloudResult<RoleInfo>;

    fn create_role(&self, name: &str, trust_policy: &str, description: &str) -> CloudResult<RoleInfo>;

    /// Attach an inline policy; `Err(AlreadyExists)` is treated as success by callers
    fn attach_role_policy(&self, role: &str, policy_name: &str, document: &str) -> CloudResult<()>;
}

/// Container image registry
pub trait ImageRegistry: Send + Sync {
    fn describe_repository(&self, name: &str) -> CloudResult<RepositoryInfo>;

    fn create_repository(&self, name: &str) -> CloudResult<RepositoryInfo>;
}

/// Remote container build service
pub trait BuildService: Send + Sync {
    fn get_project(&self, name: &str) -> CloudResult<ProjectSpec>;

    fn create_project(&self, spec: &ProjectSpec) -> CloudResult<()>;

    fn update_project(&self, spec: &ProjectSpec) -> CloudResult<()>;

    /// Start a build; returns the first snapshot (carrying the job id)
    fn start_build(&self, request: &StartBuildRequest) -> CloudResult<BuildSnapshot>;

    fn get_build(&self, job_id: &str) -> CloudResult<BuildSnapshot>;

    /// Last `max_lines` lines of the build log
    fn fetch_log_tail(&self, log: &LogPointer, max_lines: usize) -> CloudResult<Vec<String>>;
}

/// Managed agent runtime service
pub trait RuntimeService: Send + Sync {
    /// `Err(Conflict)` when a runtime with the same name already exists
    fn create_runtime(&self, target: &RuntimeTarget) -> CloudResult<RuntimeInfo>;

    /// Look a runtime up by name; `Err(NotFound)` when absent
    fn find_runtime(&self, name: &str) -> CloudResult<RuntimeInfo>;

    fn get_runtime(&self, runtime_id: &str) -> CloudResult<RuntimeInfo>;

    fn update_runtime(&self, runtime_id: &str, target: &RuntimeTarget) -> CloudResult<RuntimeInfo>;
}

/// A provider implementing every service seam
pub trait CloudProvider:
    AccountService + ObjectStore + IdentityService + ImageRegistry + BuildService + RuntimeService
{
}

impl<T> CloudProvider for T where
    T: AccountService + ObjectStore + IdentityService + ImageRegistry + BuildService + RuntimeService
{
}

/// Explicit client context handed to every pipeline component
#[derive(Clone)]
pub struct CloudContext {
    pub region: String,
    pub account_id: String,
    pub storage: Arc<dyn ObjectStore>,
    pub identity: Arc<dyn IdentityService>,
    pub registry: Arc<dyn ImageRegistry>,
    pub builds: Arc<dyn BuildService>,
    pub runtimes: Arc<dyn RuntimeService>,
}

impl CloudContext {
    /// Build a context from a single provider, resolving the account id
    pub fn connect<P>(provider: Arc<P>, region: &str, retry: &RetryPolicy) -> CloudResult<Self>
    where
        P: CloudProvider + 'static,
    {
        let account_id = retry.run(CloudOp::GetCallerIdentity, || provider.account_id())?;
        Ok(Self::with_account(provider, region, &account_id))
    }

    /// Build a context when the account id is already known
    pub fn with_account<P>(provider: Arc<P>, region: &str, account_id: &str) -> Self
    where
        P: CloudProvider + 'static,
    {
        Self {
            region: region.to_string(),
            account_id: account_id.to_string(),
            storage: provider.clone(),
            identity: provider.clone(),
            registry: provider.clone(),
            builds: provider.clone(),
            runtimes: provider,
        }
    }
}

impl std::fmt::Debug for CloudContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudContext")
            .field("region", &self.region)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailureConfig, MockCloud};

    #[test]
    fn test_connect_resolves_account() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let ctx = CloudContext::connect(mock.clone(), "us-west-2", &RetryPolicy::none()).unwrap();
        assert_eq!(ctx.account_id, mock.account());
        assert_eq!(ctx.region, "us-west-2");
    }

    #[test]
    fn test_connect_follows_given_retry_policy() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        mock.inject(CloudOp::GetCallerIdentity, FailureConfig::transient().with_fail_count(2));

        let err = CloudContext::connect(mock.clone(), "us-west-2", &RetryPolicy::immediate(1)).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(mock.calls(CloudOp::GetCallerIdentity), 2);

        let ctx = CloudContext::connect(mock.clone(), "us-west-2", &RetryPolicy::immediate(1)).unwrap();
        assert_eq!(ctx.account_id, mock.account());
    }
}
