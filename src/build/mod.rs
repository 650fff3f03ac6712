//! Remote container builds
//!
//! [`BuildTrigger`] starts a build of an uploaded source archive and hands
//! back a PENDING [`BuildJob`]. Progress is tracked by the monitor.

mod buildspec;
mod job;
mod phase;

use std::collections::BTreeMap;

use tracing::info;

pub use buildspec::{
    render_buildspec, write_buildspec, BuildSpec, BuildSpecOptions, BuildSpecPhases, PhaseCommands, BUILDSPEC_FILE, BUILD_ENV_VARS,
    TARGET_PLATFORM,
};
pub use job::{BuildJob, BuildJobError, BuildStatus, FailureReport, PhaseTransition, SourceRef};
pub use phase::{Phase, PhaseStatus, STANDARD_PHASES};

use crate::bundle::SourceBundle;
use crate::cloud::{CloudContext, CloudError, CloudOp, RetryPolicy, StartBuildRequest};
use crate::error::{LaunchError, LaunchResult};
use crate::provision::{naming, InfrastructureSet};

/// Starts remote builds
pub struct BuildTrigger<'a> {
    ctx: &'a CloudContext,
    retry: RetryPolicy,
}

impl<'a> BuildTrigger<'a> {
    pub fn new(ctx: &'a CloudContext, retry: RetryPolicy) -> Self {
        Self { ctx, retry }
    }

    /// Environment every build receives
    pub fn build_environment(infra: &InfrastructureSet, image_tag: &str) -> BTreeMap<String, String> {
        let repo_name = infra
            .repository_uri
            .rsplit('/')
            .next()
            .unwrap_or(&infra.repository_uri);

        let mut env = BTreeMap::new();
        env.insert("AWS_ACCOUNT_ID".to_string(), infra.account_id.clone());
        env.insert("AWS_DEFAULT_REGION".to_string(), infra.region.clone());
        env.insert("IMAGE_REPO_NAME".to_string(), repo_name.to_string());
        env.insert("REPOSITORY_URI".to_string(), infra.repository_uri.clone());
        env.insert("IMAGE_TAG".to_string(), image_tag.to_string());
        env.insert(
            "STACK_ID".to_string(),
            naming::stack_id(&infra.agent_name, &infra.region),
        );
        env
    }

    /// Start a build of `bundle`, which must already be uploaded
    ///
    /// Does not wait for the build.
    pub fn trigger(
        &self,
        infra: &InfrastructureSet,
        bundle: &SourceBundle,
        image_tag: &str,
    ) -> LaunchResult<BuildJob> {
        let request = StartBuildRequest {
            project_name: infra.project_name.clone(),
            source_bucket: infra.bucket.clone(),
            source_key: bundle.storage_key.clone(),
            environment: Self::build_environment(infra, image_tag),
        };

        // A retried StartBuild after a lost response would start a second build
        let snapshot = self
            .retry
            .run_when(
                CloudOp::StartBuild,
                |e| matches!(e, CloudError::Throttled { .. }),
                || self.ctx.builds.start_build(&request),
            )
            .map_err(|e| {
                LaunchError::from_cloud(format!("project {}", infra.project_name), CloudOp::StartBuild, e)
            })?;

        let image_reference = format!("{}:{}", infra.repository_uri, image_tag);
        let mut job = BuildJob::new(
            snapshot.job_id.clone(),
            Some(SourceRef {
                bucket: infra.bucket.clone(),
                key: bundle.storage_key.clone(),
            }),
            image_reference,
        );
        job.log_pointer = snapshot.log.clone();

        info!(
            agent = %infra.agent_name,
            job_id = %job.job_id,
            image = %job.image_reference,
            "build started"
        );
        Ok(job)
    }
}
