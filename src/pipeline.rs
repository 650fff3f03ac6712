//! Launch pipeline
//!
//! Remote mode: write the build spec, bundle and provision concurrently,
//! upload, trigger, monitor, deploy. Prebuilt mode skips straight from
//! the runtime role to deployment. The state record is written after the
//! build and again after deployment so a failed deploy still leaves the
//! provisioned resources on record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use serde::Serialize;
use tracing::{info, warn};

use crate::build::{write_buildspec, BuildJob, BuildTrigger, BUILDSPEC_FILE};
use crate::bundle::{BundleError, Bundler, SourceBundle, UploadOutcome};
use crate::cloud::{BuildSnapshot, CloudContext, CloudOp};
use crate::config::LaunchConfig;
use crate::deploy::{DeployResult, RuntimeDeployer, RuntimeTarget};
use crate::error::{LaunchError, LaunchResult};
use crate::monitor::BuildMonitor;
use crate::provision::{InfrastructureSet, ProvisionHints, Provisioner};
use crate::signal::SignalState;
use crate::state::{AgentRecord, LaunchState};

/// Where the runtime image comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildMode {
    /// Build the source directory remotely
    Remote,
    /// Deploy an existing image
    Prebuilt { image: String },
}

/// One launch of one agent
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub agent_name: String,
    pub region: String,
    pub source_dir: PathBuf,
    pub mode: BuildMode,
    pub auto_update_on_conflict: bool,
    pub env: BTreeMap<String, String>,
}

impl LaunchRequest {
    /// Build a request from resolved configuration
    pub fn from_config(config: &LaunchConfig) -> LaunchResult<Self> {
        let agent_name = config.agent.clone().ok_or_else(|| {
            LaunchError::Config(
                "an agent name is required (--agent or `agent` in .agent-launch.toml)".to_string(),
            )
        })?;
        let mode = match &config.prebuilt_image {
            Some(image) => BuildMode::Prebuilt {
                image: image.clone(),
            },
            None => BuildMode::Remote,
        };
        Ok(Self {
            agent_name,
            region: config.region.clone(),
            source_dir: config.source.clone(),
            mode,
            auto_update_on_conflict: config.auto_update_on_conflict,
            env: config.env.clone(),
        })
    }
}

/// Summary of the uploaded source bundle
#[derive(Debug, Clone, Serialize)]
pub struct BundleSummary {
    pub content_hash: String,
    pub size_bytes: u64,
    pub file_count: usize,
    pub storage_key: String,
    pub upload: UploadOutcome,
}

impl BundleSummary {
    fn new(bundle: &SourceBundle, upload: UploadOutcome) -> Self {
        Self {
            content_hash: bundle.content_hash.clone(),
            size_bytes: bundle.size_bytes,
            file_count: bundle.manifest.len(),
            storage_key: bundle.storage_key.clone(),
            upload,
        }
    }
}

/// Everything a successful launch produced
#[derive(Debug, Clone, Serialize)]
pub struct LaunchOutcome {
    pub agent_name: String,
    pub region: String,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infrastructure: Option<InfrastructureSet>,
    pub runtime_role_arn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildJob>,
    pub image_reference: String,
    pub deploy: DeployResult,
}

/// Runs launches against one cloud context
pub struct Launcher {
    ctx: CloudContext,
    config: LaunchConfig,
    signals: Arc<SignalState>,
    state_path: PathBuf,
}

impl Launcher {
    pub fn new(
        ctx: CloudContext,
        config: LaunchConfig,
        signals: Arc<SignalState>,
        state_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            config,
            signals,
            state_path: state_path.into(),
        }
    }

    pub fn context(&self) -> &CloudContext {
        &self.ctx
    }

    /// Run the whole pipeline
    pub fn launch(&self, request: &LaunchRequest) -> LaunchResult<LaunchOutcome> {
        if request.region != self.ctx.region {
            return Err(LaunchError::Config(format!(
                "launch region {} does not match the connected region {}",
                request.region, self.ctx.region
            )));
        }

        let mut state = LaunchState::load(&self.state_path).map_err(|e| LaunchError::Config(e.to_string()))?;
        let hints = state.hints_for(&request.agent_name, &request.region);
        let mut record = match state.record(&request.agent_name) {
            Some(existing) if existing.region == request.region => existing.clone(),
            _ => AgentRecord::new(&request.region, &self.ctx.account_id),
        };

        info!(
            agent = %request.agent_name,
            region = %request.region,
            account = %self.ctx.account_id,
            "launch started"
        );

        let (infrastructure, runtime_role_arn, bundle, build, image_reference) = match &request.mode {
            BuildMode::Remote => {
                let built = self.build_remote(request, &hints)?;
                record.set_infrastructure(&built.infrastructure);
                record.last_build_job_id = Some(built.job.job_id.clone());
                record.last_image = Some(built.job.image_reference.clone());
                self.persist(&mut state, &request.agent_name, &record);

                let role = built.infrastructure.runtime_role_arn.clone();
                let image = built.job.image_reference.clone();
                (Some(built.infrastructure), role, Some(built.bundle), Some(built.job), image)
            }
            BuildMode::Prebuilt { image } => {
                // Re-puts the runtime policy so the role can pull from any repository
                let role = Provisioner::new(&self.ctx, self.config.provision_config())
                    .ensure_runtime_role(&request.agent_name, &request.region)?;
                record.runtime_role_arn = Some(role.clone());
                record.last_image = Some(image.clone());
                (None, role, None, None, image.clone())
            }
        };

        let target = RuntimeTarget::new(&request.agent_name, &image_reference, &runtime_role_arn)
            .with_env(request.env.clone());
        let deploy = RuntimeDeployer::new(&self.ctx, self.config.deploy_config())
            .deploy(&target, request.auto_update_on_conflict)?;

        record.runtime_id = Some(deploy.runtime_id.clone());
        record.runtime_arn = Some(deploy.runtime_arn.clone());
        self.persist(&mut state, &request.agent_name, &record);

        info!(
            agent = %request.agent_name,
            runtime_id = %deploy.runtime_id,
            action = deploy.action.label(),
            "launch complete"
        );
        Ok(LaunchOutcome {
            agent_name: request.agent_name.clone(),
            region: request.region.clone(),
            account_id: self.ctx.account_id.clone(),
            infrastructure,
            runtime_role_arn,
            bundle,
            build,
            image_reference,
            deploy,
        })
    }

    /// One snapshot of a build, e.g. after monitoring was cancelled
    pub fn status(&self, job_id: &str) -> LaunchResult<BuildSnapshot> {
        self.config
            .retry_policy()
            .run(CloudOp::GetBuild, || self.ctx.builds.get_build(job_id))
            .map_err(|e| LaunchError::from_cloud(format!("build {}", job_id), CloudOp::GetBuild, e))
    }

    fn build_remote(&self, request: &LaunchRequest, hints: &ProvisionHints) -> LaunchResult<RemoteBuild> {
        let agent = request.agent_name.as_str();
        let retry = self.config.retry_policy();

        let buildspec = write_buildspec(&request.source_dir, &self.config.buildspec_options())
            .map_err(|e| LaunchError::Packaging(BundleError::Io(e)))?;
        info!(path = %buildspec.display(), "build spec written");

        let bundler = self.bundler(&request.source_dir)?;
        let provisioner = Provisioner::new(&self.ctx, self.config.provision_config());

        let (bundled, provisioned) = thread::scope(|scope| {
            let bundling = scope.spawn(|| bundler.create_bundle(agent));
            let provisioned = provisioner.ensure_with(agent, &request.region, hints);
            let bundled = bundling
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (bundled, provisioned)
        });
        let bundle = bundled?;
        let infrastructure = provisioned?;

        bundle.require(&self.config.build.dockerfile)?;
        bundle.require(BUILDSPEC_FILE)?;

        let upload = bundle
            .upload(self.ctx.storage.as_ref(), &infrastructure.bucket, &retry)
            .map_err(|e| {
                LaunchError::from_cloud(format!("bucket {}", infrastructure.bucket), CloudOp::PutObject, e)
            })?;

        let job = BuildTrigger::new(&self.ctx, retry).trigger(&infrastructure, &bundle, &bundle.image_tag())?;

        self.signals.set_active_job(&job.job_id);
        let waited = BuildMonitor::new(&self.ctx, self.config.monitor_config())
            .with_cancel(self.signals.clone())
            .wait(job);
        self.signals.clear_active_job();

        Ok(RemoteBuild {
            bundle: BundleSummary::new(&bundle, upload),
            job: waited?,
            infrastructure,
        })
    }

    fn bundler(&self, source_dir: &Path) -> LaunchResult<Bundler> {
        let excludes: Vec<&str> = self.config.bundle.exclude.iter().map(String::as_str).collect();
        let bundler = Bundler::new(source_dir)?
            .with_ignore_file(&source_dir.join(&self.config.bundle.ignore_file))?
            .with_excludes(&excludes)?
            .with_max_bytes(self.config.bundle.max_bytes);
        Ok(bundler)
    }

    /// Save the record; a failed write is logged, not fatal
    fn persist(&self, state: &mut LaunchState, agent: &str, record: &AgentRecord) {
        state.upsert(agent, record.clone());
        if let Err(e) = state.save(&self.state_path) {
            warn!(path = %self.state_path.display(), error = %e, "could not write launch state");
        }
    }
}

struct RemoteBuild {
    infrastructure: InfrastructureSet,
    bundle: BundleSummary,
    job: BuildJob,
}
