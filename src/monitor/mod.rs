//! Build monitoring
//!
//! Polls a remote build until it reaches a terminal status, folding each
//! snapshot into the [`BuildJob`] state machine.
//!
//! Poll failures are tolerated up to a bound and the time spent on them
//! is not charged against the build timeout. Cancellation stops local
//! polling only; the remote build keeps running.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::build::{BuildJob, BuildJobError, BuildStatus, FailureReport};
use crate::cloud::{BuildSnapshot, CloudContext, CloudOp, RetryPolicy};
use crate::error::{LaunchError, LaunchResult};
use crate::signal::SignalState;
use crate::timeout::BuildDeadline;

/// Monitor tuning
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Base delay between polls
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each poll
    pub jitter: Duration,
    /// Consecutive failed polls tolerated before giving up
    pub max_consecutive_poll_failures: u32,
    pub build_timeout: Duration,
    /// Log lines fetched for a failure excerpt
    pub log_tail_lines: usize,
    pub excerpt_max_bytes: usize,
    /// Applied to the log tail fetch
    pub retry: RetryPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            jitter: Duration::from_secs(1),
            max_consecutive_poll_failures: 5,
            build_timeout: Duration::from_secs(1800),
            log_tail_lines: 50,
            excerpt_max_bytes: 8192,
            retry: RetryPolicy::default(),
        }
    }
}

/// Polls build jobs to completion
pub struct BuildMonitor<'a> {
    ctx: &'a CloudContext,
    config: MonitorConfig,
    cancel: Option<Arc<SignalState>>,
}

impl<'a> BuildMonitor<'a> {
    pub fn new(ctx: &'a CloudContext, config: MonitorConfig) -> Self {
        Self {
            ctx,
            config,
            cancel: None,
        }
    }

    /// Stop polling once `state` requests cancellation
    pub fn with_cancel(mut self, state: Arc<SignalState>) -> Self {
        self.cancel = Some(state);
        self
    }

    /// Wait for `job` to finish
    ///
    /// Returns the finished job on success. A failed build becomes
    /// [`LaunchError::BuildFailure`] naming the root-cause phase; an
    /// expired deadline becomes [`LaunchError::Timeout`].
    pub fn wait(&self, mut job: BuildJob) -> LaunchResult<BuildJob> {
        self.poll_to_completion(&mut job)?;

        match job.overall_status {
            BuildStatus::Succeeded => Ok(job),
            BuildStatus::Failed => {
                let report = job.failure.clone().unwrap_or_else(|| FailureReport {
                    phase: "UNKNOWN".to_string(),
                    excerpt: String::new(),
                });
                Err(LaunchError::BuildFailure {
                    job_id: job.job_id,
                    phase: report.phase,
                    excerpt: report.excerpt,
                })
            }
            BuildStatus::TimedOut => Err(LaunchError::Timeout {
                job_id: job.job_id,
                limit: self.config.build_timeout,
            }),
            status @ (BuildStatus::Pending | BuildStatus::InProgress) => Err(LaunchError::Infrastructure {
                resource: format!("build {}", job.job_id),
                message: format!("monitoring stopped while the build was {}", status),
            }),
        }
    }

    /// Poll until the job is terminal, leaving the outcome in `job`
    pub fn poll_to_completion(&self, job: &mut BuildJob) -> LaunchResult<()> {
        let mut deadline = BuildDeadline::start(self.config.build_timeout);
        let mut consecutive_failures = 0u32;
        let mut failing_since: Option<Instant> = None;

        info!(
            job_id = %job.job_id,
            timeout_secs = self.config.build_timeout.as_secs(),
            "monitoring build"
        );

        loop {
            if self.is_cancelled() {
                warn!(job_id = %job.job_id, "build monitoring cancelled, remote build continues");
                return Err(LaunchError::Cancelled {
                    job_id: job.job_id.clone(),
                });
            }

            match self.ctx.builds.get_build(&job.job_id) {
                Ok(snapshot) => {
                    if let Some(since) = failing_since.take() {
                        deadline.excuse(since.elapsed());
                    }
                    consecutive_failures = 0;

                    self.apply_snapshot(job, &snapshot)?;
                    if job.overall_status.is_terminal() {
                        return Ok(());
                    }
                }
                Err(e) if e.is_retryable() => {
                    consecutive_failures += 1;
                    failing_since.get_or_insert_with(Instant::now);
                    warn!(
                        job_id = %job.job_id,
                        failures = consecutive_failures,
                        error = %e,
                        "build poll failed"
                    );
                    if consecutive_failures > self.config.max_consecutive_poll_failures {
                        return Err(LaunchError::Infrastructure {
                            resource: format!("build {}", job.job_id),
                            message: format!(
                                "{} consecutive status polls failed, last error: {}",
                                consecutive_failures, e
                            ),
                        });
                    }
                }
                Err(e) => {
                    return Err(LaunchError::from_cloud(
                        format!("build {}", job.job_id),
                        CloudOp::GetBuild,
                        e,
                    ))
                }
            }

            // An unreachable service does not use up the build's time
            if failing_since.is_none() && deadline.is_expired() {
                warn!(
                    job_id = %job.job_id,
                    charged_secs = deadline.charged().as_secs(),
                    "build timed out"
                );
                job.finish(BuildStatus::TimedOut, None)
                    .map_err(|e| job_state_error(&job.job_id, e))?;
                return Ok(());
            }

            self.sleep(self.next_delay());
        }
    }

    fn apply_snapshot(&self, job: &mut BuildJob, snapshot: &BuildSnapshot) -> LaunchResult<()> {
        for transition in job.observe(snapshot) {
            info!(
                job_id = %job.job_id,
                phase = %transition.phase,
                from = %transition.from,
                to = %transition.to,
                "phase transition"
            );
        }

        let status = BuildStatus::from(snapshot.status);
        if job.overall_status == BuildStatus::Pending && status == BuildStatus::InProgress {
            job.transition(BuildStatus::InProgress)
                .map_err(|e| job_state_error(&job.job_id, e))?;
        }
        if !status.is_terminal() {
            return Ok(());
        }

        if status == BuildStatus::Failed {
            job.failure = Some(self.failure_report(job));
        }
        job.finish(status, snapshot.end_time)
            .map_err(|e| job_state_error(&job.job_id, e))?;

        match &job.failure {
            Some(report) => warn!(job_id = %job.job_id, phase = %report.phase, "build failed"),
            None => info!(job_id = %job.job_id, image = %job.image_reference, "build succeeded"),
        }
        Ok(())
    }

    /// Root-cause phase and a bounded excerpt of what went wrong
    ///
    /// The phase's own messages lead the excerpt and are never displaced by
    /// log lines; the log tail fills whatever budget is left.
    fn failure_report(&self, job: &BuildJob) -> FailureReport {
        let (phase, messages) = match job.root_cause() {
            Some(phase) => (phase.name.clone(), phase.messages.clone()),
            None => (
                job.last_active_phase()
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
                Vec::new(),
            ),
        };

        let mut excerpt = bound_excerpt(&messages, messages.len(), self.config.excerpt_max_bytes);

        if let Some(log) = &job.log_pointer {
            let tail = self.config.retry.run(CloudOp::GetLogEvents, || {
                self.ctx.builds.fetch_log_tail(log, self.config.log_tail_lines)
            });
            match tail {
                Ok(tail) => {
                    let separator = usize::from(!excerpt.is_empty());
                    let remaining = self
                        .config
                        .excerpt_max_bytes
                        .saturating_sub(excerpt.len() + separator);
                    let tail = bound_excerpt(&tail, self.config.log_tail_lines, remaining);
                    if !tail.is_empty() {
                        if !excerpt.is_empty() {
                            excerpt.push('\n');
                        }
                        excerpt.push_str(&tail);
                    }
                }
                Err(e) => warn!(job_id = %job.job_id, log = %log, error = %e, "could not fetch build log"),
            }
        }

        FailureReport { phase, excerpt }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|state| state.is_cancel_requested())
            .unwrap_or(false)
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.poll_interval + Duration::from_millis(extra)
    }

    fn sleep(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        debug!(delay_ms = delay.as_millis() as u64, "next poll");
        match &self.cancel {
            // Returns early on cancellation; the loop reports it
            Some(state) => {
                state.sleep(delay);
            }
            None => thread::sleep(delay),
        }
    }
}

fn job_state_error(job_id: &str, err: BuildJobError) -> LaunchError {
    LaunchError::Infrastructure {
        resource: format!("build {}", job_id),
        message: err.to_string(),
    }
}

/// Keep the last `max_lines` lines, then the last `max_bytes` bytes
pub fn bound_excerpt(lines: &[String], max_lines: usize, max_bytes: usize) -> String {
    let start = lines.len().saturating_sub(max_lines);
    let joined = lines[start..].join("\n");
    if joined.len() <= max_bytes {
        return joined;
    }

    let mut cut = joined.len() - max_bytes;
    while !joined.is_char_boundary(cut) {
        cut += 1;
    }
    joined[cut..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildTrigger, PhaseStatus, STANDARD_PHASES};
    use crate::bundle::Bundler;
    use crate::cloud::RemoteBuildStatus;
    use crate::mock::{BuildScript, FailureConfig, MockCloud};
    use crate::provision::{ProvisionConfig, Provisioner};
    use std::fs;
    use tempfile::TempDir;

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::ZERO,
            jitter: Duration::ZERO,
            retry: RetryPolicy::none(),
            ..Default::default()
        }
    }

    /// Provision, upload and start one build scripted by `script`
    fn started_job(mock: &Arc<MockCloud>, script: BuildScript) -> (CloudContext, BuildJob) {
        let ctx = CloudContext::with_account(mock.clone(), "us-west-2", mock.account());
        let infra = Provisioner::new(
            &ctx,
            ProvisionConfig {
                role_propagation_wait: Duration::ZERO,
                retry: RetryPolicy::none(),
                ..Default::default()
            },
        )
        .ensure("my_agent", "us-west-2")
        .unwrap();

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let bundle = Bundler::new(dir.path()).unwrap().create_bundle("my_agent").unwrap();
        bundle
            .upload(mock.as_ref(), &infra.bucket, &RetryPolicy::none())
            .unwrap();

        mock.queue_build(script);
        let job = BuildTrigger::new(&ctx, RetryPolicy::none())
            .trigger(&infra, &bundle, &bundle.image_tag())
            .unwrap();
        (ctx, job)
    }

    #[test]
    fn test_successful_build() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let (ctx, job) = started_job(&mock, BuildScript::succeeding());

        let job = BuildMonitor::new(&ctx, fast_config()).wait(job).unwrap();

        assert_eq!(job.overall_status, BuildStatus::Succeeded);
        assert_eq!(job.phases.len(), STANDARD_PHASES.len());
        assert!(job.phases.iter().all(|p| p.status == PhaseStatus::Succeeded));
        assert!(job.ended_at.is_some());
    }

    #[test]
    fn test_failure_names_earliest_failed_phase() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let script = BuildScript::failing_in("BUILD", "compilation error")
            .then_failing("POST_BUILD", "push skipped")
            .with_log(["step 3/7 : RUN cargo build", "error[E0308]: mismatched types"]);
        let (ctx, job) = started_job(&mock, script);

        let err = BuildMonitor::new(&ctx, fast_config()).wait(job).unwrap_err();

        match err {
            LaunchError::BuildFailure { phase, excerpt, .. } => {
                assert_eq!(phase, "BUILD");
                assert!(excerpt.contains("compilation error"));
                assert!(excerpt.contains("mismatched types"));
                assert!(!excerpt.contains("push skipped"));
            }
            other => panic!("expected BuildFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_remote_fault_counts_as_failure() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let script = BuildScript::failing_in("INSTALL", "out of memory").ending_with(RemoteBuildStatus::Fault);
        let (ctx, job) = started_job(&mock, script);

        let err = BuildMonitor::new(&ctx, fast_config()).wait(job).unwrap_err();
        assert!(matches!(err, LaunchError::BuildFailure { ref phase, .. } if phase == "INSTALL"));
    }

    #[test]
    fn test_log_fetch_failure_still_reports() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let (ctx, job) = started_job(&mock, BuildScript::failing_in("BUILD", "compilation error"));
        mock.inject(CloudOp::GetLogEvents, FailureConfig::access_denied("logs:GetLogEvents"));

        let err = BuildMonitor::new(&ctx, fast_config()).wait(job).unwrap_err();
        assert!(matches!(err, LaunchError::BuildFailure { ref excerpt, .. } if excerpt == "compilation error"));
    }

    #[test]
    fn test_long_log_keeps_phase_messages() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let script = BuildScript::failing_in("BUILD", "compilation error")
            .with_log((0..60).map(|i| format!("log line {}", i)));
        let (ctx, job) = started_job(&mock, script);

        let err = BuildMonitor::new(&ctx, fast_config()).wait(job).unwrap_err();

        match err {
            LaunchError::BuildFailure { excerpt, .. } => {
                assert!(excerpt.starts_with("compilation error"));
                assert!(excerpt.ends_with("log line 59"));
                assert!(!excerpt.contains("log line 9\n"));
            }
            other => panic!("expected BuildFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_byte_bound_trims_log_before_phase_messages() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let script = BuildScript::failing_in("BUILD", "compilation error")
            .with_log((0..60).map(|i| format!("log line {}", i)));
        let (ctx, job) = started_job(&mock, script);
        let config = MonitorConfig {
            excerpt_max_bytes: 40,
            ..fast_config()
        };

        let err = BuildMonitor::new(&ctx, config).wait(job).unwrap_err();

        match err {
            LaunchError::BuildFailure { excerpt, .. } => {
                assert!(excerpt.starts_with("compilation error\n"));
                assert!(excerpt.ends_with("log line 59"));
                assert!(excerpt.len() <= 40);
            }
            other => panic!("expected BuildFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_transient_poll_failures_are_tolerated() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let (ctx, job) = started_job(&mock, BuildScript::succeeding());
        mock.inject(CloudOp::GetBuild, FailureConfig::transient().with_fail_count(3));

        let job = BuildMonitor::new(&ctx, fast_config()).wait(job).unwrap();
        assert_eq!(job.overall_status, BuildStatus::Succeeded);
    }

    #[test]
    fn test_persistent_poll_failures_escalate() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let (ctx, job) = started_job(&mock, BuildScript::succeeding());
        mock.inject(CloudOp::GetBuild, FailureConfig::transient());

        let err = BuildMonitor::new(&ctx, fast_config()).wait(job).unwrap_err();
        assert_eq!(err.category(), "InfrastructureError");
        assert_eq!(mock.calls(CloudOp::GetBuild), 6);
    }

    #[test]
    fn test_poll_access_denied_aborts() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let (ctx, job) = started_job(&mock, BuildScript::succeeding());
        mock.inject(CloudOp::GetBuild, FailureConfig::access_denied("codebuild:BatchGetBuilds"));

        let err = BuildMonitor::new(&ctx, fast_config()).wait(job).unwrap_err();
        assert!(matches!(err, LaunchError::Permission { ref action, .. } if action == "codebuild:BatchGetBuilds"));
        assert_eq!(mock.calls(CloudOp::GetBuild), 1);
    }

    #[test]
    fn test_timeout() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let (ctx, job) = started_job(&mock, BuildScript::never_finishing());
        let config = MonitorConfig {
            poll_interval: Duration::from_millis(10),
            build_timeout: Duration::from_millis(50),
            ..fast_config()
        };

        let err = BuildMonitor::new(&ctx, config).wait(job).unwrap_err();
        match err {
            LaunchError::Timeout { limit, .. } => assert_eq!(limit, Duration::from_millis(50)),
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_failing_polls_do_not_use_up_timeout() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let (ctx, job) = started_job(&mock, BuildScript::succeeding());
        // Two slow failed polls take longer than the whole timeout
        let slow_failure = FailureConfig {
            delay: Some(Duration::from_millis(200)),
            ..FailureConfig::transient()
        };
        mock.inject(CloudOp::GetBuild, slow_failure.with_fail_count(2));

        let config = MonitorConfig {
            poll_interval: Duration::from_millis(10),
            build_timeout: Duration::from_millis(300),
            ..fast_config()
        };
        let job = BuildMonitor::new(&ctx, config).wait(job).unwrap();
        assert_eq!(job.overall_status, BuildStatus::Succeeded);
    }

    #[test]
    fn test_cancel_stops_polling() {
        let mock = Arc::new(MockCloud::new("us-west-2"));
        let (ctx, job) = started_job(&mock, BuildScript::never_finishing());
        let state = Arc::new(SignalState::new());
        state.cancel();

        let err = BuildMonitor::new(&ctx, fast_config())
            .with_cancel(state)
            .wait(job)
            .unwrap_err();

        assert!(matches!(err, LaunchError::Cancelled { .. }));
        assert_eq!(mock.calls(CloudOp::GetBuild), 0);
    }

    #[test]
    fn test_bound_excerpt_lines_and_bytes() {
        let lines: Vec<String> = (0..10).map(|i| format!("line {}", i)).collect();
        assert_eq!(bound_excerpt(&lines, 2, 1000), "line 8\nline 9");
        assert_eq!(bound_excerpt(&lines, 2, 6), "line 9");
    }

    #[test]
    fn test_bound_excerpt_respects_char_boundaries() {
        let lines = vec!["ééé".to_string()];
        let excerpt = bound_excerpt(&lines, 10, 3);
        assert_eq!(excerpt, "é");
    }
}
