//! Cloud backend driving the `aws` command-line client
//!
//! Every call spawns `aws <service> <operation> ... --output json` and
//! parses stdout. Failures are classified from the CLI's stderr, which
//! carries the service error code in the form
//! `An error occurred (Code) when calling the Op operation: message`.

use std::collections::BTreeMap;
use std::fs;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use chrono::{DateTime, TimeZone, Utc};
use regex_lite::Regex;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    AccountService, BuildService, BuildSnapshot, CloudError, CloudResult, IdentityService,
    ImageRegistry, LogPointer, ObjectStore, ProjectSpec, RemoteBuildStatus, RemotePhase,
    RemotePhaseStatus, RepositoryInfo, RoleInfo, RuntimeInfo, RuntimeService, RuntimeStatus,
    StartBuildRequest,
};
use crate::deploy::RuntimeTarget;

/// `aws` CLI configuration
#[derive(Debug, Clone)]
pub struct AwsCliConfig {
    /// Executable to invoke
    pub binary: String,
    /// Named profile (`--profile`)
    pub profile: Option<String>,
    /// Region every call is pinned to
    pub region: String,
    /// Socket connect timeout per request
    pub connect_timeout_seconds: u64,
    /// Socket read timeout per request
    pub read_timeout_seconds: u64,
}

impl Default for AwsCliConfig {
    fn default() -> Self {
        Self {
            binary: "aws".to_string(),
            profile: None,
            region: super::DEFAULT_REGION.to_string(),
            connect_timeout_seconds: 30,
            read_timeout_seconds: 60,
        }
    }
}

/// Production cloud provider backed by the `aws` CLI
pub struct AwsCliProvider {
    config: AwsCliConfig,
}

impl AwsCliProvider {
    pub fn new(config: AwsCliConfig) -> Self {
        Self { config }
    }

    /// Global arguments appended to every invocation
    fn global_args(&self) -> Vec<String> {
        let mut args = vec![
            "--region".to_string(),
            self.config.region.clone(),
            "--output".to_string(),
            "json".to_string(),
            "--cli-connect-timeout".to_string(),
            self.config.connect_timeout_seconds.to_string(),
            "--cli-read-timeout".to_string(),
            self.config.read_timeout_seconds.to_string(),
            "--no-cli-pager".to_string(),
        ];
        if let Some(ref profile) = self.config.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args
    }

    /// Run one CLI operation and parse its JSON output
    fn call(&self, service: &str, operation: &str, args: &[String]) -> CloudResult<Value> {
        debug!(service, operation, "aws cli call");

        let output = Command::new(&self.config.binary)
            .arg(service)
            .arg(operation)
            .args(args)
            .args(self.global_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| CloudError::Service {
                code: "CliUnavailable".to_string(),
                message: format!("failed to spawn {}: {}", self.config.binary, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_stderr(&stderr));
        }

        if output.stdout.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&output.stdout).map_err(|e| CloudError::Service {
            code: "InvalidResponse".to_string(),
            message: format!("{} {} returned invalid JSON: {}", service, operation, e),
        })
    }

    /// Run an operation whose parameters are passed as `--cli-input-json`
    fn call_with_input(&self, service: &str, operation: &str, input: &Value) -> CloudResult<Value> {
        self.call(
            service,
            operation,
            &["--cli-input-json".to_string(), input.to_string()],
        )
    }
}

impl AccountService for AwsCliProvider {
    fn account_id(&self) -> CloudResult<String> {
        let out = self.call("sts", "get-caller-identity", &[])?;
        str_field(&out, &["Account"])
    }
}

impl ObjectStore for AwsCliProvider {
    fn head_bucket(&self, bucket: &str) -> CloudResult<()> {
        self.call("s3api", "head-bucket", &args(&["--bucket", bucket]))
            .map(|_| ())
            .map_err(|e| rename_not_found(e, format!("bucket {}", bucket)))
    }

    fn create_bucket(&self, bucket: &str, location_constraint: Option<&str>) -> CloudResult<()> {
        let mut a = args(&["--bucket", bucket]);
        if let Some(region) = location_constraint {
            a.push("--create-bucket-configuration".to_string());
            a.push(json!({ "LocationConstraint": region }).to_string());
        }
        self.call("s3api", "create-bucket", &a).map(|_| ())
    }

    fn put_lifecycle_expiration(&self, bucket: &str, days: u32) -> CloudResult<()> {
        let rules = json!({
            "Rules": [{
                "ID": "expire-source-bundles",
                "Status": "Enabled",
                "Filter": { "Prefix": "" },
                "Expiration": { "Days": days }
            }]
        });
        self.call(
            "s3api",
            "put-bucket-lifecycle-configuration",
            &args(&["--bucket", bucket, "--lifecycle-configuration", &rules.to_string()]),
        )
        .map(|_| ())
    }

    fn object_exists(&self, bucket: &str, key: &str) -> CloudResult<bool> {
        match self.call("s3api", "head-object", &args(&["--bucket", bucket, "--key", key])) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> CloudResult<()> {
        let staging = std::env::temp_dir().join(format!("agent-launch-{}.zip", uuid::Uuid::new_v4()));
        fs::write(&staging, body).map_err(|e| CloudError::Service {
            code: "LocalIo".to_string(),
            message: format!("cannot stage upload at {}: {}", staging.display(), e),
        })?;

        let body_arg = staging.to_string_lossy().to_string();
        let result = self.call(
            "s3api",
            "put-object",
            &args(&["--bucket", bucket, "--key", key, "--body", &body_arg]),
        );
        let _ = fs::remove_file(&staging);
        result.map(|_| ())
    }
}

impl IdentityService for AwsCliProvider {
    fn get_role(&self, name: &str) -> CloudResult<RoleInfo> {
        let out = self
            .call("iam", "get-role", &args(&["--role-name", name]))
            .map_err(|e| rename_not_found(e, format!("role {}", name)))?;
        parse_role(&out)
    }

    fn create_role(&self, name: &str, trust_policy: &str, description: &str) -> CloudResult<RoleInfo> {
        let out = self.call(
            "iam",
            "create-role",
            &args(&[
                "--role-name",
                name,
                "--assume-role-policy-document",
                trust_policy,
                "--description",
                description,
            ]),
        )?;
        parse_role(&out)
    }

    fn attach_role_policy(&self, role: &str, policy_name: &str, document: &str) -> CloudResult<()> {
        self.call(
            "iam",
            "put-role-policy",
            &args(&[
                "--role-name",
                role,
                "--policy-name",
                policy_name,
                "--policy-document",
                document,
            ]),
        )
        .map(|_| ())
    }
}

impl ImageRegistry for AwsCliProvider {
    fn describe_repository(&self, name: &str) -> CloudResult<RepositoryInfo> {
        let out = self
            .call("ecr", "describe-repositories", &args(&["--repository-names", name]))
            .map_err(|e| rename_not_found(e, format!("repository {}", name)))?;
        let repo = out
            .get("repositories")
            .and_then(|r| r.get(0))
            .ok_or_else(|| CloudError::not_found(format!("repository {}", name)))?;
        parse_repository(repo)
    }

    fn create_repository(&self, name: &str) -> CloudResult<RepositoryInfo> {
        let out = self.call(
            "ecr",
            "create-repository",
            &args(&["--repository-name", name, "--image-scanning-configuration", "scanOnPush=true"]),
        )?;
        let repo = out.get("repository").ok_or_else(|| missing("repository"))?;
        parse_repository(repo)
    }
}

impl BuildService for AwsCliProvider {
    fn get_project(&self, name: &str) -> CloudResult<ProjectSpec> {
        let out = self.call("codebuild", "batch-get-projects", &args(&["--names", name]))?;
        let project = out
            .get("projects")
            .and_then(|p| p.get(0))
            .ok_or_else(|| CloudError::not_found(format!("project {}", name)))?;
        parse_project(project)
    }

    fn create_project(&self, spec: &ProjectSpec) -> CloudResult<()> {
        self.call_with_input("codebuild", "create-project", &project_input(spec))
            .map(|_| ())
    }

    fn update_project(&self, spec: &ProjectSpec) -> CloudResult<()> {
        self.call_with_input("codebuild", "update-project", &project_input(spec))
            .map(|_| ())
    }

    fn start_build(&self, request: &StartBuildRequest) -> CloudResult<BuildSnapshot> {
        let env: Vec<Value> = request
            .environment
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v, "type": "PLAINTEXT" }))
            .collect();
        let input = json!({
            "projectName": request.project_name,
            "sourceTypeOverride": "S3",
            "sourceLocationOverride": format!("{}/{}", request.source_bucket, request.source_key),
            "environmentVariablesOverride": env,
        });
        let out = self.call_with_input("codebuild", "start-build", &input)?;
        let build = out.get("build").ok_or_else(|| missing("build"))?;
        parse_build(build)
    }

    fn get_build(&self, job_id: &str) -> CloudResult<BuildSnapshot> {
        let out = self.call("codebuild", "batch-get-builds", &args(&["--ids", job_id]))?;
        let build = out
            .get("builds")
            .and_then(|b| b.get(0))
            .ok_or_else(|| CloudError::not_found(format!("build {}", job_id)))?;
        parse_build(build)
    }

    fn fetch_log_tail(&self, log: &LogPointer, max_lines: usize) -> CloudResult<Vec<String>> {
        let out = self.call(
            "logs",
            "get-log-events",
            &args(&[
                "--log-group-name",
                &log.group,
                "--log-stream-name",
                &log.stream,
                "--limit",
                &max_lines.max(1).to_string(),
                "--no-start-from-head",
            ]),
        )?;
        let lines = out
            .get("events")
            .and_then(Value::as_array)
            .map(|events| {
                events
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .map(|m| m.trim_end().to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(lines)
    }
}

impl RuntimeService for AwsCliProvider {
    fn create_runtime(&self, target: &RuntimeTarget) -> CloudResult<RuntimeInfo> {
        let mut input = runtime_input(target);
        input["agentRuntimeName"] = json!(target.name);
        let out = self.call_with_input("bedrock-agentcore-control", "create-agent-runtime", &input)?;
        let id = str_field(&out, &["agentRuntimeId"])?;
        Ok(RuntimeInfo {
            arn: str_field(&out, &["agentRuntimeArn"])?,
            name: target.name.clone(),
            status: RuntimeStatus::parse(out.get("status").and_then(Value::as_str).unwrap_or("CREATING")),
            image_reference: target.image_reference.clone(),
            role_reference: target.role_reference.clone(),
            environment_variables: target.environment_variables.clone(),
            id,
        })
    }

    fn find_runtime(&self, name: &str) -> CloudResult<RuntimeInfo> {
        let mut next_token: Option<String> = None;
        loop {
            let mut a = Vec::new();
            if let Some(ref token) = next_token {
                a.push("--next-token".to_string());
                a.push(token.clone());
            }
            let out = self.call("bedrock-agentcore-control", "list-agent-runtimes", &a)?;
            let found = out
                .get("agentRuntimes")
                .and_then(Value::as_array)
                .and_then(|runtimes| {
                    runtimes
                        .iter()
                        .find(|r| r.get("agentRuntimeName").and_then(Value::as_str) == Some(name))
                })
                .and_then(|r| r.get("agentRuntimeId").and_then(Value::as_str));
            if let Some(id) = found {
                return self.get_runtime(id);
            }
            next_token = out
                .get("nextToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            if next_token.is_none() {
                return Err(CloudError::not_found(format!("runtime {}", name)));
            }
        }
    }

    fn get_runtime(&self, runtime_id: &str) -> CloudResult<RuntimeInfo> {
        let out = self
            .call(
                "bedrock-agentcore-control",
                "get-agent-runtime",
                &args(&["--agent-runtime-id", runtime_id]),
            )
            .map_err(|e| rename_not_found(e, format!("runtime {}", runtime_id)))?;
        parse_runtime(&out)
    }

    fn update_runtime(&self, runtime_id: &str, target: &RuntimeTarget) -> CloudResult<RuntimeInfo> {
        let mut input = runtime_input(target);
        input["agentRuntimeId"] = json!(runtime_id);
        let out = self.call_with_input("bedrock-agentcore-control", "update-agent-runtime", &input)?;
        Ok(RuntimeInfo {
            id: runtime_id.to_string(),
            arn: str_field(&out, &["agentRuntimeArn"])?,
            name: target.name.clone(),
            status: RuntimeStatus::parse(out.get("status").and_then(Value::as_str).unwrap_or("UPDATING")),
            image_reference: target.image_reference.clone(),
            role_reference: target.role_reference.clone(),
            environment_variables: target.environment_variables.clone(),
        })
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn missing(field: &str) -> CloudError {
    CloudError::Service {
        code: "InvalidResponse".to_string(),
        message: format!("response is missing `{}`", field),
    }
}

/// Replace the CLI's generic not-found resource with a descriptive one
fn rename_not_found(err: CloudError, resource: String) -> CloudError {
    match err {
        CloudError::NotFound { .. } => CloudError::NotFound { resource },
        other => other,
    }
}

fn str_field(value: &Value, path: &[&str]) -> CloudResult<String> {
    let mut current = value;
    for key in path {
        current = current.get(key).ok_or_else(|| missing(key))?;
    }
    current
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| missing(path.last().copied().unwrap_or("")))
}

fn error_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"An error occurred \(([^)]+)\)(?: when calling the (\w+) operation)?: (.*)").ok()
    })
    .as_ref()
}

fn action_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"perform: ([A-Za-z0-9-]+:[A-Za-z0-9]+)").ok())
        .as_ref()
}

/// Map CLI stderr onto the provider-neutral error classes
pub fn classify_stderr(stderr: &str) -> CloudError {
    let stderr = stderr.trim();

    let Some(caps) = error_re().and_then(|re| re.captures(stderr)) else {
        let lower = stderr.to_lowercase();
        if lower.contains("could not connect to the endpoint")
            || lower.contains("read timeout")
            || lower.contains("connect timeout")
            || lower.contains("connection was closed")
        {
            return CloudError::Transient {
                message: stderr.to_string(),
            };
        }
        return CloudError::Service {
            code: "CliError".to_string(),
            message: stderr.to_string(),
        };
    };

    let code = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let operation = caps.get(2).map(|m| m.as_str()).unwrap_or("request");
    let message = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default().to_string();

    match code {
        "404" | "NoSuchEntity" | "NoSuchBucket" | "NoSuchKey" | "NotFound"
        | "RepositoryNotFoundException" | "ResourceNotFoundException" => CloudError::NotFound {
            resource: format!("{} target", operation),
        },
        "EntityAlreadyExists" | "BucketAlreadyOwnedByYou" | "RepositoryAlreadyExistsException"
        | "ResourceAlreadyExistsException" => CloudError::AlreadyExists {
            resource: format!("{} target", operation),
        },
        "ConflictException" => CloudError::Conflict {
            resource: format!("{} target", operation),
            message,
        },
        "403" | "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation" | "Forbidden"
        | "UnrecognizedClientException" => CloudError::AccessDenied {
            action: action_re()
                .and_then(|re| re.captures(&message))
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
            message,
        },
        "Throttling" | "ThrottlingException" | "TooManyRequestsException" | "SlowDown"
        | "RequestLimitExceeded" | "LimitExceededException" => CloudError::Throttled { message },
        "500" | "503" | "InternalError" | "InternalFailure" | "InternalServerException"
        | "ServiceUnavailable" | "ServiceUnavailableException" | "RequestTimeout" => {
            CloudError::Transient { message }
        }
        "ValidationException" | "InvalidInputException" | "InvalidInput"
        | "MalformedPolicyDocument" | "InvalidParameterException" => {
            CloudError::Validation { message }
        }
        other => CloudError::Service {
            code: other.to_string(),
            message,
        },
    }
}

fn parse_role(out: &Value) -> CloudResult<RoleInfo> {
    Ok(RoleInfo {
        name: str_field(out, &["Role", "RoleName"])?,
        arn: str_field(out, &["Role", "Arn"])?,
    })
}

fn parse_repository(repo: &Value) -> CloudResult<RepositoryInfo> {
    Ok(RepositoryInfo {
        name: str_field(repo, &["repositoryName"])?,
        uri: str_field(repo, &["repositoryUri"])?,
    })
}

fn project_input(spec: &ProjectSpec) -> Value {
    json!({
        "name": spec.name,
        "source": {
            "type": "S3",
            "location": format!("{}/", spec.source_bucket),
            "buildspec": spec.buildspec_path,
        },
        "artifacts": { "type": "NO_ARTIFACTS" },
        "environment": {
            "type": spec.environment_type,
            "image": spec.image,
            "computeType": spec.compute_type,
            "privilegedMode": spec.privileged,
        },
        "serviceRole": spec.role_arn,
        "timeoutInMinutes": spec.timeout_minutes,
    })
}

fn parse_project(project: &Value) -> CloudResult<ProjectSpec> {
    let location = str_field(project, &["source", "location"]).unwrap_or_default();
    let source_bucket = location.split('/').next().unwrap_or_default().to_string();
    Ok(ProjectSpec {
        name: str_field(project, &["name"])?,
        role_arn: str_field(project, &["serviceRole"]).unwrap_or_default(),
        source_bucket,
        buildspec_path: str_field(project, &["source", "buildspec"]).unwrap_or_default(),
        image: str_field(project, &["environment", "image"]).unwrap_or_default(),
        compute_type: str_field(project, &["environment", "computeType"]).unwrap_or_default(),
        environment_type: str_field(project, &["environment", "type"]).unwrap_or_default(),
        privileged: project
            .pointer("/environment/privilegedMode")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        timeout_minutes: project
            .get("timeoutInMinutes")
            .and_then(Value::as_u64)
            .unwrap_or(60) as u32,
    })
}

/// Parse a timestamp the CLI printed as ISO 8601 or epoch seconds
fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let millis = (secs * 1000.0) as i64;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

/// Parse a `builds[]` element into a snapshot
pub fn parse_build(build: &Value) -> CloudResult<BuildSnapshot> {
    let job_id = str_field(build, &["id"])?;
    let raw_status = str_field(build, &["buildStatus"])?;
    let status = RemoteBuildStatus::parse(&raw_status).ok_or_else(|| CloudError::Service {
        code: "InvalidResponse".to_string(),
        message: format!("unknown build status {}", raw_status),
    })?;

    let phases = build
        .get("phases")
        .and_then(Value::as_array)
        .map(|phases| {
            phases
                .iter()
                .filter_map(|p| {
                    let name = p.get("phaseType")?.as_str()?.to_string();
                    // The running phase has no status yet; the trailing
                    // COMPLETED marker never gets one
                    let phase_status = match p.get("phaseStatus").and_then(Value::as_str) {
                        Some(raw) => RemotePhaseStatus::parse(raw)?,
                        None if status.is_terminal() => RemotePhaseStatus::Succeeded,
                        None => RemotePhaseStatus::InProgress,
                    };
                    let messages = p
                        .get("contexts")
                        .and_then(Value::as_array)
                        .map(|ctx| {
                            ctx.iter()
                                .filter_map(|c| {
                                    let msg = c.get("message")?.as_str()?.trim();
                                    if msg.is_empty() {
                                        return None;
                                    }
                                    match c.get("statusCode").and_then(Value::as_str) {
                                        Some(code) if !code.is_empty() => {
                                            Some(format!("{}: {}", code, msg))
                                        }
                                        _ => Some(msg.to_string()),
                                    }
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    Some(RemotePhase {
                        name,
                        status: phase_status,
                        start_time: parse_time(p.get("startTime")),
                        end_time: parse_time(p.get("endTime")),
                        messages,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let log = match (
        build.pointer("/logs/groupName").and_then(Value::as_str),
        build.pointer("/logs/streamName").and_then(Value::as_str),
    ) {
        (Some(group), Some(stream)) => Some(LogPointer {
            group: group.to_string(),
            stream: stream.to_string(),
        }),
        _ => None,
    };

    Ok(BuildSnapshot {
        job_id,
        status,
        phases,
        log,
        start_time: parse_time(build.get("startTime")),
        end_time: parse_time(build.get("endTime")),
    })
}

fn runtime_input(target: &RuntimeTarget) -> Value {
    json!({
        "agentRuntimeArtifact": {
            "containerConfiguration": { "containerUri": target.image_reference }
        },
        "roleArn": target.role_reference,
        "networkConfiguration": { "networkMode": target.network_mode.as_str() },
        "environmentVariables": target.environment_variables,
    })
}

/// Parse a `get-agent-runtime` response
pub fn parse_runtime(out: &Value) -> CloudResult<RuntimeInfo> {
    let environment_variables = out
        .get("environmentVariables")
        .and_then(Value::as_object)
        .map(|vars| {
            vars.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    Ok(RuntimeInfo {
        id: str_field(out, &["agentRuntimeId"])?,
        arn: str_field(out, &["agentRuntimeArn"])?,
        name: str_field(out, &["agentRuntimeName"])?,
        status: RuntimeStatus::parse(&str_field(out, &["status"])?),
        image_reference: str_field(
            out,
            &["agentRuntimeArtifact", "containerConfiguration", "containerUri"],
        )
        .unwrap_or_default(),
        role_reference: str_field(out, &["roleArn"]).unwrap_or_default(),
        environment_variables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = classify_stderr(
            "\nAn error occurred (NoSuchEntity) when calling the GetRole operation: The role with name X cannot be found.\n",
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_head_bucket_404() {
        let err = classify_stderr("An error occurred (404) when calling the HeadBucket operation: Not Found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_access_denied_extracts_action() {
        let err = classify_stderr(
            "An error occurred (AccessDenied) when calling the CreateRole operation: User: arn:aws:iam::123:user/dev is not authorized to perform: iam:CreateRole on resource: role X",
        );
        match err {
            CloudError::AccessDenied { action, .. } => {
                assert_eq!(action.as_deref(), Some("iam:CreateRole"));
            }
            other => panic!("expected AccessDenied, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_throttling_and_network() {
        assert!(classify_stderr(
            "An error occurred (ThrottlingException) when calling the BatchGetBuilds operation: Rate exceeded"
        )
        .is_retryable());
        assert!(classify_stderr(
            "Could not connect to the endpoint URL: \"https://codebuild.us-west-2.amazonaws.com/\""
        )
        .is_retryable());
    }

    #[test]
    fn test_classify_conflict() {
        let err = classify_stderr(
            "An error occurred (ConflictException) when calling the CreateAgentRuntime operation: Agent already exists",
        );
        assert!(matches!(err, CloudError::Conflict { .. }));
    }

    #[test]
    fn test_classify_unknown_is_service() {
        let err = classify_stderr("An error occurred (WeirdError) when calling the X operation: boom");
        assert_eq!(
            err,
            CloudError::Service {
                code: "WeirdError".into(),
                message: "boom".into()
            }
        );
    }

    #[test]
    fn test_parse_build_snapshot() {
        let build = json!({
            "id": "agent-launch-a-builder:1234",
            "buildStatus": "FAILED",
            "startTime": "2024-05-01T10:00:00.000000+00:00",
            "phases": [
                {"phaseType": "SUBMITTED", "phaseStatus": "SUCCEEDED",
                 "startTime": "2024-05-01T10:00:00+00:00", "endTime": "2024-05-01T10:00:01+00:00"},
                {"phaseType": "BUILD", "phaseStatus": "FAILED",
                 "startTime": "2024-05-01T10:01:00+00:00",
                 "contexts": [{"statusCode": "COMMAND_EXECUTION_ERROR",
                               "message": "Error while executing command: docker buildx build. Reason: exit status 1"}]},
                {"phaseType": "COMPLETED", "startTime": "2024-05-01T10:02:00+00:00"}
            ],
            "logs": {"groupName": "/aws/codebuild/agent-launch-a-builder", "streamName": "1234"}
        });

        let snapshot = parse_build(&build).unwrap();
        assert_eq!(snapshot.status, RemoteBuildStatus::Failed);
        assert_eq!(snapshot.phases.len(), 3);
        assert_eq!(snapshot.phases[1].status, RemotePhaseStatus::Failed);
        assert!(snapshot.phases[1].messages[0].starts_with("COMMAND_EXECUTION_ERROR"));
        assert_eq!(snapshot.phases[2].status, RemotePhaseStatus::Succeeded);
        assert_eq!(snapshot.log.unwrap().stream, "1234");
    }

    #[test]
    fn test_parse_build_running_phase_without_status() {
        let build = json!({
            "id": "p:1",
            "buildStatus": "IN_PROGRESS",
            "phases": [{"phaseType": "PROVISIONING", "startTime": 1714557600.5}]
        });
        let snapshot = parse_build(&build).unwrap();
        assert_eq!(snapshot.phases[0].status, RemotePhaseStatus::InProgress);
        assert!(snapshot.phases[0].start_time.is_some());
    }

    #[test]
    fn test_parse_runtime() {
        let out = json!({
            "agentRuntimeId": "my_agent-abc123",
            "agentRuntimeArn": "arn:aws:bedrock-agentcore:us-west-2:123:runtime/my_agent-abc123",
            "agentRuntimeName": "my_agent",
            "status": "READY",
            "agentRuntimeArtifact": {"containerConfiguration": {"containerUri": "repo:tag"}},
            "roleArn": "arn:aws:iam::123:role/r",
            "environmentVariables": {"MODE": "prod"}
        });
        let info = parse_runtime(&out).unwrap();
        assert_eq!(info.status, RuntimeStatus::Ready);
        assert_eq!(info.image_reference, "repo:tag");
        assert_eq!(info.environment_variables.get("MODE").map(String::as_str), Some("prod"));
    }

    #[test]
    fn test_global_args_carry_region_and_timeouts() {
        let provider = AwsCliProvider::new(AwsCliConfig {
            region: "eu-west-1".into(),
            profile: Some("dev".into()),
            ..Default::default()
        });
        let a = provider.global_args();
        assert!(a.windows(2).any(|w| w[0] == "--region" && w[1] == "eu-west-1"));
        assert!(a.windows(2).any(|w| w[0] == "--cli-read-timeout" && w[1] == "60"));
        assert!(a.windows(2).any(|w| w[0] == "--profile" && w[1] == "dev"));
    }
}
