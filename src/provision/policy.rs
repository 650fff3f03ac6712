//! Trust and permission policy documents

use serde_json::{json, Value};

/// Service principal of the managed agent runtime
pub const RUNTIME_SERVICE_PRINCIPAL: &str = "bedrock-agentcore.amazonaws.com";

/// Service principal of the remote build service
pub const BUILD_SERVICE_PRINCIPAL: &str = "codebuild.amazonaws.com";

pub const RUNTIME_POLICY_NAME: &str = "AgentLaunchRuntimePolicy";
pub const BUILD_POLICY_NAME: &str = "AgentLaunchBuildPolicy";

fn repository_arn(region: &str, account_id: &str, repository: &str) -> String {
    format!("arn:aws:ecr:{}:{}:repository/{}", region, account_id, repository)
}

/// Runtime role trust: the runtime service, only on behalf of this account
pub fn runtime_trust_policy(region: &str, account_id: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "AssumeRolePolicy",
            "Effect": "Allow",
            "Principal": { "Service": RUNTIME_SERVICE_PRINCIPAL },
            "Action": "sts:AssumeRole",
            "Condition": {
                "StringEquals": { "aws:SourceAccount": account_id },
                "ArnLike": {
                    "aws:SourceArn": format!("arn:aws:bedrock-agentcore:{}:{}:*", region, account_id)
                }
            }
        }]
    })
}

/// Build role trust: the build service
pub fn build_trust_policy(account_id: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": BUILD_SERVICE_PRINCIPAL },
            "Action": "sts:AssumeRole",
            "Condition": {
                "StringEquals": { "aws:SourceAccount": account_id }
            }
        }]
    })
}

/// What the runtime needs: pull its image, write logs and traces, call models
pub fn runtime_permissions(region: &str, account_id: &str, repository: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Sid": "ImagePull",
                "Effect": "Allow",
                "Action": ["ecr:BatchGetImage", "ecr:GetDownloadUrlForLayer"],
                "Resource": repository_arn(region, account_id, repository)
            },
            {
                "Sid": "RegistryToken",
                "Effect": "Allow",
                "Action": "ecr:GetAuthorizationToken",
                "Resource": "*"
            },
            {
                "Sid": "Logs",
                "Effect": "Allow",
                "Action": [
                    "logs:CreateLogGroup",
                    "logs:CreateLogStream",
                    "logs:PutLogEvents",
                    "logs:DescribeLogStreams"
                ],
                "Resource": format!(
                    "arn:aws:logs:{}:{}:log-group:/aws/bedrock-agentcore/runtimes/*",
                    region, account_id
                )
            },
            {
                "Sid": "Tracing",
                "Effect": "Allow",
                "Action": ["xray:PutTraceSegments", "xray:PutTelemetryRecords"],
                "Resource": "*"
            },
            {
                "Sid": "Metrics",
                "Effect": "Allow",
                "Action": "cloudwatch:PutMetricData",
                "Resource": "*",
                "Condition": { "StringEquals": { "cloudwatch:namespace": "bedrock-agentcore" } }
            },
            {
                "Sid": "ModelInvocation",
                "Effect": "Allow",
                "Action": ["bedrock:InvokeModel", "bedrock:InvokeModelWithResponseStream"],
                "Resource": "*"
            }
        ]
    })
}

/// What the build needs: read sources, push the image, write build logs
pub fn build_permissions(
    region: &str,
    account_id: &str,
    bucket: &str,
    repository: &str,
    project: &str,
) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Sid": "SourceRead",
                "Effect": "Allow",
                "Action": ["s3:GetObject", "s3:GetObjectVersion"],
                "Resource": format!("arn:aws:s3:::{}/*", bucket)
            },
            {
                "Sid": "SourceList",
                "Effect": "Allow",
                "Action": ["s3:ListBucket", "s3:GetBucketLocation"],
                "Resource": format!("arn:aws:s3:::{}", bucket)
            },
            {
                "Sid": "ImagePush",
                "Effect": "Allow",
                "Action": [
                    "ecr:BatchCheckLayerAvailability",
                    "ecr:BatchGetImage",
                    "ecr:GetDownloadUrlForLayer",
                    "ecr:InitiateLayerUpload",
                    "ecr:UploadLayerPart",
                    "ecr:CompleteLayerUpload",
                    "ecr:PutImage"
                ],
                "Resource": repository_arn(region, account_id, repository)
            },
            {
                "Sid": "RegistryToken",
                "Effect": "Allow",
                "Action": "ecr:GetAuthorizationToken",
                "Resource": "*"
            },
            {
                "Sid": "BuildLogs",
                "Effect": "Allow",
                "Action": ["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
                "Resource": format!(
                    "arn:aws:logs:{}:{}:log-group:/aws/codebuild/{}*",
                    region, account_id, project
                )
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_trust_scoped_to_account() {
        let policy = runtime_trust_policy("us-west-2", "123456789012");
        let statement = &policy["Statement"][0];
        assert_eq!(statement["Principal"]["Service"], RUNTIME_SERVICE_PRINCIPAL);
        assert_eq!(
            statement["Condition"]["StringEquals"]["aws:SourceAccount"],
            "123456789012"
        );
    }

    #[test]
    fn test_build_trust_principal() {
        let policy = build_trust_policy("123456789012");
        assert_eq!(policy["Statement"][0]["Principal"]["Service"], BUILD_SERVICE_PRINCIPAL);
    }

    #[test]
    fn test_build_permissions_cover_bucket_and_repository() {
        let policy = build_permissions("eu-west-1", "1", "bucket", "repo", "proj").to_string();
        assert!(policy.contains("arn:aws:s3:::bucket/*"));
        assert!(policy.contains("arn:aws:ecr:eu-west-1:1:repository/repo"));
        assert!(policy.contains("/aws/codebuild/proj"));
    }
}
