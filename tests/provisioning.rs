//! Provisioning idempotency and region handling

mod fixtures;

use std::time::Duration;

use agent_launch::cloud::{CloudOp, RetryPolicy};
use agent_launch::mock::FailureConfig;
use agent_launch::provision::{ProvisionConfig, Provisioner};
use fixtures::*;

fn config() -> ProvisionConfig {
    ProvisionConfig {
        role_propagation_wait: Duration::ZERO,
        retry: RetryPolicy::immediate(3),
        ..Default::default()
    }
}

#[test]
fn test_repeated_ensure_creates_nothing_new() {
    let cloud = mock(REGION);
    let ctx = context(&cloud, REGION);
    let provisioner = Provisioner::new(&ctx, config());

    let first = provisioner.ensure(AGENT, REGION).unwrap();
    let creates = cloud.create_calls();
    let roles = cloud.role_count();

    for _ in 0..3 {
        let again = provisioner.ensure(AGENT, REGION).unwrap();
        assert_eq!(again, first);
    }
    assert_eq!(cloud.create_calls(), creates);
    assert_eq!(cloud.role_count(), roles);
    assert_eq!(cloud.bucket_names().len(), 1);
}

#[test]
fn test_bucket_location_depends_on_region() {
    for (region, constraint) in [("us-east-1", None), ("eu-central-1", Some("eu-central-1"))] {
        let cloud = mock(region);
        let ctx = context(&cloud, region);
        let infra = Provisioner::new(&ctx, config()).ensure(AGENT, region).unwrap();

        let bucket = cloud.bucket(&infra.bucket).unwrap();
        assert_eq!(bucket.location_constraint.as_deref(), constraint, "region {region}");
    }
}

#[test]
fn test_concurrent_creator_is_tolerated() {
    let cloud = mock(REGION);
    cloud.race_next_create(CloudOp::CreateRepository);
    let ctx = context(&cloud, REGION);

    let infra = Provisioner::new(&ctx, config()).ensure(AGENT, REGION).unwrap();
    assert!(infra.repository_uri.ends_with("/agent-launch-support-bot"));
}

#[test]
fn test_throttling_is_retried() {
    let cloud = mock(REGION);
    cloud.inject(CloudOp::CreateBucket, FailureConfig::throttled().with_fail_count(2));
    let ctx = context(&cloud, REGION);

    Provisioner::new(&ctx, config()).ensure(AGENT, REGION).unwrap();
    assert_eq!(cloud.calls(CloudOp::CreateBucket), 3);
}

#[test]
fn test_access_denied_names_missing_action() {
    let cloud = mock(REGION);
    cloud.inject(CloudOp::CreateRepository, FailureConfig::access_denied("ecr:CreateRepository"));
    let ctx = context(&cloud, REGION);

    let err = Provisioner::new(&ctx, config()).ensure(AGENT, REGION).unwrap_err();
    assert_eq!(err.category(), "PermissionError");
    assert!(err.to_string().contains("ecr:CreateRepository"));
    assert_eq!(cloud.calls(CloudOp::CreateRepository), 1);
}
