//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use agent_launch::mock::MockCloud;
use agent_launch::signal::SignalState;
use agent_launch::state::state_path;
use agent_launch::{BuildMode, CloudContext, LaunchConfig, LaunchRequest, Launcher};
use tempfile::TempDir;

pub const REGION: &str = "us-west-2";
pub const AGENT: &str = "support_bot";

/// Config with every wait set to zero
pub fn fast_config(region: &str) -> LaunchConfig {
    let mut config = LaunchConfig::default();
    config.region = region.to_string();
    config.retry.max_retries = 0;
    config.monitor.poll_interval_ms = 0;
    config.monitor.jitter_ms = 0;
    config.deploy.poll_interval_ms = 0;
    config.provision.role_propagation_seconds = 0;
    config
}

/// Minimal agent source tree
pub fn write_agent_source(root: &Path) {
    fs::write(root.join("Dockerfile"), "FROM python:3.12-slim\nCOPY . /app\nCMD [\"python\", \"/app/agent.py\"]\n").unwrap();
    fs::write(root.join("agent.py"), "def handler(event):\n    return event\n").unwrap();
    fs::write(root.join("requirements.txt"), "boto3\n").unwrap();
    fs::create_dir_all(root.join("tools")).unwrap();
    fs::write(root.join("tools/search.py"), "def search(q):\n    return []\n").unwrap();
}

pub fn agent_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_agent_source(dir.path());
    dir
}

pub fn mock(region: &str) -> Arc<MockCloud> {
    Arc::new(MockCloud::new(region))
}

pub fn context(mock: &Arc<MockCloud>, region: &str) -> CloudContext {
    CloudContext::with_account(mock.clone(), region, mock.account())
}

pub fn launcher(mock: &Arc<MockCloud>, dir: &TempDir, config: LaunchConfig) -> Launcher {
    let ctx = context(mock, &config.region.clone());
    Launcher::new(ctx, config, Arc::new(SignalState::new()), state_path(dir.path()))
}

pub fn remote_request(dir: &TempDir, region: &str) -> LaunchRequest {
    LaunchRequest {
        agent_name: AGENT.to_string(),
        region: region.to_string(),
        source_dir: dir.path().to_path_buf(),
        mode: BuildMode::Remote,
        auto_update_on_conflict: false,
        env: BTreeMap::new(),
    }
}
