//! Deterministic resource names
//!
//! Every name is a pure function of `(agent, region, account)`, so a
//! repeated launch finds the resources an earlier one created.

use sha2::{Digest, Sha256};

/// Longest accepted agent name
pub const MAX_AGENT_NAME_LEN: usize = 48;

/// Errors for agent names
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("agent name must not be empty")]
    Empty,

    #[error("agent name must start with a letter: {0}")]
    BadStart(String),

    #[error("agent name may only contain letters, digits and underscores: {0}")]
    BadCharacter(String),

    #[error("agent name is longer than {} characters: {0}", MAX_AGENT_NAME_LEN)]
    TooLong(String),
}

/// Check an agent name against the runtime service's naming rules
pub fn validate_agent_name(name: &str) -> Result<(), NameError> {
    let first = name.chars().next().ok_or(NameError::Empty)?;
    if !first.is_ascii_alphabetic() {
        return Err(NameError::BadStart(name.to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(NameError::BadCharacter(name.to_string()));
    }
    if name.len() > MAX_AGENT_NAME_LEN {
        return Err(NameError::TooLong(name.to_string()));
    }
    Ok(())
}

/// Short stable suffix derived from the agent name
fn agent_suffix(agent: &str) -> String {
    hex::encode(Sha256::digest(agent.as_bytes()))[..10].to_string()
}

/// Source bucket shared by every agent of an account and region
pub fn bucket_name(account_id: &str, region: &str) -> String {
    format!("agent-launch-sources-{}-{}", account_id, region)
}

pub fn runtime_role_name(agent: &str, region: &str) -> String {
    format!("AgentLaunchRuntime-{}-{}", region, agent_suffix(agent))
}

pub fn build_role_name(agent: &str, region: &str) -> String {
    format!("AgentLaunchBuild-{}-{}", region, agent_suffix(agent))
}

/// Repository names must be lowercase
pub fn repository_name(agent: &str) -> String {
    format!("agent-launch-{}", agent.to_lowercase().replace('_', "-"))
}

pub fn project_name(agent: &str) -> String {
    format!("agent-launch-{}-builder", agent)
}

/// Identifier passed to builds as `STACK_ID`
pub fn stack_id(agent: &str, region: &str) -> String {
    format!("agent-launch-{}-{}", agent, region)
}

/// Role name from a role ARN (`arn:aws:iam::123:role/path/Name`)
pub fn role_name_from_arn(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}
