//! Failure Injection for the Mock Cloud
//!
//! Supports configurable failure injection for testing error paths.

use std::collections::HashMap;
use std::time::Duration;

use crate::cloud::{CloudError, CloudOp};

/// Failure configuration for an operation
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Error to return (if any)
    pub error: Option<CloudError>,
    /// Delay to add before responding
    pub delay: Option<Duration>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    /// Create a config that returns an error
    pub fn error(error: CloudError) -> Self {
        Self {
            error: Some(error),
            delay: None,
            fail_count: None,
        }
    }

    /// Create a throttling error
    pub fn throttled() -> Self {
        Self::error(CloudError::Throttled {
            message: "Rate exceeded".to_string(),
        })
    }

    /// Create a transient network error
    pub fn transient() -> Self {
        Self::error(CloudError::Transient {
            message: "Connection reset by peer".to_string(),
        })
    }

    /// Create an access-denied error naming the missing action
    pub fn access_denied(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::error(CloudError::AccessDenied {
            message: format!("not authorized to perform: {}", action),
            action: Some(action),
        })
    }

    /// Create a config that just adds delay
    pub fn delay(duration: Duration) -> Self {
        Self {
            error: None,
            delay: Some(duration),
            fail_count: None,
        }
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }
}

/// Failure injector for the mock cloud
#[derive(Debug, Default)]
pub struct FailureInjector {
    /// Per-operation failure configs
    configs: HashMap<CloudOp, FailureConfig>,
    /// Call counts per operation (for fail_count tracking)
    call_counts: HashMap<CloudOp, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a failure for an operation
    pub fn inject(&mut self, op: CloudOp, config: FailureConfig) {
        self.configs.insert(op, config);
        self.call_counts.insert(op, 0);
    }

    /// Clear all failure injections
    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    /// Clear failure injection for a specific operation
    pub fn clear_op(&mut self, op: CloudOp) {
        self.configs.remove(&op);
        self.call_counts.remove(&op);
    }

    /// Check if a failure should occur for an operation
    ///
    /// Returns the failure config if one should occur, None otherwise.
    pub fn check(&mut self, op: CloudOp) -> Option<&FailureConfig> {
        let config = self.configs.get(&op)?;
        let count = self.call_counts.entry(op).or_insert(0);
        *count += 1;

        if let Some(fail_limit) = config.fail_count {
            if *count > fail_limit {
                return None;
            }
        }

        Some(config)
    }
}
