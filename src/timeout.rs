//! Timeout configuration and build deadline tracking
//!
//! Three separate limits apply to a launch:
//! - `build_seconds`: how long the monitor waits for the remote build
//! - `request_seconds` / `connect_seconds`: per-request socket limits
//!   handed to the cloud backend
//! - `deploy_ready_seconds`: how long the deployer waits for READY
//!
//! The build deadline is charged only for time the remote service was
//! reachable. Time spent retrying failed polls is excused.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Maximum monitored build time (default: 1800 = 30 min)
    pub build_seconds: u64,

    /// Socket read timeout per cloud request (default: 60)
    pub request_seconds: u64,

    /// Socket connect timeout per cloud request (default: 30)
    pub connect_seconds: u64,

    /// Maximum wait for the runtime to become READY (default: 600)
    pub deploy_ready_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            build_seconds: 1800,
            request_seconds: 60,
            connect_seconds: 30,
            deploy_ready_seconds: 600,
        }
    }
}

impl TimeoutConfig {
    /// Validate bounds
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        // The build service caps builds at 8 hours
        if self.build_seconds == 0 || self.build_seconds > 28_800 {
            return Err(TimeoutValidationError::BuildOutOfBounds {
                value: self.build_seconds,
            });
        }

        if self.request_seconds == 0 || self.request_seconds > 900 {
            return Err(TimeoutValidationError::RequestOutOfBounds {
                value: self.request_seconds,
            });
        }

        if self.connect_seconds == 0 || self.connect_seconds > 300 {
            return Err(TimeoutValidationError::ConnectOutOfBounds {
                value: self.connect_seconds,
            });
        }

        if self.deploy_ready_seconds == 0 || self.deploy_ready_seconds > 3600 {
            return Err(TimeoutValidationError::DeployReadyOutOfBounds {
                value: self.deploy_ready_seconds,
            });
        }

        Ok(())
    }

    pub fn build_limit(&self) -> Duration {
        Duration::from_secs(self.build_seconds)
    }

    pub fn deploy_ready_limit(&self) -> Duration {
        Duration::from_secs(self.deploy_ready_seconds)
    }
}

/// Timeout validation errors
#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("build_seconds must be in (0, 28800], got {value}")]
    BuildOutOfBounds { value: u64 },

    #[error("request_seconds must be in (0, 900], got {value}")]
    RequestOutOfBounds { value: u64 },

    #[error("connect_seconds must be in (0, 300], got {value}")]
    ConnectOutOfBounds { value: u64 },

    #[error("deploy_ready_seconds must be in (0, 3600], got {value}")]
    DeployReadyOutOfBounds { value: u64 },
}

/// Wall-clock deadline that can excuse periods of unavailability
#[derive(Debug)]
pub struct BuildDeadline {
    limit: Duration,
    start_time: Instant,
    excused: Duration,
}

impl BuildDeadline {
    /// Start a deadline of `limit` from now
    pub fn start(limit: Duration) -> Self {
        Self {
            limit,
            start_time: Instant::now(),
            excused: Duration::ZERO,
        }
    }

    /// Do not charge `span` against the limit
    pub fn excuse(&mut self, span: Duration) {
        self.excused += span;
    }

    /// Time charged against the limit so far
    pub fn charged(&self) -> Duration {
        self.start_time.elapsed().saturating_sub(self.excused)
    }

    pub fn is_expired(&self) -> bool {
        self.charged() >= self.limit
    }

    /// Remaining charged time before expiry
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.charged())
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_timeout_config_default() {
        let config = TimeoutConfig::default();
        assert_eq!(config.build_seconds, 1800);
        assert_eq!(config.request_seconds, 60);
        assert_eq!(config.connect_seconds, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_config_validation_build_zero() {
        let config = TimeoutConfig {
            build_seconds: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TimeoutValidationError::BuildOutOfBounds { value: 0 })
        ));
    }

    #[test]
    fn test_timeout_config_validation_build_too_large() {
        let config = TimeoutConfig {
            build_seconds: 28_801,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_config_validation_request() {
        let config = TimeoutConfig {
            request_seconds: 901,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TimeoutValidationError::RequestOutOfBounds { value: 901 })
        ));
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = BuildDeadline::start(Duration::from_millis(20));
        assert!(!deadline.is_expired());
        sleep(Duration::from_millis(40));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_excused_time_not_charged() {
        let mut deadline = BuildDeadline::start(Duration::from_millis(50));
        sleep(Duration::from_millis(60));
        deadline.excuse(Duration::from_millis(60));
        assert!(!deadline.is_expired());
        assert!(deadline.charged() < Duration::from_millis(50));
    }
}
