//! Provider-neutral cloud error classification
//!
//! Every backend maps its native failures onto this closed set so that
//! the provisioning, monitoring and deploy stages can decide between
//! "retry", "fall back to get" and "abort" without knowing which service
//! produced the error.

/// Errors returned by cloud service calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudError {
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    #[error("conflict on {resource}: {message}")]
    Conflict { resource: String, message: String },

    #[error("access denied: {message}")]
    AccessDenied {
        /// The IAM action the caller lacks, when the service names it
        action: Option<String>,
        message: String,
    },

    #[error("request throttled: {message}")]
    Throttled { message: String },

    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("{code}: {message}")]
    Service { code: String, message: String },
}

impl CloudError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        CloudError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn already_exists(resource: impl Into<String>) -> Self {
        CloudError::AlreadyExists {
            resource: resource.into(),
        }
    }

    /// Throttling and network blips are the only retryable classes
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Throttled { .. } | CloudError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, CloudError::AlreadyExists { .. })
    }
}

/// Result type for cloud calls
pub type CloudResult<T> = Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(CloudError::Throttled { message: "slow down".into() }.is_retryable());
        assert!(CloudError::Transient { message: "reset".into() }.is_retryable());
        assert!(!CloudError::not_found("role").is_retryable());
        assert!(!CloudError::AccessDenied {
            action: Some("iam:CreateRole".into()),
            message: "no".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_display() {
        let err = CloudError::already_exists("bucket my-bucket");
        assert_eq!(err.to_string(), "bucket my-bucket already exists");
    }
}
