//! Error types for the AutoMQ Kubernetes Operator

use std::time::Duration;
use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(String),
    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),
    /// Optimistic concurrency conflict on write
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Create raced with another writer
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    /// Object storage error
    #[error("Storage error: {0}")]
    Storage(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Invalid resource state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// A request exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),
    /// The operator is shutting down
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl OperatorError {
    /// Whether a read-mutate-write should be attempted again.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            OperatorError::Conflict(_) | OperatorError::AlreadyExists(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::NotFound(_))
    }

    /// Requeue delay used by the controller error policy.
    pub fn requeue_after(&self) -> Duration {
        match self {
            OperatorError::Conflict(_) | OperatorError::AlreadyExists(_) => Duration::from_secs(1),
            OperatorError::KubeApi(_) | OperatorError::Timeout(_) | OperatorError::Storage(_) => {
                Duration::from_secs(15)
            }
            OperatorError::Cancelled(_) => Duration::from_secs(60),
            OperatorError::NotFound(_)
            | OperatorError::Configuration(_)
            | OperatorError::Serialization(_)
            | OperatorError::InvalidState(_) => Duration::from_secs(30),
        }
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                OperatorError::AlreadyExists(ae.message.clone())
            }
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict(ae.message.clone()),
            _ => OperatorError::KubeApi(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for OperatorError {
    fn from(err: reqwest::Error) -> Self {
        OperatorError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::KubeApi("test error".to_string());
        assert!(err.to_string().contains("Kubernetes API error"));
    }

    #[test]
    fn test_conflict_classification() {
        assert!(OperatorError::Conflict("rv".to_string()).is_conflict());
        assert!(OperatorError::AlreadyExists("pvc".to_string()).is_conflict());
        assert!(!OperatorError::NotFound("pvc".to_string()).is_conflict());
        assert!(OperatorError::NotFound("pvc".to_string()).is_not_found());
    }

    #[test]
    fn test_kube_error_mapping() {
        let conflict = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        assert!(matches!(OperatorError::from(conflict), OperatorError::Conflict(_)));

        let exists = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        assert!(matches!(OperatorError::from(exists), OperatorError::AlreadyExists(_)));

        let missing = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(OperatorError::from(missing).is_not_found());
    }

    #[test]
    fn test_requeue_delay_by_class() {
        assert_eq!(
            OperatorError::Conflict("x".into()).requeue_after(),
            Duration::from_secs(1)
        );
        assert_eq!(
            OperatorError::InvalidState("x".into()).requeue_after(),
            Duration::from_secs(30)
        );
        assert_eq!(
            OperatorError::Storage("x".into()).requeue_after(),
            Duration::from_secs(15)
        );
        assert_eq!(
            OperatorError::Cancelled("x".into()).requeue_after(),
            Duration::from_secs(60)
        );
        assert_eq!(
            OperatorError::Configuration("x".into()).requeue_after(),
            Duration::from_secs(30)
        );
    }
}
