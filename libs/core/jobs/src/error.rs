//! Error types shared by every job source.

use std::fmt;
use thiserror::Error;

/// Error categories tell an orchestrator whether an operation is worth retrying.
///
/// The consumer itself never retries: connect and subscribe failures are
/// returned to whoever supervises the pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure (broker unreachable, publish timeout)
    Transient,

    /// Failure that will repeat on retry (bad configuration, unsupported option)
    Permanent,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors returned by job sources, delivery handles and dispatch queues.
#[derive(Debug, Error)]
pub enum JobsError {
    /// Missing or invalid pipeline/broker configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broker connection could not be established or was lost
    #[error("connect error: {0}")]
    Connect(String),

    /// Broker refused or failed the subscription
    #[error("subscribe error: {0}")]
    Subscribe(String),

    /// Publishing to the broker failed
    #[error("publish error: {0}")]
    Publish(String),

    /// The requested option is not supported by this broker binding
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// An operation named a pipeline other than the registered one
    #[error("no such pipeline registered: requested {requested}, registered {registered}")]
    PipelineMismatch {
        requested: String,
        registered: String,
    },

    /// Run was called before any pipeline was registered
    #[error("no pipeline registered")]
    NotRegistered,

    /// A listener is already active for this pipeline
    #[error("pipeline {0} is already running")]
    AlreadyRunning(String),

    /// The consumer has been stopped and released its broker connection
    #[error("pipeline {0} is stopped")]
    Stopped(String),

    /// Message body could not be (de)serialized
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Broker delivery metadata was missing or malformed
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Deleting a message or stream failed
    #[error("delete error: {0}")]
    Delete(String),

    /// Acknowledgement (ack/nak) could not be delivered to the broker
    #[error("ack error: {0}")]
    Ack(String),

    /// Any other broker-side failure
    #[error("broker error: {0}")]
    Broker(String),
}

impl JobsError {
    /// Create an unsupported feature error.
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::UnsupportedFeature(feature.into())
    }

    /// Create a pipeline mismatch error.
    pub fn mismatch(requested: impl Into<String>, registered: impl Into<String>) -> Self {
        Self::PipelineMismatch {
            requested: requested.into(),
            registered: registered.into(),
        }
    }

    /// Get the error category for retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            JobsError::Connect(_) => ErrorCategory::Transient,
            JobsError::Subscribe(_) => ErrorCategory::Transient,
            JobsError::Publish(_) => ErrorCategory::Transient,
            JobsError::Ack(_) => ErrorCategory::Transient,
            JobsError::Delete(_) => ErrorCategory::Transient,
            JobsError::Broker(_) => ErrorCategory::Transient,

            JobsError::Configuration(_) => ErrorCategory::Permanent,
            JobsError::UnsupportedFeature(_) => ErrorCategory::Permanent,
            JobsError::PipelineMismatch { .. } => ErrorCategory::Permanent,
            JobsError::NotRegistered => ErrorCategory::Permanent,
            JobsError::AlreadyRunning(_) => ErrorCategory::Permanent,
            JobsError::Stopped(_) => ErrorCategory::Permanent,
            JobsError::Decode(_) => ErrorCategory::Permanent,
            JobsError::Metadata(_) => ErrorCategory::Permanent,
        }
    }

    /// Check if the failed operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let connect = JobsError::Connect("connection refused".to_string());
        assert_eq!(connect.category(), ErrorCategory::Transient);
        assert!(connect.is_transient());

        let decode = JobsError::Decode(serde_json::from_str::<String>("invalid").unwrap_err());
        assert_eq!(decode.category(), ErrorCategory::Permanent);

        let unsupported = JobsError::unsupported("delayed delivery");
        assert_eq!(unsupported.category(), ErrorCategory::Permanent);
        assert!(!unsupported.is_transient());
    }

    #[test]
    fn test_mismatch_message() {
        let err = JobsError::mismatch("other", "p1");
        let message = err.to_string();
        assert!(message.contains("other"));
        assert!(message.contains("p1"));
    }
}
