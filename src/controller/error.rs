//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Unparsable quantity or otherwise unusable declared configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Database dial, ping or buildInfo failure
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Optimistic concurrency conflict on update
    #[error("Conflict updating {0}")]
    Conflict(String),

    /// Object expected to exist was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// No pod is running and ready to run the replica set bootstrap
    #[error("No running and ready mongod container for replset {0}")]
    NoEligibleMember(String),

    /// Command executed inside a container failed
    #[error("Exec failed in pod {pod}: {message}")]
    Exec { pod: String, message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A replica set pass failed
    #[error("replset {name}: {source}")]
    Replset {
        name: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the replica set it came from.
    pub fn in_replset(self, name: &str) -> Self {
        Error::Replset {
            name: name.to_string(),
            source: Box::new(self),
        }
    }

    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            Error::NotFound(_) => true,
            Error::Replset { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, conflicts and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Connectivity(_)
            | Error::Conflict(_)
            | Error::NoEligibleMember(_)
            | Error::Exec { .. }
            | Error::NotFound(_) => true,
            Error::Config(_) | Error::Validation(_) | Error::MissingField(_) => false,
            Error::Serialization(_) => false,
            Error::Replset { source, .. } => source.is_retryable(),
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(15)
        } else {
            // Configuration problems only clear when the spec changes
            Duration::from_secs(300)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
