//! Error types for the state engine.

use thiserror::Error;
use vmfleet_hypervisor::HypervisorError;

/// Errors surfaced by the state engine.
///
/// `Clone` so that every waiter of a shared fetch receives the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No endpoint with that name is configured.
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// The endpoint could not be reached (refused, timed out, cancelled).
    #[error("Endpoint {endpoint} unreachable: {reason}")]
    EndpointUnreachable { endpoint: String, reason: String },

    /// The endpoint rejected our credentials.
    #[error("Authentication failed for {endpoint}: {reason}")]
    AuthenticationFailed { endpoint: String, reason: String },

    /// The endpoint has no live connection.
    #[error("Endpoint not connected: {0}")]
    NotConnected(String),

    /// A hypervisor call failed; carries the original diagnostic.
    #[error("{operation} on {endpoint} failed: {diagnostic}")]
    RemoteCallFailed {
        endpoint: String,
        operation: String,
        diagnostic: String,
    },

    /// The domain already has a non-terminal migration job.
    #[error("Domain {domain} is already migrating (job {job_id})")]
    AlreadyMigrating { domain: String, job_id: String },

    /// Compatibility check found blocking problems. Nothing was changed.
    #[error("Migration preflight failed: {}", .0.join("; "))]
    MigrationPreflightFailed(Vec<String>),

    /// Storage preparation or transfer failed, possibly after remote changes.
    #[error("Migration transfer failed: {0}")]
    MigrationTransferFailed(String),

    /// The migration was cancelled and the hypervisor confirmed the abort.
    #[error("Migration cancelled")]
    Cancelled,

    /// The connection dropped while an operation was using it.
    #[error("Endpoint lost: {0}")]
    EndpointLost(String),

    #[error("Migration job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Wrap a hypervisor call failure.
    pub fn remote(endpoint: &str, operation: &str, err: HypervisorError) -> Self {
        EngineError::RemoteCallFailed {
            endpoint: endpoint.to_string(),
            operation: operation.to_string(),
            diagnostic: err.to_string(),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_keeps_diagnostic() {
        let err = EngineError::remote(
            "node1",
            "domain_info",
            HypervisorError::DomainNotFound("abc".to_string()),
        );
        assert_eq!(err.to_string(), "domain_info on node1 failed: Domain not found: abc");
    }

    #[test]
    fn test_preflight_error_lists_issues() {
        let err = EngineError::MigrationPreflightFailed(vec![
            "arch mismatch".to_string(),
            "pool missing".to_string(),
        ]);
        assert_eq!(err.to_string(), "Migration preflight failed: arch mismatch; pool missing");
    }
}
