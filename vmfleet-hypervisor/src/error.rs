//! Error types for the hypervisor transport layer.

use thiserror::Error;

/// Errors that can occur while talking to a hypervisor endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// The endpoint rejected our credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The connection was closed or lost.
    #[error("Connection lost: {0}")]
    Disconnected(String),

    /// Domain was not found.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// Storage pool was not found.
    #[error("Storage pool not found: {0}")]
    PoolNotFound(String),

    /// Storage volume was not found.
    #[error("Storage volume not found: {0}")]
    VolumeNotFound(String),

    /// General operation failed.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A running job was aborted on request.
    #[error("Job aborted: {0}")]
    Aborted(String),

    /// Domain is in an invalid state for the requested operation.
    #[error("Invalid domain state for operation: {0}")]
    InvalidState(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    /// Whether the error means the endpoint itself is gone, rather than a
    /// single call having failed.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, HypervisorError::Disconnected(_))
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
