// Error types for the compute control plane

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ComputeError>;

/// Errors from the driver, client, and host RPC surface
#[derive(Debug, Error)]
pub enum ComputeError {
    /// Host id not registered in the pool
    #[error("Host not found: {0}")]
    HostNotFound(String),

    /// Host registered but has no usable client
    #[error("Host unavailable: {0}")]
    HostUnavailable(String),

    /// The host answered 404 for a workspace it should know. This is a
    /// reconcile signal, not a plain error: the caller re-provisions.
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    /// Docker API failure
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Compute service HTTP failure
    #[error("Compute service error ({status}): {message}")]
    Http { status: u16, message: String },

    /// Network-level failure talking to the compute service
    #[error("Compute service connection error: {0}")]
    Connection(String),

    /// Operation exceeded its deadline
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}

impl ComputeError {
    pub fn other(msg: impl Into<String>) -> Self {
        ComputeError::Other(msg.into())
    }

    /// Whether this error means the host forgot the workspace
    pub fn is_not_found(&self) -> bool {
        match self {
            ComputeError::WorkspaceNotFound(_) => true,
            ComputeError::Http { status, .. } => *status == 404,
            ComputeError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code == 404,
            _ => false,
        }
    }
}
