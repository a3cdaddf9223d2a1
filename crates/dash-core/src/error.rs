//! Error types shared by the telemetry and container-stats cores

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Library error
///
/// Variants carry rendered messages rather than source errors so the type
/// stays `Clone`; coalesced requests hand the same failure to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The container runtime or host metrics provider could not be reached
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    /// An upstream call did not finish within its deadline
    #[error("upstream call timed out after {0} ms")]
    Timeout(u64),

    /// The requested container does not exist
    #[error("container not found: {0}")]
    NotFound(String),

    /// Container identifier failed validation
    #[error("invalid container id: {0:?}")]
    InvalidContainerId(String),

    /// Unknown container action
    #[error("invalid action: {0:?}")]
    InvalidAction(String),

    /// Internal failure (panicked task, poisoned state)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error was caused by bad caller input
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidContainerId(_) | Error::InvalidAction(_))
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Error::NotFound(message),
            other => Error::Upstream(other.to_string()),
        }
    }
}
