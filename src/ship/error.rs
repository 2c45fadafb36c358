//! Shipping pipeline errors
//!
//! Every error is fatal: the first one observed cancels the whole run.

use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShipError {
    /// Bad URL, bad path, or other invalid settings detected at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The store could not be opened or queried
    #[error("Storage access error: {0}")]
    StorageAccess(#[from] StorageError),

    /// A batch could not be serialized
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The request never got a response (DNS, connect, timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote endpoint answered with something other than 204
    #[error("Remote rejected write with status {status}: {body}")]
    RemoteRejection { status: u16, body: String },

    /// This unit stopped because another unit failed first
    #[error("Pipeline cancelled")]
    Cancelled,

    /// A pipeline task panicked or was aborted
    #[error("Pipeline task failed: {0}")]
    Task(String),
}

impl ShipError {
    /// Whether this error is only a consequence of another failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ShipError::Cancelled)
    }
}

impl From<reqwest::Error> for ShipError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ShipError::Transport(format!("request timed out: {}", err))
        } else if err.is_connect() {
            ShipError::Transport(format!("connection failed: {}", err))
        } else {
            ShipError::Transport(err.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for ShipError {
    fn from(err: tokio::task::JoinError) -> Self {
        ShipError::Task(err.to_string())
    }
}

pub type ShipResult<T> = Result<T, ShipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_rejection_display() {
        let err = ShipError::RemoteRejection {
            status: 500,
            body: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "Remote rejected write with status 500: boom"
        );
    }

    #[test]
    fn test_storage_error_converts() {
        let err: ShipError = StorageError::Closed.into();
        assert!(matches!(err, ShipError::StorageAccess(StorageError::Closed)));
        assert!(!err.is_cancelled());
    }
}
