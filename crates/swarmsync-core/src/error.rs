//! Error types for the SwarmSync core

use swarmsync_types::{PeerId, TransferProblem, TransferState};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the transfer core
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transfer not found: {0}")]
    NotFound(Uuid),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Peer {0} disconnected")]
    PeerDisconnected(PeerId),

    #[error("Peer {peer} refused the request: {message}")]
    PeerRefused { peer: PeerId, message: String },

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: TransferState,
        to: TransferState,
    },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("No sources available for {0}")]
    NoSources(String),

    #[error("{0} was modified locally")]
    LocalModification(String),

    #[error("{0} was deleted")]
    TargetDeleted(String),

    #[error("Version {version} of {path} was superseded")]
    Superseded { path: String, version: u64 },

    #[error("Local file {0} does not match the requested version")]
    FileNotFound(String),

    #[error("Transfer was aborted")]
    Aborted,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Timeout")]
    Timeout,
}

impl SyncError {
    /// Classify this error into the problem code reported to observers
    pub fn problem(&self) -> TransferProblem {
        match self {
            SyncError::Network(_) | SyncError::Timeout | SyncError::PeerDisconnected(_) => {
                TransferProblem::PeerDisconnected
            }
            SyncError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                TransferProblem::FileNotFound
            }
            SyncError::Io(_) | SyncError::Database(_) => TransferProblem::IoError,
            SyncError::FileNotFound(_) => TransferProblem::FileNotFound,
            SyncError::ChecksumMismatch { .. } => TransferProblem::ChecksumMismatch,
            SyncError::NoSources(_) => TransferProblem::NoSources,
            SyncError::PeerRefused { .. } | SyncError::ServerError { .. } => {
                TransferProblem::BrokenDownload
            }
            SyncError::LocalModification(_) => TransferProblem::LocalModification,
            SyncError::TargetDeleted(_) => TransferProblem::TargetDeleted,
            SyncError::Superseded { .. } => TransferProblem::Superseded,
            _ => TransferProblem::General,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.problem().is_retryable()
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

// Allow converting to String for collaborators that only display messages
impl From<SyncError> for String {
    fn from(error: SyncError) -> Self {
        error.to_string()
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_file_not_found() {
        let err = SyncError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.problem(), TransferProblem::FileNotFound);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_local_modification_is_not_retryable() {
        let err = SyncError::LocalModification("a.txt".into());
        assert_eq!(err.problem(), TransferProblem::LocalModification);
        assert!(!err.is_retryable());
        assert!(!SyncError::Aborted.is_retryable());
    }
}
