//! Error types for the sync engine.

use thiserror::Error;

use crate::models::EntityKind;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the pull, push and orchestration layers.
///
/// Adapter failures keep the full message chain of the underlying error
/// so the reason shown to the user is the one the store reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No signed-in principal. Not retried automatically.
    #[error("not signed in")]
    NotAuthenticated,

    /// Local store I/O failed.
    #[error("local store error: {0}")]
    Local(String),

    /// Remote store I/O failed (network, HTTP status or decoding).
    #[error("remote store error: {0}")]
    Remote(String),

    /// Some fact records of one kind failed to upload. Records that did
    /// upload stay marked synced.
    #[error("{failed} of {attempted} {kind} records failed to upload: {last_error}")]
    PartialUploadFailure {
        kind: EntityKind,
        failed: usize,
        attempted: usize,
        last_error: String,
    },
}

impl SyncError {
    #[must_use]
    pub fn local(err: anyhow::Error) -> Self {
        Self::Local(format!("{err:#}"))
    }

    #[must_use]
    pub fn remote(err: anyhow::Error) -> Self {
        Self::Remote(format!("{err:#}"))
    }

    /// True for local or remote I/O failures.
    #[must_use]
    pub fn is_adapter(&self) -> bool {
        matches!(self, Self::Local(_) | Self::Remote(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn adapter_errors_keep_context_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("connection reset"));
        let err = err.context("create meals document").unwrap_err();

        let sync = SyncError::remote(err);
        assert!(sync.is_adapter());
        assert_eq!(
            sync.to_string(),
            "remote store error: create meals document: connection reset"
        );
    }

    #[test]
    fn partial_failure_display() {
        let err = SyncError::PartialUploadFailure {
            kind: EntityKind::Meal,
            failed: 1,
            attempted: 3,
            last_error: "remote store error: timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "1 of 3 meal records failed to upload: remote store error: timeout"
        );
        assert!(!err.is_adapter());
        assert!(!SyncError::NotAuthenticated.is_adapter());
    }
}
