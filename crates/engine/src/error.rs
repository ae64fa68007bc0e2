// Error taxonomy for the timeline, persistence and session layers.

use rewind_common::notebook::NotebookEditError;
use rewind_common::types::Epoch;
use thiserror::Error;

/// Structural failures of the checkpoint timeline.
#[derive(Debug, Error)]
pub enum TimelineError {
    /// An operation was recorded behind the current epoch. Indicates the
    /// caller lost track of the timeline.
    #[error("cannot record operation at epoch {epoch} when current epoch is {current}")]
    EpochOrderViolation { epoch: Epoch, current: Epoch },

    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),

    /// The operation log cannot be replayed into a consistent state.
    #[error("replay impossible: {0}")]
    ReplayImpossible(String),

    #[error("delegate failed to apply file change: {0:#}")]
    Delegate(#[from] anyhow::Error),
}

impl From<NotebookEditError> for TimelineError {
    fn from(err: NotebookEditError) -> Self {
        Self::ReplayImpossible(err.to_string())
    }
}

/// Failures at the persistence boundary. Never fatal to a running session.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read session state: {0:#}")]
    PersistenceReadFailure(anyhow::Error),

    #[error("failed to write session state: {0:#}")]
    PersistenceWriteFailure(anyhow::Error),

    /// Treated the same as "no saved state".
    #[error("unsupported session storage version {0}")]
    UnsupportedStorageVersion(u32),
}

/// Failures of user-initiated session actions.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot access a disposed editing session")]
    Disposed,

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error("workspace I/O failed for {uri}: {source:#}")]
    Workspace { uri: String, source: anyhow::Error },
}
