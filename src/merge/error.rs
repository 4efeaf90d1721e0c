use std::{collections::TryReserveError, io};

use thiserror::Error;

/// Errors that can surface while planning, executing, or installing a merge.
///
/// Running out of merge work is not an error; see [`crate::MergeOutcome::NoWorkAvailable`].
#[derive(Debug, Error)]
pub enum MergeError {
    /// The retired-chunk pool could not grow.
    #[error("retired chunk pool could not grow: {0}")]
    ResourceExhaustion(#[from] TryReserveError),
    /// Reading or writing a chunk store, bloom filter, or metadata document failed.
    #[error("merge io error: {0}")]
    Io(#[from] io::Error),
    /// Tree metadata could not be encoded or decoded.
    #[error("tree metadata codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// A persisted artifact failed its checksum.
    #[error("checksum mismatch in {0}")]
    Checksum(String),
    /// The storage layer has no store behind the given reference.
    #[error("unknown store reference {0}")]
    MissingStore(String),
    /// An invariant of the tree or of a merge was violated. Indicates a logic bug.
    #[error("inconsistent tree state: {0}")]
    InconsistentState(String),
}

impl MergeError {
    pub(crate) fn inconsistent(msg: impl Into<String>) -> Self {
        MergeError::InconsistentState(msg.into())
    }

    /// Returns `true` for failures caused by storage or metadata I/O.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            MergeError::Io(_) | MergeError::Checksum(_) | MergeError::MissingStore(_)
        )
    }
}
