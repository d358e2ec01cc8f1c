//! The version-controlled history log all clients share.
//!
//! Every schedule and finish is a commit whose message carries a
//! machine-readable record (see `record`). The log is append-only and the
//! only point of synchronisation between clients: appends are
//! compare-and-swap against the head a client based its decision on.

pub mod git;
pub mod memory;
pub mod record;

pub use record::{FinishRecord, HistoryRecord, ScheduleRecord};

use crate::job::CommitId;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History moved from {expected:?} to {actual:?} underneath the append")]
    HeadMoved {
        expected: Option<CommitId>,
        actual: Option<CommitId>,
    },
    #[error("Unknown history reference '{0}'")]
    UnknownReference(String),
    #[error("Reference '{0}' is ambiguous")]
    AmbiguousReference(String),
    #[error("Failed to run git {command}: {stderr}")]
    Command { command: String, stderr: String },
    #[error("Failed to access repository")]
    Io(#[from] std::io::Error),
    #[error("Commit {commit} carries a malformed record")]
    MalformedRecord {
        commit: CommitId,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize record")]
    Serialize(#[from] serde_json::Error),
}

/// A raw commit of the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: CommitId,
    pub message: String,
}

/// A commit carrying a schedule or finish record
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub commit: CommitId,
    pub record: HistoryRecord,
}

/// Append-only, ordered log of commits
pub trait HistoryLog: Send + Sync {
    /// current head, `None` for an empty history
    fn head(&self) -> Result<Option<CommitId>, HistoryError>;

    /// commits strictly after `since` (everything if `None`), oldest first
    fn commits_since(&self, since: Option<&CommitId>) -> Result<Vec<Commit>, HistoryError>;

    /// Append a commit with `message`, committing the current content of
    /// `artifacts` (relative to the repository root) along with it.
    ///
    /// Fails with `HistoryError::HeadMoved` without appending anything if
    /// the head isn't `expected_head` anymore.
    fn append(
        &self,
        expected_head: Option<&CommitId>,
        message: &str,
        artifacts: &[PathBuf],
    ) -> Result<CommitId, HistoryError>;

    /// resolve a user supplied history point to a commit
    fn resolve(&self, reference: &str) -> Result<CommitId, HistoryError>;
}

impl<T: HistoryLog + ?Sized> HistoryLog for Arc<T> {
    fn head(&self) -> Result<Option<CommitId>, HistoryError> {
        (**self).head()
    }

    fn commits_since(&self, since: Option<&CommitId>) -> Result<Vec<Commit>, HistoryError> {
        (**self).commits_since(since)
    }

    fn append(
        &self,
        expected_head: Option<&CommitId>,
        message: &str,
        artifacts: &[PathBuf],
    ) -> Result<CommitId, HistoryError> {
        (**self).append(expected_head, message, artifacts)
    }

    fn resolve(&self, reference: &str) -> Result<CommitId, HistoryError> {
        (**self).resolve(reference)
    }
}

/// Records found in the log strictly after some history point
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Replay {
    pub entries: Vec<HistoryEntry>,
    /// last commit read, record or not; the starting point if nothing was read
    pub head: Option<CommitId>,
}

/// Schedule and finish entries strictly after `since`, in commit order.
///
/// Commits without a record are skipped but still advance `Replay::head`.
pub fn entries_since<L: HistoryLog + ?Sized>(
    log: &L,
    since: Option<&CommitId>,
) -> Result<Replay, HistoryError> {
    let mut replay = Replay {
        entries: Vec::new(),
        head: since.cloned(),
    };

    for commit in log.commits_since(since)? {
        replay.head = Some(commit.id.clone());

        match record::decode(&commit.message) {
            Ok(Some(record)) => replay.entries.push(HistoryEntry {
                commit: commit.id,
                record,
            }),
            Ok(None) => trace!(commit = %commit.id, "Skipping commit without record"),
            Err(source) => {
                return Err(HistoryError::MalformedRecord {
                    commit: commit.id,
                    source,
                })
            }
        }
    }

    Ok(replay)
}
