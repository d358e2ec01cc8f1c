use super::{Commit, HistoryError, HistoryLog};
use crate::job::CommitId;
use parking_lot::Mutex;
use std::path::PathBuf;

#[derive(Debug, Clone)]
struct StoredCommit {
    commit: Commit,
    artifacts: Vec<PathBuf>,
}

/// History log kept in process memory.
///
/// Behaves like the git log (ordered, append-only, compare-and-swap appends)
/// without touching disk; artifacts are recorded by path only.
#[derive(Debug, Default)]
pub struct MemoryLog {
    commits: Mutex<Vec<StoredCommit>>,
}

/// spread sequential numbers so abbreviated ids stay distinct
fn commit_id(sequence: u64) -> CommitId {
    let mut value = sequence.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^= value >> 31;

    CommitId::new(format!("{value:016x}{sequence:08x}"))
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// every commit so far, oldest first
    pub fn commits(&self) -> Vec<Commit> {
        self.commits
            .lock()
            .iter()
            .map(|stored| stored.commit.clone())
            .collect()
    }

    /// artifacts committed together with `commit`
    pub fn artifacts_of(&self, commit: &CommitId) -> Option<Vec<PathBuf>> {
        self.commits
            .lock()
            .iter()
            .find(|stored| &stored.commit.id == commit)
            .map(|stored| stored.artifacts.clone())
    }
}

impl HistoryLog for MemoryLog {
    fn head(&self) -> Result<Option<CommitId>, HistoryError> {
        Ok(self
            .commits
            .lock()
            .last()
            .map(|stored| stored.commit.id.clone()))
    }

    fn commits_since(&self, since: Option<&CommitId>) -> Result<Vec<Commit>, HistoryError> {
        let commits = self.commits.lock();

        let start = match since {
            None => 0,
            Some(since) => {
                commits
                    .iter()
                    .position(|stored| &stored.commit.id == since)
                    .ok_or_else(|| HistoryError::UnknownReference(since.to_string()))?
                    + 1
            }
        };

        Ok(commits[start..]
            .iter()
            .map(|stored| stored.commit.clone())
            .collect())
    }

    fn append(
        &self,
        expected_head: Option<&CommitId>,
        message: &str,
        artifacts: &[PathBuf],
    ) -> Result<CommitId, HistoryError> {
        let mut commits = self.commits.lock();
        let actual = commits.last().map(|stored| stored.commit.id.clone());

        if actual.as_ref() != expected_head {
            return Err(HistoryError::HeadMoved {
                expected: expected_head.cloned(),
                actual,
            });
        }

        let id = commit_id(commits.len() as u64);
        commits.push(StoredCommit {
            commit: Commit {
                id: id.clone(),
                message: message.to_owned(),
            },
            artifacts: artifacts.to_vec(),
        });

        Ok(id)
    }

    /// Accepts `HEAD`, `HEAD~N` and unique prefixes of commit ids
    fn resolve(&self, reference: &str) -> Result<CommitId, HistoryError> {
        let commits = self.commits.lock();
        let unknown = || HistoryError::UnknownReference(reference.to_owned());

        if let Some(offset) = reference.strip_prefix("HEAD") {
            let back = match offset.strip_prefix('~') {
                Some(count) => count.parse::<usize>().map_err(|_| unknown())?,
                None if offset.is_empty() => 0,
                None => return Err(unknown()),
            };

            return commits
                .len()
                .checked_sub(back + 1)
                .map(|index| commits[index].commit.id.clone())
                .ok_or_else(unknown);
        }

        let mut matching = commits
            .iter()
            .filter(|stored| stored.commit.id.as_str().starts_with(reference));

        match (matching.next(), matching.next()) {
            (Some(stored), None) if !reference.is_empty() => Ok(stored.commit.id.clone()),
            (Some(_), Some(_)) => Err(HistoryError::AmbiguousReference(reference.to_owned())),
            _ => Err(unknown()),
        }
    }
}
