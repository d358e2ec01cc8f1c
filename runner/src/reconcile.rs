//! Rebuild the working state from the history log alone.
//!
//! The open set is a pure function of the log: replaying the same entries
//! always gives the same jobs in the same order, no matter who replays them
//! or how often.

#[cfg(test)]
mod reconcile_test;

use crate::{
    history::{entries_since, HistoryEntry, HistoryError, HistoryLog, HistoryRecord},
    index::ConflictIndex,
    job::{CommitId, Job},
};
use tracing::{debug, instrument, trace, warn};

/// The jobs without finish entry as of `head`, with the index of their outputs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenSet {
    head: Option<CommitId>,
    jobs: Vec<Job>,
    index: ConflictIndex,
}

impl OpenSet {
    pub fn new(head: Option<CommitId>, jobs: Vec<Job>) -> Self {
        Self {
            head,
            index: ConflictIndex::from_jobs(&jobs),
            jobs,
        }
    }

    /// last history point folded into this set
    pub fn head(&self) -> Option<&CommitId> {
        self.head.as_ref()
    }

    /// open jobs in schedule order
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, schedule_commit: &CommitId) -> Option<&Job> {
        self.jobs
            .iter()
            .find(|job| &job.schedule_commit == schedule_commit)
    }

    pub fn conflict_index(&self) -> &ConflictIndex {
        &self.index
    }

    /// Fold `entries` (all strictly after the current head) into the set
    pub fn apply(&mut self, entries: &[HistoryEntry], head: Option<CommitId>) {
        for entry in entries {
            match &entry.record {
                HistoryRecord::Schedule(record) => {
                    trace!(job_id = %record.job_id, commit = %entry.commit, "Opening job");
                    let job = record.clone().into_job(entry.commit.clone());
                    self.index.track(&job);
                    self.jobs.push(job);
                }
                HistoryRecord::Finish(record) => {
                    match self
                        .jobs
                        .iter()
                        .position(|job| job.schedule_commit == record.schedule_commit)
                    {
                        Some(position) => {
                            let job = self.jobs.remove(position);
                            self.index.release(&job.job_id);
                        }
                        // scheduled before the replayed range, or finished twice
                        None => trace!(
                            job_id = %record.job_id,
                            schedule_commit = %record.schedule_commit,
                            "Finish entry without open job"
                        ),
                    }
                }
            }
        }

        if head.is_some() {
            self.head = head;
        }
    }

    /// Catch up with everything appended to `log` after the current head
    pub fn advance<L: HistoryLog + ?Sized>(&mut self, log: &L) -> Result<Vec<HistoryEntry>, HistoryError> {
        let replay = entries_since(log, self.head.as_ref())?;
        self.apply(&replay.entries, replay.head);

        Ok(replay.entries)
    }
}

/// Open jobs among those scheduled strictly after `since` (all of history for `None`)
#[instrument(skip(log), level = "debug")]
pub fn rebuild_open_set<L: HistoryLog + ?Sized>(
    log: &L,
    since: Option<&CommitId>,
) -> Result<OpenSet, HistoryError> {
    let replay = entries_since(log, since)?;

    let mut open = OpenSet::new(since.cloned(), Vec::new());
    open.apply(&replay.entries, replay.head);

    debug!(
        entries = replay.entries.len(),
        open = open.len(),
        head = ?open.head(),
        "Rebuilt open jobs from history"
    );

    Ok(open)
}

/// Every job scheduled in `entries`, closed ones carrying their finish commit and state
pub fn replay_jobs(entries: &[HistoryEntry]) -> Vec<Job> {
    let mut jobs: Vec<Job> = Vec::new();

    for entry in entries {
        match &entry.record {
            HistoryRecord::Schedule(record) => {
                jobs.push(record.clone().into_job(entry.commit.clone()));
            }
            HistoryRecord::Finish(record) => {
                match jobs
                    .iter_mut()
                    .find(|job| job.schedule_commit == record.schedule_commit)
                {
                    Some(job) if !job.state.is_terminal() => {
                        job.state = record.state;
                        job.finish_commit = Some(entry.commit.clone());
                    }
                    Some(job) => warn!(
                        job_id = %job.job_id,
                        commit = %entry.commit,
                        "Ignoring second finish entry for the same job"
                    ),
                    None => trace!(
                        schedule_commit = %record.schedule_commit,
                        "Finish entry for a job scheduled before the replayed range"
                    ),
                }
            }
        }
    }

    jobs
}
