//! The job lifecycle: schedule, finish and reschedule.
//!
//! Every transition is decided against the open set as of some head and
//! made durable by a compare-and-swap append on top of exactly that head. If
//! someone else appended in between, the delta is replayed, the decision is
//! re-validated against it and the append is retried.

mod finish;
mod reschedule;
mod schedule;
#[cfg(test)]
mod fake;

pub use finish::{FinishOptions, FinishReport, JobReport, JobStatus, Resolution, Selector};
pub use reschedule::{RescheduleOptions, RescheduleOutcome, RescheduleReport, RescheduleTarget};
pub use schedule::ScheduleRequest;

use crate::{
    cache::{CacheError, SharedCache},
    config::RunnerConfig,
    history::{HistoryEntry, HistoryError, HistoryLog},
    index::Conflict,
    job::{CommitId, Job, JobId},
    outputs::OutputError,
    reconcile::{rebuild_open_set, OpenSet},
    scheduler::{Scheduler, SchedulerError},
};
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Declared {0}")]
    Conflict(Conflict),
    #[error("Scheduler rejected the job: {0}")]
    Submission(#[source] SchedulerError),
    #[error("Job {job_id} cannot be rescheduled: {reason}")]
    NotReschedulable { job_id: JobId, reason: String },
    #[error("Job {job_id} cannot be finished: {reason}")]
    FinishImpossible { job_id: JobId, reason: String },
    #[error("Job {job_id} is running on the cluster without a record in history: {reason}")]
    HistoryAppend { job_id: JobId, reason: String },
    #[error("Invalid output declaration: {0}")]
    InvalidOutputs(#[from] OutputError),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("No job matches '{0}'")]
    UnknownJob(String),
    #[error("'{0}' matches more than one job")]
    AmbiguousJob(String),
    #[error("Job {0} was finished by someone else")]
    AlreadyFinished(JobId),
    #[error("History access failed: {0}")]
    History(#[from] HistoryError),
    #[error("Cache failed: {0}")]
    Cache(#[from] CacheError),
}

impl LifecycleError {
    /// errors that leave the history in doubt and stop any batch
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HistoryAppend { .. } | Self::History(_))
    }

    fn from_json(error: serde_json::Error) -> Self {
        Self::History(error.into())
    }
}

/// name of the submitting node, recorded in schedule entries
static HOSTNAME: Lazy<Option<String>> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => Some(hostname.to_string_lossy().into_owned()),
    Err(error) => {
        warn!(error = ?error, "Failed to retrieve hostname: {error}");
        None
    }
});

/// Knobs of the engine, usually taken from `RunnerConfig`
#[derive(Debug, Clone)]
pub struct Settings {
    /// dataset id stamped on schedule entries, foreign ones are not rescheduled
    pub dataset: Option<String>,
    /// compare-and-swap retries per append
    pub retries: usize,
    /// commit the scheduler's `slurm-<job>*.out` logs on finish
    pub commit_logs: bool,
    pub host: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dataset: None,
            retries: 5,
            commit_logs: true,
            host: None,
        }
    }
}

impl Settings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            dataset: config.dataset.clone(),
            retries: config.history.git.retries,
            commit_logs: config.scheduler.slurm.commit_logs,
            host: HOSTNAME.clone(),
        }
    }
}

pub struct Engine<L, S> {
    log: L,
    scheduler: S,
    repo_root: PathBuf,
    settings: Settings,
    cache: Option<SharedCache>,
}

impl<L: HistoryLog, S: Scheduler> Engine<L, S> {
    pub fn new(log: L, scheduler: S, repo_root: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            log,
            scheduler,
            repo_root: repo_root.into(),
            settings,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: SharedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// release the cache connection
    pub fn close(self) -> Result<(), LifecycleError> {
        if let Some(cache) = self.cache {
            cache.close()?;
        }

        Ok(())
    }

    /// The open set at the current head, from the cache if it is still valid
    pub fn open_set(&self) -> Result<OpenSet, LifecycleError> {
        if let Some(cache) = &self.cache {
            let head = self.log.head()?;

            match cache.load(head.as_ref()) {
                Ok(open) => {
                    debug!(head = ?head, "Using cached open jobs");
                    return Ok(open);
                }
                Err(CacheError::Missing) => debug!("Cache is empty, replaying history"),
                Err(CacheError::Stale { cached, actual }) => {
                    info!(cached = ?cached, actual = ?actual, "Cache is stale, replaying history")
                }
                Err(error) => warn!(error = %error, "Cache is unusable, replaying history"),
            }
        }

        let open = rebuild_open_set(&self.log, None)?;
        self.remember(&open);

        Ok(open)
    }

    /// Open set of jobs scheduled strictly after `since`, ignoring the cache.
    ///
    /// `None` replays all of history and replaces whatever the cache held.
    pub fn open_set_since(&self, since: Option<&CommitId>) -> Result<OpenSet, LifecycleError> {
        match since {
            None => {
                if let Some(cache) = &self.cache {
                    cache.invalidate()?;
                }
                self.open_set()
            }
            Some(since) => Ok(rebuild_open_set(&self.log, Some(since))?),
        }
    }

    /// resolve a user given history point, an empty one means "from the beginning"
    pub fn history_point(&self, reference: &str) -> Result<Option<CommitId>, LifecycleError> {
        let reference = reference.trim();

        if reference.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.log.resolve(reference)?))
        }
    }

    /// store a complete open set, never one limited by a history point
    fn remember(&self, open: &OpenSet) {
        if let Some(cache) = &self.cache {
            if let Err(error) = cache.store(open) {
                warn!(error = %error, "Failed to update cache");
            }
        }
    }

    /// Append `message` on top of `open`'s head.
    ///
    /// If the head moved, the new entries are folded into `open` and handed
    /// to `revalidate` before the next attempt. The appended entry itself is
    /// not folded in.
    fn append<F>(
        &self,
        open: &mut OpenSet,
        message: &str,
        artifacts: &[PathBuf],
        mut revalidate: F,
    ) -> Result<CommitId, LifecycleError>
    where
        F: FnMut(&OpenSet, &[HistoryEntry]) -> Result<(), LifecycleError>,
    {
        let mut attempt = 0;

        loop {
            match self.log.append(open.head(), message, artifacts) {
                Ok(commit) => return Ok(commit),
                Err(HistoryError::HeadMoved { expected, actual }) if attempt < self.settings.retries => {
                    attempt += 1;
                    debug!(
                        expected = ?expected,
                        actual = ?actual,
                        "History moved, re-validating ({attempt}/{})",
                        self.settings.retries
                    );

                    let delta = open.advance(&self.log)?;
                    revalidate(open, &delta)?;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

/// Pick the single job `reference` names, by job id or schedule commit prefix
fn select<'a, I>(jobs: I, reference: &str) -> Result<&'a Job, LifecycleError>
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut matching = jobs.into_iter().filter(|job| job.matches(reference));

    match (matching.next(), matching.next()) {
        (Some(job), None) => Ok(job),
        (Some(_), Some(_)) => Err(LifecycleError::AmbiguousJob(reference.to_owned())),
        (None, _) => Err(LifecycleError::UnknownJob(reference.to_owned())),
    }
}
