use super::{select, Engine, LifecycleError};
use crate::{
    history::{record::encode, FinishRecord, HistoryEntry, HistoryLog, HistoryRecord},
    job::{CommitId, Job, JobState},
    outputs::{realize, OutputSpec},
    reconcile::OpenSet,
    scheduler::{status_group, status_summary, Scheduler, SubTaskStatus, Verdict},
};
use globset::{Glob, GlobSetBuilder};
use rayon::prelude::*;
use std::{fs, path::PathBuf};
use tracing::{debug, error, info, instrument, warn};

/// Which open jobs a finish (or listing) is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    AllOpen,
    /// scheduler job id or (abbreviated) schedule commit
    Job(String),
    /// jobs scheduled strictly after a history point, `None` for all of history
    Since(Option<CommitId>),
}

#[derive(Debug, Clone, Default)]
pub struct FinishOptions {
    /// close failed jobs without committing their outputs
    pub close_failed: bool,
    /// close failed jobs and commit their outputs anyway
    pub commit_failed: bool,
    /// close jobs the scheduler has no (complete) record of
    pub close_unknown: bool,
    /// outputs to commit in addition to the declared ones
    pub outputs: Vec<OutputSpec>,
    pub message: Option<String>,
}

/// An open job together with what the scheduler says about it
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job: Job,
    pub statuses: Vec<SubTaskStatus>,
    pub verdict: Verdict,
    pub group: String,
}

/// A job closed by a finish entry
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub state: JobState,
    pub finish_commit: CommitId,
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct JobReport {
    pub status: JobStatus,
    pub outcome: Result<Resolution, LifecycleError>,
}

#[derive(Debug, Default)]
pub struct FinishReport {
    pub jobs: Vec<JobReport>,
}

impl FinishReport {
    pub fn closed(&self) -> impl Iterator<Item = (&JobReport, &Resolution)> {
        self.jobs
            .iter()
            .filter_map(|report| report.outcome.as_ref().ok().map(|closed| (report, closed)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&JobReport, &LifecycleError)> {
        self.jobs
            .iter()
            .filter_map(|report| report.outcome.as_ref().err().map(|error| (report, error)))
    }

    pub fn is_fatal(&self) -> bool {
        self.failed().any(|(_, error)| error.is_fatal())
    }

    /// every selected job got closed
    pub fn is_complete(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// How a job with the given statuses may be closed, if at all
fn decide(
    status: &JobStatus,
    options: &FinishOptions,
) -> Result<(JobState, bool), LifecycleError> {
    let impossible = |reason: String| LifecycleError::FinishImpossible {
        job_id: status.job.job_id.clone(),
        reason,
    };

    match status.verdict {
        Verdict::Succeeded => Ok((JobState::ClosedSuccess, true)),
        Verdict::Running => Err(impossible(format!(
            "still running ({})",
            status_summary(&status.statuses)
        ))),
        Verdict::Failed if options.commit_failed => Ok((JobState::ClosedFailed, true)),
        Verdict::Failed if options.close_failed => Ok((JobState::ClosedFailed, false)),
        Verdict::Failed => Err(impossible(format!(
            "{} ({}), close it with --close-failed-jobs",
            status.group,
            status_summary(&status.statuses)
        ))),
        Verdict::Unconfirmed if options.close_unknown => {
            Ok((JobState::ClosedFailed, options.commit_failed))
        }
        Verdict::Unconfirmed => Err(impossible(format!(
            "the scheduler can't confirm its outcome ({}), close it with --close-unknown-jobs",
            status_summary(&status.statuses)
        ))),
    }
}

/// Message of a finish entry: the one given at finish time, then the one the job was scheduled with
fn finish_message(finish: Option<&str>, schedule: Option<&str>) -> Option<String> {
    let parts = [finish, schedule]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();

    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

impl<L: HistoryLog, S: Scheduler> Engine<L, S> {
    /// open jobs picked by `selector`, at the current head
    fn selected(&self, selector: &Selector) -> Result<(OpenSet, Vec<Job>, bool), LifecycleError> {
        let (mut open, complete) = match selector {
            Selector::Since(since) => (self.open_set_since(since.as_ref())?, since.is_none()),
            _ => (self.open_set()?, true),
        };
        open.advance(self.log())?;

        let jobs = match selector {
            Selector::Job(reference) => vec![select(open.jobs(), reference)?.clone()],
            _ => open.jobs().to_vec(),
        };

        Ok((open, jobs, complete))
    }

    /// ask the scheduler about all `jobs` at once
    fn query(&self, jobs: Vec<Job>) -> Vec<JobStatus> {
        let scheduler = self.scheduler();

        jobs.into_par_iter()
            .map(|job| {
                let statuses = scheduler.status(&job.job_id);
                debug!(job_id = %job.job_id, statuses = %status_summary(&statuses), "Queried job");

                JobStatus {
                    verdict: Verdict::of(&statuses),
                    group: status_group(&statuses),
                    statuses,
                    job,
                }
            })
            .collect()
    }

    /// Read-only report on the selected open jobs
    #[instrument(skip(self))]
    pub fn list_open(&self, selector: &Selector) -> Result<Vec<JobStatus>, LifecycleError> {
        let (_, jobs, _) = self.selected(selector)?;

        Ok(self.query(jobs))
    }

    /// Close every selected job the scheduler's statuses (and `options`) allow.
    ///
    /// Jobs that can't be closed are reported and stay open; only a fatal
    /// error stops the remaining jobs from being processed.
    #[instrument(skip(self, options))]
    pub fn finish(
        &self,
        selector: &Selector,
        options: &FinishOptions,
    ) -> Result<FinishReport, LifecycleError> {
        if !options.outputs.is_empty() && !matches!(selector, Selector::Job(_)) {
            return Err(LifecycleError::InvalidRequest(
                "extra outputs can only be committed for a single job".to_owned(),
            ));
        }

        let (mut open, jobs, complete) = self.selected(selector)?;
        if jobs.is_empty() {
            info!("No open jobs to finish");
        }

        let mut report = FinishReport::default();

        for status in self.query(jobs) {
            let outcome = decide(&status, options).and_then(|(state, with_artifacts)| {
                self.close_job(&mut open, &status, state, with_artifacts, options)
            });

            match &outcome {
                Ok(resolution) => info!(
                    job_id = %status.job.job_id,
                    state = %resolution.state,
                    artifacts = resolution.artifacts.len(),
                    "Closed job"
                ),
                Err(error) if error.is_fatal() => {
                    error!(job_id = %status.job.job_id, error = %error, "Stopping: {error}")
                }
                Err(error) => warn!(job_id = %status.job.job_id, "{error}"),
            }

            let fatal = outcome.as_ref().map_or_else(LifecycleError::is_fatal, |_| false);
            report.jobs.push(JobReport { status, outcome });

            if fatal {
                break;
            }
        }

        if complete {
            self.remember(&open);
        }

        Ok(report)
    }

    fn close_job(
        &self,
        open: &mut OpenSet,
        status: &JobStatus,
        state: JobState,
        with_artifacts: bool,
        options: &FinishOptions,
    ) -> Result<Resolution, LifecycleError> {
        let job = &status.job;
        let artifacts = if with_artifacts {
            self.artifacts(job, &options.outputs)?
        } else {
            Vec::new()
        };

        let record = HistoryRecord::Finish(FinishRecord {
            job_id: job.job_id.clone(),
            schedule_commit: job.schedule_commit.clone(),
            state,
            group: status.group.clone(),
            subtasks: status.statuses.clone(),
            artifacts: artifacts.clone(),
            message: finish_message(options.message.as_deref(), job.message.as_deref()),
        });
        let message = encode(&record).map_err(LifecycleError::from_json)?;

        let finish_commit = self.append(open, &message, &artifacts, |open, _| {
            match open.get(&job.schedule_commit) {
                Some(_) => Ok(()),
                None => Err(LifecycleError::AlreadyFinished(job.job_id.clone())),
            }
        })?;

        open.apply(
            &[HistoryEntry {
                commit: finish_commit.clone(),
                record,
            }],
            Some(finish_commit.clone()),
        );

        Ok(Resolution {
            state,
            finish_commit,
            artifacts,
        })
    }

    /// files to commit with `job`: its declared and `extra` outputs plus scheduler logs
    fn artifacts(&self, job: &Job, extra: &[OutputSpec]) -> Result<Vec<PathBuf>, LifecycleError> {
        let specs = job
            .declared_outputs
            .iter()
            .chain(extra)
            .cloned()
            .collect::<Vec<_>>();
        let mut artifacts = realize(&specs, self.repo_root())?;

        if self.settings().commit_logs {
            artifacts.extend(self.scheduler_logs(job));
            artifacts.sort();
            artifacts.dedup();
        }

        Ok(artifacts)
    }

    /// `slurm-<job>.out` and `slurm-<job>_<task>.out` in the job's working directory
    fn scheduler_logs(&self, job: &Job) -> Vec<PathBuf> {
        let id = job.job_id.as_str();
        let matcher = match [format!("slurm-{id}.out"), format!("slurm-{id}_*.out")]
            .iter()
            .try_fold(GlobSetBuilder::new(), |mut builder, pattern| {
                builder.add(Glob::new(pattern)?);
                Ok::<_, globset::Error>(builder)
            })
            .and_then(|builder| builder.build())
        {
            Ok(matcher) => matcher,
            Err(error) => {
                warn!(job_id = %id, error = %error, "Can't look for scheduler logs: {error}");
                return Vec::new();
            }
        };

        let directory = self.repo_root().join(&job.working_directory);
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(error) => {
                debug!(directory = ?directory, error = %error, "No scheduler logs");
                return Vec::new();
            }
        };

        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
            .filter(|entry| matcher.is_match(entry.file_name()))
            .map(|entry| job.working_directory.join(entry.file_name()))
            .collect()
    }
}
