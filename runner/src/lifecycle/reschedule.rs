use super::{select, Engine, LifecycleError, ScheduleRequest};
use crate::{
    history::{entries_since, HistoryLog, HistoryRecord},
    job::{CommitId, Job, JobState, Lineage},
    reconcile::replay_jobs,
    scheduler::Scheduler,
};
use itertools::Itertools;
use std::{
    borrow::Cow,
    io::{self, Write},
    path::Path,
};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescheduleTarget {
    /// scheduler job id or (abbreviated) schedule commit
    Job(String),
    /// every job scheduled strictly after a history point, `None` for all of history
    Since(Option<CommitId>),
    /// the job recorded by the most recent commit, if that commit is a record
    Latest,
}

#[derive(Debug, Clone, Default)]
pub struct RescheduleOptions {
    /// also resubmit jobs that were closed as failed
    pub with_failed: bool,
    /// only report what would be resubmitted, see `RescheduleReport::write_script`
    pub report_only: bool,
    /// replaces the message of the original job
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RescheduleOutcome {
    /// the superseding job, now open
    Rescheduled(Job),
    WouldReschedule,
    Skipped(String),
}

#[derive(Debug)]
pub struct RescheduleReport {
    pub jobs: Vec<(Job, Result<RescheduleOutcome, LifecycleError>)>,
}

impl RescheduleReport {
    pub fn rescheduled(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter_map(|(_, outcome)| match outcome {
            Ok(RescheduleOutcome::Rescheduled(job)) => Some(job),
            _ => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (&Job, &LifecycleError)> {
        self.jobs
            .iter()
            .filter_map(|(job, outcome)| outcome.as_ref().err().map(|error| (job, error)))
    }

    pub fn is_fatal(&self) -> bool {
        self.failed().any(|(_, error)| error.is_fatal())
    }

    /// Write the submissions a report-only run found as a shell script.
    ///
    /// `invocation` is the command line the script stands for, `root` the
    /// repository the recorded working directories are relative to.
    pub fn write_script(&self, out: &mut impl Write, invocation: &str, root: &Path) -> io::Result<()> {
        writeln!(out, "#!/bin/sh")?;
        writeln!(out, "#")?;
        writeln!(out, "# This file was generated by running")?;
        writeln!(out, "#")?;
        writeln!(out, "#   {invocation}")?;
        writeln!(out, "#")?;
        writeln!(out, "# in {}", root.display())?;

        for (job, _) in self
            .jobs
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Ok(RescheduleOutcome::WouldReschedule)))
        {
            writeln!(out)?;
            if let Some(message) = job.message.as_deref().and_then(strip_submission_note) {
                for line in message.lines() {
                    writeln!(out, "# {line}")?;
                }
            }
            writeln!(out, "# (record: {})", job.schedule_commit)?;

            let command = job.submission_command.iter().map(|word| shell_quote(word)).join(" ");
            match job.working_directory.to_str() {
                Some("") => writeln!(out, "{command}")?,
                _ => writeln!(
                    out,
                    "(cd {} && {command})",
                    shell_quote(&job.working_directory.to_string_lossy())
                )?,
            }
        }

        out.flush()
    }
}

/// `word` as a single shell word, quoted only if it has to be
fn shell_quote(word: &str) -> Cow<'_, str> {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || "-_./=:,+@%".contains(character));

    if plain {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

/// Drop the "Submitted batch job N: Pending" note older entries carry in their message
fn strip_submission_note(message: &str) -> Option<String> {
    let stripped = message
        .lines()
        .filter(|line| {
            let line = line.trim();
            !(line.starts_with("Submitted batch job") && line.ends_with(": Pending"))
        })
        .join("\n");
    let stripped = stripped.trim();

    (!stripped.is_empty()).then(|| stripped.to_owned())
}

impl<L: HistoryLog, S: Scheduler> Engine<L, S> {
    /// Resubmit earlier jobs, each as a new job superseding the original.
    ///
    /// Only jobs with a finish entry qualify; the new job is checked against
    /// the open set like any other, including jobs rescheduled before.
    #[instrument(skip(self, options))]
    pub fn reschedule(
        &self,
        target: &RescheduleTarget,
        options: &RescheduleOptions,
    ) -> Result<RescheduleReport, LifecycleError> {
        let candidates = match target {
            RescheduleTarget::Job(reference) => {
                let jobs = replay_jobs(&entries_since(self.log(), None)?.entries);
                vec![select(&jobs, reference)?.clone()]
            }
            RescheduleTarget::Since(since) => {
                replay_jobs(&entries_since(self.log(), since.as_ref())?.entries)
            }
            RescheduleTarget::Latest => {
                let replay = entries_since(self.log(), None)?;
                let latest = replay
                    .entries
                    .last()
                    .filter(|entry| replay.head.as_ref() == Some(&entry.commit));

                match latest {
                    Some(entry) => {
                        let schedule_commit = match &entry.record {
                            HistoryRecord::Schedule(_) => &entry.commit,
                            HistoryRecord::Finish(record) => &record.schedule_commit,
                        };
                        replay_jobs(&replay.entries)
                            .into_iter()
                            .filter(|job| &job.schedule_commit == schedule_commit)
                            .collect()
                    }
                    None => {
                        debug!(head = ?replay.head, "Most recent commit is not a job record");
                        Vec::new()
                    }
                }
            }
        };

        if candidates.is_empty() {
            info!("No jobs to reschedule");
        }

        let mut report = RescheduleReport { jobs: Vec::new() };

        for job in candidates {
            let outcome = self.reschedule_one(&job, options);

            match &outcome {
                Ok(RescheduleOutcome::Rescheduled(new)) => info!(
                    job_id = %job.job_id,
                    new_job_id = %new.job_id,
                    "Rescheduled job"
                ),
                Ok(RescheduleOutcome::WouldReschedule) => {
                    info!(job_id = %job.job_id, "Would reschedule job")
                }
                Ok(RescheduleOutcome::Skipped(reason)) => {
                    info!(job_id = %job.job_id, "Skipping job: {reason}")
                }
                Err(error) => warn!(job_id = %job.job_id, "{error}"),
            }

            let fatal = outcome.as_ref().map_or_else(LifecycleError::is_fatal, |_| false);
            report.jobs.push((job, outcome));

            if fatal {
                break;
            }
        }

        Ok(report)
    }

    fn reschedule_one(
        &self,
        job: &Job,
        options: &RescheduleOptions,
    ) -> Result<RescheduleOutcome, LifecycleError> {
        let refuse = |reason: String| LifecycleError::NotReschedulable {
            job_id: job.job_id.clone(),
            reason,
        };

        match job.state {
            JobState::Open => {
                return Err(refuse(
                    "it has no finish entry, finish or close it first".to_owned(),
                ))
            }
            JobState::ClosedFailed if !options.with_failed => {
                return Ok(RescheduleOutcome::Skipped(
                    "closed as failed, pass --with-failed-jobs to include it".to_owned(),
                ))
            }
            _ => {}
        }

        if job.dataset.is_some() && job.dataset != self.settings().dataset {
            return Err(refuse(format!(
                "it was recorded for dataset {}",
                job.dataset.as_deref().unwrap_or_default()
            )));
        }

        if options.report_only {
            return Ok(RescheduleOutcome::WouldReschedule);
        }

        let message = options
            .message
            .clone()
            .or_else(|| job.message.as_deref().and_then(strip_submission_note));

        self.schedule(ScheduleRequest {
            command: job.submission_command.clone(),
            working_directory: job.working_directory.clone(),
            outputs: job.declared_outputs.clone(),
            message,
            lineage: Some(Lineage::superseding(job)),
        })
        .map(RescheduleOutcome::Rescheduled)
    }
}
