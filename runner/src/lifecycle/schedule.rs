use super::{Engine, LifecycleError};
use crate::{
    history::{record::encode, HistoryEntry, HistoryLog, HistoryRecord, ScheduleRecord},
    job::{Job, Lineage},
    outputs::{OutputError, OutputSpec},
    scheduler::Scheduler,
};
use std::path::PathBuf;
use tracing::{error, info, instrument};

/// A job to submit, as given by the operator or taken from an earlier record
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub command: Vec<String>,
    /// relative to the repository root
    pub working_directory: PathBuf,
    pub outputs: Vec<OutputSpec>,
    pub message: Option<String>,
    pub lineage: Option<Lineage>,
}

impl<L: HistoryLog, S: Scheduler> Engine<L, S> {
    /// Submit a job and record it as open.
    ///
    /// Nothing reaches the history if the outputs conflict with an open job or
    /// the scheduler rejects the submission. Once the scheduler accepted the
    /// job, failing to record it is the fatal `LifecycleError::HistoryAppend`.
    #[instrument(skip(self, request), fields(outputs = request.outputs.len()))]
    pub fn schedule(&self, request: ScheduleRequest) -> Result<Job, LifecycleError> {
        if request.outputs.is_empty() {
            return Err(OutputError::Empty.into());
        }
        if request.command.is_empty() {
            return Err(LifecycleError::InvalidRequest(
                "no submission command given".to_owned(),
            ));
        }

        let mut open = self.open_set()?;
        // whatever was appended since the cache was written
        open.advance(self.log())?;
        open.conflict_index()
            .check(&request.outputs)
            .map_err(LifecycleError::Conflict)?;

        let job_id = self
            .scheduler()
            .submit(
                &request.command,
                &self.repo_root().join(&request.working_directory),
            )
            .map_err(LifecycleError::Submission)?;
        info!(job_id = %job_id, "Submitted job");

        let record = ScheduleRecord {
            job_id: job_id.clone(),
            cmd: request.command,
            pwd: request.working_directory,
            outputs: request.outputs,
            dataset: self.settings().dataset.clone(),
            host: self.settings().host.clone(),
            tool_version: env!("CARGO_PKG_VERSION").to_owned(),
            message: request.message,
            lineage: request.lineage,
        };
        let outputs = record.outputs.clone();

        let appended = encode(&HistoryRecord::Schedule(record.clone()))
            .map_err(LifecycleError::from_json)
            .and_then(|message| {
                self.append(&mut open, &message, &[], |open, _| {
                    open.conflict_index()
                        .check(&outputs)
                        .map_err(LifecycleError::Conflict)
                })
            });

        let commit = match appended {
            Ok(commit) => commit,
            Err(cause) => {
                error!(
                    job_id = %job_id,
                    error = %cause,
                    "Job {job_id} was submitted but could not be recorded, it runs without a \
                     record in history. Cancel it or record it manually: {cause}"
                );

                return Err(LifecycleError::HistoryAppend {
                    job_id,
                    reason: cause.to_string(),
                });
            }
        };

        open.apply(
            &[HistoryEntry {
                commit: commit.clone(),
                record: HistoryRecord::Schedule(record.clone()),
            }],
            Some(commit.clone()),
        );
        self.remember(&open);

        info!(job_id = %job_id, commit = %commit.short(), "Recorded open job");

        Ok(record.into_job(commit))
    }
}
