pub mod slurm;

use crate::job::JobId;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("No submission command was given")]
    EmptyCommand,
    #[error("Failed to spawn submission command")]
    Spawn(#[from] std::io::Error),
    #[error("Submission command exited with {status}: {stderr}")]
    Rejected { status: String, stderr: String },
    #[error("Submission command printed no job id: {0}")]
    MissingJobId(String),
    #[error("Submission command did not return within {0:?}")]
    Timeout(Duration),
}

/// Status of a single (sub-)task as reported by the scheduler
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Unknown,
}

impl StatusCode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Timeout)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubTaskStatus {
    pub id: String,
    pub code: StatusCode,
}

impl SubTaskStatus {
    pub fn new(id: impl Into<String>, code: StatusCode) -> Self {
        Self {
            id: id.into(),
            code,
        }
    }
}

/// What the statuses of all sub-tasks of a job allow the lifecycle to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// every sub-task completed
    Succeeded,
    /// at least one sub-task is pending or running
    Running,
    /// nothing is running, at least one sub-task failed, was cancelled or timed out
    Failed,
    /// nothing is running but some sub-task is unknown to the scheduler
    Unconfirmed,
}

impl Verdict {
    pub fn of(statuses: &[SubTaskStatus]) -> Self {
        if statuses.is_empty() {
            Self::Unconfirmed
        } else if statuses.iter().any(|status| status.code.is_active()) {
            Self::Running
        } else if statuses
            .iter()
            .any(|status| status.code == StatusCode::Unknown)
        {
            Self::Unconfirmed
        } else if statuses
            .iter()
            .all(|status| status.code == StatusCode::Completed)
        {
            Self::Succeeded
        } else {
            Self::Failed
        }
    }
}

/// Collapse sub-task statuses into a single label for a job
pub fn status_group(statuses: &[SubTaskStatus]) -> String {
    let unique = statuses
        .iter()
        .map(|status| status.code)
        .unique()
        .collect_vec();

    match unique.as_slice() {
        [] => StatusCode::Unknown.label().to_owned(),
        [single] => single.label().to_owned(),
        several if several.contains(&StatusCode::Completed) => {
            "ARRAY FAILED (SOME COMPLETE)".to_owned()
        }
        _ => "ARRAY FAILED (MULTIPLE CAUSES)".to_owned(),
    }
}

/// `job: STATUS, ...` summary used in reports and log lines
pub fn status_summary(statuses: &[SubTaskStatus]) -> String {
    statuses
        .iter()
        .map(|status| format!("{}: {}", status.id, status.code))
        .join(", ")
}

/// The cluster scheduler jobs are submitted to
pub trait Scheduler: Send + Sync {
    /// run `command` in `working_directory` and return the id of the submitted job
    fn submit(&self, command: &[String], working_directory: &Path) -> Result<JobId, SchedulerError>;

    /// Status of every sub-task of `job_id`.
    ///
    /// Never fails: anything the scheduler can't answer (purged records,
    /// timeouts, broken output) is reported as `StatusCode::Unknown`. Plain
    /// jobs yield exactly one entry.
    fn status(&self, job_id: &JobId) -> Vec<SubTaskStatus>;
}
