use crate::outputs::OutputSpec;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// Identifier handed out by the cluster scheduler on submission
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle of a history entry, ordered only by its position in the log
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// abbreviated form used in log lines and reports
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(10)]
    }

    /// true if `reference` abbreviates this commit id
    pub fn matches_prefix(&self, reference: &str) -> bool {
        reference.len() >= MIN_COMMIT_PREFIX && self.0.starts_with(reference)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// shortest commit prefix accepted as a job reference
pub const MIN_COMMIT_PREFIX: usize = 4;

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Open,
    ClosedSuccess,
    ClosedFailed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::ClosedSuccess => "CLOSED_SUCCESS",
            Self::ClosedFailed => "CLOSED_FAILED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Back-reference of a rescheduled job to the job it supersedes.
///
/// `chain` holds every ancestor schedule commit, oldest first, and ends with
/// `predecessor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub predecessor: CommitId,
    pub predecessor_job: JobId,
    #[serde(default)]
    pub chain: Vec<CommitId>,
}

impl Lineage {
    /// lineage for a job superseding `job`, extending the chain `job` already carries
    pub fn superseding(job: &Job) -> Self {
        let mut chain = job
            .lineage
            .as_ref()
            .map(|lineage| lineage.chain.clone())
            .unwrap_or_default();
        chain.push(job.schedule_commit.clone());

        Self {
            predecessor: job.schedule_commit.clone(),
            predecessor_job: job.job_id.clone(),
            chain,
        }
    }
}

/// A single scheduler submission, tracked from its schedule entry to its finish entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub declared_outputs: Vec<OutputSpec>,
    /// relative to the repository root
    pub working_directory: PathBuf,
    pub submission_command: Vec<String>,
    pub schedule_commit: CommitId,
    pub finish_commit: Option<CommitId>,
    pub lineage: Option<Lineage>,
    pub state: JobState,
    pub message: Option<String>,
    pub dataset: Option<String>,
}

impl Job {
    pub fn is_open(&self) -> bool {
        self.state == JobState::Open
    }

    /// true if `reference` names this job by scheduler id or schedule commit
    pub fn matches(&self, reference: &str) -> bool {
        self.job_id.as_str() == reference || self.schedule_commit.matches_prefix(reference)
    }
}
