use crate::{
    job::{CommitId, Job, JobId, JobState, Lineage},
    outputs::OutputSpec,
    scheduler::SubTaskStatus,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const SCHEDULE_TAG: &str = "[SLURM SCHEDULE]";
pub const FINISH_TAG: &str = "[SLURM FINISH]";
const BLOCK_START: &str = "=== Do not change lines below ===";
const BLOCK_END: &str = "^^^ Do not change lines above ^^^";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryRecord {
    Schedule(ScheduleRecord),
    Finish(FinishRecord),
}

/// Everything needed to (re-)submit a job and to check its outputs
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScheduleRecord {
    pub job_id: JobId,
    pub cmd: Vec<String>,
    /// working directory relative to the repository root
    pub pwd: PathBuf,
    pub outputs: Vec<OutputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub tool_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<Lineage>,
}

impl ScheduleRecord {
    /// the open job this record creates once appended as `commit`
    pub fn into_job(self, commit: CommitId) -> Job {
        Job {
            job_id: self.job_id,
            declared_outputs: self.outputs,
            working_directory: self.pwd,
            submission_command: self.cmd,
            schedule_commit: commit,
            finish_commit: None,
            lineage: self.lineage,
            state: JobState::Open,
            message: self.message,
            dataset: self.dataset,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FinishRecord {
    pub job_id: JobId,
    pub schedule_commit: CommitId,
    pub state: JobState,
    pub group: String,
    pub subtasks: Vec<SubTaskStatus>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HistoryRecord {
    fn header(&self) -> String {
        match self {
            Self::Schedule(record) => {
                format!("{SCHEDULE_TAG} Submitted batch job {}: Pending", record.job_id)
            }
            Self::Finish(record) => {
                format!("{FINISH_TAG} Slurm job {}: {}", record.job_id, capitalize(&record.group))
            }
        }
    }

    fn message(&self) -> Option<&str> {
        match self {
            Self::Schedule(record) => record.message.as_deref(),
            Self::Finish(record) => record.message.as_deref(),
        }
    }
}

/// "ARRAY FAILED (SOME COMPLETE)" -> "Array failed (some complete)"
fn capitalize(group: &str) -> String {
    let lowered = group.to_lowercase();
    let mut characters = lowered.chars();

    match characters.next() {
        Some(first) => first.to_uppercase().chain(characters).collect(),
        None => String::new(),
    }
}

/// Render `record` as a commit message
pub fn encode(record: &HistoryRecord) -> Result<String, serde_json::Error> {
    let mut message = record.header();
    message.push_str("\n\n");

    if let Some(text) = record.message().filter(|text| !text.trim().is_empty()) {
        message.push_str(text.trim());
        message.push_str("\n\n");
    }

    message.push_str(BLOCK_START);
    message.push('\n');
    message.push_str(&serde_json::to_string_pretty(record)?);
    message.push('\n');
    message.push_str(BLOCK_END);
    message.push('\n');

    Ok(message)
}

/// Extract the record of a commit message, `None` for ordinary commits
pub fn decode(message: &str) -> Result<Option<HistoryRecord>, serde_json::Error> {
    if !(message.starts_with(SCHEDULE_TAG) || message.starts_with(FINISH_TAG)) {
        return Ok(None);
    }

    let Some(start) = message.find(BLOCK_START) else {
        return Ok(None);
    };
    let body = &message[start + BLOCK_START.len()..];
    let Some(end) = body.rfind(BLOCK_END) else {
        return Ok(None);
    };

    serde_json::from_str(body[..end].trim()).map(Some)
}
