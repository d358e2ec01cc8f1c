use super::{Scheduler, SchedulerError, StatusCode, SubTaskStatus};
use crate::job::JobId;
use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, instrument, trace, warn};
use wait_timeout::ChildExt;

/// Scheduler adapter driving SLURM through its command line tools.
///
/// Jobs are submitted by running the operator's command (usually an `sbatch`
/// invocation) and reading the job id it prints; statuses come from `sacct`.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    pub sacct: PathBuf,
    pub status_timeout: Duration,
    pub submit_timeout: Duration,
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self {
            sacct: PathBuf::from("sacct"),
            status_timeout: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(120),
        }
    }
}

/// Output of a child process that finished within its time budget
struct Finished {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// read a pipe to its end on a separate thread so the child never blocks on a full pipe
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<std::io::Result<String>> {
    thread::spawn(move || {
        let mut buffer = String::new();

        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut buffer)?;
        }

        Ok(buffer)
    })
}

fn collect(reader: JoinHandle<std::io::Result<String>>) -> std::io::Result<String> {
    reader
        .join()
        .unwrap_or_else(|_| Err(std::io::Error::new(std::io::ErrorKind::Other, "pipe reader panicked")))
}

/// wait for `child` at most `timeout`, killing it once the budget is exhausted
fn wait_bounded(mut child: Child, timeout: Duration) -> Result<Option<Finished>, std::io::Error> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    match child.wait_timeout(timeout)? {
        Some(status) => Ok(Some(Finished {
            status,
            stdout: collect(stdout)?,
            stderr: collect(stderr)?,
        })),
        None => {
            child.kill()?;
            child.wait()?;

            Ok(None)
        }
    }
}

impl Scheduler for SlurmScheduler {
    #[instrument(skip(self), level = "debug")]
    fn submit(&self, command: &[String], working_directory: &Path) -> Result<JobId, SchedulerError> {
        let (program, arguments) = command.split_first().ok_or(SchedulerError::EmptyCommand)?;

        let child = Command::new(program)
            .args(arguments)
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let finished =
            wait_bounded(child, self.submit_timeout)?.ok_or(SchedulerError::Timeout(self.submit_timeout))?;

        if !finished.status.success() {
            return Err(SchedulerError::Rejected {
                status: finished.status.to_string(),
                stderr: finished.stderr.trim().to_owned(),
            });
        }

        trace!(stdout = finished.stdout, "Submission output");

        parse_job_id(&finished.stdout)
            .ok_or_else(|| SchedulerError::MissingJobId(finished.stdout.trim().to_owned()))
    }

    #[instrument(skip(self), level = "debug")]
    fn status(&self, job_id: &JobId) -> Vec<SubTaskStatus> {
        let unknown = || vec![SubTaskStatus::new(job_id.as_str(), StatusCode::Unknown)];

        let child = match Command::new(&self.sacct)
            .args(["-n", "-X", "-j", job_id.as_str(), "-o", "JobID,State", "--parsable2"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                warn!(error = ?error, job_id = %job_id, "Failed to spawn sacct: {error}");
                return unknown();
            }
        };

        match wait_bounded(child, self.status_timeout) {
            Ok(Some(finished)) if finished.status.success() => {
                let statuses = parse_sacct(&finished.stdout);

                if statuses.is_empty() {
                    debug!(job_id = %job_id, "sacct does not know the job (anymore)");
                    unknown()
                } else {
                    statuses
                }
            }
            Ok(Some(finished)) => {
                warn!(job_id = %job_id, stderr = finished.stderr.trim(), "sacct exited with {}", finished.status);
                unknown()
            }
            Ok(None) => {
                warn!(job_id = %job_id, timeout = ?self.status_timeout, "sacct timed out");
                unknown()
            }
            Err(error) => {
                warn!(error = ?error, job_id = %job_id, "Failed to query sacct: {error}");
                unknown()
            }
        }
    }
}

/// Extract the job id from the output of a submission.
///
/// Understands both `Submitted batch job 4711` and the `--parsable` form
/// `4711` / `4711;cluster`.
pub fn parse_job_id(output: &str) -> Option<JobId> {
    const MARKER: &str = "Submitted batch job";

    for line in output.lines().map(str::trim) {
        if let Some(index) = line.find(MARKER) {
            let id = line[index + MARKER.len()..].split_whitespace().next()?;

            if id.chars().all(|c| c.is_ascii_digit()) {
                return Some(JobId::new(id));
            }
        }

        let parsable = line.split(';').next().unwrap_or(line);
        if !parsable.is_empty() && parsable.chars().all(|c| c.is_ascii_digit()) {
            return Some(JobId::new(parsable));
        }
    }

    None
}

/// Parse `sacct -n -X -o JobID,State --parsable2` output, one entry per line
pub fn parse_sacct(output: &str) -> Vec<SubTaskStatus> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (id, state) = line.split_once('|')?;

            Some(SubTaskStatus::new(id.trim(), normalize_state(state)))
        })
        .collect()
}

/// Map a SLURM job state (e.g. `CANCELLED by 1234`, `FAILED+`) onto a `StatusCode`
pub fn normalize_state(state: &str) -> StatusCode {
    let token = state
        .trim()
        .split(|c: char| c.is_whitespace() || c == '+' || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    match token.as_str() {
        "PENDING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESV_DEL_HOLD" => {
            StatusCode::Pending
        }
        "RUNNING" | "CONFIGURING" | "COMPLETING" | "SUSPENDED" | "STAGE_OUT" | "SIGNALING"
        | "RESIZING" | "STOPPED" => StatusCode::Running,
        "COMPLETED" => StatusCode::Completed,
        "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE" | "PREEMPTED"
        | "REVOKED" => StatusCode::Failed,
        "CANCELLED" => StatusCode::Cancelled,
        "TIMEOUT" => StatusCode::Timeout,
        _ => StatusCode::Unknown,
    }
}
