use crate::{
    job::JobId,
    scheduler::{Scheduler, SchedulerError, StatusCode, SubTaskStatus},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

type Hook = Box<dyn FnMut(&JobId) + Send>;

/// Scripted scheduler: hands out sequential ids, reports whatever statuses
/// a test assigned and can run a hook on submission or status queries to
/// play a concurrent client.
pub struct FakeScheduler {
    next_id: AtomicU64,
    rejecting: AtomicBool,
    statuses: Mutex<HashMap<JobId, Vec<StatusCode>>>,
    submissions: Mutex<Vec<(Vec<String>, PathBuf)>>,
    on_submit: Mutex<Option<Hook>>,
    on_status: Mutex<Option<Hook>>,
}

impl FakeScheduler {
    pub fn new(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
            rejecting: AtomicBool::new(false),
            statuses: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            on_submit: Mutex::new(None),
            on_status: Mutex::new(None),
        }
    }

    /// one code per sub-task, a single code for plain jobs
    pub fn set_status(&self, job_id: &JobId, codes: &[StatusCode]) {
        self.statuses.lock().insert(job_id.clone(), codes.to_vec());
    }

    /// forget a job, as if the scheduler purged its records
    pub fn purge(&self, job_id: &JobId) {
        self.statuses.lock().remove(job_id);
    }

    pub fn reject(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> usize {
        self.submissions.lock().len()
    }

    pub fn last_submission(&self) -> Option<(Vec<String>, PathBuf)> {
        self.submissions.lock().last().cloned()
    }

    /// run `hook` once, after the next accepted submission
    pub fn on_submit(&self, hook: impl FnMut(&JobId) + Send + 'static) {
        *self.on_submit.lock() = Some(Box::new(hook));
    }

    /// run `hook` once, during the next status query
    pub fn on_status(&self, hook: impl FnMut(&JobId) + Send + 'static) {
        *self.on_status.lock() = Some(Box::new(hook));
    }

    fn fire(hook: &Mutex<Option<Hook>>, job_id: &JobId) {
        let taken = hook.lock().take();

        if let Some(mut hook) = taken {
            hook(job_id);
        }
    }
}

impl Scheduler for FakeScheduler {
    fn submit(&self, command: &[String], working_directory: &Path) -> Result<JobId, SchedulerError> {
        if command.is_empty() {
            return Err(SchedulerError::EmptyCommand);
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rejected {
                status: "exit status: 1".to_owned(),
                stderr: "sbatch: error: invalid partition specified".to_owned(),
            });
        }

        let job_id = JobId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string());
        self.submissions
            .lock()
            .push((command.to_vec(), working_directory.to_path_buf()));
        self.set_status(&job_id, &[StatusCode::Pending]);

        Self::fire(&self.on_submit, &job_id);

        Ok(job_id)
    }

    fn status(&self, job_id: &JobId) -> Vec<SubTaskStatus> {
        Self::fire(&self.on_status, job_id);

        match self.statuses.lock().get(job_id) {
            None => vec![SubTaskStatus::new(job_id.as_str(), StatusCode::Unknown)],
            Some(codes) if codes.len() == 1 => vec![SubTaskStatus::new(job_id.as_str(), codes[0])],
            Some(codes) => codes
                .iter()
                .enumerate()
                .map(|(task, code)| SubTaskStatus::new(format!("{job_id}_{task}"), *code))
                .collect(),
        }
    }
}
