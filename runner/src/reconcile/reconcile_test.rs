use super::{rebuild_open_set, replay_jobs, OpenSet};
use crate::{
    history::{
        entries_since, memory::MemoryLog, record::encode, FinishRecord, HistoryLog, HistoryRecord,
        ScheduleRecord,
    },
    job::{CommitId, JobId, JobState},
    scheduler::{StatusCode, SubTaskStatus},
};
use std::path::PathBuf;

struct Writer {
    log: MemoryLog,
    head: Option<CommitId>,
}

impl Writer {
    fn new() -> Self {
        Self {
            log: MemoryLog::new(),
            head: None,
        }
    }

    fn push(&mut self, message: &str) -> CommitId {
        let commit = self.log.append(self.head.as_ref(), message, &[]).unwrap();
        self.head = Some(commit.clone());
        commit
    }

    fn schedule(&mut self, job_id: &str, output: &str) -> CommitId {
        let record = HistoryRecord::Schedule(ScheduleRecord {
            job_id: JobId::new(job_id),
            cmd: vec!["sbatch".to_owned(), format!("{job_id}.sh")],
            pwd: PathBuf::new(),
            outputs: vec![output.parse().unwrap()],
            dataset: None,
            host: None,
            tool_version: "test".to_owned(),
            message: None,
            lineage: None,
        });
        self.push(&encode(&record).unwrap())
    }

    fn finish(&mut self, job_id: &str, schedule_commit: &CommitId, state: JobState) -> CommitId {
        let record = HistoryRecord::Finish(FinishRecord {
            job_id: JobId::new(job_id),
            schedule_commit: schedule_commit.clone(),
            state,
            group: "COMPLETED".to_owned(),
            subtasks: vec![SubTaskStatus::new(job_id, StatusCode::Completed)],
            artifacts: Vec::new(),
            message: None,
        });
        self.push(&encode(&record).unwrap())
    }
}

fn job_ids(open: &OpenSet) -> Vec<&str> {
    open.jobs().iter().map(|job| job.job_id.as_str()).collect()
}

#[test]
pub fn finish_entries_close_jobs() {
    let mut writer = Writer::new();
    writer.push("Initial commit");
    let first = writer.schedule("1", "a/");
    writer.schedule("2", "b/");
    writer.finish("1", &first, JobState::ClosedSuccess);
    writer.schedule("3", "c/");
    let head = writer.push("unrelated change");

    let open = rebuild_open_set(&writer.log, None).unwrap();

    assert_eq!(job_ids(&open), vec!["2", "3"]);
    assert_eq!(open.head(), Some(&head));
    assert!(open.jobs().iter().all(|job| job.state == JobState::Open));
    assert!(open.get(&first).is_none());
    let conflict = open
        .conflict_index()
        .check(&["b/x.txt".parse().unwrap()])
        .unwrap_err();
    assert_eq!(conflict.owner, JobId::new("2"));
    // outputs of finished jobs are free again
    assert!(open.conflict_index().check(&["a/".parse().unwrap()]).is_ok());
}

#[test]
pub fn since_limits_replayed_range() {
    let mut writer = Writer::new();
    let first = writer.schedule("1", "a/");
    let second = writer.schedule("2", "b/");
    writer.finish("1", &first, JobState::ClosedFailed);
    writer.schedule("3", "c/");

    // job 1 predates the range, its finish entry is ignored
    let open = rebuild_open_set(&writer.log, Some(&first)).unwrap();
    assert_eq!(job_ids(&open), vec!["2", "3"]);

    let open = rebuild_open_set(&writer.log, Some(&second)).unwrap();
    assert_eq!(job_ids(&open), vec!["3"]);
}

#[test]
pub fn rebuilding_is_idempotent() {
    let mut writer = Writer::new();
    let mut schedules = Vec::new();
    for job in 0..20 {
        schedules.push(writer.schedule(&job.to_string(), &format!("out/{job}/")));
        if job % 3 == 2 {
            let target = job - 1;
            writer.finish(&target.to_string(), &schedules[target], JobState::ClosedSuccess);
        }
    }

    let once = rebuild_open_set(&writer.log, None).unwrap();
    let twice = rebuild_open_set(&writer.log, None).unwrap();
    assert_eq!(once, twice);

    let from_middle = rebuild_open_set(&writer.log, Some(&schedules[9])).unwrap();
    assert_eq!(from_middle, rebuild_open_set(&writer.log, Some(&schedules[9])).unwrap());
}

#[test]
pub fn advance_matches_full_rebuild() {
    let mut writer = Writer::new();
    let first = writer.schedule("1", "a/");
    writer.schedule("2", "b/");

    let mut incremental = rebuild_open_set(&writer.log, None).unwrap();

    writer.finish("1", &first, JobState::ClosedSuccess);
    writer.schedule("4", "d/");

    let delta = incremental.advance(&writer.log).unwrap();
    assert_eq!(delta.len(), 2);
    assert_eq!(incremental, rebuild_open_set(&writer.log, None).unwrap());

    // nothing new
    assert!(incremental.advance(&writer.log).unwrap().is_empty());
    assert_eq!(incremental.head(), writer.head.as_ref());
}

#[test]
pub fn replayed_jobs_keep_their_outcome() {
    let mut writer = Writer::new();
    let first = writer.schedule("1", "a/");
    let second = writer.schedule("2", "b/");
    let closed = writer.finish("2", &second, JobState::ClosedFailed);
    // a second finish must not rewrite history
    writer.finish("2", &second, JobState::ClosedSuccess);

    let jobs = replay_jobs(&entries_since(&writer.log, None).unwrap().entries);

    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].schedule_commit, first);
    assert_eq!(jobs[0].state, JobState::Open);
    assert_eq!(jobs[1].state, JobState::ClosedFailed);
    assert_eq!(jobs[1].finish_commit, Some(closed));
}

#[test]
pub fn overlapping_records_are_still_open() {
    let mut writer = Writer::new();
    writer.schedule("1", "shared/");
    let second = writer.schedule("2", "shared/inner.txt");

    let mut open = rebuild_open_set(&writer.log, None).unwrap();
    assert_eq!(job_ids(&open), vec!["1", "2"]);
    assert!(open
        .conflict_index()
        .check(&["shared/other.txt".parse().unwrap()])
        .is_err());

    writer.finish("2", &second, JobState::ClosedSuccess);
    open.advance(&writer.log).unwrap();

    assert_eq!(job_ids(&open), vec!["1"]);
    assert_eq!(open, rebuild_open_set(&writer.log, None).unwrap());
}
