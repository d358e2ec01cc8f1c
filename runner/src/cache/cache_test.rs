use super::{CacheError, SharedCache};
use crate::{
    job::{CommitId, Job, JobId, JobState, Lineage},
    reconcile::OpenSet,
};
use std::path::PathBuf;

fn job(job_id: &str, commit: &str) -> Job {
    Job {
        job_id: JobId::new(job_id),
        declared_outputs: vec!["results/".parse().unwrap(), "plots/*.png".parse().unwrap()],
        working_directory: PathBuf::from("analysis"),
        submission_command: vec!["sbatch".to_owned(), "--array=0-3".to_owned(), "run.sh".to_owned()],
        schedule_commit: CommitId::new(commit),
        finish_commit: None,
        lineage: Some(Lineage {
            predecessor: CommitId::new("0000aaaa"),
            predecessor_job: JobId::new("1"),
            chain: vec![CommitId::new("0000aaaa")],
        }),
        state: JobState::Open,
        message: Some("again".to_owned()),
        dataset: None,
    }
}

#[test]
pub fn open_set_is_returned_for_its_head() {
    let cache = SharedCache::in_memory().unwrap();
    let head = CommitId::new("feedbeef");
    let open = OpenSet::new(Some(head.clone()), vec![job("10", "c0ffee01"), job("11", "c0ffee02")]);

    cache.store(&open).unwrap();

    assert_eq!(cache.load(Some(&head)).unwrap(), open);
    cache.close().unwrap();
}

#[test]
pub fn moved_head_is_stale() {
    let cache = SharedCache::in_memory().unwrap();
    assert!(matches!(cache.load(None), Err(CacheError::Missing)));

    cache
        .store(&OpenSet::new(Some(CommitId::new("aaaa1111")), vec![job("1", "aaaa1111")]))
        .unwrap();

    match cache.load(Some(&CommitId::new("bbbb2222"))) {
        Err(CacheError::Stale { cached, actual }) => {
            assert_eq!(cached, Some(CommitId::new("aaaa1111")));
            assert_eq!(actual, Some(CommitId::new("bbbb2222")));
        }
        other => panic!("expected a stale cache, got {other:?}"),
    }

    cache.invalidate().unwrap();
    assert!(matches!(
        cache.load(Some(&CommitId::new("aaaa1111"))),
        Err(CacheError::Missing)
    ));
}

#[test]
pub fn storing_replaces_previous_set() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("cache.db");

    let cache = SharedCache::open(&path).unwrap();
    cache
        .store(&OpenSet::new(Some(CommitId::new("01")), vec![job("1", "01")]))
        .unwrap();
    cache.store(&OpenSet::new(None, Vec::new())).unwrap();
    cache.close().unwrap();

    // survives reopening
    let reopened = SharedCache::open(&path).unwrap();
    assert_eq!(reopened.load(None).unwrap(), OpenSet::new(None, Vec::new()));
    assert!(matches!(
        reopened.load(Some(&CommitId::new("01"))),
        Err(CacheError::Stale { cached: None, .. })
    ));
}
