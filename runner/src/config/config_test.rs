use super::{check_executable, ConfigErrors, RunnerConfig, CONFIG_FILE};
use std::{fs, os::unix::fs::PermissionsExt, path::Path, time::Duration};

#[test]
pub fn empty_config_uses_defaults() {
    let config: RunnerConfig = serde_yaml::from_str("{}").unwrap();

    assert_eq!(config, RunnerConfig::default());
    assert_eq!(config.history.git.retries, 5);
    assert!(config.scheduler.slurm.commit_logs);
    assert!(config.cache.enabled);
    assert!(!config.preflight_checks());
}

#[test]
pub fn parses_full_config() {
    let config: RunnerConfig = serde_yaml::from_str(
        "
dataset: 8f2c0d8e
scheduler:
  slurm:
    sacct: sacct
    status_timeout: 1500
    submit_timeout: 60000
    commit_logs: false
history:
  git:
    retries: 2
cache:
  path: .git/jobs.db
  enabled: true
",
    )
    .unwrap();

    assert_eq!(config.dataset.as_deref(), Some("8f2c0d8e"));
    assert_eq!(config.history.git.retries, 2);

    let scheduler = config.scheduler.slurm.scheduler();
    assert_eq!(scheduler.status_timeout, Duration::from_millis(1500));
    assert_eq!(scheduler.submit_timeout, Duration::from_secs(60));

    assert_eq!(
        config
            .cache
            .resolve(Path::new("/repo"), Path::new("/repo/.git"), Some("main")),
        Some(Path::new("/repo/.git/jobs.db").to_path_buf())
    );
}

#[test]
pub fn rejects_unknown_fields() {
    assert!(serde_yaml::from_str::<RunnerConfig>("scheduler:\n  pbs: {}\n").is_err());
    assert!(serde_yaml::from_str::<RunnerConfig>("retries: 3\n").is_err());
}

#[test]
pub fn default_cache_is_per_branch() {
    let config = RunnerConfig::default();
    let git_dir = Path::new("/repo/.git");

    assert_eq!(
        config
            .cache
            .resolve(Path::new("/repo"), git_dir, Some("feature/run-a")),
        Some(git_dir.join("slurmlog-feature-run-a.db"))
    );

    let mut disabled = config;
    disabled.cache.enabled = false;
    assert_eq!(disabled.cache.resolve(Path::new("/repo"), git_dir, None), None);
}

#[test]
pub fn preflight_reports_every_problem() {
    let directory = tempfile::tempdir().unwrap();
    let sacct = directory.path().join("sacct");
    fs::write(&sacct, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&sacct, fs::Permissions::from_mode(0o644)).unwrap();

    assert!(!check_executable(&sacct).unwrap());
    assert!(matches!(
        check_executable(&directory.path().join("missing")),
        Err(ConfigErrors::FileNotFound(_))
    ));

    let mut config = RunnerConfig::default();
    config.scheduler.slurm.sacct = sacct.clone();
    assert!(config.preflight_checks());

    fs::set_permissions(&sacct, fs::Permissions::from_mode(0o755)).unwrap();
    assert!(!config.preflight_checks());

    config.scheduler.slurm.status_timeout = 0;
    assert!(config.preflight_checks());

    let mut config = RunnerConfig::default();
    config.dataset = Some(" ".to_owned());
    assert!(config.preflight_checks());
}

#[test]
pub fn discovers_repository_config() {
    let directory = tempfile::tempdir().unwrap();

    assert_eq!(
        RunnerConfig::discover(directory.path(), None).unwrap(),
        RunnerConfig::default()
    );

    fs::write(directory.path().join(CONFIG_FILE), "dataset: abc\n").unwrap();
    assert_eq!(
        RunnerConfig::discover(directory.path(), None)
            .unwrap()
            .dataset
            .as_deref(),
        Some("abc")
    );

    assert!(matches!(
        RunnerConfig::discover(directory.path(), Some(&directory.path().join("nope.yaml"))),
        Err(ConfigErrors::Read { .. })
    ));
}
