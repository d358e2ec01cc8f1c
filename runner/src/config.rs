use crate::scheduler::slurm::SlurmScheduler;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

#[cfg(test)]
mod config_test;

/// looked up in the repository root if no configuration is given explicitly
pub const CONFIG_FILE: &str = ".slurmlog.yaml";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File {0:?} not found")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Failed to read configuration {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Configuration is not valid")]
    Parse(#[from] serde_yaml::Error),
    #[error("Configuration failed the preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // dataset id stamped on every schedule entry
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub slurm: SlurmConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SlurmConfig {
    #[serde(default = "default_sacct")]
    pub sacct: PathBuf,
    // milliseconds, a timed out query reports UNKNOWN
    #[serde(default = "default_status_timeout")]
    pub status_timeout: u64,
    // milliseconds, a timed out submission is rejected
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout: u64,
    #[serde(default = "default_true")]
    pub commit_logs: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    #[serde(default)]
    pub git: GitConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GitConfig {
    #[serde(default = "default_retries")]
    pub retries: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    // relative paths are taken from the repository root
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sacct: default_sacct(),
            status_timeout: default_status_timeout(),
            submit_timeout: default_submit_timeout(),
            commit_logs: true,
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            enabled: true,
        }
    }
}

impl SlurmConfig {
    pub fn scheduler(&self) -> SlurmScheduler {
        SlurmScheduler {
            sacct: self.sacct.clone(),
            status_timeout: Duration::from_millis(self.status_timeout),
            submit_timeout: Duration::from_millis(self.submit_timeout),
        }
    }
}

impl CacheConfig {
    /// where the cache of `branch` lives, `None` if caching is disabled
    pub fn resolve(&self, repo_root: &Path, git_dir: &Path, branch: Option<&str>) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }

        Some(match &self.path {
            Some(path) => repo_root.join(path),
            None => git_dir.join(format!(
                "slurmlog-{}.db",
                branch.unwrap_or("detached").replace('/', "-")
            )),
        })
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_str(&content)?)
    }

    /// `explicit` if given, the repository's configuration file if present, defaults otherwise
    pub fn discover(repo_root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigErrors> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let path = repo_root.join(CONFIG_FILE);
        if path.is_file() {
            debug!(path = ?path, "Loading configuration");
            Self::load(&path)
        } else {
            debug!("No configuration found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if let Some(dataset) = &self.dataset {
            if dataset.trim().is_empty() {
                error!("dataset must not be empty, remove it to record no dataset id");
                contains_error = true;
            }
        }

        let slurm = &self.scheduler.slurm;
        if slurm.status_timeout == 0 {
            error!("scheduler.slurm.status_timeout cannot be 0, every status would be UNKNOWN");
            contains_error = true;
        }
        if slurm.submit_timeout == 0 {
            error!("scheduler.slurm.submit_timeout cannot be 0, every submission would time out");
            contains_error = true;
        }

        // bare names are looked up in PATH when running
        if slurm.sacct.components().count() > 1 {
            match check_executable(&slurm.sacct) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "scheduler.slurm.sacct ({}) is not executable",
                        slurm.sacct.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if scheduler.slurm.sacct ({}) is an executable: {e}",
                        slurm.sacct.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if self.history.git.retries == 0 {
            warn!("history.git.retries is 0, any concurrent append fails immediately");
        }

        if let Some(path) = &self.cache.path {
            let raw = path.to_string_lossy();

            if raw.is_empty() || raw.ends_with('/') {
                error!("cache.path ({raw}) must name a file");
                contains_error = true;
            }
        }

        contains_error
    }
}

fn default_sacct() -> PathBuf {
    PathBuf::from("sacct")
}

fn default_status_timeout() -> u64 {
    30_000
}

fn default_submit_timeout() -> u64 {
    120_000
}

fn default_retries() -> usize {
    5
}

fn default_true() -> bool {
    true
}
