use super::{Commit, HistoryError, HistoryLog};
use crate::job::CommitId;
use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};
use tracing::{debug, instrument, warn};

const RECORD_SEPARATOR: char = '\u{1e}';
const FIELD_SEPARATOR: char = '\u{1f}';
/// paths handed to a single `git add`
const ADD_CHUNK: usize = 512;

/// History log stored as commits of a git repository.
///
/// Appends never go through the shared index: the commit is assembled in a
/// private index file on top of the expected head and published with
/// `git update-ref HEAD <new> <expected>`, which git refuses if the branch
/// moved in between.
#[derive(Debug, Clone)]
pub struct GitLog {
    root: PathBuf,
    git_dir: PathBuf,
    git: PathBuf,
}

impl GitLog {
    /// open the repository containing `path`
    pub fn discover(path: &Path) -> Result<Self, HistoryError> {
        let locator = Self {
            root: path.to_path_buf(),
            git_dir: PathBuf::new(),
            git: PathBuf::from("git"),
        };

        let root = PathBuf::from(locator.run(["rev-parse", "--show-toplevel"], None)?.trim());
        let git_dir = PathBuf::from(
            locator
                .run(["rev-parse", "--absolute-git-dir"], None)?
                .trim(),
        );

        debug!(root = ?root, git_dir = ?git_dir, "Opened git history");

        Ok(Self {
            root,
            git_dir,
            git: locator.git,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// name of the checked out branch, `None` when detached
    pub fn branch(&self) -> Option<String> {
        self.run(["symbolic-ref", "--quiet", "--short", "HEAD"], None)
            .ok()
            .map(|branch| branch.trim().to_owned())
            .filter(|branch| !branch.is_empty())
    }

    fn command<I, S>(&self, arguments: I, index: Option<&Path>) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.git);
        command.current_dir(&self.root).args(arguments);

        if let Some(index) = index {
            command.env("GIT_INDEX_FILE", index);
        }

        command
    }

    fn check(arguments: String, output: Output) -> Result<String, HistoryError> {
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(HistoryError::Command {
                command: arguments,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }

    fn run<I, S>(&self, arguments: I, index: Option<&Path>) -> Result<String, HistoryError>
    where
        I: IntoIterator<Item = S> + Clone,
        S: AsRef<OsStr>,
    {
        let description = arguments
            .clone()
            .into_iter()
            .map(|argument| argument.as_ref().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let output = self.command(arguments, index).output()?;

        Self::check(description, output)
    }

    /// Build the tree of `base` plus `artifacts` in a private index
    fn write_tree(
        &self,
        base: Option<&CommitId>,
        artifacts: &[PathBuf],
        index: &Path,
    ) -> Result<String, HistoryError> {
        match base {
            Some(base) => self.run(["read-tree", base.as_str()], Some(index))?,
            None => self.run(["read-tree", "--empty"], Some(index))?,
        };

        for chunk in artifacts.chunks(ADD_CHUNK) {
            let mut arguments = vec![
                OsStr::new("add").to_os_string(),
                OsStr::new("--force").to_os_string(),
                OsStr::new("--").to_os_string(),
            ];
            arguments.extend(chunk.iter().map(|path| path.as_os_str().to_os_string()));

            self.run(arguments, Some(index))?;
        }

        Ok(self.run(["write-tree"], Some(index))?.trim().to_owned())
    }
}

impl HistoryLog for GitLog {
    fn head(&self) -> Result<Option<CommitId>, HistoryError> {
        let output = self
            .command(["rev-parse", "--verify", "--quiet", "HEAD^{commit}"], None)
            .output()?;

        if output.status.success() {
            Ok(Some(CommitId::new(
                String::from_utf8_lossy(&output.stdout).trim(),
            )))
        } else {
            // unborn branch
            Ok(None)
        }
    }

    fn commits_since(&self, since: Option<&CommitId>) -> Result<Vec<Commit>, HistoryError> {
        if self.head()?.is_none() {
            return Ok(Vec::new());
        }

        let range = match since {
            Some(since) => format!("{since}..HEAD"),
            None => "HEAD".to_owned(),
        };
        let output = self.run(
            [
                "log",
                "--first-parent",
                "--reverse",
                "--format=%H%x1f%B%x1e",
                range.as_str(),
            ],
            None,
        )?;

        Ok(output
            .split(RECORD_SEPARATOR)
            .filter_map(|entry| {
                let (id, message) = entry.trim_start().split_once(FIELD_SEPARATOR)?;

                Some(Commit {
                    id: CommitId::new(id.trim()),
                    message: message.to_owned(),
                })
            })
            .collect())
    }

    #[instrument(skip(self, message), level = "debug")]
    fn append(
        &self,
        expected_head: Option<&CommitId>,
        message: &str,
        artifacts: &[PathBuf],
    ) -> Result<CommitId, HistoryError> {
        let actual = self.head()?;
        if actual.as_ref() != expected_head {
            return Err(HistoryError::HeadMoved {
                expected: expected_head.cloned(),
                actual,
            });
        }

        let index = self
            .git_dir
            .join(format!("slurmlog-index-{}", std::process::id()));
        let tree = self.write_tree(expected_head, artifacts, &index);
        if let Err(error) = fs::remove_file(&index) {
            debug!(error = ?error, index = ?index, "Failed to remove private index");
        }
        let tree = tree?;

        let mut arguments = vec!["commit-tree".to_owned(), tree];
        if let Some(parent) = expected_head {
            arguments.push("-p".to_owned());
            arguments.push(parent.to_string());
        }
        arguments.push("-m".to_owned());
        arguments.push(message.to_owned());
        let commit = CommitId::new(self.run(&arguments, None)?.trim());

        let old = expected_head.map(CommitId::to_string).unwrap_or_default();
        if let Err(error) = self.run(
            ["update-ref", "-m", "slurmlog", "HEAD", commit.as_str(), old.as_str()],
            None,
        ) {
            let actual = self.head()?;

            return Err(if actual.as_ref() != expected_head {
                HistoryError::HeadMoved {
                    expected: expected_head.cloned(),
                    actual,
                }
            } else {
                error
            });
        }

        if !artifacts.is_empty() {
            // keep the shared index in line with the new head for the committed paths
            let mut arguments = vec![
                OsStr::new("reset").to_os_string(),
                OsStr::new("--quiet").to_os_string(),
                OsStr::new("--").to_os_string(),
            ];
            arguments.extend(artifacts.iter().map(|path| path.as_os_str().to_os_string()));

            if let Err(error) = self.run(arguments, None) {
                warn!(error = %error, "Failed to refresh the index after committing outputs");
            }
        }

        Ok(commit)
    }

    fn resolve(&self, reference: &str) -> Result<CommitId, HistoryError> {
        let revision = format!("{reference}^{{commit}}");
        let output = self
            .command(["rev-parse", "--verify", "--quiet", revision.as_str()], None)
            .output()?;

        if output.status.success() {
            Ok(CommitId::new(String::from_utf8_lossy(&output.stdout).trim()))
        } else {
            Err(HistoryError::UnknownReference(reference.to_owned()))
        }
    }
}
