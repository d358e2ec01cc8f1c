use super::{OutputError, OutputSpec};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Collect the files currently on disk that realise `specs`.
///
/// Returned paths are relative to `repo_root`, sorted and free of
/// duplicates. Declared outputs that don't exist are skipped with a warning.
pub fn realize(specs: &[OutputSpec], repo_root: &Path) -> Result<Vec<PathBuf>, OutputError> {
    let mut realized = Vec::new();

    for spec in specs {
        let before = realized.len();

        match spec {
            OutputSpec::Literal(path) | OutputSpec::Directory(path) => {
                let absolute = repo_root.join(path);

                if absolute.is_dir() {
                    realized.extend(walk_files(&absolute, repo_root)?);
                } else if absolute.symlink_metadata().is_ok() {
                    realized.push(path.clone());
                }
            }
            OutputSpec::Wildcard { root, .. } => {
                let absolute_root = repo_root.join(root);

                if absolute_root.is_dir() {
                    // matcher() only returns None for non wildcard specs
                    if let Some(matcher) = spec.matcher()? {
                        for entry in walk(&absolute_root) {
                            let entry = entry?;
                            let Ok(relative) = entry.path().strip_prefix(repo_root) else {
                                continue;
                            };

                            if !matcher.is_match(relative) {
                                continue;
                            }

                            if entry.path().is_dir() {
                                realized.extend(walk_files(entry.path(), repo_root)?);
                            } else {
                                realized.push(relative.to_path_buf());
                            }
                        }
                    }
                }
            }
        }

        if realized.len() == before {
            warn!(output = %spec, "Declared output does not exist, nothing to commit for it");
        } else {
            debug!(output = %spec, files = realized.len() - before, "Realized output");
        }
    }

    Ok(realized.into_iter().sorted().dedup().collect_vec())
}

fn walk(path: &Path) -> ignore::Walk {
    WalkBuilder::new(path)
        .standard_filters(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build()
}

fn walk_files(path: &Path, repo_root: &Path) -> Result<Vec<PathBuf>, OutputError> {
    let mut files = Vec::new();

    for entry in walk(path) {
        let entry: DirEntry = entry?;

        if entry.file_type().map_or(false, |kind| !kind.is_dir()) {
            if let Ok(relative) = entry.path().strip_prefix(repo_root) {
                files.push(relative.to_path_buf());
            }
        }
    }

    Ok(files)
}
