//! Declared output specifications of a job.
//!
//! A specification is one of
//! - a literal path, which also covers anything that ends up beneath it,
//! - a directory, covering every path beneath it,
//! - a wildcard pattern, matched component-wise like a shell glob.
//!
//! All specifications are normalised relative to the repository root. The
//! overlap relation is conservative: it may report overlap for two
//! specifications no file can match both of, never the other way round.

mod expand;
#[cfg(test)]
mod outputs_test;

pub use expand::realize;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Component, Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("At least one output has to be declared")]
    Empty,
    #[error("Output {0} is outside of the repository")]
    OutsideRepository(String),
    #[error("Output {0} contains a wildcard, pass --allow-wildcard-outputs to permit this")]
    WildcardNotAllowed(String),
    #[error("Output pattern is invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("Failed to walk output directory")]
    Walk(#[from] ignore::Error),
}

const GLOB_META: &[char] = &['*', '?', '[', '{'];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum OutputSpec {
    Literal(PathBuf),
    /// an empty path denotes the repository root
    Directory(PathBuf),
    Wildcard {
        pattern: String,
        /// literal leading directories of `pattern`
        root: PathBuf,
    },
}

impl OutputSpec {
    /// Declare an output given on the command line.
    ///
    /// `raw` is relative to `pwd` (itself relative to `repo_root`). Existing
    /// directories on disk are declared as directories even without a
    /// trailing slash.
    pub fn declare(
        raw: &str,
        pwd: &Path,
        repo_root: &Path,
        allow_wildcards: bool,
    ) -> Result<Self, OutputError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OutputError::Empty);
        }

        let is_wildcard = raw.contains(GLOB_META);
        if is_wildcard && !allow_wildcards {
            return Err(OutputError::WildcardNotAllowed(raw.to_owned()));
        }

        let joined = if Path::new(raw).is_absolute() {
            Path::new(raw)
                .strip_prefix(repo_root)
                .map(Path::to_path_buf)
                .map_err(|_| OutputError::OutsideRepository(raw.to_owned()))?
        } else {
            pwd.join(raw)
        };
        let normalized =
            normalize(&joined).ok_or_else(|| OutputError::OutsideRepository(raw.to_owned()))?;

        if is_wildcard {
            Self::wildcard(&normalized)
        } else if raw.ends_with('/')
            || normalized.is_empty()
            || repo_root.join(&normalized).is_dir()
        {
            Ok(Self::Directory(PathBuf::from(normalized)))
        } else {
            Ok(Self::Literal(PathBuf::from(normalized)))
        }
    }

    fn wildcard(pattern: &str) -> Result<Self, OutputError> {
        // validate early so a broken pattern never reaches the history
        GlobBuilder::new(pattern).literal_separator(true).build()?;

        let root = pattern
            .split('/')
            .take_while(|component| !component.contains(GLOB_META))
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self::Wildcard {
            pattern: pattern.to_owned(),
            root: PathBuf::from(root),
        })
    }

    /// the deepest path every match of this specification lies beneath
    pub fn root(&self) -> &Path {
        match self {
            Self::Literal(path) | Self::Directory(path) => path,
            Self::Wildcard { root, .. } => root,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard { .. })
    }

    /// Overlap relation between two specifications.
    ///
    /// Never reports `false` for two specifications that could denote a
    /// common path.
    pub fn overlaps(&self, other: &OutputSpec) -> bool {
        match (self, other) {
            (Self::Wildcard { root: left, .. }, Self::Wildcard { root: right, .. }) => {
                nested(left, right)
            }
            (Self::Wildcard { pattern, .. }, path_like)
            | (path_like, Self::Wildcard { pattern, .. }) => {
                pattern_meets_path(pattern, path_like.root())
            }
            (left, right) => nested(left.root(), right.root()),
        }
    }

    pub(crate) fn matcher(&self) -> Result<Option<GlobMatcher>, OutputError> {
        match self {
            Self::Wildcard { pattern, .. } => Ok(Some(
                GlobBuilder::new(pattern)
                    .literal_separator(true)
                    .build()?
                    .compile_matcher(),
            )),
            _ => Ok(None),
        }
    }
}

/// one path lies at or beneath the other
fn nested(left: &Path, right: &Path) -> bool {
    left.starts_with(right) || right.starts_with(left)
}

/// Checks whether a glob could match `path`, one of its ancestors or anything
/// beneath it, by matching the components they have in common.
fn pattern_meets_path(pattern: &str, path: &Path) -> bool {
    let pattern_components = pattern.split('/').collect::<Vec<_>>();

    // component-wise matching is only sound if every group stays within one component
    if group_spans_separator(pattern)
        || pattern_components.iter().any(|component| component.contains("**"))
    {
        let root = pattern_components
            .iter()
            .take_while(|component| !component.contains(GLOB_META))
            .collect::<PathBuf>();

        return nested(&root, path);
    }

    path.components()
        .zip(pattern_components.iter())
        .all(|(component, pattern_component)| {
            let component = component.as_os_str().to_string_lossy();

            if !pattern_component.contains(GLOB_META) {
                return component == *pattern_component;
            }

            match GlobBuilder::new(pattern_component)
                .literal_separator(true)
                .build()
            {
                Ok(glob) => glob.compile_matcher().is_match(component.as_ref()),
                // unparsable components can't be ruled out
                Err(_) => true,
            }
        })
}

/// true if a `{...}` alternation or `[...]` class of `pattern` contains a `/`
fn group_spans_separator(pattern: &str) -> bool {
    let mut braces = 0usize;
    let mut in_class = false;
    let mut characters = pattern.chars();

    while let Some(character) = characters.next() {
        match character {
            '\\' => {
                characters.next();
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '{' if !in_class => braces += 1,
            '}' if !in_class => braces = braces.saturating_sub(1),
            '/' if in_class || braces > 0 => return true,
            _ => {}
        }
    }

    false
}

/// Lexically normalise a relative path, `None` if it escapes its base
fn normalize(path: &Path) -> Option<String> {
    let mut components: Vec<String> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(name) => components.push(name.to_string_lossy().into_owned()),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(components.join("/"))
}

impl fmt::Display for OutputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(path) => write!(f, "{}", path.display()),
            Self::Directory(path) if path.as_os_str().is_empty() => f.write_str("./"),
            Self::Directory(path) => write!(f, "{}/", path.display()),
            Self::Wildcard { pattern, .. } => f.write_str(pattern),
        }
    }
}

impl FromStr for OutputSpec {
    type Err = OutputError;

    /// parse the normalised form written into history records
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(OutputError::Empty);
        }

        let normalized =
            normalize(Path::new(value)).ok_or_else(|| OutputError::OutsideRepository(value.to_owned()))?;

        if value.contains(GLOB_META) {
            Self::wildcard(&normalized)
        } else if value.ends_with('/') || normalized.is_empty() {
            Ok(Self::Directory(PathBuf::from(normalized)))
        } else {
            Ok(Self::Literal(PathBuf::from(normalized)))
        }
    }
}

impl From<OutputSpec> for String {
    fn from(spec: OutputSpec) -> Self {
        spec.to_string()
    }
}

impl TryFrom<String> for OutputSpec {
    type Error = OutputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
