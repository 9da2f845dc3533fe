use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

/// Separator between repository name and entry path in a repository target id.
pub const REPO_SEPARATOR: char = '|';

/// Unique identifier of a runnable unit.
///
/// Either `"<file>.py"` (standalone upload) or `"<repo>|<entry path>"` (cloned repository).
/// Every other property of a target is derived from this string.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    pub fn file(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn repo(repo_name: &str, entry: &str) -> Self {
        Self(format!("{repo_name}{REPO_SEPARATOR}{entry}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Repository name and entry path, if the id has the repository shape.
    ///
    /// Anything else (no separator, empty halves, more than one separator) is a file id.
    pub fn repo_parts(&self) -> Option<(&str, &str)> {
        let (repo, entry) = self.0.split_once(REPO_SEPARATOR)?;
        if repo.is_empty() || entry.is_empty() || entry.contains(REPO_SEPARATOR) {
            return None;
        }
        Some((repo, entry))
    }

    pub fn kind(&self) -> TargetKind {
        if self.repo_parts().is_some() {
            TargetKind::Repo
        } else {
            TargetKind::File
        }
    }

    /// File stem used for the log file: the separator (and any path separator) becomes `_`.
    pub fn log_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| match c {
                REPO_SEPARATOR | '/' | '\\' => '_',
                c => c,
            })
            .collect()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TargetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    File,
    Repo,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::File => f.write_str("file"),
            TargetKind::Repo => f.write_str("repo"),
        }
    }
}

/// Concrete on-disk layout of a target, recomputed from its id on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    pub work_dir: PathBuf,
    /// Relative to `work_dir`.
    pub entry_path: PathBuf,
    pub env_file: PathBuf,
    pub log_file: PathBuf,
    pub requirements_file: PathBuf,
}

impl Target {
    pub fn entry_file(&self) -> PathBuf {
        self.work_dir.join(&self.entry_path)
    }
}

/// The shared upload directory and the naming rules for everything under it.
#[derive(Debug, Clone)]
pub struct UploadLayout {
    root: PathBuf,
}

impl UploadLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self, repo_name: &str) -> PathBuf {
        self.root.join(repo_name)
    }

    /// Never fails and does no I/O. Malformed ids resolve as file targets whose
    /// files simply do not exist.
    pub fn resolve(&self, id: &TargetId) -> Target {
        let log_file = self.root.join(format!("{}.log", id.log_stem()));

        match id.repo_parts() {
            Some((repo, entry)) => {
                let work_dir = self.repo_dir(repo);
                Target {
                    id: id.clone(),
                    kind: TargetKind::Repo,
                    entry_path: PathBuf::from(entry),
                    env_file: work_dir.join(".env"),
                    requirements_file: work_dir.join("requirements.txt"),
                    work_dir,
                    log_file,
                }
            }
            None => Target {
                id: id.clone(),
                kind: TargetKind::File,
                work_dir: self.root.clone(),
                entry_path: PathBuf::from(id.as_str()),
                env_file: self.root.join(format!("{}.env", id.as_str())),
                requirements_file: self.root.join(format!("{}_req.txt", id.as_str())),
                log_file,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetIdError {
    #[error("name must be non-empty")]
    Empty,
    #[error("`{0}` is not a .py file")]
    NotPython(String),
    #[error("`{0}` contains the reserved character `|`")]
    ReservedSeparator(String),
    #[error("path must be relative")]
    Absolute,
    #[error("path traversal is not allowed")]
    Traversal,
    #[error("`{0}` is not a valid name")]
    InvalidName(String),
}

fn check_separator(name: &str) -> Result<(), TargetIdError> {
    if name.contains(REPO_SEPARATOR) {
        return Err(TargetIdError::ReservedSeparator(name.to_string()));
    }
    Ok(())
}

fn check_python(name: &str) -> Result<(), TargetIdError> {
    if !name.ends_with(".py") {
        return Err(TargetIdError::NotPython(name.to_string()));
    }
    Ok(())
}

/// Names end up in paths and in the status URL query, so they stay URL-safe.
fn check_segment(name: &str) -> Result<(), TargetIdError> {
    if name == "."
        || name == ".."
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(TargetIdError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A standalone upload must be a bare `.py` file name.
pub fn validate_file_name(name: &str) -> Result<(), TargetIdError> {
    if name.is_empty() {
        return Err(TargetIdError::Empty);
    }
    check_separator(name)?;
    check_segment(name)?;
    check_python(name)
}

/// Repository names become directories directly under the upload root.
pub fn validate_repo_name(name: &str) -> Result<(), TargetIdError> {
    if name.is_empty() {
        return Err(TargetIdError::Empty);
    }
    check_separator(name)?;
    check_segment(name)
}

/// Normalizes an entry path inside a repository (`./src/main.py` -> `src/main.py`).
pub fn normalize_entry_path(rel: &str) -> Result<String, TargetIdError> {
    if rel.is_empty() {
        return Err(TargetIdError::Empty);
    }
    check_separator(rel)?;

    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(TargetIdError::Absolute);
    }

    let mut parts = Vec::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => {
                let seg = seg.to_string_lossy();
                check_segment(&seg)?;
                parts.push(seg.into_owned());
            }
            Component::ParentDir => return Err(TargetIdError::Traversal),
            Component::Prefix(_) | Component::RootDir => return Err(TargetIdError::Absolute),
        }
    }
    if parts.is_empty() {
        return Err(TargetIdError::Empty);
    }

    let out = parts.join("/");
    check_python(&out)?;
    Ok(out)
}
