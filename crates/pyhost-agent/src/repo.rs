//! Helpers for the clone collaborator: naming a cloned repository and offering its
//! entry files. Cloning itself happens outside the agent.

use std::path::{Path, PathBuf};

use pyhost_process::{TargetIdError, normalize_entry_path, validate_repo_name};

/// Repository name from a public clone URL: last path segment without `.git`.
pub fn repo_name_from_url(url: &str) -> Result<String, TargetIdError> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(TargetIdError::InvalidName(url.to_string()));
    }

    let last = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let name = last.strip_suffix(".git").unwrap_or(last);
    validate_repo_name(name)?;
    Ok(name.to_string())
}

/// `.py` files inside a cloned repository, relative to its root, sorted.
/// Hidden directories (`.git`, `.venv`, ...) are skipped, as are paths that
/// could not be registered as an entry.
pub async fn list_entry_candidates(repo_dir: &Path, limit: usize) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut pending: Vec<PathBuf> = vec![PathBuf::new()];

    while let Some(rel) = pending.pop() {
        let mut rd = tokio::fs::read_dir(repo_dir.join(&rel)).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let ft = entry.file_type().await?;
            let child = rel.join(&*name);
            if ft.is_dir() {
                pending.push(child);
            } else if ft.is_file() && name.ends_with(".py") {
                let rel = child
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if normalize_entry_path(&rel).is_ok() {
                    out.push(rel);
                }
            }
        }
    }

    out.sort();
    out.truncate(limit);
    Ok(out)
}
