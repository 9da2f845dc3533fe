//! Target-scoped `.env` overrides layered over the agent's own environment.
//!
//! The format is deliberately narrow: `KEY=VALUE` per line, `#` comments, and one
//! optional pair of matching quotes around the value. No escapes, no interpolation.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    io::ErrorKind,
    path::Path,
};

use tokio::io::AsyncWriteExt;

fn strip_matching_quotes(v: &str) -> &str {
    for q in ['"', '\''] {
        if v.len() >= 2
            && let Some(inner) = v.strip_prefix(q).and_then(|s| s.strip_suffix(q))
        {
            return inner;
        }
    }
    v
}

/// Parses env-file text into ordered `(key, value)` pairs. Lines without `=` are skipped.
pub fn parse_env_text(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        out.push((key.to_string(), strip_matching_quotes(v.trim()).to_string()));
    }
    out
}

/// Reads the override pairs from `path`. A missing file is `Ok(None)`.
pub async fn read_overrides(path: &Path) -> std::io::Result<Option<Vec<(String, String)>>> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(Some(parse_env_text(&String::from_utf8_lossy(&raw)))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Host environment with the overrides from `env_file` applied on top.
///
/// Never fails: an unreadable file is logged and ignored.
pub async fn resolve_env(env_file: Option<&Path>) -> BTreeMap<OsString, OsString> {
    let mut env: BTreeMap<OsString, OsString> = std::env::vars_os().collect();

    let Some(path) = env_file else {
        return env;
    };

    match read_overrides(path).await {
        Ok(Some(pairs)) => {
            tracing::debug!(path = %path.display(), count = pairs.len(), "applying env overrides");
            for (k, v) in pairs {
                env.insert(OsString::from(k), OsString::from(v));
            }
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "env file unreadable; using host environment");
        }
    }
    env
}

/// Appends free text typed by a user, separated from existing content by a newline.
pub async fn append_env_text(path: &Path, text: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let existing = tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    if existing > 0 {
        f.write_all(b"\n").await?;
    }
    f.write_all(text.as_bytes()).await?;
    f.flush().await?;
    Ok(())
}
