//! Durable JSON state: target ownership and the allowed-user list.
//!
//! Each store keeps its map in memory behind one mutex and rewrites the whole file
//! (temp file + rename) before a mutating call returns. Missing or corrupt files load
//! as empty.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use pyhost_process::{TargetId, TargetKind, UserId};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{io::AsyncWriteExt, sync::Mutex};

async fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let raw = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == ErrorKind::NotFound => return T::default(),
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "state file unreadable; starting empty");
            return T::default();
        }
    };
    match serde_json::from_slice::<T>(&raw) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "state file corrupt; starting empty");
            T::default()
        }
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).context("serialize state")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    f.sync_all().await.ok();
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OwnershipRecord {
    pub owner: UserId,
    #[serde(rename = "type")]
    pub kind: TargetKind,
}

/// Who may manage which target. Last writer wins.
#[derive(Debug, Clone)]
pub struct OwnershipRegistry {
    path: PathBuf,
    inner: Arc<Mutex<BTreeMap<TargetId, OwnershipRecord>>>,
}

impl OwnershipRegistry {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = load_json_or_default(&path).await;
        Self {
            path,
            inner: Arc::new(Mutex::new(map)),
        }
    }

    /// Inserts or overwrites the record. The in-memory map is rolled back if the
    /// file cannot be written.
    pub async fn record(
        &self,
        target_id: &TargetId,
        owner: UserId,
        kind: TargetKind,
    ) -> anyhow::Result<()> {
        let mut map = self.inner.lock().await;
        let previous = map.insert(target_id.clone(), OwnershipRecord { owner, kind });
        if let Err(err) = write_json_atomic(&self.path, &*map).await {
            match previous {
                Some(p) => map.insert(target_id.clone(), p),
                None => map.remove(target_id),
            };
            return Err(err);
        }
        tracing::info!(target_id = %target_id, owner, %kind, "ownership recorded");
        Ok(())
    }

    pub async fn get(&self, target_id: &TargetId) -> Option<OwnershipRecord> {
        self.inner.lock().await.get(target_id).cloned()
    }

    pub async fn owner(&self, target_id: &TargetId) -> Option<UserId> {
        self.get(target_id).await.map(|r| r.owner)
    }

    /// Returns whether a record was removed. Removing an unknown id is a no-op.
    pub async fn delete(&self, target_id: &TargetId) -> anyhow::Result<bool> {
        let mut map = self.inner.lock().await;
        let Some(previous) = map.remove(target_id) else {
            return Ok(false);
        };
        if let Err(err) = write_json_atomic(&self.path, &*map).await {
            map.insert(target_id.clone(), previous);
            return Err(err);
        }
        tracing::info!(target_id = %target_id, "ownership deleted");
        Ok(true)
    }

    pub async fn owned_by(&self, user: UserId) -> Vec<(TargetId, OwnershipRecord)> {
        self.inner
            .lock()
            .await
            .iter()
            .filter(|(_, r)| r.owner == user)
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    pub async fn all(&self) -> Vec<(TargetId, OwnershipRecord)> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }
}

/// Users other than the super-admin who may use the service.
#[derive(Debug, Clone)]
pub struct AllowedUsers {
    path: PathBuf,
    inner: Arc<Mutex<BTreeSet<UserId>>>,
}

impl AllowedUsers {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let set = load_json_or_default(&path).await;
        Self {
            path,
            inner: Arc::new(Mutex::new(set)),
        }
    }

    pub async fn contains(&self, user: UserId) -> bool {
        self.inner.lock().await.contains(&user)
    }

    /// `Ok(false)` when the user was already present.
    pub async fn add(&self, user: UserId) -> anyhow::Result<bool> {
        let mut set = self.inner.lock().await;
        if !set.insert(user) {
            return Ok(false);
        }
        if let Err(err) = write_json_atomic(&self.path, &*set).await {
            set.remove(&user);
            return Err(err);
        }
        Ok(true)
    }

    /// `Ok(false)` when the user was not present.
    pub async fn remove(&self, user: UserId) -> anyhow::Result<bool> {
        let mut set = self.inner.lock().await;
        if !set.remove(&user) {
            return Ok(false);
        }
        if let Err(err) = write_json_atomic(&self.path, &*set).await {
            set.insert(user);
            return Err(err);
        }
        Ok(true)
    }

    pub async fn list(&self) -> Vec<UserId> {
        self.inner.lock().await.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ownership_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ownership.json");
        let id = TargetId::file("app.py");

        let reg = OwnershipRegistry::open(&path).await;
        reg.record(&id, 5, TargetKind::File).await.unwrap();
        reg.record(&TargetId::repo("r", "main.py"), 7, TargetKind::Repo)
            .await
            .unwrap();

        let reopened = OwnershipRegistry::open(&path).await;
        assert_eq!(reopened.owner(&id).await, Some(5));
        assert_eq!(reopened.owned_by(7).await.len(), 1);
        assert_eq!(reopened.all().await.len(), 2);
    }

    #[tokio::test]
    async fn record_overwrites_and_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = OwnershipRegistry::open(dir.path().join("ownership.json")).await;
        let id = TargetId::file("app.py");

        reg.record(&id, 5, TargetKind::File).await.unwrap();
        reg.record(&id, 9, TargetKind::File).await.unwrap();
        assert_eq!(reg.owner(&id).await, Some(9));

        assert!(reg.delete(&id).await.unwrap());
        assert!(!reg.delete(&id).await.unwrap());
        assert_eq!(reg.owner(&id).await, None);
    }

    #[tokio::test]
    async fn corrupt_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ownership.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let reg = OwnershipRegistry::open(&path).await;
        assert!(reg.all().await.is_empty());

        reg.record(&TargetId::file("x.py"), 1, TargetKind::File)
            .await
            .unwrap();
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["x.py"]["owner"], 1);
        assert_eq!(v["x.py"]["type"], "file");
    }

    #[tokio::test]
    async fn allowed_users_add_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowed_users.json");
        let users = AllowedUsers::open(&path).await;

        assert!(users.add(42).await.unwrap());
        assert!(!users.add(42).await.unwrap());
        assert!(users.contains(42).await);

        let reopened = AllowedUsers::open(&path).await;
        assert_eq!(reopened.list().await, vec![42]);
        assert!(reopened.remove(42).await.unwrap());
        assert!(!reopened.remove(42).await.unwrap());
    }
}
