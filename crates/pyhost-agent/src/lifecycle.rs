//! Access-controlled facade over ownership and process supervision.
//!
//! Every target operation starts with an explicit guard: the caller must be the
//! super-admin or the recorded owner. Guard failures have no side effects.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pyhost_process::{
    ProcessState, TargetId, TargetIdError, TargetKind, UploadLayout, UserId,
    normalize_entry_path, validate_file_name, validate_repo_name,
};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::{
    config::AgentConfig,
    env_file,
    process_manager::{ProcessManager, StartReport, StopReport, SupervisorConfig, SupervisorError},
    repo,
    stats::{self, ServerStats},
    store::{AllowedUsers, OwnershipRecord, OwnershipRegistry},
};

/// Largest log tail returned by `logs`.
pub const MAX_LOG_BYTES: u64 = 1024 * 1024;

/// Entry files offered after a clone.
pub const ENTRY_CANDIDATE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Super-admin or a user on the allowed list.
    Member,
    SuperAdmin,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("access denied")]
    AccessDenied,
    #[error("super admin only")]
    SuperAdminOnly,
    #[error("{0} is already running")]
    AlreadyRunning(TargetId),
    #[error("target not found: {0}")]
    TargetNotFound(String),
    #[error("launch failed: {0}")]
    LaunchFailure(String),
    #[error(transparent)]
    InvalidTarget(#[from] TargetIdError),
    #[error("{0} is owned by another user")]
    Taken(String),
    #[error("{0}")]
    Internal(String),
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::AccessDenied => "access_denied",
            LifecycleError::SuperAdminOnly => "super_admin_only",
            LifecycleError::AlreadyRunning(_) => "already_running",
            LifecycleError::TargetNotFound(_) => "target_not_found",
            LifecycleError::LaunchFailure(_) => "launch_failure",
            LifecycleError::InvalidTarget(_) => "invalid_target",
            LifecycleError::Taken(_) => "taken",
            LifecycleError::Internal(_) => "internal",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            LifecycleError::AccessDenied => "⛔ Access denied.".to_string(),
            LifecycleError::SuperAdminOnly => "⛔ Super admin only.".to_string(),
            LifecycleError::AlreadyRunning(id) => format!("⚠️ `{id}` is already running!"),
            LifecycleError::Taken(name) => {
                format!("❌ Taken! `{name}` is owned by another user.")
            }
            other => format!("❌ Error: {other}"),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        LifecycleError::Internal(err.to_string())
    }
}

impl From<SupervisorError> for LifecycleError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::AlreadyRunning(id) => LifecycleError::AlreadyRunning(id),
            SupervisorError::TargetNotFound(path) => {
                LifecycleError::TargetNotFound(path.display().to_string())
            }
            e @ SupervisorError::LaunchFailure { .. } => LifecycleError::LaunchFailure(e.to_string()),
            e @ SupervisorError::LogFile { .. } => LifecycleError::Internal(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum StartOutcome {
    Running {
        target_id: TargetId,
        pid: u32,
        status_url: String,
    },
    Crashed {
        target_id: TargetId,
        exit_code: Option<i32>,
        log_tail: String,
    },
}

impl StartOutcome {
    pub fn user_message(&self) -> String {
        match self {
            StartOutcome::Running {
                target_id,
                pid,
                status_url,
            } => format!("🟢 Running!\nID: `{target_id}`\nPID: {pid}\n🔗 URL: `{status_url}`"),
            StartOutcome::Crashed {
                target_id,
                exit_code,
                log_tail,
            } => {
                let code = exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                format!("❌ Crashed: `{target_id}` (exit {code})\n`{log_tail}`")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StopOutcome {
    pub target_id: TargetId,
    pub was_running: bool,
    pub forced: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeleteOutcome {
    pub target_id: TargetId,
    pub was_running: bool,
    pub removed_files: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TargetSummary {
    pub target_id: TargetId,
    pub kind: TargetKind,
    pub owner: UserId,
    pub state: ProcessState,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TargetInfo {
    pub target_id: TargetId,
    pub kind: TargetKind,
    pub owner: Option<UserId>,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub status_url: String,
}

async fn write_new_file(path: &std::path::Path, content: &[u8]) -> std::io::Result<()> {
    let mut f = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    f.write_all(content).await?;
    f.sync_all().await
}

fn audit(caller: UserId, action: &str, target_id: &TargetId, ok: bool) {
    if ok {
        tracing::info!(target: "pyhost::audit", caller, action, target_id = %target_id, "allowed");
    } else {
        tracing::warn!(target: "pyhost::audit", caller, action, target_id = %target_id, "denied");
    }
}

#[derive(Debug, Clone)]
pub struct Controller {
    super_admin: UserId,
    base_url: String,
    layout: UploadLayout,
    ownership: OwnershipRegistry,
    users: AllowedUsers,
    processes: ProcessManager,
    /// Serializes claim checks with the writes and records that depend on them.
    claims: Arc<Mutex<()>>,
}

impl Controller {
    pub fn new(
        super_admin: UserId,
        base_url: impl Into<String>,
        layout: UploadLayout,
        ownership: OwnershipRegistry,
        users: AllowedUsers,
        processes: ProcessManager,
    ) -> Self {
        Self {
            super_admin,
            base_url: base_url.into(),
            layout,
            ownership,
            users,
            processes,
            claims: Arc::new(Mutex::new(())),
        }
    }

    /// Opens the persisted stores and prepares the upload directory.
    pub async fn open(cfg: &AgentConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&cfg.upload_dir).await?;
        let ownership = OwnershipRegistry::open(cfg.ownership_path()).await;
        let users = AllowedUsers::open(cfg.allowed_users_path()).await;
        Ok(Self::new(
            cfg.super_admin,
            cfg.base_url.clone(),
            UploadLayout::new(cfg.upload_dir.clone()),
            ownership,
            users,
            ProcessManager::new(SupervisorConfig::from(cfg)),
        ))
    }

    pub fn layout(&self) -> &UploadLayout {
        &self.layout
    }

    pub fn status_url(&self, target_id: &TargetId) -> String {
        format!("{}/status?script={}", self.base_url, target_id)
    }

    pub fn is_super_admin(&self, caller: UserId) -> bool {
        caller == self.super_admin
    }

    pub async fn is_member(&self, caller: UserId) -> bool {
        self.is_super_admin(caller) || self.users.contains(caller).await
    }

    pub async fn require(&self, caller: UserId, role: Role) -> Result<(), LifecycleError> {
        match role {
            Role::SuperAdmin if self.is_super_admin(caller) => Ok(()),
            Role::SuperAdmin => Err(LifecycleError::SuperAdminOnly),
            Role::Member if self.is_member(caller).await => Ok(()),
            Role::Member => Err(LifecycleError::AccessDenied),
        }
    }

    /// Super-admin or recorded owner. Returns the ownership record, if any.
    async fn authorize_target(
        &self,
        caller: UserId,
        action: &str,
        target_id: &TargetId,
    ) -> Result<Option<OwnershipRecord>, LifecycleError> {
        let record = self.ownership.get(target_id).await;
        let ok = self.is_super_admin(caller) || record.as_ref().is_some_and(|r| r.owner == caller);
        audit(caller, action, target_id, ok);
        if !ok {
            return Err(LifecycleError::AccessDenied);
        }
        Ok(record)
    }

    async fn launch(&self, target_id: &TargetId) -> Result<StartOutcome, LifecycleError> {
        let target = self.layout.resolve(target_id);
        let report = self.processes.start(&target).await?;
        Ok(match report {
            StartReport::Running { pid } => StartOutcome::Running {
                target_id: target_id.clone(),
                pid,
                status_url: self.status_url(target_id),
            },
            StartReport::Crashed { exit, log_tail, .. } => StartOutcome::Crashed {
                target_id: target_id.clone(),
                exit_code: exit.and_then(|e| e.code),
                log_tail,
            },
        })
    }

    pub async fn start(
        &self,
        caller: UserId,
        target_id: &TargetId,
    ) -> Result<StartOutcome, LifecycleError> {
        self.authorize_target(caller, "start", target_id).await?;
        self.launch(target_id).await
    }

    pub async fn restart(
        &self,
        caller: UserId,
        target_id: &TargetId,
    ) -> Result<StartOutcome, LifecycleError> {
        self.authorize_target(caller, "restart", target_id).await?;
        self.processes.stop(target_id).await;
        self.launch(target_id).await
    }

    pub async fn stop(
        &self,
        caller: UserId,
        target_id: &TargetId,
    ) -> Result<StopOutcome, LifecycleError> {
        self.authorize_target(caller, "stop", target_id).await?;
        let (was_running, forced) = match self.processes.stop(target_id).await {
            StopReport::NotRunning => (false, false),
            StopReport::Stopped { forced, .. } => (true, forced),
        };
        Ok(StopOutcome {
            target_id: target_id.clone(),
            was_running,
            forced,
        })
    }

    /// Stops the process, removes its files, then forgets the owner.
    pub async fn delete(
        &self,
        caller: UserId,
        target_id: &TargetId,
    ) -> Result<DeleteOutcome, LifecycleError> {
        self.authorize_target(caller, "delete", target_id).await?;
        let target = self.layout.resolve(target_id);
        let report = self.processes.delete_artifacts(&target).await;
        self.ownership
            .delete(target_id)
            .await
            .map_err(LifecycleError::internal)?;
        Ok(DeleteOutcome {
            target_id: target_id.clone(),
            was_running: matches!(report.stop, StopReport::Stopped { .. }),
            removed_files: report.removed.len(),
        })
    }

    pub async fn inspect(
        &self,
        caller: UserId,
        target_id: &TargetId,
    ) -> Result<TargetInfo, LifecycleError> {
        let record = self.authorize_target(caller, "inspect", target_id).await?;
        let status = self.processes.status(target_id).await;
        Ok(TargetInfo {
            target_id: target_id.clone(),
            kind: record.as_ref().map(|r| r.kind).unwrap_or(target_id.kind()),
            owner: record.map(|r| r.owner),
            state: status.state,
            pid: status.pid,
            exit_code: status.exit_code,
            started_at: status.started_at,
            status_url: self.status_url(target_id),
        })
    }

    /// Tail of the target's log, or `None` when nothing has been logged yet.
    pub async fn logs(
        &self,
        caller: UserId,
        target_id: &TargetId,
        max_bytes: u64,
    ) -> Result<Option<String>, LifecycleError> {
        self.authorize_target(caller, "logs", target_id).await?;
        let target = self.layout.resolve(target_id);
        Ok(self
            .processes
            .tail_log(&target, max_bytes.clamp(1, MAX_LOG_BYTES))
            .await)
    }

    /// Own targets, or every target for the super-admin.
    pub async fn list(&self, caller: UserId) -> Vec<TargetSummary> {
        let records = if self.is_super_admin(caller) {
            self.ownership.all().await
        } else {
            self.ownership.owned_by(caller).await
        };

        let mut out = Vec::with_capacity(records.len());
        for (target_id, r) in records {
            let state = self.processes.status(&target_id).await.state;
            out.push(TargetSummary {
                target_id,
                kind: r.kind,
                owner: r.owner,
                state,
            });
        }
        out
    }

    /// Unauthenticated liveness behind the public status endpoint.
    pub async fn is_running(&self, target_id: &TargetId) -> bool {
        self.processes.is_running(target_id).await
    }

    /// Claim rule for a new upload: the name is claimable when it has no owner and no
    /// file, when the caller already owns it, or when the caller is the super-admin.
    /// Must run under the claim lock.
    async fn upload_claim_locked(
        &self,
        caller: UserId,
        file_name: &str,
    ) -> Result<TargetId, LifecycleError> {
        let target_id = TargetId::file(file_name);
        if self.is_super_admin(caller) {
            return Ok(target_id);
        }
        let claimable = match self.ownership.owner(&target_id).await {
            Some(owner) => owner == caller,
            None => !tokio::fs::try_exists(self.layout.root().join(file_name))
                .await
                .unwrap_or(true),
        };
        if !claimable {
            tracing::warn!(caller, file_name, "upload rejected: name taken");
            return Err(LifecycleError::Taken(file_name.to_string()));
        }
        Ok(target_id)
    }

    /// Checks the claim rule before an upload collaborator writes a script.
    pub async fn check_upload_claim(
        &self,
        caller: UserId,
        file_name: &str,
    ) -> Result<TargetId, LifecycleError> {
        self.require(caller, Role::Member).await?;
        validate_file_name(file_name)?;
        let _claim = self.claims.lock().await;
        self.upload_claim_locked(caller, file_name).await
    }

    /// Records ownership once the upload collaborator has written the script.
    /// The file exists by now, so only a foreign owner record makes the name taken.
    pub async fn register_upload(
        &self,
        caller: UserId,
        file_name: &str,
    ) -> Result<TargetId, LifecycleError> {
        self.require(caller, Role::Member).await?;
        validate_file_name(file_name)?;
        let target_id = TargetId::file(file_name);

        let _claim = self.claims.lock().await;
        if !self.is_super_admin(caller)
            && self
                .ownership
                .owner(&target_id)
                .await
                .is_some_and(|owner| owner != caller)
        {
            tracing::warn!(caller, file_name, "upload rejected: name taken");
            return Err(LifecycleError::Taken(file_name.to_string()));
        }
        self.ownership
            .record(&target_id, caller, TargetKind::File)
            .await
            .map_err(LifecycleError::internal)?;
        Ok(target_id)
    }

    /// Claim check, write, and ownership in one step.
    ///
    /// The content lands in a private temp file first. It is renamed over the script
    /// only after the claim succeeds, with the claim lock held until ownership is recorded.
    pub async fn upload_script(
        &self,
        caller: UserId,
        file_name: &str,
        content: &[u8],
    ) -> Result<TargetId, LifecycleError> {
        self.require(caller, Role::Member).await?;
        validate_file_name(file_name)?;

        let path = self.layout.root().join(file_name);
        let tmp = self
            .layout
            .root()
            .join(format!(".{file_name}.{}.upload", uuid::Uuid::new_v4()));
        if let Err(err) = write_new_file(&tmp, content).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(LifecycleError::internal(err));
        }

        let _claim = self.claims.lock().await;
        let target_id = match self.upload_claim_locked(caller, file_name).await {
            Ok(id) => id,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err);
            }
        };
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(LifecycleError::internal(err));
        }
        self.ownership
            .record(&target_id, caller, TargetKind::File)
            .await
            .map_err(LifecycleError::internal)?;
        Ok(target_id)
    }

    /// Claim rule for a clone: the repository directory is free, or every target
    /// already recorded under it belongs to the caller. Must run under the claim lock.
    async fn repo_claim_locked(
        &self,
        caller: UserId,
        repo_name: &str,
    ) -> Result<(), LifecycleError> {
        if self.is_super_admin(caller) {
            return Ok(());
        }
        let foreign = self.ownership.all().await.into_iter().any(|(id, r)| {
            id.repo_parts().is_some_and(|(repo, _)| repo == repo_name) && r.owner != caller
        });
        if foreign {
            tracing::warn!(caller, repo_name, "clone rejected: repository taken");
            return Err(LifecycleError::Taken(repo_name.to_string()));
        }
        Ok(())
    }

    pub async fn check_repo_claim(
        &self,
        caller: UserId,
        repo_name: &str,
    ) -> Result<(), LifecycleError> {
        self.require(caller, Role::Member).await?;
        validate_repo_name(repo_name)?;
        let _claim = self.claims.lock().await;
        self.repo_claim_locked(caller, repo_name).await
    }

    /// Records ownership of `repo|entry` after a clone and entry selection.
    pub async fn register_repo_entry(
        &self,
        caller: UserId,
        repo_name: &str,
        entry: &str,
    ) -> Result<TargetId, LifecycleError> {
        self.require(caller, Role::Member).await?;
        validate_repo_name(repo_name)?;
        let entry = normalize_entry_path(entry)?;
        let target_id = TargetId::repo(repo_name, &entry);

        let _claim = self.claims.lock().await;
        self.repo_claim_locked(caller, repo_name).await?;

        let target = self.layout.resolve(&target_id);
        if !tokio::fs::try_exists(target.entry_file()).await.unwrap_or(false) {
            return Err(LifecycleError::TargetNotFound(
                target.entry_file().display().to_string(),
            ));
        }

        self.ownership
            .record(&target_id, caller, TargetKind::Repo)
            .await
            .map_err(LifecycleError::internal)?;
        Ok(target_id)
    }

    /// `.py` files the caller may pick as the entry of a cloned repository.
    pub async fn entry_candidates(
        &self,
        caller: UserId,
        repo_name: &str,
    ) -> Result<Vec<String>, LifecycleError> {
        self.check_repo_claim(caller, repo_name).await?;
        let dir = self.layout.repo_dir(repo_name);
        repo::list_entry_candidates(&dir, ENTRY_CANDIDATE_LIMIT)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    LifecycleError::TargetNotFound(dir.display().to_string())
                }
                _ => LifecycleError::internal(e),
            })
    }

    /// Appends user-typed `KEY=VALUE` text to the target's env file.
    pub async fn append_env(
        &self,
        caller: UserId,
        target_id: &TargetId,
        text: &str,
    ) -> Result<(), LifecycleError> {
        self.authorize_target(caller, "env", target_id).await?;
        let target = self.layout.resolve(target_id);
        env_file::append_env_text(&target.env_file, text)
            .await
            .map_err(LifecycleError::internal)
    }

    pub async fn add_user(&self, caller: UserId, user: UserId) -> Result<bool, LifecycleError> {
        self.require(caller, Role::SuperAdmin).await?;
        let added = self.users.add(user).await.map_err(LifecycleError::internal)?;
        tracing::info!(caller, user, added, "allowed user add");
        Ok(added)
    }

    pub async fn remove_user(&self, caller: UserId, user: UserId) -> Result<bool, LifecycleError> {
        self.require(caller, Role::SuperAdmin).await?;
        let removed = self
            .users
            .remove(user)
            .await
            .map_err(LifecycleError::internal)?;
        tracing::info!(caller, user, removed, "allowed user remove");
        Ok(removed)
    }

    pub async fn list_users(&self, caller: UserId) -> Result<Vec<UserId>, LifecycleError> {
        self.require(caller, Role::SuperAdmin).await?;
        Ok(self.users.list().await)
    }

    pub async fn stats(&self, caller: UserId) -> Result<ServerStats, LifecycleError> {
        self.require(caller, Role::Member).await?;
        Ok(stats::collect(self.processes.active_count().await).await)
    }

    pub async fn active_count(&self) -> usize {
        self.processes.active_count().await
    }

    pub async fn shutdown(&self) {
        self.processes.stop_all().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::http::test_support::*;

    #[tokio::test]
    async fn owner_starts_stranger_denied_admin_stops() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        let id = c
            .upload_script(ALICE, "app.py", b"sleep 30\n")
            .await
            .unwrap();

        let outcome = c.start(ALICE, &id).await.unwrap();
        let StartOutcome::Running { status_url, .. } = &outcome else {
            panic!("expected running, got {outcome:?}");
        };
        assert_eq!(status_url, "http://host.test/status?script=app.py");
        assert!(c.is_running(&id).await);

        let denied = c.stop(BOB, &id).await;
        assert!(matches!(denied, Err(LifecycleError::AccessDenied)));
        assert!(c.is_running(&id).await);

        let stopped = c.stop(ADMIN, &id).await.unwrap();
        assert!(stopped.was_running);
        assert!(!c.is_running(&id).await);
    }

    #[tokio::test]
    async fn strangers_cannot_restart_or_delete() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        let id = c
            .upload_script(ALICE, "app.py", b"sleep 30\n")
            .await
            .unwrap();
        c.start(ALICE, &id).await.unwrap();

        assert!(matches!(
            c.restart(BOB, &id).await,
            Err(LifecycleError::AccessDenied)
        ));
        assert!(matches!(
            c.delete(BOB, &id).await,
            Err(LifecycleError::AccessDenied)
        ));
        assert!(matches!(
            c.logs(BOB, &id, 100).await,
            Err(LifecycleError::AccessDenied)
        ));
        assert!(c.is_running(&id).await);
        assert!(c.layout().root().join("app.py").exists());
        assert_eq!(c.ownership.owner(&id).await, Some(ALICE));

        c.stop(ALICE, &id).await.unwrap();
    }

    #[tokio::test]
    async fn double_start_warns_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        let id = c
            .upload_script(ALICE, "app.py", b"sleep 30\n")
            .await
            .unwrap();

        c.start(ALICE, &id).await.unwrap();
        let err = c.start(ALICE, &id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRunning(_)));
        assert!(err.user_message().contains("already running"));
        assert_eq!(c.active_count().await, 1);

        c.stop(ALICE, &id).await.unwrap();
    }

    #[tokio::test]
    async fn restart_replaces_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        let id = c
            .upload_script(ALICE, "app.py", b"sleep 30\n")
            .await
            .unwrap();

        let StartOutcome::Running { pid: first, .. } = c.start(ALICE, &id).await.unwrap() else {
            panic!("expected running");
        };
        let StartOutcome::Running { pid: second, .. } = c.restart(ALICE, &id).await.unwrap() else {
            panic!("expected running");
        };
        assert_ne!(first, second);
        assert_eq!(c.active_count().await, 1);

        c.stop(ALICE, &id).await.unwrap();
    }

    #[tokio::test]
    async fn delete_cleans_files_and_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        let id = c
            .upload_script(ALICE, "app.py", b"sleep 30\n")
            .await
            .unwrap();
        c.append_env(ALICE, &id, "TOKEN=\"abc\"").await.unwrap();
        c.start(ALICE, &id).await.unwrap();

        let target = c.layout().resolve(&id);
        assert!(target.env_file.exists());
        assert!(target.log_file.exists());

        let outcome = c.delete(ALICE, &id).await.unwrap();
        assert!(outcome.was_running);
        assert_eq!(c.ownership.owner(&id).await, None);
        assert!(!c.is_running(&id).await);
        assert!(!target.entry_file().exists());
        assert!(!target.env_file.exists());
        assert!(!target.log_file.exists());

        // Deleting again is only allowed for the super-admin now, and is a no-op.
        assert!(matches!(
            c.delete(ALICE, &id).await,
            Err(LifecycleError::AccessDenied)
        ));
        let again = c.delete(ADMIN, &id).await.unwrap();
        assert_eq!(again.removed_files, 0);
    }

    #[tokio::test]
    async fn crash_is_reported_with_tail() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        let id = c
            .upload_script(ALICE, "bad.py", b"echo 'Traceback: boom' >&2\nexit 1\n")
            .await
            .unwrap();

        let outcome = c.start(ALICE, &id).await.unwrap();
        let StartOutcome::Crashed {
            exit_code,
            log_tail,
            ..
        } = &outcome
        else {
            panic!("expected crash, got {outcome:?}");
        };
        assert_eq!(*exit_code, Some(1));
        assert!(log_tail.contains("Traceback: boom"));
        assert!(outcome.user_message().starts_with("❌ Crashed"));

        let info = c.inspect(ALICE, &id).await.unwrap();
        assert_eq!(info.state, ProcessState::Crashed);
    }

    #[tokio::test]
    async fn upload_name_taken_by_another_user() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        c.upload_script(ALICE, "app.py", b"sleep 1\n").await.unwrap();

        let err = c.upload_script(BOB, "app.py", b"evil\n").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Taken(_)));
        let content = tokio::fs::read(c.layout().root().join("app.py")).await.unwrap();
        assert_eq!(content, b"sleep 1\n");

        // Same owner may overwrite; super-admin may claim.
        c.upload_script(ALICE, "app.py", b"sleep 2\n").await.unwrap();
        c.upload_script(ADMIN, "app.py", b"sleep 3\n").await.unwrap();
        assert_eq!(
            c.ownership.owner(&TargetId::file("app.py")).await,
            Some(ADMIN)
        );
    }

    #[tokio::test]
    async fn rejected_upload_leaves_owned_name_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        let id = c.upload_script(ALICE, "app.py", b"echo alice\n").await.unwrap();
        tokio::fs::remove_file(c.layout().root().join("app.py"))
            .await
            .unwrap();

        assert!(matches!(
            c.check_upload_claim(BOB, "app.py").await,
            Err(LifecycleError::Taken(_))
        ));
        let err = c.upload_script(BOB, "app.py", b"echo bob\n").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Taken(_)));

        assert!(!c.layout().root().join("app.py").exists());
        let mut rd = tokio::fs::read_dir(c.layout().root()).await.unwrap();
        assert!(rd.next_entry().await.unwrap().is_none(), "temp upload left behind");
        assert_eq!(c.ownership.owner(&id).await, Some(ALICE));
        assert!(matches!(
            c.start(ALICE, &id).await,
            Err(LifecycleError::TargetNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_uploads_keep_the_winner_content() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;

        for i in 0..20 {
            let name = format!("race{i}.py");
            let (a, b) = tokio::join!(
                c.upload_script(ALICE, &name, b"echo alice\n"),
                c.upload_script(BOB, &name, b"echo bob\n"),
            );
            assert!(a.is_ok() != b.is_ok(), "round {i}: a={a:?} b={b:?}");

            let (winner, expected): (UserId, &[u8]) = if a.is_ok() {
                (ALICE, b"echo alice\n")
            } else {
                (BOB, b"echo bob\n")
            };
            let id = TargetId::file(name.as_str());
            assert_eq!(c.ownership.owner(&id).await, Some(winner));
            let content = tokio::fs::read(c.layout().root().join(&name)).await.unwrap();
            assert_eq!(content, expected, "round {i}");
        }
    }

    #[tokio::test]
    async fn uploads_require_membership_and_valid_names() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;

        assert!(matches!(
            c.upload_script(99, "x.py", b"").await,
            Err(LifecycleError::AccessDenied)
        ));
        assert!(matches!(
            c.upload_script(ALICE, "a|b.py", b"").await,
            Err(LifecycleError::InvalidTarget(_))
        ));
        assert!(matches!(
            c.upload_script(ALICE, "notes.txt", b"").await,
            Err(LifecycleError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn names_that_would_break_the_status_url_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;

        for name in ["my app.py", "a&b.py", "x#1.py", "q?.py"] {
            assert!(
                matches!(
                    c.upload_script(ALICE, name, b"").await,
                    Err(LifecycleError::InvalidTarget(_))
                ),
                "{name}"
            );
        }
        assert!(!dir.path().join("scripts/my app.py").exists());

        let repo = c.layout().repo_dir("myrepo");
        tokio::fs::create_dir_all(&repo).await.unwrap();
        tokio::fs::write(repo.join("my bot.py"), "").await.unwrap();
        assert!(matches!(
            c.register_repo_entry(ALICE, "myrepo", "my bot.py").await,
            Err(LifecycleError::InvalidTarget(_))
        ));

        let id = c.upload_script(ALICE, "my-app_2.py", b"").await.unwrap();
        assert_eq!(
            c.status_url(&id),
            "http://host.test/status?script=my-app_2.py"
        );
    }

    #[tokio::test]
    async fn repo_entry_registration_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        let repo = c.layout().repo_dir("myrepo");
        tokio::fs::create_dir_all(&repo).await.unwrap();
        tokio::fs::write(repo.join("main.py"), "sleep 30\n").await.unwrap();

        let id = c
            .register_repo_entry(ALICE, "myrepo", "./main.py")
            .await
            .unwrap();
        assert_eq!(id.as_str(), "myrepo|main.py");

        assert!(matches!(
            c.register_repo_entry(BOB, "myrepo", "main.py").await,
            Err(LifecycleError::Taken(_))
        ));
        assert!(matches!(
            c.register_repo_entry(ALICE, "myrepo", "missing.py").await,
            Err(LifecycleError::TargetNotFound(_))
        ));

        c.upload_script(BOB, "other.py", b"sleep 1\n").await.unwrap();

        let alice = c.list(ALICE).await;
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].kind, TargetKind::Repo);
        assert_eq!(alice[0].state, ProcessState::Stopped);

        let admin = c.list(ADMIN).await;
        assert_eq!(admin.len(), 2);
    }

    #[tokio::test]
    async fn status_url_embeds_raw_target_id() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        assert_eq!(
            c.status_url(&TargetId::repo("myrepo", "main.py")),
            "http://host.test/status?script=myrepo|main.py"
        );
    }

    #[tokio::test]
    async fn user_management_is_super_admin_only() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;

        assert!(matches!(
            c.add_user(ALICE, 42).await,
            Err(LifecycleError::SuperAdminOnly)
        ));
        assert!(c.add_user(ADMIN, 42).await.unwrap());
        assert!(!c.add_user(ADMIN, 42).await.unwrap());
        assert!(c.is_member(42).await);
        assert_eq!(c.list_users(ADMIN).await.unwrap(), vec![ALICE, BOB, 42]);
        assert!(c.list_users(ALICE).await.is_err());
        assert!(c.remove_user(ADMIN, 42).await.unwrap());
        assert!(!c.is_member(42).await);
        assert!(c.stats(42).await.is_err());
        assert!(c.stats(ALICE).await.is_ok());
    }

    #[tokio::test]
    async fn logs_absent_before_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path()).await;
        let id = c.upload_script(ALICE, "app.py", b"echo hi\n").await.unwrap();

        assert_eq!(c.logs(ALICE, &id, 2000).await.unwrap(), None);
        c.start(ALICE, &id).await.unwrap();
        assert_eq!(c.logs(ALICE, &id, 2000).await.unwrap().as_deref(), Some("hi\n"));
    }
}
