use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use pyhost_process::{ProcessState, ProcessStatus, Target, TargetId, TargetKind};
use tokio::{
    process::{Child, Command},
    sync::{Mutex, watch},
};

use crate::{env_file, logs};

/// How long to wait for the exit to be observed after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Launch settings shared by every target.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub grace_period: Duration,
    pub stop_timeout: Duration,
}

impl From<&crate::config::AgentConfig> for SupervisorConfig {
    fn from(c: &crate::config::AgentConfig) -> Self {
        Self {
            interpreter: c.interpreter.clone(),
            interpreter_args: c.interpreter_args.clone(),
            grace_period: c.grace_period,
            stop_timeout: c.stop_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{0} is already running")]
    AlreadyRunning(TargetId),
    #[error("target file not found: {}", .0.display())]
    TargetNotFound(PathBuf),
    #[error("failed to open log file {}: {source}", .path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch {target_id}: {source}")]
    LaunchFailure {
        target_id: TargetId,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartReport {
    /// Still alive once the grace period elapsed.
    Running { pid: u32 },
    /// Exited inside the grace period.
    Crashed {
        pid: u32,
        exit: Option<ExitInfo>,
        log_tail: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReport {
    NotRunning,
    Stopped {
        exit: Option<ExitInfo>,
        /// SIGTERM was ignored until the deadline and the group was killed.
        forced: bool,
    },
}

#[derive(Debug, Clone)]
pub struct DeleteReport {
    pub stop: StopReport,
    pub removed: Vec<PathBuf>,
}

#[derive(Debug)]
struct ProcessEntry {
    pid: u32,
    pgid: i32,
    log_file: PathBuf,
    started_at: DateTime<Utc>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessEntry {
    fn exited(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    fn status(&self, target_id: &TargetId) -> ProcessStatus {
        let exit = self.exited();
        ProcessStatus {
            target_id: target_id.clone(),
            state: if exit.is_some() {
                ProcessState::Crashed
            } else {
                ProcessState::Running
            },
            pid: Some(self.pid),
            exit_code: exit.and_then(|e| e.code),
            started_at: Some(self.started_at),
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Children must not outlive the agent: the process table is not persisted.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: libc::c_int) {
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(%err, pgid, signal, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: i32) {}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Opens (without truncating) the log file; the caller truncates once the start is committed.
async fn open_log_file(path: &Path) -> Result<(std::fs::File, std::fs::File), SupervisorError> {
    let wrap = |source| SupervisorError::LogFile {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(wrap)?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(wrap)?
        .into_std()
        .await;
    let dup = file.try_clone().map_err(wrap)?;
    Ok((file, dup))
}

async fn reap(mut child: Child, tx: watch::Sender<Option<ExitInfo>>, target_id: TargetId) {
    let info = match child.wait().await {
        Ok(status) => ExitInfo::from_status(status),
        Err(err) => {
            tracing::warn!(%err, target_id = %target_id, "wait failed");
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };
    tracing::info!(
        target_id = %target_id,
        exit_code = ?info.code,
        signal = ?info.signal,
        "process exited"
    );
    let _ = tx.send(Some(info));
}

async fn remove_path(path: &Path, removed: &mut Vec<PathBuf>) {
    let res = match tokio::fs::symlink_metadata(path).await {
        Ok(m) if m.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match res {
        Ok(()) => removed.push(path.to_path_buf()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(%err, path = %path.display(), "failed to remove target file"),
    }
}

/// Owns the table of live processes, one per target id.
#[derive(Debug, Clone)]
pub struct ProcessManager {
    cfg: Arc<SupervisorConfig>,
    inner: Arc<Mutex<HashMap<TargetId, ProcessEntry>>>,
}

impl ProcessManager {
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Launches the target and reports whether it survived the grace period.
    ///
    /// The liveness check, the spawn and the table insert happen under one lock, so a
    /// second start of the same id is rejected even while the first is in its grace wait.
    /// Env resolution and the log open happen before the lock is taken.
    pub async fn start(&self, target: &Target) -> Result<StartReport, SupervisorError> {
        if !target.work_dir.is_dir() {
            return Err(SupervisorError::TargetNotFound(target.work_dir.clone()));
        }
        let entry_file = target.entry_file();
        if !entry_file.is_file() {
            return Err(SupervisorError::TargetNotFound(entry_file));
        }

        let env = env_file::resolve_env(Some(&target.env_file)).await;
        let (stdout, stderr) = open_log_file(&target.log_file).await?;

        let (pid, mut exit_rx) = {
            let mut table = self.inner.lock().await;
            if let Some(e) = table.get(&target.id) {
                if e.exited().is_none() {
                    return Err(SupervisorError::AlreadyRunning(target.id.clone()));
                }
                table.remove(&target.id);
            }

            stdout.set_len(0).map_err(|source| SupervisorError::LogFile {
                path: target.log_file.clone(),
                source,
            })?;

            let mut cmd = Command::new(&self.cfg.interpreter);
            cmd.args(&self.cfg.interpreter_args)
                .arg(&target.entry_path)
                .current_dir(&target.work_dir)
                .env_clear()
                .envs(&env)
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout))
                .stderr(Stdio::from(stderr));

            #[cfg(unix)]
            {
                unsafe {
                    cmd.pre_exec(|| {
                        // New session: pgid == pid, so the whole tree can be signalled.
                        set_parent_death_signal()?;
                        if libc::setsid() == -1 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }

            let launch_failure = |source| SupervisorError::LaunchFailure {
                target_id: target.id.clone(),
                source,
            };
            let child = cmd.spawn().map_err(launch_failure)?;
            let pid = child
                .id()
                .ok_or_else(|| launch_failure(std::io::Error::other("child has no pid")))?;

            let (tx, rx) = watch::channel(None);
            tokio::spawn(reap(child, tx, target.id.clone()));

            table.insert(
                target.id.clone(),
                ProcessEntry {
                    pid,
                    pgid: pid as i32,
                    log_file: target.log_file.clone(),
                    started_at: Utc::now(),
                    exit: rx.clone(),
                },
            );
            (pid, rx)
        };

        tracing::info!(
            target_id = %target.id,
            pid,
            interpreter = %self.cfg.interpreter,
            cwd = %target.work_dir.display(),
            "process started"
        );

        // Lock is released: other targets are served during the grace wait.
        let exited = match tokio::time::timeout(
            self.cfg.grace_period,
            exit_rx.wait_for(|e| e.is_some()),
        )
        .await
        {
            Ok(Ok(info)) => Some(*info),
            Ok(Err(_)) => Some(None),
            Err(_) => None,
        };

        let Some(exit) = exited else {
            return Ok(StartReport::Running { pid });
        };

        let log_tail = match logs::tail_bytes(&target.log_file, logs::CRASH_TAIL_BYTES).await {
            Ok(Some(buf)) => logs::tail_text(&buf),
            Ok(None) => String::new(),
            Err(err) => format!("<failed to read log: {err}>"),
        };
        tracing::warn!(target_id = %target.id, pid, exit = ?exit, "process crashed during grace period");
        Ok(StartReport::Crashed {
            pid,
            exit,
            log_tail,
        })
    }

    /// SIGTERM to the process group, then SIGKILL once `stop_timeout` passes.
    /// Stopping a target that is not running is a no-op.
    pub async fn stop(&self, target_id: &TargetId) -> StopReport {
        let (pid, pgid, log_file, mut exit_rx) = {
            let mut table = self.inner.lock().await;
            let Some(e) = table.get(target_id) else {
                return StopReport::NotRunning;
            };
            if e.exited().is_some() {
                table.remove(target_id);
                return StopReport::NotRunning;
            }
            (e.pid, e.pgid, e.log_file.clone(), e.exit.clone())
        };

        tracing::info!(
            target_id = %target_id,
            pid,
            log_file = %log_file.display(),
            "stop requested"
        );
        signal_group(pgid, SIGTERM);

        let mut forced = false;
        let graceful = tokio::time::timeout(
            self.cfg.stop_timeout,
            exit_rx.wait_for(|e| e.is_some()),
        )
        .await
        .map(|res| res.ok().and_then(|info| *info));
        let exit = match graceful {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(
                    target_id = %target_id,
                    pid,
                    timeout_ms = self.cfg.stop_timeout.as_millis() as u64,
                    "SIGTERM ignored; killing process group"
                );
                signal_group(pgid, SIGKILL);
                forced = true;
                match tokio::time::timeout(KILL_WAIT, exit_rx.wait_for(|e| e.is_some())).await {
                    Ok(res) => res.ok().and_then(|info| *info),
                    Err(_) => None,
                }
            }
        };

        {
            let mut table = self.inner.lock().await;
            if table.get(target_id).is_some_and(|e| e.pid == pid) {
                table.remove(target_id);
            }
        }

        tracing::info!(target_id = %target_id, pid, forced, "process stopped");
        StopReport::Stopped { exit, forced }
    }

    /// Reaps a stale entry as a side effect.
    pub async fn is_running(&self, target_id: &TargetId) -> bool {
        let mut table = self.inner.lock().await;
        match table.get(target_id) {
            Some(e) if e.exited().is_none() => true,
            Some(_) => {
                table.remove(target_id);
                false
            }
            None => false,
        }
    }

    /// Status without reaping, so a crash stays visible until the next start or stop.
    pub async fn status(&self, target_id: &TargetId) -> ProcessStatus {
        let table = self.inner.lock().await;
        table
            .get(target_id)
            .map(|e| e.status(target_id))
            .unwrap_or_else(|| ProcessStatus::stopped(target_id.clone()))
    }

    pub async fn active_count(&self) -> usize {
        let table = self.inner.lock().await;
        table.values().filter(|e| e.exited().is_none()).count()
    }

    /// Best-effort tail of the target's log; `None` when there is no log file.
    pub async fn tail_log(&self, target: &Target, max_bytes: u64) -> Option<String> {
        match logs::tail_bytes(&target.log_file, max_bytes).await {
            Ok(buf) => buf.map(|b| logs::tail_text(&b)),
            Err(err) => {
                tracing::warn!(%err, target_id = %target.id, "failed to read log");
                None
            }
        }
    }

    /// Stops the target, then removes its script (or whole repository) and sibling files.
    /// Individual missing files are ignored.
    pub async fn delete_artifacts(&self, target: &Target) -> DeleteReport {
        let stop = self.stop(&target.id).await;
        let mut removed = Vec::new();

        match target.kind {
            TargetKind::Repo => {
                // Only ever remove a direct child of the upload root.
                let safe = target
                    .id
                    .repo_parts()
                    .is_some_and(|(repo, _)| pyhost_process::validate_repo_name(repo).is_ok());
                if safe {
                    remove_path(&target.work_dir, &mut removed).await;
                } else {
                    tracing::warn!(target_id = %target.id, "refusing to remove repository with unsafe name");
                }
            }
            TargetKind::File => {
                if pyhost_process::validate_file_name(target.id.as_str()).is_ok() {
                    remove_path(&target.entry_file(), &mut removed).await;
                }
            }
        }

        for p in [&target.env_file, &target.requirements_file, &target.log_file] {
            remove_path(p, &mut removed).await;
        }

        tracing::info!(target_id = %target.id, removed = removed.len(), "target files deleted");
        DeleteReport { stop, removed }
    }

    /// Stops every managed process. Used on shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<TargetId> = self.inner.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}
