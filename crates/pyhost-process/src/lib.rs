mod target;

pub use target::{
    REPO_SEPARATOR, Target, TargetId, TargetIdError, TargetKind, UploadLayout,
    normalize_entry_path, validate_file_name, validate_repo_name,
};

/// Chat-platform user id. The super-admin is configured separately.
pub type UserId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Running,
    /// Exited on its own. Terminal until the target is started again.
    Crashed,
}

impl ProcessState {
    pub fn is_running(self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub target_id: TargetId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ProcessStatus {
    pub fn stopped(target_id: TargetId) -> Self {
        Self {
            target_id,
            state: ProcessState::Stopped,
            pid: None,
            exit_code: None,
            started_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_status_has_no_pid() {
        let st = ProcessStatus::stopped(TargetId::file("app.py"));
        assert_eq!(st.state, ProcessState::Stopped);
        assert!(st.pid.is_none());
        assert!(!st.state.is_running());
    }

    #[test]
    fn state_serializes_lowercase() {
        let s = serde_json::to_string(&ProcessState::Crashed).unwrap();
        assert_eq!(s, "\"crashed\"");
    }
}
