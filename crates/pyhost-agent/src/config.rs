use std::{path::PathBuf, time::Duration};

use pyhost_process::UserId;

const DEFAULT_GRACE_MS: u64 = 3000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PORT: u16 = 8080;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub upload_dir: PathBuf,
    pub state_dir: PathBuf,
    pub super_admin: UserId,
    pub base_url: String,
    pub port: u16,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub grace_period: Duration,
    pub stop_timeout: Duration,
    pub api_token: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("scripts"),
            state_dir: PathBuf::from("."),
            super_admin: 0,
            base_url: "http://localhost:8080".to_string(),
            port: DEFAULT_PORT,
            interpreter: "python".to_string(),
            interpreter_args: vec!["-u".to_string()],
            grace_period: Duration::from_millis(DEFAULT_GRACE_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            api_token: None,
            log_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let d = Self::default();

        let base_url = env_string("PYHOST_BASE_URL")
            .or_else(|| env_string("RENDER_EXTERNAL_URL"))
            .unwrap_or(d.base_url);

        let interpreter_args = match std::env::var("PYHOST_INTERPRETER_ARGS") {
            Ok(raw) => raw.split_whitespace().map(str::to_string).collect(),
            Err(_) => d.interpreter_args,
        };

        Self {
            upload_dir: env_string("PYHOST_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.upload_dir),
            state_dir: env_string("PYHOST_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.state_dir),
            super_admin: env_string("ADMIN_ID")
                .and_then(|v| v.parse::<UserId>().ok())
                .unwrap_or(d.super_admin),
            base_url: base_url.trim_end_matches('/').to_string(),
            port: env_string("PORT")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(d.port),
            interpreter: env_string("PYHOST_INTERPRETER").unwrap_or(d.interpreter),
            interpreter_args,
            grace_period: Duration::from_millis(
                env_u64("PYHOST_GRACE_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(DEFAULT_GRACE_MS),
            ),
            stop_timeout: Duration::from_millis(
                env_u64("PYHOST_STOP_TIMEOUT_MS")
                    .map(|v| v.clamp(500, 300_000))
                    .unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
            ),
            api_token: env_string("PYHOST_API_TOKEN"),
            log_dir: env_string("PYHOST_AGENT_LOG_DIR").map(PathBuf::from),
        }
    }

    pub fn ownership_path(&self) -> PathBuf {
        self.state_dir.join("ownership.json")
    }

    pub fn allowed_users_path(&self) -> PathBuf {
        self.state_dir.join("allowed_users.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = AgentConfig::default();
        assert_eq!(c.grace_period, Duration::from_secs(3));
        assert_eq!(c.interpreter, "python");
        assert_eq!(c.interpreter_args, vec!["-u".to_string()]);
        assert_eq!(c.ownership_path(), PathBuf::from("./ownership.json"));
    }
}
