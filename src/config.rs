use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ipc::DEFAULT_MAX_FRAME_LEN;
use crate::stats::SYSFS_NET_ROOT;

/// Well-known control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/networkMonitor";
/// Maximum number of workers (and listen backlog).
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
/// Worker executable looked up next to the supervisor binary.
pub const WORKER_BINARY: &str = "ifmond";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Supervisor and worker settings. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub socket_path: PathBuf,
    /// Worker executable; `ifmond` beside the current executable when unset.
    pub worker_path: Option<PathBuf>,
    pub queue_capacity: usize,
    pub poll_interval_secs: u64,
    /// Pause after every supervisor wakeup.
    pub idle_delay_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Upper bound on one readiness wait; unset blocks until I/O or a signal.
    pub readiness_timeout_ms: Option<u64>,
    pub max_frame_len: usize,
    pub sysfs_root: PathBuf,
    pub require_root: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.into(),
            worker_path: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval_secs: 1,
            idle_delay_ms: 1000,
            shutdown_grace_ms: 1000,
            readiness_timeout_ms: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            sysfs_root: SYSFS_NET_ROOT.into(),
            require_root: true,
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Per-user config file, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("netmond").join("netmond.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::Invalid("max_frame_len must be at least 1".into()));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket_path is empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout_ms.map(Duration::from_millis)
    }

    /// Resolve the worker executable path.
    pub fn worker_executable(&self) -> std::io::Result<PathBuf> {
        if let Some(path) = &self.worker_path {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe()?;
        Ok(exe.with_file_name(WORKER_BINARY))
    }
}
