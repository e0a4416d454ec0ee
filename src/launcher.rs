//! Worker process spawning.
//!
//! Uses `std::process::Command` (fork + exec). Every descriptor the
//! supervisor holds is close-on-exec, so the child starts with only its
//! standard streams. The interface is the only argument; everything else
//! the worker needs travels in its environment.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::unistd::Pid;
use thiserror::Error;

use crate::auth::{LaunchToken, TOKEN_ENV};
use crate::config::MonitorConfig;
use crate::ipc::DEFAULT_MAX_FRAME_LEN;
use crate::stats::SYSFS_NET_ROOT;

/// Environment variable carrying the control socket path.
pub const SOCKET_ENV: &str = "NETMOND_SOCKET";
/// Seconds between worker polling cycles.
pub const INTERVAL_ENV: &str = "NETMOND_INTERVAL_SECS";
/// Root of the statistics tree the worker reads.
pub const SYSFS_ROOT_ENV: &str = "NETMOND_SYSFS_ROOT";
/// Frame limit the worker applies to its connection.
pub const MAX_FRAME_ENV: &str = "NETMOND_MAX_FRAME_LEN";

/// One interface to monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub interface: String,
}

impl WorkerSpec {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {program} for {interface}: {source}")]
    Spawn {
        program: PathBuf,
        interface: String,
        source: std::io::Error,
    },
    #[error("spawned process id {0} does not fit a pid_t")]
    Pid(u32),
}

/// A worker that has been started but has not connected yet.
#[derive(Debug)]
pub struct Launched {
    pub pid: Pid,
    pub token: LaunchToken,
}

#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    socket_path: PathBuf,
    interval_secs: u64,
    sysfs_root: PathBuf,
    max_frame_len: usize,
}

impl Launcher {
    /// Launcher with default worker settings.
    pub fn new(program: impl Into<PathBuf>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            socket_path: socket_path.into(),
            interval_secs: 1,
            sysfs_root: SYSFS_NET_ROOT.into(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Launcher handing the configured socket, interval, sysfs root and
    /// frame limit down to every worker.
    pub fn from_config(program: impl Into<PathBuf>, cfg: &MonitorConfig) -> Self {
        Self {
            program: program.into(),
            socket_path: cfg.socket_path.clone(),
            interval_secs: cfg.poll_interval().as_secs(),
            sysfs_root: cfg.sysfs_root.clone(),
            max_frame_len: cfg.max_frame_len,
        }
    }

    /// Start `<program> <interface>` with a fresh launch token.
    pub fn spawn(&self, spec: &WorkerSpec) -> Result<Launched, LaunchError> {
        let token = LaunchToken::generate();

        let child = Command::new(&self.program)
            .arg(&spec.interface)
            .env(TOKEN_ENV, token.to_string())
            .env(SOCKET_ENV, &self.socket_path)
            .env(INTERVAL_ENV, self.interval_secs.to_string())
            .env(SYSFS_ROOT_ENV, &self.sysfs_root)
            .env(MAX_FRAME_ENV, self.max_frame_len.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.clone(),
                interface: spec.interface.clone(),
                source,
            })?;

        let raw = child.id();
        let pid = i32::try_from(raw).map_err(|_| LaunchError::Pid(raw))?;
        log::debug!("spawned {} for {} (pid {pid})", self.program.display(), spec.interface);

        // The child is reaped through its pid during shutdown.
        drop(child);
        Ok(Launched {
            pid: Pid::from_raw(pid),
            token,
        })
    }
}
