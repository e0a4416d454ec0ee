//! Supervisor-side bookkeeping for launched workers.

use chrono::{DateTime, TimeDelta, Utc};
use nix::unistd::Pid;

use crate::auth::LaunchToken;
use crate::ipc::Connection;
use crate::state_machine::WorkerState;

/// Everything the supervisor knows about one worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub pid: Pid,
    pub interface: String,
    pub token: LaunchToken,
    pub connection: Option<Connection>,
    pub state: WorkerState,
    pub connected_at: Option<DateTime<Utc>>,
    /// Cleared when the connection is released.
    pub active: bool,
    /// Set once the process has been waited for.
    pub reaped: bool,
}

impl WorkerHandle {
    pub fn new(pid: Pid, interface: impl Into<String>, token: LaunchToken) -> Self {
        Self {
            pid,
            interface: interface.into(),
            token,
            connection: None,
            state: WorkerState::Spawned,
            connected_at: None,
            active: false,
            reaped: false,
        }
    }

    /// Attach the accepted connection.
    pub fn attach(&mut self, connection: Connection) {
        self.connection = Some(connection);
        self.connected_at = Some(Utc::now());
        self.active = true;
    }

    /// Time since the connection was attached.
    pub fn uptime(&self) -> Option<TimeDelta> {
        self.connected_at.map(|at| Utc::now() - at)
    }

    /// Drop the connection (closing it) and mark the handle inactive.
    pub fn release(&mut self) {
        self.connection = None;
        self.active = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Accepted connection that never completed a valid `ready`.
#[derive(Debug)]
pub struct IdleConnection {
    pub connection: Connection,
    pub state: WorkerState,
}

/// Ordered set of handles; the index given at spawn never changes.
#[derive(Debug, Default)]
pub struct Session {
    handles: Vec<WorkerHandle>,
    idle: Vec<IdleConnection>,
    accepted: usize,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spawned worker, returning its slot.
    pub fn push(&mut self, handle: WorkerHandle) -> usize {
        self.handles.push(handle);
        self.handles.len() - 1
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn get(&self, slot: usize) -> Option<&WorkerHandle> {
        self.handles.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut WorkerHandle> {
        self.handles.get_mut(slot)
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut [WorkerHandle] {
        &mut self.handles
    }

    pub fn idle(&self) -> &[IdleConnection] {
        &self.idle
    }

    pub fn idle_mut(&mut self) -> &mut Vec<IdleConnection> {
        &mut self.idle
    }

    /// Connections accepted so far, claimed or idle.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn note_accepted(&mut self) {
        self.accepted += 1;
    }

    /// Slot of the not-yet-connected worker launched with `token`.
    pub fn claim(&self, token: &str) -> Option<usize> {
        self.handles
            .iter()
            .position(|h| !h.is_connected() && !h.state.is_done() && h.token.matches(token))
    }

    pub fn active_count(&self) -> usize {
        self.handles.iter().filter(|h| h.active).count()
    }
}
