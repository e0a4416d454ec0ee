use std::fs;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::sys::socket::{AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind, listen, socket};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};

use crate::config::MonitorConfig;
use crate::ipc::Connection;
use crate::launcher::{Launcher, WorkerSpec};
use crate::protocol::ControlMessage;
use crate::session::{IdleConnection, Session, WorkerHandle};
use crate::signals::{self, ShutdownCheck};
use crate::state_machine::{Action, Event, WorkerState, step};
use crate::stats::StatsSnapshot;

/// Signal asking a worker to finish its current cycle and send `done`.
const STOP_SIGNAL: Signal = Signal::SIGINT;
/// How often a lingering child is re-checked while reaping.
const REAP_POLL: Duration = Duration::from_millis(50);

/// Where reports and free-form worker lines end up.
pub trait ReportSink {
    fn surface(&mut self, interface: &str, snapshot: &StatsSnapshot);
    fn print(&mut self, line: &str);
}

/// Prints to stdout for the operator.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ReportSink for ConsoleSink {
    fn surface(&mut self, _interface: &str, snapshot: &StatsSnapshot) {
        println!("{snapshot}");
    }

    fn print(&mut self, line: &str) {
        println!("{line}");
    }
}

/// Listening control socket; the socket file is removed on drop.
#[derive(Debug)]
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    /// Bind and listen at `path`, replacing a stale socket file.
    pub fn bind(path: &Path, backlog: usize) -> Result<Self> {
        let listener = match listen_at(path, backlog) {
            Ok(listener) => listener,
            Err(Errno::EADDRINUSE) => {
                if UnixStream::connect(path).is_ok() {
                    anyhow::bail!(
                        "another supervisor is already listening on {}",
                        path.display()
                    );
                }
                warn!("Removing stale control socket {}", path.display());
                fs::remove_file(path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                listen_at(path, backlog)
                    .with_context(|| format!("Error while binding the socket {}", path.display()))?
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Error while binding the socket {}", path.display()));
            }
        };

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn accept(&self) -> io::Result<UnixStream> {
        self.listener.accept().map(|(stream, _)| stream)
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Failed to remove {}: {e}", self.path.display());
        }
    }
}

fn listen_at(path: &Path, backlog: usize) -> nix::Result<UnixListener> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(i32::try_from(backlog).unwrap_or(i32::MAX))?)?;
    Ok(UnixListener::from(fd))
}

/// What a readiness entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Listener,
    Worker(usize),
    Idle(usize),
}

/// Owns every worker handle and the listening socket.
pub struct Supervisor<S: ReportSink> {
    config: MonitorConfig,
    socket: ControlSocket,
    session: Session,
    sink: S,
}

impl<S: ReportSink> Supervisor<S> {
    pub fn new(config: MonitorConfig, socket: ControlSocket, sink: S) -> Self {
        Self {
            config,
            socket,
            session: Session::new(),
            sink,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Track an already spawned worker.
    pub fn register(&mut self, handle: WorkerHandle) -> usize {
        self.session.push(handle)
    }

    /// Spawn one worker per `WorkerSpec`, in order. Failed spawns are skipped.
    pub fn launch_all(&mut self, launcher: &Launcher, specs: &[WorkerSpec]) -> usize {
        for spec in specs.iter().take(self.config.queue_capacity) {
            match launcher.spawn(spec) {
                Ok(launched) => {
                    let slot = self.register(WorkerHandle::new(
                        launched.pid,
                        &spec.interface,
                        launched.token,
                    ));
                    info!(
                        "Worker {slot} for {} started (pid {})",
                        spec.interface, launched.pid
                    );
                }
                Err(e) => error!("{e}"),
            }
        }
        if specs.len() > self.config.queue_capacity {
            warn!(
                "Only the first {} of {} interfaces are monitored",
                self.config.queue_capacity,
                specs.len()
            );
        }
        self.session.len()
    }

    /// Connections the listener accepts before it leaves the poll set.
    fn expected_connections(&self) -> usize {
        self.session.len()
    }

    /// Main event loop. Runs until `shutdown` reports a stop, then tears
    /// every worker down.
    pub fn run(&mut self, shutdown: &impl ShutdownCheck) -> Result<()> {
        info!(
            "Supervisor ({}) waiting for {} interface monitor(s) on {}",
            std::process::id(),
            self.expected_connections(),
            self.socket.path().display()
        );

        while !shutdown.should_stop() {
            let listening = self.session.accepted() < self.expected_connections();
            let ready = match self.wait_readiness(self.config.readiness_timeout(), listening) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => Vec::new(),
                Err(e) => {
                    error!("Error while waiting for socket readiness: {e}");
                    Vec::new()
                }
            };
            if shutdown.should_stop() {
                break;
            }

            if ready.contains(&Source::Listener) {
                self.accept_one();
            } else {
                for source in ready {
                    self.service(source);
                }
                self.session.idle_mut().retain(|idle| !idle.state.is_done());
            }

            thread::sleep(self.config.idle_delay());
        }

        if let Some(sig) = signals::take_signal() {
            info!("Received {sig:?}, shutting down");
        }
        self.shutdown();
        Ok(())
    }

    /// Block until the listener or a connection is readable.
    fn wait_readiness(&self, timeout: Option<Duration>, listening: bool) -> nix::Result<Vec<Source>> {
        let mut sources = Vec::new();
        let mut fds = Vec::new();

        if listening {
            sources.push(Source::Listener);
            fds.push(PollFd::new(self.socket.listener.as_fd(), PollFlags::POLLIN));
        }
        for (slot, handle) in self.session.handles().iter().enumerate() {
            if let Some(conn) = &handle.connection {
                sources.push(Source::Worker(slot));
                fds.push(PollFd::new(conn.as_fd(), PollFlags::POLLIN));
            }
        }
        for (idx, idle) in self.session.idle().iter().enumerate() {
            sources.push(Source::Idle(idx));
            fds.push(PollFd::new(idle.connection.as_fd(), PollFlags::POLLIN));
        }

        poll(&mut fds, poll_timeout(timeout))?;

        let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        Ok(fds
            .iter()
            .zip(sources)
            .filter(|(fd, _)| fd.revents().is_some_and(|r| r.intersects(wake)))
            .map(|(_, source)| source)
            .collect())
    }

    /// Accept one connection and run its handshake inline.
    fn accept_one(&mut self) {
        let stream = match self.socket.accept() {
            Ok(stream) => stream,
            Err(e) => {
                error!("Error while accepting connection on the socket: {e}");
                return;
            }
        };
        self.session.note_accepted();
        let mut conn = Connection::new(stream, self.config.max_frame_len);
        debug!("Incoming connection {}", conn.as_raw_fd());

        let first = match conn.recv() {
            Ok(msg) => msg,
            Err(e) if e.is_disconnect() => {
                warn!("Connection closed before the handshake: {e}");
                return;
            }
            Err(e) => {
                error!("Error while receiving the handshake: {e}");
                self.park(conn);
                return;
            }
        };

        let slot = match &first {
            ControlMessage::Ready { token } => self.session.claim(token),
            _ => None,
        };
        let Some(slot) = slot else {
            match &first {
                ControlMessage::Ready { .. } => {
                    warn!("Connection presented an unknown launch token, leaving it idle")
                }
                other => self.sink.print(&other.display_text()),
            }
            self.park(conn);
            return;
        };

        if let Some(handle) = self.session.get_mut(slot) {
            info!(
                "Starting the monitor for the interface {} (pid {})",
                handle.interface, handle.pid
            );
            handle.attach(conn);
        }
        self.dispatch(slot, Event::Accepted);
        self.dispatch(slot, Event::Message(first));

        // monitor → monitoring completes before the loop resumes.
        if self.session.get(slot).is_some_and(|h| h.state == WorkerState::Handshaking) {
            self.receive_from(slot);
        }
    }

    fn park(&mut self, connection: Connection) {
        self.session.idle_mut().push(IdleConnection {
            connection,
            state: WorkerState::Connected,
        });
    }

    fn service(&mut self, source: Source) {
        match source {
            Source::Listener => {}
            Source::Worker(slot) => self.receive_from(slot),
            Source::Idle(idx) => self.receive_idle(idx),
        }
    }

    /// Read one message from a worker and act on it.
    fn receive_from(&mut self, slot: usize) {
        let Some(handle) = self.session.get_mut(slot) else {
            return;
        };
        let interface = handle.interface.clone();
        let Some(conn) = handle.connection.as_mut() else {
            return;
        };

        match conn.recv() {
            Ok(msg) => self.dispatch(slot, Event::Message(msg)),
            Err(e) if e.is_disconnect() => {
                warn!("{interface}: connection lost ({e})");
                self.dispatch(slot, Event::Disconnected);
            }
            Err(e) => error!("{interface}: error while receiving: {e}"),
        }
    }

    fn receive_idle(&mut self, idx: usize) {
        let Some(idle) = self.session.idle_mut().get_mut(idx) else {
            return;
        };
        let event = match idle.connection.recv() {
            Ok(ControlMessage::Ready { .. }) => {
                warn!("Ignoring ready from an idle connection");
                return;
            }
            Ok(msg) => Event::Message(msg),
            Err(e) if e.is_disconnect() => Event::Disconnected,
            Err(e) => {
                error!("Error while receiving from an idle connection: {e}");
                return;
            }
        };

        let (next, action) = step(idle.state, event);
        idle.state = next;
        if let Action::Print(text) = action {
            self.sink.print(&text);
        }
    }

    /// Feed `event` to the worker's state machine and carry out the action.
    fn dispatch(&mut self, slot: usize, event: Event) {
        let Some(handle) = self.session.get_mut(slot) else {
            return;
        };
        let (next, action) = step(handle.state, event);
        debug!("{}: {:?} -> {:?}", handle.interface, handle.state, next);
        handle.state = next;

        match action {
            Action::None => {}
            Action::Surface(snapshot) => self.sink.surface(&handle.interface, &snapshot),
            Action::Print(text) => self.sink.print(&text),
            Action::Close => {
                let uptime = handle.uptime();
                handle.release();
                match uptime {
                    Some(up) => info!(
                        "{}: monitor finished after {}s (pid {})",
                        handle.interface,
                        up.num_seconds(),
                        handle.pid
                    ),
                    None => info!("{}: monitor finished (pid {})", handle.interface, handle.pid),
                }
            }
            Action::Reply(msg) => {
                let interface = handle.interface.clone();
                let Some(conn) = handle.connection.as_mut() else {
                    return;
                };
                match conn.send(&msg) {
                    Ok(()) => self.dispatch(slot, Event::ReplySent),
                    Err(e) if e.is_disconnect() => {
                        warn!("{interface}: connection lost while sending {}", msg.keyword());
                        self.dispatch(slot, Event::Disconnected);
                    }
                    Err(e) => {
                        error!("{interface}: error while sending {}: {e}", msg.keyword());
                        self.dispatch(slot, Event::ReplySent);
                    }
                }
            }
        }
    }

    /// Stop every worker, drain late messages for the grace period, then
    /// close whatever is left and reap the processes.
    pub fn shutdown(&mut self) {
        info!("Stopping {} interface monitor(s)", self.session.len());
        for handle in self.session.handles() {
            if handle.reaped {
                continue;
            }
            match kill(handle.pid, STOP_SIGNAL) {
                Ok(()) => debug!("Sent {STOP_SIGNAL:?} to {} (pid {})", handle.interface, handle.pid),
                Err(Errno::ESRCH) => debug!("{} (pid {}) already gone", handle.interface, handle.pid),
                Err(e) => warn!("Failed to signal {} (pid {}): {e}", handle.interface, handle.pid),
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace();
        while self.session.handles().iter().any(WorkerHandle::is_connected) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.wait_readiness(Some(remaining), false) {
                Ok(ready) => {
                    for source in ready {
                        self.service(source);
                    }
                    self.session.idle_mut().retain(|idle| !idle.state.is_done());
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Error while draining worker sockets: {e}");
                    break;
                }
            }
        }

        for slot in 0..self.session.len() {
            if self.session.get(slot).is_some_and(WorkerHandle::is_connected) {
                self.dispatch(slot, Event::Terminated);
            }
        }
        self.session.idle_mut().clear();

        self.reap_all(deadline + self.config.shutdown_grace());
    }

    /// Wait for every child until `deadline`, killing stragglers after it.
    fn reap_all(&mut self, deadline: Instant) {
        for handle in self.session.handles_mut() {
            if handle.reaped {
                continue;
            }
            let status = loop {
                match waitpid(handle.pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) if Instant::now() < deadline => {
                        thread::sleep(REAP_POLL)
                    }
                    Ok(WaitStatus::StillAlive) => {
                        warn!(
                            "{} (pid {}) did not stop in time, killing it",
                            handle.interface, handle.pid
                        );
                        kill(handle.pid, Signal::SIGKILL).ok();
                        break waitpid(handle.pid, None);
                    }
                    other => break other,
                }
            };

            match status {
                Ok(status) => info!("{} (pid {}) {}", handle.interface, handle.pid, describe(status)),
                Err(Errno::ECHILD) => debug!("{} (pid {}) is not our child", handle.interface, handle.pid),
                Err(e) => warn!("Failed to reap {} (pid {}): {e}", handle.interface, handle.pid),
            }
            handle.reaped = true;
        }
    }
}

fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(t) => i32::try_from(t.as_millis())
            .ok()
            .and_then(|ms| PollTimeout::try_from(ms).ok())
            .unwrap_or(PollTimeout::MAX),
    }
}

fn describe(status: WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exited with code {code}"),
        WaitStatus::Signaled(_, sig, _) => format!("killed by signal {sig:?}"),
        other => format!("finished ({other:?})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LaunchToken;
    use std::process::Command;

    #[derive(Default)]
    struct Collect {
        reports: Vec<(String, StatsSnapshot)>,
        lines: Vec<String>,
    }

    impl ReportSink for Collect {
        fn surface(&mut self, interface: &str, snapshot: &StatsSnapshot) {
            self.reports.push((interface.to_string(), snapshot.clone()));
        }

        fn print(&mut self, line: &str) {
            self.lines.push(line.to_string());
        }
    }

    fn config(dir: &Path) -> MonitorConfig {
        MonitorConfig {
            socket_path: dir.join("ctl.sock"),
            idle_delay_ms: 0,
            shutdown_grace_ms: 200,
            readiness_timeout_ms: Some(50),
            ..Default::default()
        }
    }

    fn supervisor(dir: &Path) -> Supervisor<Collect> {
        let cfg = config(dir);
        let socket = ControlSocket::bind(&cfg.socket_path, cfg.queue_capacity).unwrap();
        Supervisor::new(cfg, socket, Collect::default())
    }

    fn sleeper_handle(interface: &str) -> WorkerHandle {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        WorkerHandle::new(pid, interface, LaunchToken::generate())
    }

    fn pump_until(sup: &mut Supervisor<Collect>, done: impl Fn(&Session) -> bool) {
        for _ in 0..100 {
            if done(sup.session()) {
                return;
            }
            for source in sup.wait_readiness(Some(Duration::from_millis(50)), false).unwrap() {
                sup.service(source);
            }
            sup.session.idle_mut().retain(|idle| !idle.state.is_done());
        }
        panic!("supervisor never reached the expected state");
    }

    #[test]
    fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let socket = ControlSocket::bind(&path, 4).unwrap();
        assert!(UnixStream::connect(socket.path()).is_ok());
        drop(socket);
        assert!(!path.exists());
    }

    #[test]
    fn test_live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let _live = ControlSocket::bind(&path, 4).unwrap();

        let err = ControlSocket::bind(&path, 4).unwrap_err();
        assert!(err.to_string().contains("already listening"));
    }

    #[test]
    fn test_handshake_report_and_link_down_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        let slot = sup.register(sleeper_handle("eth0"));
        let token = sup.session().get(slot).unwrap().token.to_string();
        let path = sup.socket.path().to_path_buf();

        let worker = thread::spawn(move || {
            let mut conn = Connection::connect(&path, 1024).unwrap();
            let reply = conn.request(&ControlMessage::ready(token)).unwrap();
            assert_eq!(reply, ControlMessage::Monitor);
            conn.send(&ControlMessage::Monitoring).unwrap();
            let reply = conn.request(&ControlMessage::LinkDown).unwrap();
            assert_eq!(reply, ControlMessage::LinkUp);
            let snapshot = StatsSnapshot {
                interface: "eth0".into(),
                operstate: "up".into(),
                rx_bytes: 42,
                ..Default::default()
            };
            conn.send(&ControlMessage::report(snapshot)).unwrap();
            conn.send(&ControlMessage::Done).unwrap();
        });

        sup.accept_one();
        assert_eq!(sup.session().get(slot).unwrap().state, WorkerState::Monitoring);
        assert_eq!(sup.session().active_count(), 1);

        pump_until(&mut sup, |s| !s.get(0).unwrap().is_connected());
        worker.join().unwrap();

        let handle = sup.session().get(slot).unwrap();
        assert_eq!(handle.state, WorkerState::Done);
        assert!(!handle.active);
        assert_eq!(sup.sink().reports.len(), 1);
        assert_eq!(sup.sink().reports[0].0, "eth0");
        assert_eq!(sup.sink().reports[0].1.rx_bytes, 42);

        sup.shutdown();
        assert!(sup.session().get(slot).unwrap().reaped);
    }

    #[test]
    fn test_unknown_token_is_left_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        let slot = sup.register(sleeper_handle("eth0"));
        let path = sup.socket.path().to_path_buf();

        let mut stranger = Connection::connect(&path, 1024).unwrap();
        stranger
            .send(&ControlMessage::ready(LaunchToken::generate().to_string()))
            .unwrap();
        sup.accept_one();

        assert_eq!(sup.session().accepted(), 1);
        assert_eq!(sup.session().idle().len(), 1);
        assert!(!sup.session().get(slot).unwrap().is_connected());

        // Raw frame carrying something that is not a control message.
        let mut raw = stranger.stream().try_clone().unwrap();
        io::Write::write_all(&mut raw, &[0, 0, 0, 5]).unwrap();
        io::Write::write_all(&mut raw, b"hello").unwrap();
        drop(raw);
        drop(stranger);
        pump_until(&mut sup, |s| s.idle().is_empty());
        assert_eq!(sup.sink().lines, vec!["hello".to_string()]);

        sup.shutdown();
    }

    #[test]
    fn test_shutdown_closes_connected_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        let slot = sup.register(sleeper_handle("eth1"));
        let token = sup.session().get(slot).unwrap().token.to_string();
        let path = sup.socket.path().to_path_buf();

        let mut conn = Connection::connect(&path, 1024).unwrap();
        conn.send(&ControlMessage::ready(token)).unwrap();
        conn.send(&ControlMessage::Monitoring).unwrap();
        sup.accept_one();
        assert_eq!(conn.recv().unwrap(), ControlMessage::Monitor);

        sup.shutdown();
        let handle = sup.session().get(slot).unwrap();
        assert_eq!(handle.state, WorkerState::Done);
        assert!(!handle.active);
        assert!(handle.reaped);
        assert!(matches!(conn.recv(), Err(crate::ipc::IpcError::Closed)));
    }
}
