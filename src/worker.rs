//! Per-interface monitoring loop run by `ifmond`.
//!
//! The worker announces itself with `ready`, waits for `monitor`, then polls
//! its interface once per interval until asked to stop. Every collaborator is
//! a trait object so the loop can be driven over a socket pair in tests.

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::auth::LaunchToken;
use crate::ipc::{Connection, IpcError};
use crate::link::LinkController;
use crate::protocol::ControlMessage;
use crate::signals::ShutdownCheck;
use crate::stats::StatsSource;

/// Pause between polling cycles.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps on the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSleeper;

impl Sleeper for RealSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Everything one monitoring run needs besides the connection.
pub struct WorkerContext<'a> {
    pub interface: &'a str,
    pub token: &'a LaunchToken,
    pub stats: &'a dyn StatsSource,
    pub link: &'a dyn LinkController,
    pub sleeper: &'a dyn Sleeper,
    pub interval: Duration,
}

/// How a monitoring run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Left the loop and sent `done`.
    Finished { cycles: u64 },
    /// The supervisor closed the connection first.
    SupervisorGone { cycles: u64 },
}

impl Outcome {
    pub fn cycles(self) -> u64 {
        match self {
            Self::Finished { cycles } | Self::SupervisorGone { cycles } => cycles,
        }
    }
}

/// Handshake, poll until `shutdown` fires, then say `done`.
pub fn run_monitor(
    conn: &mut Connection,
    ctx: &WorkerContext<'_>,
    shutdown: &impl ShutdownCheck,
) -> Result<Outcome, IpcError> {
    let mut cycles = 0;
    let gone = |e: IpcError, cycles: u64| -> Result<Outcome, IpcError> {
        if e.is_disconnect() {
            info!("{}: supervisor closed the connection", ctx.interface);
            Ok(Outcome::SupervisorGone { cycles })
        } else {
            Err(e)
        }
    };

    let reply = match conn.request(&ControlMessage::ready(ctx.token.to_string())) {
        Ok(reply) => reply,
        Err(e) => return gone(e, cycles),
    };

    if reply == ControlMessage::Monitor {
        if let Err(e) = conn.send(&ControlMessage::Monitoring) {
            return gone(e, cycles);
        }
        info!("{}: monitoring every {:?}", ctx.interface, ctx.interval);

        while !shutdown.should_stop() {
            match cycle(conn, ctx) {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => return gone(e, cycles),
                // Dropped for this cycle only.
                Err(e) => error!("{}: cycle failed: {e}", ctx.interface),
            }
            cycles += 1;
            ctx.sleeper.sleep(ctx.interval);
        }
    } else {
        warn!(
            "{}: expected monitor, got {}; not monitoring",
            ctx.interface,
            reply.keyword()
        );
    }

    match conn.send(&ControlMessage::Done) {
        Ok(()) => Ok(Outcome::Finished { cycles }),
        Err(e) => gone(e, cycles),
    }
}

/// One polling cycle: snapshot, link check, report.
fn cycle(conn: &mut Connection, ctx: &WorkerContext<'_>) -> Result<(), IpcError> {
    let snapshot = ctx.stats.snapshot(ctx.interface);

    match ctx.link.is_link_up(ctx.interface) {
        Ok(true) => {}
        Ok(false) => {
            info!("{}: link is down, asking the supervisor", ctx.interface);
            match conn.request(&ControlMessage::LinkDown)? {
                ControlMessage::LinkUp => {
                    if let Err(e) = ctx.link.set_link_up(ctx.interface) {
                        error!("{}: failed to bring the link up: {e}", ctx.interface);
                    }
                }
                other => warn!(
                    "{}: expected link_up, got {}",
                    ctx.interface,
                    other.keyword()
                ),
            }
        }
        Err(e) => warn!("{}: failed to query link state: {e}", ctx.interface),
    }

    debug!(
        "{}: reporting rx_bytes={} tx_bytes={}",
        ctx.interface, snapshot.rx_bytes, snapshot.tx_bytes
    );
    conn.send(&ControlMessage::report(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::ShutdownFlag;
    use crate::stats::StatsSnapshot;
    use std::cell::Cell;
    use std::io;
    use std::os::unix::net::UnixStream;
    use std::thread;

    struct FixedStats;

    impl StatsSource for FixedStats {
        fn snapshot(&self, interface: &str) -> StatsSnapshot {
            StatsSnapshot {
                interface: interface.to_string(),
                operstate: "up".into(),
                rx_packets: 7,
                ..Default::default()
            }
        }
    }

    /// Reports the link down for the first `down_for` queries.
    #[derive(Default)]
    struct FakeLink {
        down_for: Cell<u32>,
        raised: Cell<u32>,
        broken: bool,
    }

    impl LinkController for FakeLink {
        fn is_link_up(&self, _interface: &str) -> io::Result<bool> {
            if self.broken {
                return Err(io::Error::other("no ioctl here"));
            }
            let left = self.down_for.get();
            if left > 0 {
                self.down_for.set(left - 1);
                return Ok(false);
            }
            Ok(true)
        }

        fn set_link_up(&self, _interface: &str) -> io::Result<()> {
            self.raised.set(self.raised.get() + 1);
            Ok(())
        }
    }

    /// Triggers the flag on the sleep that brings `left` to zero.
    struct StopAfter {
        flag: ShutdownFlag,
        left: Cell<u32>,
    }

    impl Sleeper for StopAfter {
        fn sleep(&self, _duration: Duration) {
            let left = self.left.get().saturating_sub(1);
            self.left.set(left);
            if left == 0 {
                self.flag.trigger();
            }
        }
    }

    fn pair(worker_limit: usize) -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        (Connection::new(a, worker_limit), Connection::new(b, 4096))
    }

    fn run(
        link: &FakeLink,
        cycles: u32,
        supervisor: impl FnOnce(Connection) + Send + 'static,
    ) -> Result<Outcome, IpcError> {
        run_with_limit(link, cycles, 4096, supervisor)
    }

    fn run_with_limit(
        link: &FakeLink,
        cycles: u32,
        worker_limit: usize,
        supervisor: impl FnOnce(Connection) + Send + 'static,
    ) -> Result<Outcome, IpcError> {
        let (mut worker, peer) = pair(worker_limit);
        let script = thread::spawn(move || supervisor(peer));

        let flag = ShutdownFlag::manual();
        let token = LaunchToken::generate();
        let sleeper = StopAfter {
            flag: flag.clone(),
            left: Cell::new(cycles),
        };
        let ctx = WorkerContext {
            interface: "eth0",
            token: &token,
            stats: &FixedStats,
            link,
            sleeper: &sleeper,
            interval: Duration::from_secs(1),
        };
        let outcome = run_monitor(&mut worker, &ctx, &flag);
        drop(worker);
        script.join().unwrap();
        outcome
    }

    fn handshake(peer: &mut Connection) {
        assert!(matches!(peer.recv().unwrap(), ControlMessage::Ready { .. }));
        peer.send(&ControlMessage::Monitor).unwrap();
        assert_eq!(peer.recv().unwrap(), ControlMessage::Monitoring);
    }

    #[test]
    fn test_reports_each_cycle_then_done() {
        let link = FakeLink::default();
        let outcome = run(&link, 2, |mut peer| {
            handshake(&mut peer);
            for _ in 0..2 {
                match peer.recv().unwrap() {
                    ControlMessage::Report { snapshot } => {
                        assert_eq!(snapshot.interface, "eth0");
                        assert_eq!(snapshot.rx_packets, 7);
                    }
                    other => panic!("expected report, got {other:?}"),
                }
            }
            assert_eq!(peer.recv().unwrap(), ControlMessage::Done);
        });
        assert_eq!(outcome.unwrap(), Outcome::Finished { cycles: 2 });
        assert_eq!(link.raised.get(), 0);
    }

    #[test]
    fn test_link_down_waits_for_link_up_then_reports() {
        let link = FakeLink {
            down_for: Cell::new(1),
            ..Default::default()
        };
        let outcome = run(&link, 1, |mut peer| {
            handshake(&mut peer);
            assert_eq!(peer.recv().unwrap(), ControlMessage::LinkDown);
            peer.send(&ControlMessage::LinkUp).unwrap();
            assert!(matches!(peer.recv().unwrap(), ControlMessage::Report { .. }));
            assert_eq!(peer.recv().unwrap(), ControlMessage::Done);
        });
        assert_eq!(outcome.unwrap(), Outcome::Finished { cycles: 1 });
        assert_eq!(link.raised.get(), 1);
    }

    #[test]
    fn test_failed_link_query_counts_as_up() {
        let link = FakeLink {
            broken: true,
            ..Default::default()
        };
        let outcome = run(&link, 1, |mut peer| {
            handshake(&mut peer);
            assert!(matches!(peer.recv().unwrap(), ControlMessage::Report { .. }));
            assert_eq!(peer.recv().unwrap(), ControlMessage::Done);
        });
        assert_eq!(outcome.unwrap().cycles(), 1);
    }

    #[test]
    fn test_unexpected_reply_skips_monitoring() {
        let link = FakeLink::default();
        let outcome = run(&link, 1, |mut peer| {
            assert!(matches!(peer.recv().unwrap(), ControlMessage::Ready { .. }));
            peer.send(&ControlMessage::LinkUp).unwrap();
            assert_eq!(peer.recv().unwrap(), ControlMessage::Done);
        });
        assert_eq!(outcome.unwrap(), Outcome::Finished { cycles: 0 });
    }

    #[test]
    fn test_supervisor_hangup_ends_run_without_error() {
        let link = FakeLink::default();
        let outcome = run(&link, 5, |mut peer| {
            assert!(matches!(peer.recv().unwrap(), ControlMessage::Ready { .. }));
            drop(peer);
        });
        assert_eq!(outcome.unwrap(), Outcome::SupervisorGone { cycles: 0 });
    }

    #[test]
    fn test_oversized_report_is_dropped_and_run_continues() {
        let link = FakeLink::default();
        // Big enough for the handshake, too small for a report.
        let outcome = run_with_limit(&link, 2, 200, |mut peer| {
            handshake(&mut peer);
            assert_eq!(peer.recv().unwrap(), ControlMessage::Done);
        });
        assert_eq!(outcome.unwrap(), Outcome::Finished { cycles: 2 });
    }
}
