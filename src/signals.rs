//! Cooperative shutdown driven by SIGINT / SIGTERM.
//!
//! The handler only flips the flag of the installed [`ShutdownFlag`]; loops
//! check it at their top and right after any blocking wait. Handlers are
//! installed without `SA_RESTART` so a pending `poll` returns `EINTR`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::Result;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;

/// Flag of the process-wide installed handler.
static INSTALLED: OnceCell<Arc<AtomicBool>> = OnceCell::new();
/// Last signal number delivered, 0 if none.
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handler(sig: i32) {
    LAST_SIGNAL.store(sig, Ordering::SeqCst);
    if let Some(flag) = INSTALLED.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

pub trait ShutdownCheck {
    fn should_stop(&self) -> bool;
}

/// Shared stop flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl ShutdownFlag {
    /// A flag that only changes through [`ShutdownFlag::trigger`].
    pub fn manual() -> Self {
        Self::default()
    }

    /// Route SIGINT and SIGTERM to a new flag and ignore SIGPIPE.
    ///
    /// Calling this twice returns a flag sharing state with the first one.
    pub fn install() -> Result<Self> {
        let flag = INSTALLED.get_or_init(|| Arc::new(AtomicBool::new(false))).clone();

        let action = SigAction::new(
            SigHandler::Handler(handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            // Safety: the handler only touches atomics.
            unsafe { signal::sigaction(sig, &action) }
                .map_err(|e| anyhow::anyhow!("Failed to register {} handler: {e}", sig.as_str()))?;
        }
        ignore_sigpipe();

        Ok(Self { flag })
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl ShutdownCheck for ShutdownFlag {
    fn should_stop(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Report a delivered signal once, for logging.
pub fn take_signal() -> Option<Signal> {
    let val = LAST_SIGNAL.swap(0, Ordering::AcqRel);
    if val == 0 {
        return None;
    }
    match Signal::try_from(val) {
        Ok(sig) => Some(sig),
        Err(e) => {
            log::error!("Invalid signal number {val} from signal handler: {e}");
            None
        }
    }
}

/// Broken connections surface as `EPIPE` instead of killing the process.
pub fn ignore_sigpipe() {
    // Safety: SIG_IGN installs no code.
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }.ok();
}
