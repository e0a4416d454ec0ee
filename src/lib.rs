//! Supervisor and per-interface workers for network interface monitoring.
//!
//! `netmond` binds a Unix control socket, launches one `ifmond` worker per
//! interface and drives each through the control protocol in a single
//! `poll` loop. Workers report interface counters every polling cycle and
//! ask the supervisor before forcing a downed link back up.

pub mod auth;
pub mod cli;
pub mod config;
pub mod console;
pub mod ipc;
pub mod launcher;
pub mod link;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod signals;
pub mod state_machine;
pub mod stats;
pub mod supervisor;
pub mod worker;
