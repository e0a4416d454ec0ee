use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use netmond::auth::LaunchToken;
use netmond::cli::WorkerArgs;
use netmond::config::DEFAULT_SOCKET_PATH;
use netmond::ipc::Connection;
use netmond::link::IoctlLink;
use netmond::logging;
use netmond::signals::ShutdownFlag;
use netmond::stats::SysfsStats;
use netmond::worker::{RealSleeper, WorkerContext, run_monitor};

fn main() {
    let args = WorkerArgs::parse();
    logging::init(args.verbose);

    // Only a supervisor-launched worker carries a token.
    let token = match LaunchToken::from_env() {
        Ok(token) => token,
        Err(e) => {
            println!("permission not granted");
            error!("{}: {e}", args.interface);
            std::process::exit(1);
        }
    };

    if let Err(e) = real_main(&args, &token) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn real_main(args: &WorkerArgs, token: &LaunchToken) -> Result<()> {
    let shutdown = ShutdownFlag::install()?;

    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
    let mut conn = Connection::connect(&socket, args.max_frame_len)
        .with_context(|| format!("Error while connecting to {}", socket.display()))?;
    info!("{}: connected to {} (pid {})", args.interface, socket.display(), std::process::id());

    let stats = SysfsStats::new(&args.sysfs_root);
    let ctx = WorkerContext {
        interface: &args.interface,
        token,
        stats: &stats,
        link: &IoctlLink,
        sleeper: &RealSleeper,
        interval: Duration::from_secs(args.interval_secs),
    };
    let outcome = run_monitor(&mut conn, &ctx, &shutdown)
        .with_context(|| format!("{}: monitoring failed", args.interface))?;

    info!("{}: finished after {} cycle(s)", args.interface, outcome.cycles());
    Ok(())
}
