use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{error, info};

use netmond::cli::SupervisorArgs;
use netmond::config::MonitorConfig;
use netmond::launcher::Launcher;
use netmond::signals::ShutdownFlag;
use netmond::supervisor::{ConsoleSink, ControlSocket, Supervisor};
use netmond::{console, logging};

fn main() {
    let args = SupervisorArgs::parse();
    logging::init(args.verbose);

    if let Err(e) = real_main(args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn real_main(args: SupervisorArgs) -> Result<()> {
    let mut cfg = load_config(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        cfg.socket_path = socket;
    }
    if let Some(worker) = args.worker {
        cfg.worker_path = Some(worker);
    }
    cfg.validate()?;

    if cfg.require_root && !nix::unistd::geteuid().is_root() {
        bail!("netmond must run as root to bring interfaces up (require_root = false skips this check)");
    }

    let shutdown = ShutdownFlag::install()?;

    let specs = if args.interfaces.is_empty() {
        console::prompt_specs(&cfg.sysfs_root, cfg.queue_capacity)?
    } else {
        console::specs_from_args(&cfg.sysfs_root, &args.interfaces, cfg.queue_capacity)?
    };

    let worker = cfg
        .worker_executable()
        .context("Failed to locate the worker executable")?;
    let socket = ControlSocket::bind(&cfg.socket_path, cfg.queue_capacity)?;
    let launcher = Launcher::from_config(worker, &cfg);

    let mut supervisor = Supervisor::new(cfg, socket, ConsoleSink);
    if supervisor.launch_all(&launcher, &specs) == 0 {
        bail!("No interface monitor could be started");
    }

    info!("netmond started (pid {})", std::process::id());
    supervisor.run(&shutdown)?;
    info!("netmond exiting");
    Ok(())
}

/// `--config` when given, else the per-user file if present, else defaults.
fn load_config(path: Option<&Path>) -> Result<MonitorConfig> {
    if let Some(path) = path {
        info!("Using config from: {}", path.display());
        return Ok(MonitorConfig::load(path)?);
    }
    match MonitorConfig::default_path() {
        Some(path) if path.exists() => {
            info!("Using config from: {}", path.display());
            Ok(MonitorConfig::load(&path)?)
        }
        _ => Ok(MonitorConfig::default()),
    }
}
