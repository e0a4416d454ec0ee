use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Network interface monitor supervisor")]
pub struct SupervisorArgs {
    /// Interfaces to monitor; prompts when none are given
    #[arg(value_name = "INTERFACE")]
    pub interfaces: Vec<String>,

    /// Path to configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Control socket path (overrides the config file)
    #[arg(long, short = 's')]
    pub socket: Option<PathBuf>,

    /// Worker executable (overrides the config file)
    #[arg(long)]
    pub worker: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser, Debug)]
#[command(version, about = "Per-interface network monitor worker")]
pub struct WorkerArgs {
    /// Interface to monitor
    #[arg(value_name = "INTERFACE")]
    pub interface: String,

    /// Control socket path; defaults to the one the supervisor passed down
    #[arg(long, short = 's', env = "NETMOND_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Seconds between polling cycles
    #[arg(long, env = "NETMOND_INTERVAL_SECS", default_value_t = 1)]
    pub interval_secs: u64,

    /// Root of the per-interface statistics tree
    #[arg(long, hide = true, env = "NETMOND_SYSFS_ROOT", default_value = crate::stats::SYSFS_NET_ROOT)]
    pub sysfs_root: PathBuf,

    /// Largest control frame accepted or sent, in bytes
    #[arg(long, hide = true, env = "NETMOND_MAX_FRAME_LEN", default_value_t = crate::ipc::DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// More logging (-v debug, -vv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_commands_are_well_formed() {
        SupervisorArgs::command().debug_assert();
        WorkerArgs::command().debug_assert();
    }

    #[test]
    fn test_supervisor_args() {
        let args = SupervisorArgs::parse_from(["netmond", "-vv", "--socket", "/run/x.sock", "eth0", "eth1"]);
        assert_eq!(args.interfaces, vec!["eth0", "eth1"]);
        assert_eq!(args.socket, Some(PathBuf::from("/run/x.sock")));
        assert_eq!(args.verbose, 2);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_worker_settings_follow_launcher_environment() {
        use crate::launcher::{INTERVAL_ENV, MAX_FRAME_ENV, SOCKET_ENV, SYSFS_ROOT_ENV};
        use std::ffi::OsStr;

        let cmd = WorkerArgs::command();
        let env_of = |id: &str| {
            cmd.get_arguments()
                .find(|a| a.get_id() == id)
                .and_then(|a| a.get_env())
                .map(OsStr::to_os_string)
        };
        assert_eq!(env_of("socket").as_deref(), Some(OsStr::new(SOCKET_ENV)));
        assert_eq!(env_of("interval_secs").as_deref(), Some(OsStr::new(INTERVAL_ENV)));
        assert_eq!(env_of("sysfs_root").as_deref(), Some(OsStr::new(SYSFS_ROOT_ENV)));
        assert_eq!(env_of("max_frame_len").as_deref(), Some(OsStr::new(MAX_FRAME_ENV)));
    }

    #[test]
    fn test_worker_requires_interface() {
        assert!(WorkerArgs::try_parse_from(["ifmond"]).is_err());
        let args = WorkerArgs::try_parse_from(["ifmond", "--interval-secs", "5", "eth0"]).unwrap();
        assert_eq!(args.interface, "eth0");
        assert_eq!(args.interval_secs, 5);
    }
}
