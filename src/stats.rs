//! Interface counters read from the kernel's per-interface sysfs tree.
//!
//! Every field is a separate scalar file under `/sys/class/net/<if>/`. A file
//! that is missing or does not parse yields the zero value for that field so
//! one unreadable counter never costs the whole snapshot.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default sysfs root holding one directory per interface.
pub const SYSFS_NET_ROOT: &str = "/sys/class/net";

/// Point-in-time counters and operational state for one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub interface: String,
    pub operstate: String,
    pub carrier_up_count: u64,
    pub carrier_down_count: u64,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_dropped: u64,
    pub rx_errors: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_dropped: u64,
    pub tx_errors: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Interface:{} state:{} up_count:{} down_count:{}",
            self.interface, self.operstate, self.carrier_up_count, self.carrier_down_count
        )?;
        writeln!(
            f,
            "rx_bytes:{} rx_dropped:{} rx_errors:{} rx_packets:{}",
            self.rx_bytes, self.rx_dropped, self.rx_errors, self.rx_packets
        )?;
        write!(
            f,
            "tx_bytes:{} tx_dropped:{} tx_errors:{} tx_packets:{}",
            self.tx_bytes, self.tx_dropped, self.tx_errors, self.tx_packets
        )
    }
}

/// Failure to parse the three-line report layout back into a snapshot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseSnapshotError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a counter: {value:?}")]
    BadCounter { field: &'static str, value: String },
    #[error("unknown field `{0}`")]
    UnknownField(String),
}

impl FromStr for StatsSnapshot {
    type Err = ParseSnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut snapshot = StatsSnapshot::default();
        let mut seen_interface = false;
        let mut seen_state = false;

        for token in s.split_whitespace() {
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| ParseSnapshotError::UnknownField(token.to_string()))?;

            let slot = match key {
                "Interface" => {
                    snapshot.interface = value.to_string();
                    seen_interface = true;
                    continue;
                }
                "state" => {
                    snapshot.operstate = value.to_string();
                    seen_state = true;
                    continue;
                }
                "up_count" => (&mut snapshot.carrier_up_count, "up_count"),
                "down_count" => (&mut snapshot.carrier_down_count, "down_count"),
                "rx_bytes" => (&mut snapshot.rx_bytes, "rx_bytes"),
                "rx_packets" => (&mut snapshot.rx_packets, "rx_packets"),
                "rx_dropped" => (&mut snapshot.rx_dropped, "rx_dropped"),
                "rx_errors" => (&mut snapshot.rx_errors, "rx_errors"),
                "tx_bytes" => (&mut snapshot.tx_bytes, "tx_bytes"),
                "tx_packets" => (&mut snapshot.tx_packets, "tx_packets"),
                "tx_dropped" => (&mut snapshot.tx_dropped, "tx_dropped"),
                "tx_errors" => (&mut snapshot.tx_errors, "tx_errors"),
                other => return Err(ParseSnapshotError::UnknownField(other.to_string())),
            };
            let (counter, field) = slot;
            *counter = value.parse().map_err(|_| ParseSnapshotError::BadCounter {
                field,
                value: value.to_string(),
            })?;
        }

        if !seen_interface {
            return Err(ParseSnapshotError::MissingField("Interface"));
        }
        if !seen_state {
            return Err(ParseSnapshotError::MissingField("state"));
        }
        Ok(snapshot)
    }
}

/// Source of interface snapshots. Reads only; never fails as a whole.
pub trait StatsSource {
    fn snapshot(&self, interface: &str) -> StatsSnapshot;
}

/// Reads counters from a sysfs-style tree rooted at `root`.
#[derive(Debug, Clone)]
pub struct SysfsStats {
    root: PathBuf,
}

impl Default for SysfsStats {
    fn default() -> Self {
        Self::new(SYSFS_NET_ROOT)
    }
}

impl SysfsStats {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_field(&self, interface: &str, field: &str) -> Option<String> {
        let path = self.root.join(interface).join(field);
        match fs::read_to_string(&path) {
            Ok(s) => Some(s.trim().to_string()),
            Err(e) => {
                log::debug!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    fn read_counter(&self, interface: &str, field: &str) -> u64 {
        let Some(raw) = self.read_field(interface, field) else {
            return 0;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                log::debug!("Unparseable {field} for {interface} ({raw:?}): {e}");
                0
            }
        }
    }
}

impl StatsSource for SysfsStats {
    fn snapshot(&self, interface: &str) -> StatsSnapshot {
        StatsSnapshot {
            interface: interface.to_string(),
            operstate: self.read_field(interface, "operstate").unwrap_or_default(),
            carrier_up_count: self.read_counter(interface, "carrier_up_count"),
            carrier_down_count: self.read_counter(interface, "carrier_down_count"),
            rx_bytes: self.read_counter(interface, "statistics/rx_bytes"),
            rx_packets: self.read_counter(interface, "statistics/rx_packets"),
            rx_dropped: self.read_counter(interface, "statistics/rx_dropped"),
            rx_errors: self.read_counter(interface, "statistics/rx_errors"),
            tx_bytes: self.read_counter(interface, "statistics/tx_bytes"),
            tx_packets: self.read_counter(interface, "statistics/tx_packets"),
            tx_dropped: self.read_counter(interface, "statistics/tx_dropped"),
            tx_errors: self.read_counter(interface, "statistics/tx_errors"),
        }
    }
}

/// True when `interface` is a plain name with an entry under `root`.
pub fn interface_exists(root: &Path, interface: &str) -> bool {
    if interface.is_empty() || interface.contains('/') || interface == "." || interface == ".." {
        return false;
    }
    root.join(interface).exists()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Lay out a fake interface directory the way sysfs does.
    pub(crate) fn fake_interface(root: &Path, name: &str, fields: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("statistics")).unwrap();
        for (field, value) in fields {
            fs::write(dir.join(field), format!("{value}\n")).unwrap();
        }
    }

    #[test]
    fn test_snapshot_reads_every_field() {
        let root = tempfile::tempdir().unwrap();
        fake_interface(
            root.path(),
            "eth0",
            &[
                ("operstate", "up"),
                ("carrier_up_count", "3"),
                ("carrier_down_count", "2"),
                ("statistics/rx_bytes", "1000"),
                ("statistics/rx_packets", "10"),
                ("statistics/rx_dropped", "1"),
                ("statistics/rx_errors", "0"),
                ("statistics/tx_bytes", "2000"),
                ("statistics/tx_packets", "20"),
                ("statistics/tx_dropped", "4"),
                ("statistics/tx_errors", "5"),
            ],
        );

        let snap = SysfsStats::new(root.path()).snapshot("eth0");
        assert_eq!(snap.interface, "eth0");
        assert_eq!(snap.operstate, "up");
        assert_eq!(snap.carrier_up_count, 3);
        assert_eq!(snap.carrier_down_count, 2);
        assert_eq!(snap.rx_bytes, 1000);
        assert_eq!(snap.tx_packets, 20);
        assert_eq!(snap.tx_errors, 5);
    }

    #[test]
    fn test_missing_and_garbage_fields_default_to_zero() {
        let root = tempfile::tempdir().unwrap();
        fake_interface(
            root.path(),
            "wlan0",
            &[("statistics/rx_bytes", "not-a-number"), ("statistics/tx_bytes", "7")],
        );

        let snap = SysfsStats::new(root.path()).snapshot("wlan0");
        assert_eq!(snap.operstate, "");
        assert_eq!(snap.rx_bytes, 0);
        assert_eq!(snap.carrier_up_count, 0);
        assert_eq!(snap.tx_bytes, 7);
    }

    #[test]
    fn test_text_rendering_parses_back() {
        let snap = StatsSnapshot {
            interface: "eth1".into(),
            operstate: "down".into(),
            carrier_up_count: 1,
            carrier_down_count: 2,
            rx_bytes: u64::MAX,
            rx_packets: 4,
            rx_dropped: 5,
            rx_errors: 6,
            tx_bytes: 7,
            tx_packets: 8,
            tx_dropped: 9,
            tx_errors: 10,
        };
        let text = snap.to_string();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("Interface:eth1 state:down up_count:1 down_count:2"));
        assert_eq!(text.parse::<StatsSnapshot>().unwrap(), snap);
    }

    #[test]
    fn test_parse_rejects_incomplete_report() {
        assert_eq!(
            "state:up rx_bytes:1".parse::<StatsSnapshot>(),
            Err(ParseSnapshotError::MissingField("Interface"))
        );
        assert!(matches!(
            "Interface:eth0 state:up rx_bytes:-1".parse::<StatsSnapshot>(),
            Err(ParseSnapshotError::BadCounter { field: "rx_bytes", .. })
        ));
    }

    #[test]
    fn test_interface_exists() {
        let root = tempfile::tempdir().unwrap();
        fake_interface(root.path(), "eth0", &[]);
        assert!(interface_exists(root.path(), "eth0"));
        assert!(!interface_exists(root.path(), "eth9"));
        assert!(!interface_exists(root.path(), ""));
        assert!(!interface_exists(root.path(), "../eth0"));
    }
}
