//! Path and host utilities for taskfarm data storage.

use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

/// Default performance store filename.
pub const PERF_DB_FILENAME: &str = "perf.db";

/// Get the data directory for taskfarm.
///
/// Uses XDG base directory specification on Linux/macOS:
/// - Linux: `~/.local/share/taskfarm`
/// - macOS: `~/Library/Application Support/taskfarm`
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("taskfarm"))
        .unwrap_or_else(|| PathBuf::from(".taskfarm"))
}

/// Get the default path of the performance store.
pub fn get_perf_store_path() -> PathBuf {
    get_data_dir().join(PERF_DB_FILENAME)
}

/// Derive the scratch store path sitting next to a performance store.
///
/// ```
/// use std::path::PathBuf;
/// use taskfarm::paths::scratch_path_for;
///
/// let scratch = scratch_path_for("/var/lib/taskfarm/calc_12.db");
/// assert_eq!(scratch, PathBuf::from("/var/lib/taskfarm/calc_12.scratch.db"));
/// ```
pub fn scratch_path_for<P: AsRef<Path>>(store_path: P) -> PathBuf {
    store_path.as_ref().with_extension("scratch.db")
}

/// Name of this host, or "localhost" if it cannot be read.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Whether `host` names this machine.
///
/// Loopback addresses, "localhost" and the machine's own hostname count as
/// local; anything else is launched remotely.
pub fn is_local_host(host: &str) -> bool {
    if host == "localhost" || host == hostname() {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => (host, 0)
            .to_socket_addrs()
            .map(|mut addrs| addrs.any(|a| a.ip().is_loopback()))
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_data_dir_returns_valid_path() {
        let data_dir = get_data_dir();
        let name = data_dir.file_name().unwrap().to_str().unwrap();
        assert!(name == "taskfarm" || name == ".taskfarm");
    }

    #[test]
    fn test_perf_store_path_is_in_data_dir() {
        let path = get_perf_store_path();
        assert!(path.starts_with(get_data_dir()));
        assert_eq!(path.file_name().unwrap(), "perf.db");
    }

    #[test]
    fn test_scratch_path_for_relative() {
        assert_eq!(
            scratch_path_for("data/calc.db"),
            PathBuf::from("data/calc.scratch.db")
        );
    }

    #[test]
    fn test_local_hosts() {
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("localhost"));
        assert!(is_local_host("::1"));
        assert!(is_local_host(&hostname()));
        assert!(!is_local_host("10.255.255.1"));
    }

    #[test]
    fn test_hostname_not_empty() {
        assert!(!hostname().is_empty());
    }
}
