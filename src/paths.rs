//! Default locations for service directories and the control socket.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SYSTEM_SERVICE_DIR: &str = "/etc/slinit.d";
pub const DEFAULT_USER_SERVICE_DIR: &str = ".config/slinit.d";
pub const DEFAULT_SYSTEM_SOCKET: &str = "/run/slinit.socket";
pub const DEFAULT_USER_SOCKET: &str = ".slinitctl";

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Resolves the service directories: an explicit comma-separated override,
/// or the system/user default.
pub fn resolve_service_dirs(flag: Option<&str>, system_mode: bool) -> Vec<PathBuf> {
    if let Some(dirs) = flag {
        return dirs
            .split(',')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
    }

    if system_mode {
        return vec![PathBuf::from(DEFAULT_SYSTEM_SERVICE_DIR)];
    }

    match home_dir() {
        Some(home) => vec![home.join(DEFAULT_USER_SERVICE_DIR)],
        None => vec![PathBuf::from(DEFAULT_USER_SERVICE_DIR)],
    }
}

/// Resolves the control socket path for the daemon.
pub fn resolve_socket_path(flag: Option<&str>, system_mode: bool) -> PathBuf {
    if let Some(path) = flag {
        return PathBuf::from(path);
    }

    if system_mode {
        return PathBuf::from(DEFAULT_SYSTEM_SOCKET);
    }

    match home_dir() {
        Some(home) => home.join(DEFAULT_USER_SOCKET),
        None => PathBuf::from(DEFAULT_USER_SOCKET),
    }
}

/// Resolves the socket path for the CLI: explicit override, else by
/// effective uid (root talks to the system instance).
pub fn client_socket_path(flag: Option<&str>) -> PathBuf {
    if let Some(path) = flag {
        return PathBuf::from(path);
    }

    if nix::unistd::geteuid().is_root() {
        return PathBuf::from(DEFAULT_SYSTEM_SOCKET);
    }

    match home_dir() {
        Some(home) => home.join(DEFAULT_USER_SOCKET),
        None => PathBuf::from(DEFAULT_USER_SOCKET),
    }
}

/// Reads the kernel uptime from /proc/uptime; the time from kernel boot to
/// supervisor start.
pub fn read_kernel_uptime() -> std::io::Result<Duration> {
    let data = std::fs::read_to_string("/proc/uptime")?;
    let secs: f64 = data
        .split_ascii_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "unexpected /proc/uptime")
        })?;
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dirs_split_on_commas() {
        let dirs = resolve_service_dirs(Some("/a,/b/c"), true);
        assert_eq!(dirs, vec![PathBuf::from("/a"), PathBuf::from("/b/c")]);
    }

    #[test]
    fn system_mode_defaults() {
        assert_eq!(
            resolve_service_dirs(None, true),
            vec![PathBuf::from(DEFAULT_SYSTEM_SERVICE_DIR)]
        );
        assert_eq!(
            resolve_socket_path(None, true),
            PathBuf::from(DEFAULT_SYSTEM_SOCKET)
        );
    }

    #[test]
    fn explicit_socket_wins() {
        assert_eq!(
            resolve_socket_path(Some("/tmp/x.sock"), true),
            PathBuf::from("/tmp/x.sock")
        );
        assert_eq!(
            client_socket_path(Some("/tmp/x.sock")),
            PathBuf::from("/tmp/x.sock")
        );
    }

    #[test]
    fn kernel_uptime_parses() {
        // /proc/uptime exists on any Linux test host.
        let uptime = read_kernel_uptime().unwrap();
        assert!(uptime > Duration::ZERO);
    }
}
