//! PID-file reading for self-backgrounding daemons.
//!
//! The PID is the first whitespace-trimmed token of the first line; anything
//! after the first newline is ignored. The parsed PID is liveness-checked
//! with `kill(pid, 0)`: ESRCH means the daemon already died, EPERM means it
//! exists under another user and counts as alive.

use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

/// Outcome of a successful PID-file parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidProbe {
    /// The PID was read and the process exists.
    Live(i32),
    /// The PID was read but the process no longer exists.
    Dead(i32),
}

/// Failure to read or validate a PID file.
#[derive(Error, Debug)]
pub enum PidFileError {
    #[error("reading PID file: {0}")]
    Io(#[from] std::io::Error),
    #[error("PID file is empty")]
    Empty,
    #[error("invalid PID in file: {0:?}")]
    Invalid(String),
    #[error("checking process {pid}: {errno}")]
    Check { pid: i32, errno: Errno },
}

/// Reads and validates the PID stored at `path`.
pub fn read_pid_file(path: &Path) -> Result<PidProbe, PidFileError> {
    let data = std::fs::read_to_string(path)?;

    let mut content = data.trim();
    if content.is_empty() {
        return Err(PidFileError::Empty);
    }
    if let Some(idx) = content.find('\n') {
        content = content[..idx].trim();
    }

    let pid: i32 = content
        .parse()
        .map_err(|_| PidFileError::Invalid(content.to_string()))?;
    if pid <= 0 {
        return Err(PidFileError::Invalid(content.to_string()));
    }

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => Ok(PidProbe::Live(pid)),
        Err(Errno::ESRCH) => Ok(PidProbe::Dead(pid)),
        Err(Errno::EPERM) => Ok(PidProbe::Live(pid)),
        Err(errno) => Err(PidFileError::Check { pid, errno }),
    }
}
