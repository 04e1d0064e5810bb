//! # Process runner: spawning, signalling and liveness probing of children.
//!
//! This module owns everything that touches the OS process layer:
//!
//! - [`spawn_child`] forks and execs a child with the configured working
//!   directory, credentials, environment file, process group or console
//!   session, and output destination.
//! - [`signal_process`] delivers signals to a process or its whole group.
//! - [`ExitInfo`] classifies wait statuses (clean exit, non-zero, signal).
//! - [`read_pid_file`] parses a PID file and liveness-checks the PID, used
//!   by the bgprocess launcher handshake.

mod exec;
mod pidfile;

pub use exec::{spawn_child, ExecError, ExecParams, ExecStage, OutputMode, SpawnedChild};
pub use pidfile::{read_pid_file, PidFileError, PidProbe};

use std::os::unix::process::ExitStatusExt;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Sends a signal to a process.
///
/// Unless `process_only` is set, the signal is delivered to the whole
/// process group (negative PID). A non-positive PID is a no-op.
pub fn signal_process(pid: i32, sig: Signal, process_only: bool) -> nix::Result<()> {
    if pid <= 0 {
        return Ok(());
    }
    let target = if process_only { pid } else { -pid };
    kill(Pid::from_raw(target), sig)
}

/// Probes whether a process exists using `kill(pid, 0)`.
///
/// EPERM counts as alive: the process exists but belongs to another user.
pub fn process_exists(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Classified exit status of a terminated child.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitInfo {
    status: Option<std::process::ExitStatus>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            status: Some(status),
        }
    }

    /// True if a wait status has been recorded.
    pub fn has_status(&self) -> bool {
        self.status.is_some()
    }

    /// True if the process exited normally (with any code).
    pub fn exited(&self) -> bool {
        self.status.map(|s| s.code().is_some()).unwrap_or(false)
    }

    /// Exit code if the process exited normally, -1 otherwise.
    pub fn exit_code(&self) -> i32 {
        self.status.and_then(|s| s.code()).unwrap_or(-1)
    }

    /// True if the process exited with code 0.
    pub fn exited_clean(&self) -> bool {
        self.exit_code() == 0
    }

    /// True if the process was killed by a signal.
    pub fn signaled(&self) -> bool {
        self.status.map(|s| s.signal().is_some()).unwrap_or(false)
    }

    /// The terminating signal, if any.
    pub fn signal(&self) -> Option<i32> {
        self.status.and_then(|s| s.signal())
    }
}
