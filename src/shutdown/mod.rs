//! # System shutdown: the final actions after all services have stopped.
//!
//! When running as PID 1 the supervisor is responsible for taking the
//! machine down: sweep remaining processes (SIGTERM, a grace period, then
//! SIGKILL), flush filesystems, and issue the reboot syscall matching the
//! requested shutdown type. A soft reboot instead re-executes the
//! supervisor binary so the kernel keeps running.
//!
//! Every syscall goes through the [`SystemOps`] indirection so tests can
//! verify the sequence and arguments without touching the kernel.

mod pid1;

pub use pid1::init_pid1;

use std::io;
use std::time::Duration;

use nix::sys::reboot::RebootMode;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, error, info};

use crate::service::types::ShutdownType;

/// Pause between the SIGTERM and SIGKILL sweeps.
pub const PROCESS_KILL_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// The syscalls used during shutdown, behind an indirection for testing.
pub trait SystemOps {
    /// Signals every process except ourselves (`kill(-1, sig)`).
    fn kill_all(&self, sig: Signal) -> nix::Result<()>;

    /// Flushes filesystem buffers.
    fn sync(&self);

    /// Issues the reboot syscall. Does not return on success.
    fn reboot(&self, mode: RebootMode) -> nix::Result<()>;

    /// Replaces this process with a fresh copy of our own binary, keeping
    /// argv and environment. Returns only on failure.
    fn reexec(&self) -> io::Error;
}

/// The real kernel-facing implementation.
pub struct RealSystem;

impl SystemOps for RealSystem {
    fn kill_all(&self, sig: Signal) -> nix::Result<()> {
        kill(Pid::from_raw(-1), sig)
    }

    fn sync(&self) {
        nix::unistd::sync();
    }

    fn reboot(&self, mode: RebootMode) -> nix::Result<()> {
        nix::sys::reboot::reboot(mode).map(|_| ())
    }

    fn reexec(&self) -> io::Error {
        use std::os::unix::process::CommandExt;
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => return e,
        };
        std::process::Command::new(exe)
            .args(std::env::args().skip(1))
            .exec()
    }
}

/// Maps a shutdown type to its reboot syscall command.
pub fn reboot_command_for(shutdown_type: ShutdownType) -> RebootMode {
    match shutdown_type {
        ShutdownType::Poweroff => RebootMode::RB_POWER_OFF,
        ShutdownType::Reboot => RebootMode::RB_AUTOBOOT,
        // Halt, and anything unexpected, halts.
        _ => RebootMode::RB_HALT_SYSTEM,
    }
}

/// SIGTERM to everything, a grace period, then SIGKILL.
pub fn kill_all_processes(ops: &dyn SystemOps) {
    info!("sending SIGTERM to all processes");
    if let Err(e) = ops.kill_all(Signal::SIGTERM) {
        // ESRCH just means there was nothing left to signal.
        if e != nix::errno::Errno::ESRCH {
            debug!(error = %e, "kill(-1, SIGTERM)");
        }
    }

    std::thread::sleep(PROCESS_KILL_GRACE_PERIOD);

    info!("sending SIGKILL to remaining processes");
    if let Err(e) = ops.kill_all(Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            debug!(error = %e, "kill(-1, SIGKILL)");
        }
    }
}

/// Performs the full shutdown sequence. Only meaningful as PID 1; never
/// returns, because PID 1 must not exit even when the final syscall fails.
pub fn execute(ops: &dyn SystemOps, shutdown_type: ShutdownType) -> ! {
    info!(%shutdown_type, "executing shutdown");

    kill_all_processes(ops);

    info!("syncing filesystems");
    ops.sync();

    if let Err(e) = ops.reboot(reboot_command_for(shutdown_type)) {
        error!(error = %e, "reboot syscall failed");
    }

    error!("shutdown failed, holding indefinitely");
    infinite_hold()
}

/// Re-executes the supervisor binary without rebooting the kernel:
/// sync, process sweep, sync again, exec. Returns the exec error on
/// failure; the caller falls back to a hard reboot.
pub fn soft_reboot(ops: &dyn SystemOps) -> io::Error {
    info!("performing soft reboot");

    ops.sync();
    kill_all_processes(ops);
    ops.sync();

    info!("re-executing supervisor binary");
    ops.reexec()
}

/// Blocks forever. PID 1 must never exit.
pub fn infinite_hold() -> ! {
    loop {
        std::thread::park();
    }
}
