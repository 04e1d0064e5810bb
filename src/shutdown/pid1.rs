//! One-time setup when running as PID 1.
//!
//! - stdin/stdout/stderr are redirected to /dev/console so log output
//!   reaches the system console,
//! - the kernel's Ctrl+Alt+Del reboot is disabled so the key combination
//!   becomes an orderly SIGINT-driven shutdown instead,
//! - the process marks itself a child subreaper so orphaned descendants
//!   reparent to us for reaping,
//! - terminal job-control signals are ignored.
//!
//! Each step is best-effort; a failure is logged and boot continues.

use std::os::fd::AsRawFd;

use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::debug;

pub fn init_pid1() {
    match setup_console() {
        Ok(()) => debug!("console redirected to /dev/console"),
        Err(e) => debug!(error = %e, "console setup failed (non-fatal)"),
    }

    match nix::sys::reboot::set_cad_enabled(false) {
        Ok(()) => debug!("Ctrl+Alt+Del disabled"),
        Err(e) => debug!(error = %e, "disabling Ctrl+Alt+Del failed (non-fatal)"),
    }

    match set_child_subreaper() {
        Ok(()) => debug!("child subreaper set"),
        Err(e) => debug!(error = %e, "setting child subreaper failed (non-fatal)"),
    }

    ignore_terminal_signals();
    debug!("terminal signals ignored (SIGTSTP, SIGTTIN, SIGTTOU, SIGPIPE)");
}

/// Marks this process a child subreaper: orphaned descendants reparent to
/// us instead of PID 1.
fn set_child_subreaper() -> std::io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1 as libc::c_ulong) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Duplicates /dev/console onto fds 0, 1 and 2.
fn setup_console() -> std::io::Result<()> {
    let read_end = std::fs::OpenOptions::new()
        .read(true)
        .open("/dev/console")?;
    nix::unistd::dup2(read_end.as_raw_fd(), 0)?;

    let write_end = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/console")?;
    nix::unistd::dup2(write_end.as_raw_fd(), 1)?;
    nix::unistd::dup2(write_end.as_raw_fd(), 2)?;

    Ok(())
}

/// Terminal job-control signals have no meaning for an init process and
/// must not stop it.
fn ignore_terminal_signals() {
    for sig in [
        Signal::SIGTSTP,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
        Signal::SIGPIPE,
    ] {
        unsafe {
            let _ = signal(sig, SigHandler::SigIgn);
        }
    }
}
