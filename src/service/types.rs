//! Core enumerations of the service state machine.
//!
//! These map one-to-one onto the wire bytes of the control protocol, so the
//! discriminant values are part of the external contract and must not be
//! reordered.

use std::fmt;

/// Current lifecycle state of a service.
///
/// STOPPED and STARTED are terminal between commands; STARTING and STOPPING
/// are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

impl ServiceState {
    /// Returns true for a final state (STOPPED or STARTED).
    pub fn is_final(self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Started)
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ServiceState::Stopped),
            1 => Some(ServiceState::Starting),
            2 => Some(ServiceState::Started),
            3 => Some(ServiceState::Stopping),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Stopped => "STOPPED",
            ServiceState::Starting => "STARTING",
            ServiceState::Started => "STARTED",
            ServiceState::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

/// The kind of service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceType {
    /// Placeholder installed while a load is in progress, used to break
    /// dependency cycles. Never returned outside the loader.
    Placeholder = 0,
    /// Long-running monitored process.
    Process = 1,
    /// Self-backgrounding daemon process discovered via PID file.
    BgProcess = 2,
    /// Started and stopped via external commands.
    Scripted = 3,
    /// No external process.
    Internal = 4,
    /// Externally triggered service.
    Triggered = 5,
}

impl ServiceType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ServiceType::Placeholder),
            1 => Some(ServiceType::Process),
            2 => Some(ServiceType::BgProcess),
            3 => Some(ServiceType::Scripted),
            4 => Some(ServiceType::Internal),
            5 => Some(ServiceType::Triggered),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceType::Placeholder => "placeholder",
            ServiceType::Process => "process",
            ServiceType::BgProcess => "bgprocess",
            ServiceType::Scripted => "scripted",
            ServiceType::Internal => "internal",
            ServiceType::Triggered => "triggered",
        };
        f.write_str(s)
    }
}

/// Shutdown modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownType {
    /// No explicit shutdown requested.
    None = 0,
    /// Continue running with no services.
    Remain = 1,
    /// Halt the system without powering down.
    Halt = 2,
    /// Power off the system.
    Poweroff = 3,
    /// Reboot the system.
    Reboot = 4,
    /// Re-execute the supervisor without rebooting the kernel.
    SoftReboot = 5,
}

impl ShutdownType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ShutdownType::None),
            1 => Some(ShutdownType::Remain),
            2 => Some(ShutdownType::Halt),
            3 => Some(ShutdownType::Poweroff),
            4 => Some(ShutdownType::Reboot),
            5 => Some(ShutdownType::SoftReboot),
            _ => None,
        }
    }
}

impl fmt::Display for ShutdownType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownType::None => "none",
            ShutdownType::Remain => "remain",
            ShutdownType::Halt => "halt",
            ShutdownType::Poweroff => "poweroff",
            ShutdownType::Reboot => "reboot",
            ShutdownType::SoftReboot => "softreboot",
        };
        f.write_str(s)
    }
}

/// Why a service stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppedReason {
    /// Normal stop.
    Normal,
    /// A hard dependency was restarted.
    DepRestart,
    /// A dependency failed to start.
    DepFailed,
    /// Failed to start (process terminated during startup).
    Failed,
    /// Failed to start (could not launch the process).
    ExecFailed,
    /// Timed out while starting.
    TimedOut,
    /// Process terminated after having started.
    Terminated,
}

impl StoppedReason {
    /// True if the service ran to completion and then terminated.
    pub fn did_finish(self) -> bool {
        matches!(self, StoppedReason::Terminated)
    }
}

impl fmt::Display for StoppedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoppedReason::Normal => "normal",
            StoppedReason::DepRestart => "dependency-restart",
            StoppedReason::DepFailed => "dependency-failed",
            StoppedReason::Failed => "failed",
            StoppedReason::ExecFailed => "exec-failed",
            StoppedReason::TimedOut => "timed-out",
            StoppedReason::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Automatic restart behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoRestartMode {
    /// Never restart automatically.
    #[default]
    Never,
    /// Always restart, regardless of exit reason.
    Always,
    /// Restart only when the process fails (signal or non-zero exit).
    OnFailure,
}

/// Destination for a service's captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogType {
    /// Discard all output.
    #[default]
    None,
    /// Append output to a file.
    File,
    /// Keep output in a bounded in-memory buffer.
    Buffer,
    /// Pipe output to a consumer service.
    Pipe,
}

/// Behavioral option bits of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceFlags {
    /// Service runs on the console.
    pub runs_on_console: bool,
    /// Service uses the console during startup.
    pub starts_on_console: bool,
    /// Service shares the console.
    pub shares_console: bool,
    /// Pass the control socket fd to the child.
    pub pass_cs_fd: bool,
    /// Startup may be interrupted.
    pub start_interruptible: bool,
    /// Service may be skipped during boot.
    pub skippable: bool,
    /// Signal only the process, not its process group.
    pub signal_process_only: bool,
    /// Always chain to the next service, even on failure.
    pub always_chain: bool,
    /// Kill every process in the service's group on stop.
    pub kill_all_on_stop: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrip() {
        for v in 0..4u8 {
            let st = ServiceState::from_u8(v).unwrap();
            assert_eq!(st as u8, v);
        }
        assert!(ServiceState::from_u8(4).is_none());
    }

    #[test]
    fn final_states() {
        assert!(ServiceState::Stopped.is_final());
        assert!(ServiceState::Started.is_final());
        assert!(!ServiceState::Starting.is_final());
        assert!(!ServiceState::Stopping.is_final());
    }

    #[test]
    fn shutdown_roundtrip() {
        for v in 0..6u8 {
            let st = ShutdownType::from_u8(v).unwrap();
            assert_eq!(st as u8, v);
        }
        assert!(ShutdownType::from_u8(6).is_none());
    }

    #[test]
    fn reason_finish() {
        assert!(StoppedReason::Terminated.did_finish());
        assert!(!StoppedReason::Normal.did_finish());
        assert!(!StoppedReason::DepFailed.did_finish());
    }
}
