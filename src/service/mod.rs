//! # Service state machine core.
//!
//! This module contains the supervised-service model and its scheduler:
//!
//! - **types.rs**: state/variant/reason enumerations shared with the wire
//!   protocol.
//! - **dep.rs**: typed dependency edges and their hardness predicates.
//! - **set.rs**: [`ServiceSet`], the id-indexed pool of services and edges,
//!   the two-phase propagation/transition queues, the console queue, and
//!   active-service accounting.
//! - **record.rs**: the per-service record and every state machine
//!   operation (start, stop, propagation, transitions, pinning, console).
//! - **simple.rs / process.rs / bgprocess.rs / scripted.rs**: the five
//!   service variants' lifecycle hooks.
//! - **monitor.rs**: the per-service monitor task watching child exits,
//!   the multipurpose timer, and bgprocess daemon liveness.
//! - **logbuffer.rs**: bounded capture of child output.
//!
//! ## Scheduling model
//! All mutation happens through [`ServiceSet`] methods while the caller
//! holds the supervisor mutex. The two-phase drain (`process_queues`) runs
//! propagation to quiescence before each transition step, so failure
//! cascades settle before any dependent acts on them.

pub mod dep;
pub mod logbuffer;
pub mod record;
pub mod set;
pub mod types;

mod bgprocess;
mod monitor;
mod process;
mod scripted;
mod simple;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::proc::ExitInfo;
use crate::service::logbuffer::LogBuffer;
use crate::service::types::{LogType, ServiceType};

pub(crate) use monitor::MonitorHandle;

/// Variant-specific payload of a service.
pub enum ServiceKind {
    /// Placeholder installed during loading; never visible outside the loader.
    Placeholder,
    /// No external process; started and stopped instantly.
    Internal,
    /// Held in STARTING until externally triggered.
    Triggered { is_triggered: bool },
    /// Long-running monitored process.
    Process(Box<ProcessPayload>),
    /// Self-backgrounding daemon discovered through a PID file.
    BgProcess(Box<BgProcessPayload>),
    /// Driven by external start/stop commands.
    Scripted(Box<ScriptedPayload>),
}

impl ServiceKind {
    pub fn service_type(&self) -> ServiceType {
        match self {
            ServiceKind::Placeholder => ServiceType::Placeholder,
            ServiceKind::Internal => ServiceType::Internal,
            ServiceKind::Triggered { .. } => ServiceType::Triggered,
            ServiceKind::Process(_) => ServiceType::Process,
            ServiceKind::BgProcess(_) => ServiceType::BgProcess,
            ServiceKind::Scripted(_) => ServiceType::Scripted,
        }
    }
}

/// Process configuration shared by the process and bgprocess variants.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: Vec<String>,
    pub stop_command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Credentials to run as (uid, gid).
    pub run_as: Option<(u32, u32)>,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    /// Minimum delay between smooth-recovery respawns.
    pub restart_delay: Duration,
    /// Restart rate-limit window.
    pub restart_interval: Duration,
    /// Maximum restarts within the window; zero or less means unlimited.
    pub max_restart_count: i32,
    pub log_type: LogType,
    pub log_buf_max: usize,
    pub log_file: Option<PathBuf>,
}

pub(crate) const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(200);
pub(crate) const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_MAX_RESTARTS: i32 = 3;

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            stop_command: Vec::new(),
            working_dir: None,
            env_file: None,
            run_as: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            restart_delay: DEFAULT_RESTART_DELAY,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            max_restart_count: DEFAULT_MAX_RESTARTS,
            log_type: LogType::None,
            log_buf_max: 0,
            log_file: None,
        }
    }
}

/// What the multipurpose service timer is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerPurpose {
    StartTimeout,
    StopTimeout,
    RestartDelay,
}

/// At most one timer per process-like service; arming replaces the old one.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    armed: Option<(tokio::time::Instant, TimerPurpose)>,
}

impl TimerSlot {
    pub fn arm(&mut self, after: Duration, purpose: TimerPurpose) {
        self.armed = Some((tokio::time::Instant::now() + after, purpose));
    }

    pub fn cancel(&mut self) {
        self.armed = None;
    }

    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.armed.map(|(at, _)| at)
    }

    /// Consumes the armed purpose, disarming the slot.
    pub fn take_purpose(&mut self) -> Option<TimerPurpose> {
        self.armed.take().map(|(_, p)| p)
    }
}

/// Restart rate-limit window tracking.
#[derive(Debug, Default)]
pub(crate) struct RestartWindow {
    start: Option<Instant>,
    count: i32,
}

impl RestartWindow {
    /// Returns false when the limit has been exhausted within the window.
    pub fn check(&mut self, interval: Duration, max_count: i32) -> bool {
        if max_count <= 0 {
            return true;
        }
        let now = Instant::now();
        match self.start {
            Some(window_start) if now.duration_since(window_start) < interval => {
                if self.count >= max_count {
                    return false;
                }
                self.count += 1;
                true
            }
            _ => {
                self.start = Some(now);
                self.count = 1;
                true
            }
        }
    }
}

/// Payload of a long-running process service.
#[derive(Default)]
pub struct ProcessPayload {
    pub config: ProcessConfig,
    /// PID of the running process, 0 when none.
    pub pid: i32,
    pub exit_status: ExitInfo,
    pub(crate) stop_issued: bool,
    pub(crate) smooth_recovering: bool,
    pub(crate) last_start: Option<Instant>,
    pub(crate) restart_window: RestartWindow,
    pub(crate) timer: TimerSlot,
    pub(crate) monitor: Option<MonitorHandle>,
    pub log_buffer: Option<Arc<LogBuffer>>,
}

impl ProcessPayload {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }
}

/// Payload of a self-backgrounding daemon service.
#[derive(Default)]
pub struct BgProcessPayload {
    pub config: ProcessConfig,
    /// Path of the PID file written by the launcher; required.
    pub pid_file: PathBuf,
    pub launcher_pid: i32,
    pub daemon_pid: i32,
    pub exit_status: ExitInfo,
    pub(crate) stop_issued: bool,
    pub(crate) smooth_recovering: bool,
    pub(crate) last_start: Option<Instant>,
    pub(crate) restart_window: RestartWindow,
    pub(crate) timer: TimerSlot,
    pub(crate) monitor: Option<MonitorHandle>,
    pub log_buffer: Option<Arc<LogBuffer>>,
}

impl BgProcessPayload {
    pub fn new(config: ProcessConfig, pid_file: PathBuf) -> Self {
        Self {
            config,
            pid_file,
            ..Default::default()
        }
    }

    /// The daemon PID when known, otherwise the launcher PID.
    pub fn pid(&self) -> i32 {
        if self.daemon_pid > 0 {
            self.daemon_pid
        } else {
            self.launcher_pid
        }
    }
}

/// Payload of a scripted service.
#[derive(Default)]
pub struct ScriptedPayload {
    pub start_command: Vec<String>,
    pub stop_command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub run_as: Option<(u32, u32)>,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub start_pid: i32,
    pub stop_pid: i32,
    pub exit_status: ExitInfo,
    pub(crate) timer: TimerSlot,
    pub(crate) monitor: Option<MonitorHandle>,
}

impl ScriptedPayload {
    pub fn new(start_command: Vec<String>, stop_command: Vec<String>) -> Self {
        Self {
            start_command,
            stop_command,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            ..Default::default()
        }
    }

    /// PID of the currently running command, start before stop.
    pub fn pid(&self) -> i32 {
        if self.start_pid > 0 {
            self.start_pid
        } else {
            self.stop_pid
        }
    }
}
