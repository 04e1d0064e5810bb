//! # The central event coordinator.
//!
//! One select loop over OS signals, shutdown requests from the control
//! socket, bus events (each of which triggers the all-services-stopped
//! check), an emergency watchdog, and external cancellation.
//!
//! ## Signal mapping
//! - SIGTERM: halt
//! - SIGINT: halt, or reboot when running as PID 1 (Ctrl+Alt+Del)
//! - SIGQUIT: poweroff
//! - SIGHUP: noted, reserved for future reload behavior
//! - SIGCHLD: orphan reaping, PID 1 only. Children of our own spawns are
//!   collected by their monitor tasks; the reap here only sees processes
//!   reparented onto us.
//!
//! Once shutdown is initiated, automatic restarts are disabled, every
//! service is stopped and unpinned, and an emergency watchdog forces the
//! loop to exit if the drain has not completed within the deadline.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventKind};
use crate::service::types::ShutdownType;
use crate::supervisor::Supervisor;

/// Deadline for the shutdown drain before the loop is forced to exit.
pub const DEFAULT_EMERGENCY_TIMEOUT: Duration = Duration::from_secs(90);

pub struct EventLoop {
    sup: Arc<Supervisor>,
    shutdown_rx: mpsc::UnboundedReceiver<ShutdownType>,
    is_pid1: bool,
    shutdown_initiated: bool,
    shutdown_type: ShutdownType,
    emergency_timeout: Duration,
    force_exit: CancellationToken,
}

impl EventLoop {
    pub fn new(sup: Arc<Supervisor>, shutdown_rx: mpsc::UnboundedReceiver<ShutdownType>) -> Self {
        Self {
            sup,
            shutdown_rx,
            is_pid1: false,
            shutdown_initiated: false,
            shutdown_type: ShutdownType::None,
            emergency_timeout: DEFAULT_EMERGENCY_TIMEOUT,
            force_exit: CancellationToken::new(),
        }
    }

    /// Enables PID 1 behavior: boot-failure detection, orphan reaping, and
    /// the Ctrl+Alt+Del reboot mapping for SIGINT.
    pub fn set_pid1_mode(&mut self, v: bool) {
        self.is_pid1 = v;
    }

    /// Overrides the emergency shutdown deadline.
    pub fn set_emergency_timeout(&mut self, d: Duration) {
        self.emergency_timeout = d;
    }

    /// The shutdown type that ended the loop; the caller maps it to the
    /// appropriate system action.
    pub fn shutdown_type(&self) -> ShutdownType {
        self.shutdown_type
    }

    /// Runs until cancellation, a completed shutdown drain, or the
    /// emergency watchdog.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let streams = (|| {
            Ok::<_, std::io::Error>((
                signal(SignalKind::terminate())?,
                signal(SignalKind::interrupt())?,
                signal(SignalKind::quit())?,
                signal(SignalKind::hangup())?,
                signal(SignalKind::child())?,
            ))
        })();
        let (mut sigterm, mut sigint, mut sigquit, mut sighup, mut sigchld) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                error!(error = %e, "failed to install signal handlers");
                return;
            }
        };

        let mut bus_rx = self.sup.bus.subscribe();

        info!(pid = std::process::id(), "event loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("event loop cancelled, shutting down");
                    return;
                }

                _ = self.force_exit.cancelled() => {
                    error!("emergency shutdown timeout reached, forcing exit");
                    return;
                }

                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating shutdown");
                    self.initiate_shutdown(ShutdownType::Halt);
                }

                _ = sigint.recv() => {
                    if self.is_pid1 {
                        info!("received SIGINT (PID 1), initiating reboot");
                        self.initiate_shutdown(ShutdownType::Reboot);
                    } else {
                        info!("received SIGINT, initiating shutdown");
                        self.initiate_shutdown(ShutdownType::Halt);
                    }
                }

                _ = sigquit.recv() => {
                    info!("received SIGQUIT, initiating poweroff");
                    self.initiate_shutdown(ShutdownType::Poweroff);
                }

                _ = sighup.recv() => {
                    info!("received SIGHUP");
                }

                _ = sigchld.recv() => {
                    if self.is_pid1 {
                        reap_orphans();
                    }
                }

                requested = self.shutdown_rx.recv() => {
                    if let Some(shutdown_type) = requested {
                        self.initiate_shutdown(shutdown_type);
                    }
                }

                _ = bus_rx.recv() => {
                    // Any lifecycle event may have been the last stop.
                }
            }

            let active = self.sup.with_set(|set| set.count_active_services());
            if active == 0 {
                if self.shutdown_initiated {
                    info!("all services stopped, exiting");
                    return;
                }
                if self.is_pid1 {
                    warn!("all services stopped without shutdown request (boot failure?)");
                    return;
                }
            }
        }
    }

    /// Starts the shutdown: every service is stopped, and the watchdog is
    /// armed. Idempotent.
    pub fn initiate_shutdown(&mut self, shutdown_type: ShutdownType) {
        if self.shutdown_initiated {
            return;
        }
        self.shutdown_initiated = true;
        self.shutdown_type = shutdown_type;

        self.sup
            .bus
            .publish(Event::new(EventKind::ShutdownRequested).with_shutdown(shutdown_type));
        self.sup.with_set(|set| set.stop_all_services(shutdown_type));

        let force_exit = self.force_exit.clone();
        let deadline = self.emergency_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            error!(?deadline, "services did not stop in time, forcing shutdown");
            force_exit.cancel();
        });
    }
}

/// Collects exit statuses of orphans reparented onto us (PID 1 or child
/// subreaper). Without this they would remain zombies.
fn reap_orphans() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => {
                debug!(?status, "reaped orphan process");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceKind;
    use crate::service::types::ServiceState;

    #[tokio::test]
    async fn control_shutdown_drains_and_exits() {
        let (sup, shutdown_rx) = Supervisor::new(Vec::new());
        let svc = sup.with_set(|set| {
            let id = set.add_service("svc", ServiceKind::Internal);
            set.start_service(id);
            id
        });

        let mut event_loop = EventLoop::new(Arc::clone(&sup), shutdown_rx);
        sup.request_shutdown(ShutdownType::Poweroff);

        tokio::time::timeout(
            Duration::from_secs(5),
            event_loop.run(CancellationToken::new()),
        )
        .await
        .expect("event loop should exit after shutdown drain");

        assert_eq!(event_loop.shutdown_type(), ShutdownType::Poweroff);
        sup.with_set(|set| {
            assert_eq!(set.rec(svc).state, ServiceState::Stopped);
            assert!(set.is_shutting_down());
        });
    }

    #[tokio::test]
    async fn cancellation_ends_loop() {
        let (sup, shutdown_rx) = Supervisor::new(Vec::new());
        let mut event_loop = EventLoop::new(sup, shutdown_rx);

        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), event_loop.run(cancel))
            .await
            .expect("cancelled loop should return");
        assert_eq!(event_loop.shutdown_type(), ShutdownType::None);
    }
}
