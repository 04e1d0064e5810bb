//! # The process variant: a long-running, directly monitored child.
//!
//! `bring_up` spawns the command and reports the service started as soon as
//! the spawn succeeds (readiness protocols are out of scope). The monitor
//! task then watches for the child's exit:
//!
//! - during STARTING: classified as a start failure,
//! - during STOPPING: the expected result of `bring_down`,
//! - during STARTED with smooth recovery: respawned in place after
//!   `restart_delay`, without touching dependents,
//! - during STARTED otherwise: unexpected termination, force-stopping the
//!   service and its dependents, then restarting if still desired.
//!
//! Stop escalation: `bring_down` delivers the configured term signal; if the
//! stop timeout expires the whole process group gets SIGKILL.

use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{error, info};

use crate::proc::{signal_process, spawn_child, ExecParams, ExitInfo, OutputMode};
use crate::service::logbuffer::LogBuffer;
use crate::service::set::{ServiceId, ServiceSet};
use crate::service::types::{LogType, ServiceState, StoppedReason};
use crate::service::{ProcessConfig, ServiceKind, TimerPurpose};

/// Builds exec parameters from a process configuration.
pub(crate) fn exec_params_for(cfg: &ProcessConfig, console: bool) -> ExecParams {
    let output = if console {
        OutputMode::Console
    } else {
        match cfg.log_type {
            LogType::Buffer => OutputMode::Piped,
            LogType::File => cfg
                .log_file
                .clone()
                .map(OutputMode::File)
                .unwrap_or(OutputMode::Discard),
            _ => OutputMode::Discard,
        }
    };
    ExecParams {
        command: cfg.command.clone(),
        working_dir: cfg.working_dir.clone(),
        env_file: cfg.env_file.clone(),
        run_as: cfg.run_as,
        output,
    }
}

impl ServiceSet {
    fn process_payload_mut(&mut self, id: ServiceId) -> &mut crate::service::ProcessPayload {
        match &mut self.svc_mut(id).kind {
            ServiceKind::Process(p) => p,
            _ => unreachable!("not a process service"),
        }
    }

    fn process_payload(&self, id: ServiceId) -> &crate::service::ProcessPayload {
        match &self.svc(id).kind {
            ServiceKind::Process(p) => p,
            _ => unreachable!("not a process service"),
        }
    }

    // ---- Shared timer plumbing ----

    pub(crate) fn arm_service_timer(
        &mut self,
        id: ServiceId,
        after: Duration,
        purpose: TimerPurpose,
    ) {
        match &mut self.svc_mut(id).kind {
            ServiceKind::Process(p) => p.timer.arm(after, purpose),
            ServiceKind::BgProcess(p) => p.timer.arm(after, purpose),
            ServiceKind::Scripted(p) => p.timer.arm(after, purpose),
            _ => return,
        }
        self.nudge_monitor(id);
    }

    pub(crate) fn cancel_service_timer(&mut self, id: ServiceId) {
        match &mut self.svc_mut(id).kind {
            ServiceKind::Process(p) => p.timer.cancel(),
            ServiceKind::BgProcess(p) => p.timer.cancel(),
            ServiceKind::Scripted(p) => p.timer.cancel(),
            _ => {}
        }
    }

    /// Ensures the buffer exists (or marks the restart) before a spawn that
    /// captures output, and returns it.
    pub(crate) fn prepare_log_buffer(&mut self, id: ServiceId) -> Option<std::sync::Arc<LogBuffer>> {
        let (log_type, buf_max) = match &self.svc(id).kind {
            ServiceKind::Process(p) => (p.config.log_type, p.config.log_buf_max),
            ServiceKind::BgProcess(p) => (p.config.log_type, p.config.log_buf_max),
            _ => return None,
        };
        if log_type != LogType::Buffer {
            return None;
        }
        let slot = match &mut self.svc_mut(id).kind {
            ServiceKind::Process(p) => &mut p.log_buffer,
            ServiceKind::BgProcess(p) => &mut p.log_buffer,
            _ => unreachable!(),
        };
        match slot {
            Some(buf) => {
                buf.append_restart_marker();
                Some(buf.clone())
            }
            None => {
                let buf = LogBuffer::new(buf_max);
                *slot = Some(buf.clone());
                Some(buf)
            }
        }
    }

    // ---- Lifecycle hooks ----

    /// Spawns the service process and reports it started.
    ///
    /// Also the respawn path for smooth recovery.
    pub(crate) fn process_bring_up(&mut self, id: ServiceId) -> bool {
        let name = self.rec(id).name.clone();

        let params = {
            let p = self.process_payload(id);
            if p.config.command.is_empty() {
                error!(service = %name, "no command specified");
                return false;
            }
            let flags = &self.rec(id).flags;
            exec_params_for(&p.config, flags.runs_on_console || flags.starts_on_console)
        };

        let buffer = self.prepare_log_buffer(id);

        let spawned = match spawn_child(&params) {
            Ok(s) => s,
            Err(e) => {
                error!(service = %name, error = %e, "failed to start");
                self.rec_mut(id).stop_reason = StoppedReason::ExecFailed;
                return false;
            }
        };

        let mut child = spawned.child;
        if let Some(buf) = buffer {
            if let Some(out) = child.stdout.take() {
                buf.spawn_reader(out);
            }
            if let Some(err) = child.stderr.take() {
                buf.spawn_reader(err);
            }
        }

        {
            let p = self.process_payload_mut(id);
            p.pid = spawned.pid;
            p.exit_status = ExitInfo::default();
            p.stop_issued = false;
            p.last_start = Some(Instant::now());
            p.timer.cancel();
        }
        self.deliver_child(id, child);
        self.started(id);

        true
    }

    /// Delivers the term signal, arming SIGKILL escalation.
    pub(crate) fn process_bring_down(&mut self, id: ServiceId) {
        let pid = self.process_payload(id).pid;
        if pid <= 0 {
            self.cancel_service_timer(id);
            self.stopped(id);
            return;
        }

        if self.process_payload(id).stop_issued {
            return;
        }

        let sig = self.rec(id).term_signal;
        let process_only = self.rec(id).flags.signal_process_only;
        info!(service = %self.rec(id).name, signal = %sig, pid, "sending stop signal");
        if let Err(e) = signal_process(pid, sig, process_only) {
            error!(service = %self.rec(id).name, error = %e, "failed to signal process");
        }

        self.process_payload_mut(id).stop_issued = true;

        let stop_timeout = self.process_payload(id).config.stop_timeout;
        if stop_timeout > Duration::ZERO {
            self.arm_service_timer(id, stop_timeout, TimerPurpose::StopTimeout);
        }
    }

    /// SIGINT to the running process; the start ends when the exit arrives.
    pub(crate) fn process_interrupt_start(&mut self, id: ServiceId) -> bool {
        if self.rec(id).waiting_for_deps {
            return true;
        }
        let pid = self.process_payload(id).pid;
        if pid > 0 {
            info!(service = %self.rec(id).name, pid, "interrupting start");
            let process_only = self.rec(id).flags.signal_process_only;
            let _ = signal_process(pid, Signal::SIGINT, process_only);
            return false;
        }
        true
    }

    // ---- Monitor callbacks ----

    pub(crate) fn process_child_exit(&mut self, id: ServiceId, info: ExitInfo) {
        {
            let p = self.process_payload_mut(id);
            p.pid = 0;
            p.exit_status = info;
            p.timer.cancel();
        }

        let name = self.rec(id).name.clone();
        match self.rec(id).state {
            ServiceState::Starting => {
                error!(service = %name, code = info.exit_code(),
                       "process exited during startup");
                self.rec_mut(id).stop_reason = StoppedReason::Failed;
                self.failed_to_start(id, false, true);
            }
            ServiceState::Stopping => {
                self.process_payload_mut(id).stop_issued = false;
                self.stopped(id);
            }
            ServiceState::Started => {
                if info.exited() {
                    error!(service = %name, code = info.exit_code(), "process exited");
                } else if let Some(sig) = info.signal() {
                    error!(service = %name, signal = sig, "process killed by signal");
                }

                if self.rec(id).smooth_recovery && self.check_restart(id) {
                    self.process_payload_mut(id).smooth_recovering = true;
                    self.process_smooth_recovery(id);
                } else {
                    self.proc_unexpected_termination(id);
                }
            }
            ServiceState::Stopped => {}
        }
    }

    /// A STARTED process died unexpectedly: force-stop through the state
    /// machine, then restart in place if the service is still wanted.
    pub(crate) fn proc_unexpected_termination(&mut self, id: ServiceId) {
        self.rec_mut(id).stop_reason = StoppedReason::Terminated;
        self.rec_mut(id).force_stop = true;

        self.do_stop(id, false);
        self.process_queues();

        let rec = self.rec(id);
        if rec.state == ServiceState::Stopping
            && rec.desired == ServiceState::Started
            && !rec.is_start_pinned()
        {
            self.initiate_start(id);
            self.process_queues();
        }
    }

    fn process_smooth_recovery(&mut self, id: ServiceId) {
        info!(service = %self.rec(id).name, "smooth recovery, restarting process");

        let (elapsed, delay) = {
            let p = self.process_payload(id);
            (
                p.last_start.map(|t| t.elapsed()).unwrap_or(Duration::MAX),
                p.config.restart_delay,
            )
        };

        if elapsed >= delay {
            if self.process_bring_up(id) {
                self.process_payload_mut(id).smooth_recovering = false;
            } else {
                self.process_payload_mut(id).smooth_recovering = false;
                self.proc_unexpected_termination(id);
            }
        } else {
            self.arm_service_timer(id, delay - elapsed, TimerPurpose::RestartDelay);
        }
    }

    pub(crate) fn process_timer_expired(&mut self, id: ServiceId) {
        let purpose = match self.process_payload_mut(id).timer.take_purpose() {
            Some(p) => p,
            None => return,
        };

        match purpose {
            TimerPurpose::StartTimeout => {
                let pid = self.process_payload(id).pid;
                if pid > 0 {
                    error!(service = %self.rec(id).name, "start timeout exceeded, sending SIGINT");
                    let process_only = self.rec(id).flags.signal_process_only;
                    let _ = signal_process(pid, Signal::SIGINT, process_only);
                    self.rec_mut(id).stop_reason = StoppedReason::TimedOut;
                    self.failed_to_start(id, false, false);
                }
            }
            TimerPurpose::StopTimeout => {
                let pid = self.process_payload(id).pid;
                if pid > 0 {
                    error!(service = %self.rec(id).name, "stop timeout exceeded, sending SIGKILL");
                    // Escalation always targets the whole group.
                    let _ = signal_process(pid, Signal::SIGKILL, false);
                }
            }
            TimerPurpose::RestartDelay => {
                if self.process_payload(id).smooth_recovering {
                    if self.process_bring_up(id) {
                        self.process_payload_mut(id).smooth_recovering = false;
                    } else {
                        self.process_payload_mut(id).smooth_recovering = false;
                        self.proc_unexpected_termination(id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::service::dep::DependencyType;
    use crate::service::testutil::wait_for_state;
    use crate::service::types::{AutoRestartMode, ServiceState};
    use crate::service::{ProcessPayload, ServiceKind};
    use crate::supervisor::Supervisor;
    use crate::ServiceId;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn add_process(
        sup: &Arc<Supervisor>,
        name: &str,
        config: ProcessConfig,
    ) -> ServiceId {
        sup.with_set(|set| {
            set.add_service(name, ServiceKind::Process(Box::new(ProcessPayload::new(config))))
        })
    }

    #[tokio::test]
    async fn long_running_process_starts_and_stops() {
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_process(
            &sup,
            "sleeper",
            ProcessConfig {
                command: sh("sleep 60"),
                ..Default::default()
            },
        );

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Started, Duration::from_secs(2)).await);
        assert!(sup.with_set(|set| set.pid_of(id)) > 0);

        sup.with_set(|set| set.stop_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(3)).await);
        sup.with_set(|set| set.check_invariants());
    }

    #[tokio::test]
    async fn stubborn_process_killed_after_stop_timeout() {
        // A child ignoring SIGTERM is SIGKILLed once the stop timeout runs
        // out.
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_process(
            &sup,
            "stubborn",
            ProcessConfig {
                command: sh("trap '' TERM; sleep 60"),
                stop_timeout: Duration::from_millis(500),
                ..Default::default()
            },
        );

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Started, Duration::from_secs(2)).await);

        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(300)).await;

        sup.with_set(|set| set.stop_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_millis(2500)).await);
    }

    #[tokio::test]
    async fn exec_failure_is_classified() {
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_process(
            &sup,
            "missing",
            ProcessConfig {
                command: vec!["/nonexistent/binary-xyz".into()],
                ..Default::default()
            },
        );

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(1)).await);
        sup.with_set(|set| {
            assert!(set.rec(id).start_failed);
            assert_eq!(set.rec(id).stop_reason, StoppedReason::ExecFailed);
        });
    }

    #[tokio::test]
    async fn restart_rate_limit_leaves_service_stopped() {
        // Four rapid crashes within the window: the fourth restart is
        // refused and the service settles in STOPPED.
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = sup.with_set(|set| {
            let id = set.add_service(
                "flake",
                ServiceKind::Process(Box::new(ProcessPayload::new(ProcessConfig {
                    command: vec!["/bin/false".into()],
                    restart_interval: Duration::from_secs(10),
                    max_restart_count: 3,
                    ..Default::default()
                }))),
            );
            set.rec_mut(id).auto_restart = AutoRestartMode::Always;
            id
        });

        sup.with_set(|set| set.start_service(id));

        // Wait for the service to give up restarting.
        let mut settled = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (state, desired) =
                sup.with_set(|set| (set.rec(id).state, set.rec(id).desired));
            if state == ServiceState::Stopped && desired == ServiceState::Stopped {
                settled = true;
                break;
            }
        }
        assert!(settled, "service should stop permanently after rate limit");

        // It stays down.
        tokio::time::sleep(Duration::from_millis(300)).await;
        sup.with_set(|set| {
            assert_eq!(set.rec(id).state, ServiceState::Stopped);
            set.check_invariants();
        });
    }

    #[tokio::test]
    async fn smooth_recovery_does_not_disturb_dependents() {
        let (sup, _rx) = Supervisor::new(Vec::new());
        let (proc_id, app_id) = sup.with_set(|set| {
            let proc_id = set.add_service(
                "backend",
                ServiceKind::Process(Box::new(ProcessPayload::new(ProcessConfig {
                    command: sh("sleep 60"),
                    restart_delay: Duration::from_millis(50),
                    ..Default::default()
                }))),
            );
            set.rec_mut(proc_id).smooth_recovery = true;
            let app_id = set.add_service("app", ServiceKind::Internal);
            set.add_dep(app_id, proc_id, DependencyType::Regular);
            (proc_id, app_id)
        });

        sup.with_set(|set| set.start_service(app_id));
        assert!(wait_for_state(&sup, proc_id, ServiceState::Started, Duration::from_secs(2)).await);
        assert!(wait_for_state(&sup, app_id, ServiceState::Started, Duration::from_secs(2)).await);
        let first_pid = sup.with_set(|set| set.pid_of(proc_id));
        assert!(first_pid > 0);

        // Watch for any stop notification reaching the dependent.
        let mut bus_rx = sup.bus.subscribe();

        // Kill the backend out from under the supervisor.
        tokio::time::sleep(Duration::from_millis(100)).await;
        crate::proc::signal_process(first_pid, nix::sys::signal::Signal::SIGKILL, true).unwrap();

        // It comes back with a fresh PID.
        let mut respawned = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let pid = sup.with_set(|set| set.pid_of(proc_id));
            if pid > 0 && pid != first_pid {
                respawned = true;
                break;
            }
        }
        assert!(respawned, "backend should be respawned in place");
        sup.with_set(|set| {
            assert_eq!(set.rec(proc_id).state, ServiceState::Started);
            assert_eq!(set.rec(app_id).state, ServiceState::Started);
            set.check_invariants();
        });

        // No stop event was published for the dependent.
        while let Ok(ev) = bus_rx.try_recv() {
            if ev.kind == crate::EventKind::Stopped {
                assert_ne!(ev.service.as_deref(), Some("app"));
            }
        }

        sup.with_set(|set| set.stop_service(app_id));
        assert!(wait_for_state(&sup, proc_id, ServiceState::Stopped, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn unexpected_termination_restarts_when_desired() {
        // Without smooth recovery, a crash bounces the service through
        // STOPPING/STOPPED and back up while it is still wanted.
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = sup.with_set(|set| {
            let id = set.add_service(
                "bouncy",
                ServiceKind::Process(Box::new(ProcessPayload::new(ProcessConfig {
                    command: sh("sleep 60"),
                    ..Default::default()
                }))),
            );
            set.rec_mut(id).auto_restart = AutoRestartMode::Always;
            id
        });

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Started, Duration::from_secs(2)).await);
        let first_pid = sup.with_set(|set| set.pid_of(id));

        crate::proc::signal_process(first_pid, nix::sys::signal::Signal::SIGKILL, true).unwrap();

        let mut respawned = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let pid = sup.with_set(|set| set.pid_of(id));
            if pid > 0 && pid != first_pid {
                respawned = true;
                break;
            }
        }
        assert!(respawned);

        sup.with_set(|set| set.stop_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn buffered_output_is_captured() {
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_process(
            &sup,
            "chatty",
            ProcessConfig {
                command: sh("echo captured line; sleep 60"),
                log_type: crate::LogType::Buffer,
                log_buf_max: 4096,
                ..Default::default()
            },
        );

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Started, Duration::from_secs(2)).await);

        let mut captured = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let snapshot = sup
                .with_set(|set| set.log_buffer_of(id))
                .map(|buf| buf.snapshot())
                .unwrap_or_default();
            if snapshot == b"captured line\n" {
                captured = true;
                break;
            }
        }
        assert!(captured, "stdout should land in the log buffer");

        sup.with_set(|set| set.stop_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(3)).await);
    }
}
