//! # The bgprocess variant: a self-backgrounding daemon.
//!
//! The configured command is a *launcher* expected to fork the real daemon
//! and exit cleanly. On a clean launcher exit the PID file is read and its
//! PID liveness-checked; only then is the service started. The daemon is
//! afterwards probed every second with signal 0, since it is not our direct
//! child and cannot be waited on.

use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{error, info};

use crate::proc::{read_pid_file, signal_process, spawn_child, ExitInfo, PidProbe};
use crate::service::process::exec_params_for;
use crate::service::set::{ServiceId, ServiceSet};
use crate::service::types::{ServiceState, StoppedReason};
use crate::service::{ServiceKind, TimerPurpose};

impl ServiceSet {
    fn bg_payload_mut(&mut self, id: ServiceId) -> &mut crate::service::BgProcessPayload {
        match &mut self.svc_mut(id).kind {
            ServiceKind::BgProcess(p) => p,
            _ => unreachable!("not a bgprocess service"),
        }
    }

    fn bg_payload(&self, id: ServiceId) -> &crate::service::BgProcessPayload {
        match &self.svc(id).kind {
            ServiceKind::BgProcess(p) => p,
            _ => unreachable!("not a bgprocess service"),
        }
    }

    /// Spawns the launcher. The service stays STARTING until the launcher
    /// exits and the PID file has been validated.
    pub(crate) fn bgprocess_bring_up(&mut self, id: ServiceId) -> bool {
        let name = self.rec(id).name.clone();

        let params = {
            let p = self.bg_payload(id);
            if p.config.command.is_empty() {
                error!(service = %name, "no command specified");
                return false;
            }
            if p.pid_file.as_os_str().is_empty() {
                error!(service = %name, "no pid-file specified for bgprocess");
                return false;
            }
            exec_params_for(&p.config, false)
        };

        let buffer = self.prepare_log_buffer(id);

        let spawned = match spawn_child(&params) {
            Ok(s) => s,
            Err(e) => {
                error!(service = %name, error = %e, "failed to start launcher");
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
            let p = self.bg_payload_mut(id);
            p.launcher_pid = spawned.pid;
            p.daemon_pid = 0;
            p.exit_status = ExitInfo::default();
            p.stop_issued = false;
            p.last_start = Some(Instant::now());
        }
        self.deliver_child(id, child);

        let start_timeout = self.bg_payload(id).config.start_timeout;
        if start_timeout > Duration::ZERO {
            self.arm_service_timer(id, start_timeout, TimerPurpose::StartTimeout);
        }

        true
    }

    /// Signals the daemon (process only, never its group: the daemon is in
    /// a session of its own making).
    pub(crate) fn bgprocess_bring_down(&mut self, id: ServiceId) {
        let pid = self.bg_payload(id).pid();
        if pid <= 0 {
            self.cancel_service_timer(id);
            self.stopped(id);
            return;
        }

        if self.bg_payload(id).stop_issued {
            return;
        }

        let sig = self.rec(id).term_signal;
        info!(service = %self.rec(id).name, signal = %sig, pid, "sending stop signal");
        if let Err(e) = signal_process(pid, sig, true) {
            error!(service = %self.rec(id).name, error = %e, "failed to signal daemon");
        }

        self.bg_payload_mut(id).stop_issued = true;

        let stop_timeout = self.bg_payload(id).config.stop_timeout;
        if stop_timeout > Duration::ZERO {
            self.arm_service_timer(id, stop_timeout, TimerPurpose::StopTimeout);
        }
    }

    pub(crate) fn bgprocess_interrupt_start(&mut self, id: ServiceId) -> bool {
        if self.rec(id).waiting_for_deps {
            return true;
        }
        let launcher = self.bg_payload(id).launcher_pid;
        if launcher > 0 {
            let _ = signal_process(launcher, Signal::SIGINT, false);
            return false;
        }
        true
    }

    // ---- Monitor callbacks ----

    /// The launcher exited: on a clean exit, complete the PID-file
    /// handshake; anything else is a start failure.
    pub(crate) fn bgprocess_launcher_exit(&mut self, id: ServiceId, info: ExitInfo) {
        {
            let p = self.bg_payload_mut(id);
            p.launcher_pid = 0;
            p.exit_status = info;
        }
        let name = self.rec(id).name.clone();

        if !info.exited_clean() {
            error!(service = %name, code = info.exit_code(), "launcher exited uncleanly");
            self.cancel_service_timer(id);
            self.rec_mut(id).stop_reason = StoppedReason::Failed;
            self.failed_to_start(id, false, true);
            return;
        }

        let pid_file = self.bg_payload(id).pid_file.clone();
        match read_pid_file(&pid_file) {
            Err(e) => {
                error!(service = %name, path = %pid_file.display(), error = %e,
                       "failed to read PID file");
                self.cancel_service_timer(id);
                self.rec_mut(id).stop_reason = StoppedReason::Failed;
                self.failed_to_start(id, false, true);
            }
            Ok(PidProbe::Dead(pid)) => {
                error!(service = %name, pid, "daemon already terminated");
                self.cancel_service_timer(id);
                self.rec_mut(id).stop_reason = StoppedReason::Failed;
                self.failed_to_start(id, false, true);
            }
            Ok(PidProbe::Live(pid)) => {
                self.bg_payload_mut(id).daemon_pid = pid;
                self.cancel_service_timer(id);
                self.started(id);
            }
        }
    }

    /// The liveness probe found the daemon gone.
    pub(crate) fn bgprocess_daemon_terminated(&mut self, id: ServiceId) {
        let pid = self.bg_payload(id).daemon_pid;
        error!(service = %self.rec(id).name, pid, "daemon process terminated");

        self.bg_payload_mut(id).daemon_pid = 0;
        self.cancel_service_timer(id);

        match self.rec(id).state {
            ServiceState::Stopping => {
                self.bg_payload_mut(id).stop_issued = false;
                self.stopped(id);
            }
            ServiceState::Started => {
                if self.rec(id).smooth_recovery && self.check_restart(id) {
                    self.bg_payload_mut(id).smooth_recovering = true;
                    self.bgprocess_smooth_recovery(id);
                } else {
                    self.proc_unexpected_termination(id);
                }
            }
            _ => {}
        }
    }

    fn bgprocess_smooth_recovery(&mut self, id: ServiceId) {
        info!(service = %self.rec(id).name, "smooth recovery, relaunching daemon");

        let (elapsed, delay) = {
            let p = self.bg_payload(id);
            (
                p.last_start.map(|t| t.elapsed()).unwrap_or(Duration::MAX),
                p.config.restart_delay,
            )
        };

        if elapsed >= delay {
            if self.bgprocess_bring_up(id) {
                self.bg_payload_mut(id).smooth_recovering = false;
            } else {
                self.bg_payload_mut(id).smooth_recovering = false;
                self.proc_unexpected_termination(id);
            }
        } else {
            self.arm_service_timer(id, delay - elapsed, TimerPurpose::RestartDelay);
        }
    }

    pub(crate) fn bgprocess_timer_expired(&mut self, id: ServiceId) {
        let purpose = match self.bg_payload_mut(id).timer.take_purpose() {
            Some(p) => p,
            None => return,
        };

        match purpose {
            TimerPurpose::StartTimeout => {
                let p = self.bg_payload(id);
                let pid = if p.launcher_pid > 0 {
                    p.launcher_pid
                } else {
                    p.daemon_pid
                };
                if pid > 0 {
                    error!(service = %self.rec(id).name, "start timeout exceeded, sending SIGINT");
                    let _ = signal_process(pid, Signal::SIGINT, false);
                    self.rec_mut(id).stop_reason = StoppedReason::TimedOut;
                    self.failed_to_start(id, false, false);
                }
            }
            TimerPurpose::StopTimeout => {
                let pid = self.bg_payload(id).daemon_pid;
                if pid > 0 {
                    error!(service = %self.rec(id).name, "stop timeout exceeded, sending SIGKILL");
                    let _ = signal_process(pid, Signal::SIGKILL, false);
                }
            }
            TimerPurpose::RestartDelay => {
                if self.bg_payload(id).smooth_recovering {
                    if self.bgprocess_bring_up(id) {
                        self.bg_payload_mut(id).smooth_recovering = false;
                    } else {
                        self.bg_payload_mut(id).smooth_recovering = false;
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

    use crate::service::testutil::wait_for_state;
    use crate::service::{BgProcessPayload, ProcessConfig, ServiceKind};
    use crate::supervisor::Supervisor;
    use crate::ServiceId;

    fn add_bgprocess(
        sup: &Arc<Supervisor>,
        name: &str,
        script: &str,
        pid_file: std::path::PathBuf,
    ) -> ServiceId {
        let config = ProcessConfig {
            command: vec!["/bin/sh".into(), "-c".into(), script.into()],
            ..Default::default()
        };
        sup.with_set(|set| {
            set.add_service(
                name,
                ServiceKind::BgProcess(Box::new(BgProcessPayload::new(config, pid_file))),
            )
        })
    }

    #[tokio::test]
    async fn daemon_discovered_through_pid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("daemon.pid");
        let script = format!("sleep 60 & echo $! > {}; exit 0", pid_file.display());

        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_bgprocess(&sup, "daemon", &script, pid_file.clone());

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Started, Duration::from_millis(1500)).await);

        let daemon_pid = sup.with_set(|set| set.pid_of(id));
        let recorded: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(daemon_pid, recorded);

        sup.with_set(|set| set.stop_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_millis(3000)).await);
        sup.with_set(|set| set.check_invariants());
    }

    #[tokio::test]
    async fn invalid_pid_file_fails_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("bad.pid");
        let script = format!("echo not-a-pid > {}; exit 0", pid_file.display());

        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_bgprocess(&sup, "bad-daemon", &script, pid_file);

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(2)).await);
        sup.with_set(|set| {
            assert!(set.rec(id).start_failed);
            assert_eq!(set.rec(id).stop_reason, StoppedReason::Failed);
        });
    }

    #[tokio::test]
    async fn dead_pid_in_file_fails_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("dead.pid");
        // A PID beyond the kernel's pid range cannot refer to a live
        // process.
        let script = format!("echo 99999999 > {}; exit 0", pid_file.display());

        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_bgprocess(&sup, "dead-daemon", &script, pid_file);

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(2)).await);
        sup.with_set(|set| {
            assert!(set.rec(id).start_failed);
            assert_eq!(set.rec(id).stop_reason, StoppedReason::Failed);
        });
    }

    #[tokio::test]
    async fn unclean_launcher_fails_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("never.pid");

        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_bgprocess(&sup, "bad-launcher", "exit 3", pid_file);

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(2)).await);
        sup.with_set(|set| {
            assert!(set.rec(id).start_failed);
            assert_eq!(set.rec(id).stop_reason, StoppedReason::Failed);
        });
    }

    #[tokio::test]
    async fn missing_pid_file_refuses_bring_up() {
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_bgprocess(&sup, "no-pidfile", "exit 0", std::path::PathBuf::new());

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(1)).await);
        sup.with_set(|set| assert!(set.rec(id).start_failed));
    }

    #[tokio::test]
    async fn daemon_death_is_noticed_by_polling() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("poll.pid");
        let script = format!("sleep 60 & echo $! > {}; exit 0", pid_file.display());

        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_bgprocess(&sup, "mortal", &script, pid_file);

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Started, Duration::from_millis(1500)).await);

        let daemon_pid = sup.with_set(|set| set.pid_of(id));
        crate::proc::signal_process(daemon_pid, nix::sys::signal::Signal::SIGKILL, true).unwrap();

        // The liveness probe runs every second; the exit is treated as an
        // unexpected termination and, with restarts off, settles STOPPED.
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(3)).await);
        sup.with_set(|set| {
            assert_eq!(set.rec(id).stop_reason, StoppedReason::Terminated);
            set.check_invariants();
        });
    }
}
