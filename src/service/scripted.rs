//! # The scripted variant: external start and stop commands.
//!
//! The service is started once its start command exits with code 0, and
//! stopped once its stop command exits (with any status). A missing start
//! command behaves like an internal service; a missing stop command stops
//! immediately. A command overrunning its timeout is killed outright.

use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::error;

use crate::proc::{signal_process, spawn_child, ExecParams, ExitInfo, OutputMode};
use crate::service::set::{ServiceId, ServiceSet};
use crate::service::types::StoppedReason;
use crate::service::{ServiceKind, TimerPurpose};

impl ServiceSet {
    fn scripted_payload_mut(&mut self, id: ServiceId) -> &mut crate::service::ScriptedPayload {
        match &mut self.svc_mut(id).kind {
            ServiceKind::Scripted(p) => p,
            _ => unreachable!("not a scripted service"),
        }
    }

    fn scripted_payload(&self, id: ServiceId) -> &crate::service::ScriptedPayload {
        match &self.svc(id).kind {
            ServiceKind::Scripted(p) => p,
            _ => unreachable!("not a scripted service"),
        }
    }

    fn scripted_params(&self, id: ServiceId, command: &[String]) -> ExecParams {
        let p = self.scripted_payload(id);
        ExecParams {
            command: command.to_vec(),
            working_dir: p.working_dir.clone(),
            env_file: None,
            run_as: p.run_as,
            output: OutputMode::Discard,
        }
    }

    pub(crate) fn scripted_bring_up(&mut self, id: ServiceId) -> bool {
        let start_command = self.scripted_payload(id).start_command.clone();
        if start_command.is_empty() {
            // No start command: starts instantly, like an internal service.
            self.started(id);
            return true;
        }

        let params = self.scripted_params(id, &start_command);
        let spawned = match spawn_child(&params) {
            Ok(s) => s,
            Err(e) => {
                error!(service = %self.rec(id).name, error = %e, "failed to run start command");
                self.rec_mut(id).stop_reason = StoppedReason::ExecFailed;
                return false;
            }
        };

        self.scripted_payload_mut(id).start_pid = spawned.pid;
        self.deliver_child(id, spawned.child);

        let start_timeout = self.scripted_payload(id).start_timeout;
        if start_timeout > Duration::ZERO {
            self.arm_service_timer(id, start_timeout, TimerPurpose::StartTimeout);
        }

        true
    }

    pub(crate) fn scripted_bring_down(&mut self, id: ServiceId) {
        let stop_command = self.scripted_payload(id).stop_command.clone();
        if stop_command.is_empty() {
            self.stopped(id);
            return;
        }

        let params = self.scripted_params(id, &stop_command);
        let spawned = match spawn_child(&params) {
            Ok(s) => s,
            Err(e) => {
                error!(service = %self.rec(id).name, error = %e, "failed to run stop command");
                // The service is considered stopped regardless.
                self.stopped(id);
                return;
            }
        };

        self.scripted_payload_mut(id).stop_pid = spawned.pid;
        self.deliver_child(id, spawned.child);

        let stop_timeout = self.scripted_payload(id).stop_timeout;
        if stop_timeout > Duration::ZERO {
            self.arm_service_timer(id, stop_timeout, TimerPurpose::StopTimeout);
        }
    }

    pub(crate) fn scripted_interrupt_start(&mut self, id: ServiceId) -> bool {
        if self.rec(id).waiting_for_deps {
            return true;
        }
        let start_pid = self.scripted_payload(id).start_pid;
        if start_pid > 0 && self.rec(id).flags.start_interruptible {
            let _ = signal_process(start_pid, Signal::SIGINT, false);
            return false;
        }
        start_pid <= 0
    }

    // ---- Monitor callbacks ----

    pub(crate) fn scripted_child_exit(&mut self, id: ServiceId, info: ExitInfo) {
        if self.scripted_payload(id).stop_pid > 0 {
            self.scripted_stop_exit(id, info);
        } else {
            self.scripted_start_exit(id, info);
        }
    }

    fn scripted_start_exit(&mut self, id: ServiceId, info: ExitInfo) {
        {
            let p = self.scripted_payload_mut(id);
            p.start_pid = 0;
            p.exit_status = info;
            p.timer.cancel();
        }

        if info.exited_clean() {
            self.started(id);
        } else {
            error!(service = %self.rec(id).name, code = info.exit_code(),
                   "start command failed");
            self.rec_mut(id).stop_reason = StoppedReason::Failed;
            self.failed_to_start(id, false, true);
        }
    }

    fn scripted_stop_exit(&mut self, id: ServiceId, info: ExitInfo) {
        {
            let p = self.scripted_payload_mut(id);
            p.stop_pid = 0;
            p.timer.cancel();
        }

        if !info.exited_clean() {
            error!(service = %self.rec(id).name, code = info.exit_code(),
                   "stop command failed");
        }

        // Whether the stop command succeeded or not, the service is stopped.
        self.stopped(id);
    }

    pub(crate) fn scripted_timer_expired(&mut self, id: ServiceId) {
        let purpose = match self.scripted_payload_mut(id).timer.take_purpose() {
            Some(p) => p,
            None => return,
        };

        match purpose {
            TimerPurpose::StartTimeout => {
                let pid = self.scripted_payload(id).start_pid;
                if pid > 0 {
                    error!(service = %self.rec(id).name,
                           "start command timeout, sending SIGKILL");
                    let _ = signal_process(pid, Signal::SIGKILL, false);
                }
            }
            TimerPurpose::StopTimeout => {
                let pid = self.scripted_payload(id).stop_pid;
                if pid > 0 {
                    error!(service = %self.rec(id).name,
                           "stop command timeout, sending SIGKILL");
                    let _ = signal_process(pid, Signal::SIGKILL, false);
                }
            }
            TimerPurpose::RestartDelay => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::service::testutil::wait_for_state;
    use crate::service::types::ServiceState;
    use crate::service::{ScriptedPayload, ServiceKind};
    use crate::supervisor::Supervisor;
    use crate::ServiceId;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn add_scripted(
        sup: &Arc<Supervisor>,
        name: &str,
        start: Vec<String>,
        stop: Vec<String>,
    ) -> ServiceId {
        sup.with_set(|set| {
            set.add_service(
                name,
                ServiceKind::Scripted(Box::new(ScriptedPayload::new(start, stop))),
            )
        })
    }

    #[tokio::test]
    async fn clean_start_command_reaches_started() {
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_scripted(&sup, "script", sh("exit 0"), sh("exit 0"));

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Started, Duration::from_secs(2)).await);

        sup.with_set(|set| set.stop_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(2)).await);
        sup.with_set(|set| set.check_invariants());
    }

    #[tokio::test]
    async fn failing_start_command_fails_service() {
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_scripted(&sup, "broken", sh("exit 7"), Vec::new());

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(2)).await);
        sup.with_set(|set| {
            assert!(set.rec(id).start_failed);
            assert_eq!(set.rec(id).stop_reason, StoppedReason::Failed);
            assert_eq!(set.exit_status_of(id).exit_code(), 7);
        });
    }

    #[tokio::test]
    async fn missing_commands_behave_like_internal() {
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_scripted(&sup, "bare", Vec::new(), Vec::new());

        sup.with_set(|set| {
            set.start_service(id);
            assert_eq!(set.rec(id).state, ServiceState::Started);
            set.stop_service(id);
            assert_eq!(set.rec(id).state, ServiceState::Stopped);
            set.check_invariants();
        });
    }

    #[tokio::test]
    async fn failing_stop_command_still_stops() {
        let (sup, _rx) = Supervisor::new(Vec::new());
        let id = add_scripted(&sup, "bad-stop", sh("exit 0"), sh("exit 1"));

        sup.with_set(|set| set.start_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Started, Duration::from_secs(2)).await);

        sup.with_set(|set| set.stop_service(id));
        assert!(wait_for_state(&sup, id, ServiceState::Stopped, Duration::from_secs(2)).await);
    }
}
