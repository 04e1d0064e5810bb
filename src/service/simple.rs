//! Process-less variants (internal, triggered) and the variant hook
//! dispatch shared by the state machine.

use std::sync::Arc;

use tracing::error;

use crate::proc::ExitInfo;
use crate::service::logbuffer::LogBuffer;
use crate::service::set::{ServiceId, ServiceSet};
use crate::service::types::{LogType, ServiceState, ServiceType};
use crate::service::ServiceKind;

impl ServiceSet {
    // ---- Variant hook dispatch ----

    /// Brings the service up. Returns false on immediate failure.
    pub(crate) fn bring_up(&mut self, id: ServiceId) -> bool {
        match self.svc(id).kind.service_type() {
            ServiceType::Internal | ServiceType::Placeholder => {
                self.started(id);
                true
            }
            ServiceType::Triggered => {
                let triggered = matches!(
                    self.svc(id).kind,
                    ServiceKind::Triggered { is_triggered: true }
                );
                if triggered {
                    self.started(id);
                }
                // Not triggered: hold in STARTING until set_trigger(true).
                true
            }
            ServiceType::Process => self.process_bring_up(id),
            ServiceType::BgProcess => self.bgprocess_bring_up(id),
            ServiceType::Scripted => self.scripted_bring_up(id),
        }
    }

    /// Brings the service down.
    pub(crate) fn bring_down(&mut self, id: ServiceId) {
        match self.svc(id).kind.service_type() {
            ServiceType::Internal | ServiceType::Placeholder | ServiceType::Triggered => {
                self.stopped(id);
            }
            ServiceType::Process => self.process_bring_down(id),
            ServiceType::BgProcess => self.bgprocess_bring_down(id),
            ServiceType::Scripted => self.scripted_bring_down(id),
        }
    }

    pub(crate) fn can_interrupt_start(&self, id: ServiceId) -> bool {
        match &self.svc(id).kind {
            ServiceKind::Process(p) => self.rec(id).waiting_for_deps || p.pid > 0,
            ServiceKind::BgProcess(p) => self.rec(id).waiting_for_deps || p.launcher_pid > 0,
            ServiceKind::Scripted(_) => {
                self.rec(id).waiting_for_deps || self.rec(id).flags.start_interruptible
            }
            _ => true,
        }
    }

    /// Attempts to interrupt an in-progress start. Returns true when the
    /// start was cancelled synchronously; false means the caller must wait
    /// for the process to die.
    pub(crate) fn interrupt_start(&mut self, id: ServiceId) -> bool {
        match self.svc(id).kind.service_type() {
            ServiceType::Process => self.process_interrupt_start(id),
            ServiceType::BgProcess => self.bgprocess_interrupt_start(id),
            ServiceType::Scripted => self.scripted_interrupt_start(id),
            _ => true,
        }
    }

    /// Restart rate-limit probe. True when another restart is allowed.
    pub(crate) fn check_restart(&mut self, id: ServiceId) -> bool {
        let name = self.rec(id).name.clone();
        let allowed = match &mut self.svc_mut(id).kind {
            ServiceKind::Process(p) => p
                .restart_window
                .check(p.config.restart_interval, p.config.max_restart_count),
            ServiceKind::BgProcess(p) => p
                .restart_window
                .check(p.config.restart_interval, p.config.max_restart_count),
            _ => true,
        };
        if !allowed {
            error!(service = %name, "restarting too quickly, stopping");
        }
        allowed
    }

    /// Called when a service settles in STOPPED with no restart pending.
    pub(crate) fn becoming_inactive(&mut self, id: ServiceId) {
        match self.svc(id).kind.service_type() {
            ServiceType::Process | ServiceType::BgProcess | ServiceType::Scripted => {
                self.cleanup_monitor(id);
            }
            _ => {}
        }
    }

    /// PID of the service's process, -1 when it has none.
    pub fn pid_of(&self, id: ServiceId) -> i32 {
        let pid = match &self.svc(id).kind {
            ServiceKind::Process(p) => p.pid,
            ServiceKind::BgProcess(p) => p.pid(),
            ServiceKind::Scripted(p) => p.pid(),
            _ => 0,
        };
        if pid > 0 {
            pid
        } else {
            -1
        }
    }

    /// Exit status of the service's last process.
    pub fn exit_status_of(&self, id: ServiceId) -> ExitInfo {
        match &self.svc(id).kind {
            ServiceKind::Process(p) => p.exit_status,
            ServiceKind::BgProcess(p) => p.exit_status,
            ServiceKind::Scripted(p) => p.exit_status,
            _ => ExitInfo::default(),
        }
    }

    pub fn log_type_of(&self, id: ServiceId) -> LogType {
        match &self.svc(id).kind {
            ServiceKind::Process(p) => p.config.log_type,
            ServiceKind::BgProcess(p) => p.config.log_type,
            _ => LogType::None,
        }
    }

    pub fn log_buffer_of(&self, id: ServiceId) -> Option<Arc<LogBuffer>> {
        match &self.svc(id).kind {
            ServiceKind::Process(p) => p.log_buffer.clone(),
            ServiceKind::BgProcess(p) => p.log_buffer.clone(),
            _ => None,
        }
    }

    // ---- Triggered services ----

    /// Sets or clears the trigger. Returns false when the service is not a
    /// triggered variant.
    ///
    /// Setting the trigger while the service is STARTING with its
    /// dependencies satisfied completes the start.
    pub fn set_trigger(&mut self, id: ServiceId, value: bool) -> bool {
        match &mut self.svc_mut(id).kind {
            ServiceKind::Triggered { is_triggered } => {
                *is_triggered = value;
            }
            _ => return false,
        }
        if value
            && self.rec(id).state == ServiceState::Starting
            && !self.rec(id).waiting_for_deps
        {
            self.started(id);
        }
        true
    }

    /// Current trigger state, or None for non-triggered services.
    pub fn is_triggered(&self, id: ServiceId) -> Option<bool> {
        match self.svc(id).kind {
            ServiceKind::Triggered { is_triggered } => Some(is_triggered),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_trigger_rejected_for_other_variants() {
        let mut set = ServiceSet::new_detached();
        let svc = set.add_service("plain", ServiceKind::Internal);
        assert!(!set.set_trigger(svc, true));
        assert!(set.is_triggered(svc).is_none());
    }

    #[test]
    fn trigger_clears_and_sets() {
        let mut set = ServiceSet::new_detached();
        let svc = set.add_service("trig", ServiceKind::Triggered { is_triggered: false });
        assert!(set.set_trigger(svc, true));
        assert_eq!(set.is_triggered(svc), Some(true));
        assert!(set.set_trigger(svc, false));
        assert_eq!(set.is_triggered(svc), Some(false));
    }

    #[test]
    fn pid_defaults_to_minus_one() {
        let set_pid = {
            let mut set = ServiceSet::new_detached();
            let svc = set.add_service("internal", ServiceKind::Internal);
            set.pid_of(svc)
        };
        assert_eq!(set_pid, -1);
    }
}
