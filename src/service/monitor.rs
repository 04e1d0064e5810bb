//! # Per-service monitor tasks.
//!
//! Every process-backed service has at most one monitor task. The task owns
//! the [`Child`] handle and selects over:
//!
//! - child exit,
//! - the service's multipurpose timer deadline,
//! - a best-effort rearm nudge (sent whenever the timer is re-armed, so the
//!   select is re-entered with the fresh deadline),
//! - replacement children (smooth recovery and scripted stop commands reuse
//!   the running monitor),
//! - a periodic liveness probe for bgprocess daemons,
//! - a cancellation token fired when the service settles in STOPPED.
//!
//! Handlers lock the service set, mutate through the ordinary state machine
//! entry points, and drain the queues before returning to the select.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::proc::{process_exists, ExitInfo};
use crate::service::set::{ServiceId, ServiceSet};
use crate::service::ServiceKind;
use crate::supervisor::Supervisor;

/// How often a bgprocess daemon is liveness-probed.
const DAEMON_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Dummy deadline used when the timer slot is disarmed.
const FAR_FUTURE: Duration = Duration::from_secs(86400);

/// Handle kept in the service payload for its live monitor task.
pub(crate) struct MonitorHandle {
    pub cancel: CancellationToken,
    pub child_tx: mpsc::UnboundedSender<Child>,
    pub nudge_tx: mpsc::Sender<()>,
}

impl ServiceSet {
    fn monitor_slot(&mut self, id: ServiceId) -> Option<&mut Option<MonitorHandle>> {
        match &mut self.svc_mut(id).kind {
            ServiceKind::Process(p) => Some(&mut p.monitor),
            ServiceKind::BgProcess(p) => Some(&mut p.monitor),
            ServiceKind::Scripted(p) => Some(&mut p.monitor),
            _ => None,
        }
    }

    /// Hands a freshly spawned child to the service's monitor task,
    /// starting one if none is running.
    pub(crate) fn deliver_child(&mut self, id: ServiceId, child: Child) {
        let mut pending = child;

        if let Some(slot) = self.monitor_slot(id) {
            if let Some(handle) = slot {
                if !handle.cancel.is_cancelled() {
                    match handle.child_tx.send(pending) {
                        Ok(()) => return,
                        Err(mpsc::error::SendError(c)) => pending = c,
                    }
                }
            }
        } else {
            return;
        }

        let cancel = CancellationToken::new();
        let (child_tx, child_rx) = mpsc::unbounded_channel();
        let (nudge_tx, nudge_rx) = mpsc::channel(1);
        let handle = MonitorHandle {
            cancel: cancel.clone(),
            child_tx,
            nudge_tx,
        };
        if let Some(slot) = self.monitor_slot(id) {
            *slot = Some(handle);
        }

        match self.shared.upgrade() {
            Some(sup) => {
                tokio::spawn(run_monitor(sup, id, pending, child_rx, nudge_rx, cancel));
            }
            None => {
                warn!(
                    service = %self.rec(id).name,
                    "no supervisor attached; child will not be monitored"
                );
            }
        }
    }

    /// Nudges the monitor so it picks up a newly armed timer.
    ///
    /// Best effort: a pending nudge already queued is enough.
    pub(crate) fn nudge_monitor(&mut self, id: ServiceId) {
        if let Some(Some(handle)) = self.monitor_slot(id) {
            let _ = handle.nudge_tx.try_send(());
        }
    }

    /// Cancels the monitor task and disarms the timer.
    pub(crate) fn cleanup_monitor(&mut self, id: ServiceId) {
        match &mut self.svc_mut(id).kind {
            ServiceKind::Process(p) => {
                p.timer.cancel();
                if let Some(h) = p.monitor.take() {
                    h.cancel.cancel();
                }
            }
            ServiceKind::BgProcess(p) => {
                p.timer.cancel();
                if let Some(h) = p.monitor.take() {
                    h.cancel.cancel();
                }
            }
            ServiceKind::Scripted(p) => {
                p.timer.cancel();
                if let Some(h) = p.monitor.take() {
                    h.cancel.cancel();
                }
            }
            _ => {}
        }
    }

    /// Snapshot the monitor-relevant state: the armed timer deadline and
    /// the daemon PID to liveness-probe (bgprocess only).
    pub(crate) fn monitor_view(&self, id: ServiceId) -> (Option<tokio::time::Instant>, i32) {
        match &self.svc(id).kind {
            ServiceKind::Process(p) => (p.timer.deadline(), 0),
            ServiceKind::BgProcess(p) => (p.timer.deadline(), p.daemon_pid),
            ServiceKind::Scripted(p) => (p.timer.deadline(), 0),
            _ => (None, 0),
        }
    }

    /// Dispatches a child exit to the owning variant.
    pub(crate) fn monitor_child_exit(&mut self, id: ServiceId, info: ExitInfo) {
        match self.svc(id).kind.service_type() {
            crate::ServiceType::Process => self.process_child_exit(id, info),
            crate::ServiceType::BgProcess => self.bgprocess_launcher_exit(id, info),
            crate::ServiceType::Scripted => self.scripted_child_exit(id, info),
            _ => {}
        }
    }

    /// Dispatches a timer expiry to the owning variant.
    pub(crate) fn monitor_timer_expired(&mut self, id: ServiceId) {
        match self.svc(id).kind.service_type() {
            crate::ServiceType::Process => self.process_timer_expired(id),
            crate::ServiceType::BgProcess => self.bgprocess_timer_expired(id),
            crate::ServiceType::Scripted => self.scripted_timer_expired(id),
            _ => {}
        }
    }

    /// Dispatches a failed daemon liveness probe.
    pub(crate) fn monitor_daemon_terminated(&mut self, id: ServiceId) {
        if self.svc(id).kind.service_type() == crate::ServiceType::BgProcess {
            self.bgprocess_daemon_terminated(id);
        }
    }
}

async fn run_monitor(
    sup: Arc<Supervisor>,
    id: ServiceId,
    child: Child,
    mut child_rx: mpsc::UnboundedReceiver<Child>,
    mut nudge_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut child_slot: Option<Child> = Some(child);
    let mut poll = tokio::time::interval(DAEMON_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let (deadline, daemon_pid) = sup.with_set(|set| set.monitor_view(id));
        let has_child = child_slot.is_some();
        let sleep_at =
            deadline.unwrap_or_else(|| tokio::time::Instant::now() + FAR_FUTURE);

        tokio::select! {
            _ = cancel.cancelled() => return,

            res = async { child_slot.as_mut().expect("guarded").wait().await }, if has_child => {
                child_slot = None;
                let info = match res {
                    Ok(status) => ExitInfo::from_status(status),
                    Err(_) => ExitInfo::default(),
                };
                sup.with_set(|set| {
                    set.monitor_child_exit(id, info);
                    set.process_queues();
                });
            }

            replacement = child_rx.recv() => {
                match replacement {
                    Some(c) => child_slot = Some(c),
                    None => return,
                }
            }

            _ = tokio::time::sleep_until(sleep_at), if deadline.is_some() => {
                sup.with_set(|set| {
                    set.monitor_timer_expired(id);
                    set.process_queues();
                });
            }

            nudge = nudge_rx.recv() => {
                if nudge.is_none() {
                    // Handle dropped; the cancel token fires right after.
                    return;
                }
            }

            _ = poll.tick(), if daemon_pid > 0 && !has_child => {
                if !process_exists(daemon_pid) {
                    sup.with_set(|set| {
                        set.monitor_daemon_terminated(id);
                        set.process_queues();
                    });
                }
            }
        }
    }
}
