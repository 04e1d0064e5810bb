//! # The per-service record and the full lifecycle state machine.
//!
//! A [`Record`] holds the lifecycle state shared by every service variant.
//! The state machine operations are methods on
//! [`ServiceSet`](crate::ServiceSet), keyed by [`ServiceId`]; they are the
//! only code that mutates records, and they run while the caller holds the
//! supervisor mutex.
//!
//! ## Operation map
//! ```text
//! start ──► do_start ──► initiate_start ──► (deps wait) ──► all_deps_started
//!                                                              │ bring_up
//!                 dependents notified ◄── started ◄────────────┘
//!
//! stop ──► do_stop ──► (dependents drain) ──► bring_down ──► stopped
//!                                                              │ restart?
//!                                              initiate_start ◄┘
//! ```
//! Propagation flags (`prop_*`) defer cross-service effects to the
//! propagation queue; `execute_transition` advances STARTING/STOPPING
//! services whose wait conditions have cleared.

use std::time::SystemTime;

use nix::sys::signal::Signal;
use tracing::{error, info};

use crate::events::{Event, EventKind};
use crate::service::dep::{DependencyType, EdgeId, ServiceDep};
use crate::service::set::{ServiceId, ServiceSet};
use crate::service::types::{
    AutoRestartMode, ServiceFlags, ServiceState, StoppedReason,
};

/// Lifecycle state common to every service variant.
pub struct Record {
    pub name: String,
    pub description: String,

    pub state: ServiceState,
    pub desired: ServiceState,

    pub auto_restart: AutoRestartMode,
    pub smooth_recovery: bool,

    // Pins
    pub pinned_stopped: bool,
    pub pinned_started: bool,
    /// A dependent transitively pins this service started.
    pub dept_pinned_started: bool,

    // Waiting flags
    pub waiting_for_deps: bool,
    pub waiting_for_console: bool,
    pub have_console: bool,
    /// Explicit activation counts one holder in `required_by`.
    pub start_explicit: bool,

    // Propagation flags, drained by the scheduler
    pub prop_require: bool,
    pub prop_release: bool,
    pub prop_failure: bool,
    pub prop_start: bool,
    pub prop_stop: bool,
    pub prop_pin_dpt: bool,

    // Start status
    pub start_failed: bool,
    pub start_skipped: bool,
    pub in_auto_restart: bool,
    pub in_user_restart: bool,
    pub force_stop: bool,

    /// Number of holders: explicit activation plus acquiring dependents.
    pub required_by: i32,

    pub depends_on: Vec<EdgeId>,
    pub dependents: Vec<EdgeId>,

    pub term_signal: Signal,
    pub stop_reason: StoppedReason,
    /// Service to start when this one finishes cleanly.
    pub chain_to: Option<String>,

    // Queue membership
    pub in_prop_queue: bool,
    pub in_transition_queue: bool,

    pub flags: ServiceFlags,

    // Boot timing
    pub start_request_time: Option<SystemTime>,
    pub started_time: Option<SystemTime>,
    pub stopped_time: Option<SystemTime>,
}

impl Record {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            state: ServiceState::Stopped,
            desired: ServiceState::Stopped,
            auto_restart: AutoRestartMode::Never,
            smooth_recovery: false,
            pinned_stopped: false,
            pinned_started: false,
            dept_pinned_started: false,
            waiting_for_deps: false,
            waiting_for_console: false,
            have_console: false,
            start_explicit: false,
            prop_require: false,
            prop_release: false,
            prop_failure: false,
            prop_start: false,
            prop_stop: false,
            prop_pin_dpt: false,
            start_failed: false,
            start_skipped: false,
            in_auto_restart: false,
            in_user_restart: false,
            force_stop: false,
            required_by: 0,
            depends_on: Vec::new(),
            dependents: Vec::new(),
            term_signal: Signal::SIGTERM,
            stop_reason: StoppedReason::Normal,
            chain_to: None,
            in_prop_queue: false,
            in_transition_queue: false,
            flags: ServiceFlags::default(),
            start_request_time: None,
            started_time: None,
            stopped_time: None,
        }
    }

    pub fn is_start_pinned(&self) -> bool {
        self.pinned_started || self.dept_pinned_started
    }

    pub fn is_stop_pinned(&self) -> bool {
        self.pinned_stopped
    }

    pub fn is_marked_active(&self) -> bool {
        self.start_explicit
    }

    /// Effectively stopped: STOPPED, or STARTING but still waiting on deps.
    pub fn is_fundamentally_stopped(&self) -> bool {
        self.state == ServiceState::Stopped
            || (self.state == ServiceState::Starting && self.waiting_for_deps)
    }

    /// A STOPPING service can swing back to STARTED while it is only
    /// waiting for dependents and has not been force-stopped.
    pub fn can_interrupt_stop(&self) -> bool {
        self.waiting_for_deps && !self.force_stop
    }

    /// Time from start request to reaching STARTED, zero if not started.
    pub fn startup_duration(&self) -> std::time::Duration {
        match (self.start_request_time, self.started_time) {
            (Some(req), Some(started)) => {
                started.duration_since(req).unwrap_or_default()
            }
            _ => std::time::Duration::ZERO,
        }
    }
}

impl ServiceSet {
    fn notify(&self, id: ServiceId, kind: EventKind) {
        self.bus
            .publish(Event::new(kind).with_service(self.rec(id).name.clone()));
    }

    // ---- External operations ----

    /// Marks the service explicitly started and initiates the start.
    pub fn start(&mut self, id: ServiceId) {
        if self.rec(id).pinned_stopped {
            return;
        }
        if !self.rec(id).start_explicit {
            let rec = self.rec_mut(id);
            rec.required_by += 1;
            rec.start_explicit = true;
        }
        self.do_start(id);
    }

    /// Removes explicit activation; stops the service when `bring_down` is
    /// set or no holders remain.
    pub fn stop(&mut self, id: ServiceId, mut bring_down: bool) {
        if self.rec(id).start_explicit {
            let rec = self.rec_mut(id);
            rec.start_explicit = false;
            rec.required_by -= 1;
        }

        if bring_down || self.rec(id).required_by == 0 {
            self.rec_mut(id).desired = ServiceState::Stopped;
        }

        if self.rec(id).is_start_pinned() {
            return;
        }

        if self.rec(id).required_by == 0 {
            bring_down = true;
            {
                let rec = self.rec_mut(id);
                rec.prop_release = !rec.prop_require;
            }
            if self.rec(id).prop_release {
                self.add_prop_queue(id);
            }
        }

        if bring_down && self.rec(id).state != ServiceState::Stopped {
            self.rec_mut(id).stop_reason = StoppedReason::Normal;
            self.do_stop(id, false);
        }
    }

    /// Restarts a STARTED service. Returns true if a restart was issued.
    pub fn restart(&mut self, id: ServiceId) -> bool {
        if self.rec(id).state == ServiceState::Started {
            let rec = self.rec_mut(id);
            rec.stop_reason = StoppedReason::Normal;
            rec.force_stop = true;
            self.do_stop(id, true);
            return true;
        }
        false
    }

    /// Marks this service and (via propagation) its dependents for forced stop.
    pub fn forced_stop(&mut self, id: ServiceId) {
        if self.rec(id).state != ServiceState::Stopped {
            self.rec_mut(id).force_stop = true;
            if !self.rec(id).is_start_pinned() {
                self.rec_mut(id).prop_stop = true;
                self.add_prop_queue(id);
            }
        }
    }

    /// Forces the service to stop with no possibility of restart.
    pub fn unrecoverable_stop(&mut self, id: ServiceId) {
        self.rec_mut(id).desired = ServiceState::Stopped;
        self.forced_stop(id);
    }

    // ---- Pinning ----

    pub fn pin_start(&mut self, id: ServiceId) {
        if self.rec(id).pinned_started {
            return;
        }
        if !self.rec(id).dept_pinned_started {
            for eid in self.rec(id).depends_on.clone() {
                if self.edge(eid).is_hard() {
                    let to = self.edge(eid).to;
                    if !self.rec(to).dept_pinned_started {
                        self.rec_mut(to).prop_pin_dpt = true;
                        self.add_prop_queue(to);
                    }
                }
            }
        }
        self.rec_mut(id).pinned_started = true;
    }

    pub fn pin_stop(&mut self, id: ServiceId) {
        self.rec_mut(id).pinned_stopped = true;
    }

    /// Removes both pins, applying any deferred stop.
    pub fn unpin(&mut self, id: ServiceId) {
        if self.rec(id).pinned_started {
            self.rec_mut(id).pinned_started = false;

            if self.rec(id).dept_pinned_started {
                return;
            }

            for eid in self.rec(id).depends_on.clone() {
                if self.edge(eid).is_hard() {
                    let to = self.edge(eid).to;
                    if self.rec(to).dept_pinned_started {
                        self.rec_mut(to).prop_pin_dpt = true;
                        self.add_prop_queue(to);
                    }
                }
            }

            if self.rec(id).state == ServiceState::Started {
                if self.rec(id).required_by == 0 {
                    self.rec_mut(id).prop_release = true;
                    self.add_prop_queue(id);
                }
                if self.rec(id).desired == ServiceState::Stopped || self.rec(id).force_stop {
                    self.do_stop(id, false);
                    self.process_queues();
                }
            }
        }
        if self.rec(id).pinned_stopped {
            self.rec_mut(id).pinned_stopped = false;
        }
    }

    // ---- Reference counting ----

    /// Adds a holder; the first holder triggers a start.
    pub(crate) fn require(&mut self, id: ServiceId) {
        self.rec_mut(id).required_by += 1;
        if self.rec(id).required_by == 1 {
            let state = self.rec(id).state;
            if state != ServiceState::Starting && state != ServiceState::Started {
                self.rec_mut(id).prop_start = true;
                self.add_prop_queue(id);
            }
        }
    }

    /// Drops a holder; the last holder's departure stops the service.
    pub(crate) fn release(&mut self, id: ServiceId, issue_stop: bool) {
        self.rec_mut(id).required_by -= 1;
        if self.rec(id).required_by != 0 {
            return;
        }

        if self.rec(id).state == ServiceState::Stopping
            && self.rec(id).desired == ServiceState::Started
            && !self.rec(id).is_start_pinned()
        {
            self.notify(id, EventKind::StartCancelled);
        }
        self.rec_mut(id).desired = ServiceState::Stopped;

        if self.rec(id).is_start_pinned() {
            return;
        }

        {
            let rec = self.rec_mut(id);
            rec.prop_release = !rec.prop_require;
            rec.prop_require = false;
        }
        if self.rec(id).prop_release {
            self.add_prop_queue(id);
        }

        let state = self.rec(id).state;
        if state != ServiceState::Stopped && state != ServiceState::Stopping && issue_stop {
            self.rec_mut(id).stop_reason = StoppedReason::Normal;
            self.do_stop(id, false);
        }
    }

    /// Releases every dependency acquisition this service holds.
    pub(crate) fn release_dependencies(&mut self, id: ServiceId) {
        for eid in self.rec(id).depends_on.clone() {
            if self.edge(eid).holding_acq {
                self.edge_mut(eid).holding_acq = false;
                let to = self.edge(eid).to;
                self.release(to, true);
            }
        }
    }

    // ---- Scheduler steps ----

    /// Applies and clears the pending propagation flags of one service.
    pub(crate) fn do_propagation(&mut self, id: ServiceId) {
        if self.rec(id).prop_require {
            for eid in self.rec(id).depends_on.clone() {
                if !self.edge(eid).is_only_ordering() {
                    let to = self.edge(eid).to;
                    self.require(to);
                    self.edge_mut(eid).holding_acq = true;
                }
            }
            self.rec_mut(id).prop_require = false;
        }

        if self.rec(id).prop_release {
            self.release_dependencies(id);
            self.rec_mut(id).prop_release = false;
        }

        if self.rec(id).prop_failure {
            self.rec_mut(id).prop_failure = false;
            self.rec_mut(id).stop_reason = StoppedReason::DepFailed;
            self.rec_mut(id).state = ServiceState::Stopped;
            self.failed_to_start(id, true, true);
        }

        if self.rec(id).prop_start {
            self.rec_mut(id).prop_start = false;
            self.do_start(id);
        }

        if self.rec(id).prop_stop {
            self.rec_mut(id).prop_stop = false;
            let with_restart = self.rec(id).in_user_restart;
            self.do_stop(id, with_restart);
        }

        if self.rec(id).prop_pin_dpt {
            self.rec_mut(id).prop_pin_dpt = false;
            let mut dept_pin = false;
            for &eid in &self.rec(id).dependents {
                let edge = self.edge(eid);
                if edge.is_hard() && self.rec(edge.from).is_start_pinned() {
                    dept_pin = true;
                    break;
                }
            }
            if dept_pin != self.rec(id).dept_pinned_started {
                self.rec_mut(id).dept_pinned_started = dept_pin;
                for eid in self.rec(id).depends_on.clone() {
                    if self.edge(eid).is_hard() {
                        let to = self.edge(eid).to;
                        if self.rec(to).dept_pinned_started != dept_pin {
                            self.rec_mut(to).prop_pin_dpt = true;
                            self.add_prop_queue(to);
                        }
                    }
                }

                let pin_dropped = {
                    let rec = self.rec(id);
                    !rec.dept_pinned_started
                        && !rec.pinned_started
                        && (rec.desired == ServiceState::Stopped || rec.force_stop)
                        && rec.state == ServiceState::Started
                };
                if pin_dropped {
                    self.do_stop(id, false);
                }
            }
        }
    }

    /// Advances one STARTING or STOPPING service whose wait has cleared.
    pub(crate) fn execute_transition(&mut self, id: ServiceId) {
        match self.rec(id).state {
            ServiceState::Starting => {
                if self.check_deps_started(id) {
                    self.rec_mut(id).waiting_for_deps = false;
                    self.all_deps_started(id);
                }
            }
            ServiceState::Stopping => {
                if self.stop_check_dependents(id) {
                    self.rec_mut(id).waiting_for_deps = false;
                    self.bring_down(id);
                }
            }
            _ => {}
        }
    }

    // ---- Start path ----

    pub(crate) fn do_start(&mut self, id: ServiceId) {
        let was_active = self.rec(id).state != ServiceState::Stopped;

        if !was_active {
            self.rec_mut(id).start_request_time = Some(SystemTime::now());
        }

        self.rec_mut(id).desired = ServiceState::Started;

        if self.rec(id).pinned_stopped {
            if !was_active {
                self.failed_to_start(id, false, false);
            }
            return;
        }

        // First activation re-attaches soft dependents that are running.
        if !was_active {
            for eid in self.rec(id).dependents.clone() {
                let edge = self.edge(eid);
                if !edge.is_hard() && !edge.holding_acq {
                    let dept_state = self.rec(edge.from).state;
                    if dept_state == ServiceState::Started || dept_state == ServiceState::Starting
                    {
                        self.edge_mut(eid).holding_acq = true;
                        self.rec_mut(id).required_by += 1;
                    }
                }
            }
        }

        if was_active {
            if self.rec(id).state != ServiceState::Stopping {
                return;
            }
            if !self.rec(id).can_interrupt_stop() {
                return;
            }
            self.notify(id, EventKind::StopCancelled);
        } else {
            self.service_active();
            {
                let rec = self.rec_mut(id);
                rec.prop_require = !rec.prop_release;
                rec.prop_release = false;
            }
            if self.rec(id).prop_require {
                self.add_prop_queue(id);
            }
        }

        self.initiate_start(id);
    }

    pub(crate) fn initiate_start(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        rec.start_failed = false;
        rec.start_skipped = false;
        rec.state = ServiceState::Starting;
        rec.waiting_for_deps = true;

        if self.start_check_dependencies(id) {
            self.add_transition_queue(id);
        }
    }

    /// Marks `waiting_on` on unsatisfied edges. Returns true when nothing
    /// is waited on.
    fn start_check_dependencies(&mut self, id: ServiceId) -> bool {
        let mut all_started = true;

        for eid in self.rec(id).depends_on.clone() {
            let to = self.edge(eid).to;
            let to_state = self.rec(to).state;
            if self.edge(eid).is_only_ordering() && to_state != ServiceState::Starting {
                continue;
            }
            if to_state != ServiceState::Started {
                self.edge_mut(eid).waiting_on = true;
                all_started = false;
            }
        }

        // Ordering-only dependents that are STARTING must finish first.
        for eid in self.rec(id).dependents.clone() {
            let edge = self.edge(eid);
            if !edge.waiting_on && edge.is_only_ordering() {
                let from = edge.from;
                if self.rec(from).state == ServiceState::Starting {
                    self.edge_mut(eid).waiting_on = true;
                }
            }
        }

        all_started
    }

    fn check_deps_started(&self, id: ServiceId) -> bool {
        self.rec(id)
            .depends_on
            .iter()
            .all(|&eid| !self.edge(eid).waiting_on)
    }

    pub(crate) fn all_deps_started(&mut self, id: ServiceId) {
        if self.rec(id).flags.starts_on_console && !self.rec(id).have_console {
            self.queue_for_console(id);
            return;
        }

        self.rec_mut(id).waiting_for_deps = false;

        if !self.bring_up(id) {
            self.rec_mut(id).state = ServiceState::Stopping;
            self.failed_to_start(id, false, true);
        }
    }

    /// Called by a variant once the service has successfully started.
    pub(crate) fn started(&mut self, id: ServiceId) {
        if self.rec(id).have_console && !self.rec(id).flags.runs_on_console {
            self.release_console(id);
        }

        self.rec_mut(id).started_time = Some(SystemTime::now());
        let name = self.rec(id).name.clone();
        self.note_boot_ready(&name);

        info!(service = %name, "service started");
        self.rec_mut(id).state = ServiceState::Started;
        self.notify(id, EventKind::Started);

        if self.rec(id).force_stop || self.rec(id).desired == ServiceState::Stopped {
            self.do_stop(id, false);
            return;
        }

        for eid in self.rec(id).dependents.clone() {
            if self.edge(eid).waiting_on {
                let from = self.edge(eid).from;
                self.dependency_started(from);
                self.edge_mut(eid).waiting_on = false;
            }
        }
    }

    // ---- Stop path ----

    pub(crate) fn do_stop(&mut self, id: ServiceId, with_restart: bool) {
        if self.rec(id).is_start_pinned() {
            return;
        }

        self.rec_mut(id).in_auto_restart = false;
        self.rec_mut(id).in_user_restart = false;

        let mut for_restart = with_restart;
        let restart_deps = with_restart;

        if !with_restart {
            let auto_restart = self.rec(id).auto_restart;
            let wants_started = self.rec(id).desired == ServiceState::Started;
            if auto_restart == AutoRestartMode::Always && wants_started {
                for_restart = self.check_restart(id);
                self.rec_mut(id).in_auto_restart = for_restart;
            } else if auto_restart == AutoRestartMode::OnFailure && wants_started {
                let exit = self.exit_status_of(id);
                if exit.signaled() || (exit.exited() && exit.exit_code() != 0) {
                    for_restart = self.check_restart(id);
                    self.rec_mut(id).in_auto_restart = for_restart;
                }
            }
        }

        if !for_restart && self.rec(id).start_explicit {
            self.rec_mut(id).start_explicit = false;
            self.release(id, false);
        }

        let all_deps_stopped = self.stop_dependents(id, for_restart, restart_deps);

        if self.rec(id).state != ServiceState::Started {
            if self.rec(id).state == ServiceState::Starting {
                let waiting_deps = self.rec(id).waiting_for_deps;
                let waiting_console = self.rec(id).waiting_for_console;
                if !waiting_deps && !waiting_console {
                    if !self.can_interrupt_start(id) {
                        return;
                    }
                    if !self.interrupt_start(id) {
                        // Interrupt is asynchronous; wait for the exit.
                        self.notify(id, EventKind::StartCancelled);
                        return;
                    }
                } else if self.rec(id).waiting_for_console {
                    self.unqueue_console(id);
                    self.rec_mut(id).waiting_for_console = false;
                }

                self.notify(id, EventKind::StartCancelled);
            } else {
                return;
            }
        }

        self.rec_mut(id).state = ServiceState::Stopping;
        self.rec_mut(id).waiting_for_deps = !all_deps_stopped;
        if all_deps_stopped {
            self.add_transition_queue(id);
        }
    }

    /// Called by a variant once the service has actually stopped.
    pub(crate) fn stopped(&mut self, id: ServiceId) {
        self.rec_mut(id).stopped_time = Some(SystemTime::now());

        if self.rec(id).have_console {
            self.release_console(id);
        }

        self.rec_mut(id).force_stop = false;

        let will_restart =
            self.rec(id).desired == ServiceState::Started && !self.rec(id).pinned_stopped;

        // Not restarting: break soft links from dependents.
        if !will_restart {
            for eid in self.rec(id).dependents.clone() {
                if !self.edge(eid).is_hard() {
                    if self.edge(eid).waiting_on {
                        self.edge_mut(eid).waiting_on = false;
                        let from = self.edge(eid).from;
                        self.dependency_started(from);
                    }
                    if self.edge(eid).holding_acq {
                        self.edge_mut(eid).holding_acq = false;
                        self.release(id, false);
                    }
                }
            }
        }

        for eid in self.rec(id).depends_on.clone() {
            let to = self.edge(eid).to;
            self.dependent_stopped(to);
        }

        self.rec_mut(id).state = ServiceState::Stopped;

        if will_restart {
            self.initiate_start(id);
        } else {
            self.becoming_inactive(id);

            if self.rec(id).start_explicit {
                self.rec_mut(id).start_explicit = false;
                self.release(id, false);
            } else if self.rec(id).required_by == 0 {
                self.service_inactive();
            }
        }

        if !self.rec(id).start_failed {
            info!(service = %self.rec(id).name, "service stopped");

            if let Some(chain_to) = self.rec(id).chain_to.clone() {
                if !self.is_shutting_down() {
                    let exit = self.exit_status_of(id);
                    let should_chain = self.rec(id).flags.always_chain
                        || (self.rec(id).stop_reason.did_finish()
                            && exit.exited()
                            && exit.exit_code() == 0
                            && !will_restart);
                    if should_chain {
                        match self.load_service(&chain_to) {
                            Ok(chain_id) => self.start(chain_id),
                            Err(e) => {
                                error!(service = %self.rec(id).name, chain = %chain_to,
                                       error = %e, "could not chain to service");
                            }
                        }
                    }
                }
            }
        }
        self.notify(id, EventKind::Stopped);
    }

    /// Routes a start failure: cancels dependents, releases holders, and
    /// optionally completes the stop immediately.
    pub(crate) fn failed_to_start(&mut self, id: ServiceId, dep_failed: bool, immediate_stop: bool) {
        self.rec_mut(id).desired = ServiceState::Stopped;

        if self.rec(id).waiting_for_console {
            self.unqueue_console(id);
            self.rec_mut(id).waiting_for_console = false;
        }

        if self.rec(id).start_explicit {
            self.rec_mut(id).start_explicit = false;
            self.release(id, false);
        }

        for eid in self.rec(id).dependents.clone() {
            let dep_type = self.edge(eid).dep_type;
            match dep_type {
                DependencyType::Regular | DependencyType::Milestone => {
                    let from = self.edge(eid).from;
                    if self.rec(from).state == ServiceState::Starting {
                        self.rec_mut(from).prop_failure = true;
                        self.add_prop_queue(from);
                    }
                }
                _ => {
                    if self.edge(eid).waiting_on {
                        self.edge_mut(eid).waiting_on = false;
                        let from = self.edge(eid).from;
                        self.dependency_started(from);
                    }
                }
            }

            if self.edge(eid).holding_acq {
                self.edge_mut(eid).holding_acq = false;
                self.release(id, false);
            }
        }

        self.rec_mut(id).start_failed = true;
        if dep_failed {
            error!(service = %self.rec(id).name, "service failed to start (dependency failed)");
        } else {
            error!(service = %self.rec(id).name, "service failed to start");
        }
        self.notify(id, EventKind::StartFailed);
        self.rec_mut(id).pinned_started = false;

        if immediate_stop {
            self.stopped(id);
        }
    }

    fn dependency_started(&mut self, id: ServiceId) {
        let rec = self.rec(id);
        if (rec.state == ServiceState::Starting || rec.state == ServiceState::Started)
            && rec.waiting_for_deps
        {
            self.add_transition_queue(id);
        }
    }

    fn dependent_stopped(&mut self, id: ServiceId) {
        let rec = self.rec(id);
        if rec.state == ServiceState::Stopping && rec.waiting_for_deps {
            self.add_transition_queue(id);
        }
    }

    /// True when no hard dependent still holds an acquisition.
    fn stop_check_dependents(&self, id: ServiceId) -> bool {
        !self.rec(id).dependents.iter().any(|&eid| {
            let edge = self.edge(eid);
            edge.is_hard() && edge.holding_acq && !edge.waiting_on
        })
    }

    /// Pushes dependents into their stop (or restart) path. Returns true
    /// when every hard dependent is already fundamentally stopped.
    fn stop_dependents(&mut self, id: ServiceId, for_restart: bool, restart_deps: bool) -> bool {
        let mut all_stopped = true;

        for eid in self.rec(id).dependents.clone() {
            if self.edge(eid).is_hard() {
                let from = self.edge(eid).from;

                if !self.rec(from).is_fundamentally_stopped() {
                    all_stopped = false;
                }

                if self.rec(id).force_stop {
                    if self.rec(id).desired == ServiceState::Stopped {
                        self.rec_mut(from).stop_reason = StoppedReason::DepFailed;
                        self.rec_mut(from).desired = ServiceState::Stopped;
                    }
                    self.forced_stop(from);
                }

                if self.rec(from).state != ServiceState::Stopped {
                    if self.rec(id).desired == ServiceState::Stopped {
                        if self.rec(from).desired != ServiceState::Stopped {
                            self.rec_mut(from).desired = ServiceState::Stopped;
                            if self.rec(from).start_explicit {
                                self.rec_mut(from).start_explicit = false;
                                self.release(from, true);
                            }
                            self.rec_mut(from).prop_stop = true;
                            self.add_prop_queue(from);
                        }
                    } else if restart_deps && self.rec(from).state != ServiceState::Stopping {
                        self.rec_mut(from).stop_reason = StoppedReason::DepRestart;
                        self.rec_mut(from).in_user_restart = true;
                        self.rec_mut(from).prop_stop = true;
                        self.add_prop_queue(from);
                    }
                }
            } else if !for_restart {
                // Soft dependency: break the link.
                if self.edge(eid).waiting_on {
                    self.edge_mut(eid).waiting_on = false;
                    let from = self.edge(eid).from;
                    self.dependency_started(from);
                }
                if self.edge(eid).holding_acq {
                    self.edge_mut(eid).holding_acq = false;
                    self.release(id, false);
                }
            }
        }

        all_stopped
    }

    // ---- Console ----

    fn queue_for_console(&mut self, id: ServiceId) {
        self.rec_mut(id).waiting_for_console = true;
        self.append_console_queue(id);
    }

    pub(crate) fn release_console(&mut self, id: ServiceId) {
        self.rec_mut(id).have_console = false;
        self.console_released(id);
    }

    /// Called when the console becomes available to a queued service.
    pub(crate) fn acquired_console(&mut self, id: ServiceId) {
        self.rec_mut(id).waiting_for_console = false;
        self.rec_mut(id).have_console = true;

        if self.rec(id).state != ServiceState::Starting {
            self.release_console(id);
        } else if self.check_deps_started(id) {
            self.all_deps_started(id);
        } else {
            self.release_console(id);
        }
    }

    // ---- Edge maintenance ----

    /// Adds a dependency edge from `from` to `to`.
    ///
    /// An active dependent acquires non-ordering targets immediately so the
    /// `required_by` invariant holds for edges added at runtime.
    pub fn add_dep(&mut self, from: ServiceId, to: ServiceId, dep_type: DependencyType) -> EdgeId {
        let eid = self.alloc_edge(ServiceDep::new(from, to, dep_type));
        self.rec_mut(from).depends_on.push(eid);
        self.rec_mut(to).dependents.push(eid);

        if dep_type != DependencyType::Before && dep_type != DependencyType::After {
            let to_state = self.rec(to).state;
            if dep_type == DependencyType::Regular
                || to_state == ServiceState::Started
                || to_state == ServiceState::Starting
            {
                let from_state = self.rec(from).state;
                if from_state == ServiceState::Starting || from_state == ServiceState::Started {
                    self.require(to);
                    self.edge_mut(eid).holding_acq = true;
                }
            }
        }

        eid
    }

    /// Removes the edge of the given type to the given target, if present.
    pub fn rm_dep(&mut self, from: ServiceId, to: ServiceId, dep_type: DependencyType) -> bool {
        let found = self.rec(from).depends_on.iter().copied().find(|&eid| {
            let edge = self.edge(eid);
            edge.to == to && edge.dep_type == dep_type
        });
        match found {
            Some(eid) => {
                self.rm_dep_edge(eid);
                true
            }
            None => false,
        }
    }

    pub(crate) fn rm_dep_edge(&mut self, eid: EdgeId) {
        let (from, to, holding) = {
            let edge = self.edge(eid);
            (edge.from, edge.to, edge.holding_acq)
        };

        self.rec_mut(from).depends_on.retain(|&e| e != eid);
        self.rec_mut(to).dependents.retain(|&e| e != eid);

        if holding {
            self.release(to, true);
        }

        self.free_edge(eid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceKind;

    fn internal(set: &mut ServiceSet, name: &str) -> ServiceId {
        set.add_service(name, ServiceKind::Internal)
    }

    fn drained(set: &mut ServiceSet) {
        set.process_queues();
        set.check_invariants();
    }

    #[test]
    fn internal_start_stop() {
        let mut set = ServiceSet::new_detached();
        let svc = internal(&mut set, "test-svc");

        set.start_service(svc);
        set.check_invariants();
        assert_eq!(set.rec(svc).state, ServiceState::Started);
        assert!(set.rec(svc).is_marked_active());

        set.stop_service(svc);
        set.check_invariants();
        assert_eq!(set.rec(svc).state, ServiceState::Stopped);
        assert!(!set.rec(svc).is_marked_active());
    }

    #[test]
    fn regular_dep_started_and_released() {
        let mut set = ServiceSet::new_detached();
        let dep = internal(&mut set, "dep-svc");
        let main = internal(&mut set, "main-svc");
        set.add_dep(main, dep, DependencyType::Regular);

        set.start_service(main);
        set.check_invariants();
        assert_eq!(set.rec(dep).state, ServiceState::Started);
        assert_eq!(set.rec(main).state, ServiceState::Started);

        set.stop_service(main);
        set.check_invariants();
        assert_eq!(set.rec(main).state, ServiceState::Stopped);
        assert_eq!(set.rec(dep).state, ServiceState::Stopped);
    }

    #[test]
    fn linear_chain_start_order() {
        // c depends on b depends on a; starting c starts all three
        // with a before b before c.
        let mut set = ServiceSet::new_detached();
        let a = internal(&mut set, "a");
        let b = internal(&mut set, "b");
        let c = internal(&mut set, "c");
        set.add_dep(b, a, DependencyType::Regular);
        set.add_dep(c, b, DependencyType::Regular);

        set.start_service(c);
        set.check_invariants();
        for id in [a, b, c] {
            assert_eq!(set.rec(id).state, ServiceState::Started);
        }
        let ta = set.rec(a).started_time.unwrap();
        let tb = set.rec(b).started_time.unwrap();
        let tc = set.rec(c).started_time.unwrap();
        assert!(ta <= tb && tb <= tc);
    }

    #[test]
    fn shared_hard_dep_refcounting() {
        // dep stays up while either x or y needs it.
        let mut set = ServiceSet::new_detached();
        let dep = internal(&mut set, "dep");
        let x = internal(&mut set, "x");
        let y = internal(&mut set, "y");
        set.add_dep(x, dep, DependencyType::Regular);
        set.add_dep(y, dep, DependencyType::Regular);

        set.start_service(x);
        set.start_service(y);
        set.check_invariants();
        assert_eq!(set.rec(dep).state, ServiceState::Started);

        set.stop_service(x);
        set.check_invariants();
        assert_eq!(set.rec(x).state, ServiceState::Stopped);
        assert_eq!(set.rec(dep).state, ServiceState::Started);

        set.stop_service(y);
        set.check_invariants();
        assert_eq!(set.rec(y).state, ServiceState::Stopped);
        assert_eq!(set.rec(dep).state, ServiceState::Stopped);
    }

    #[test]
    fn soft_dep_failure_does_not_cascade() {
        let mut set = ServiceSet::new_detached();
        let dep = internal(&mut set, "soft-dep");
        let main = internal(&mut set, "main-svc");
        set.add_dep(main, dep, DependencyType::Soft);

        set.pin_stop(dep);
        set.start_service(main);
        set.check_invariants();
        assert_eq!(set.rec(main).state, ServiceState::Started);
    }

    #[test]
    fn soft_dep_stop_does_not_propagate() {
        let mut set = ServiceSet::new_detached();
        let dep = internal(&mut set, "soft-dep");
        let main = internal(&mut set, "main-svc");
        set.add_dep(main, dep, DependencyType::Soft);

        set.start_service(main);
        assert_eq!(set.rec(dep).state, ServiceState::Started);
        assert_eq!(set.rec(main).state, ServiceState::Started);

        set.stop_service(dep);
        set.check_invariants();
        assert_eq!(set.rec(dep).state, ServiceState::Stopped);
        assert_eq!(set.rec(main).state, ServiceState::Started);
    }

    #[test]
    fn waits_for_failure_does_not_cascade() {
        let mut set = ServiceSet::new_detached();
        let dep = internal(&mut set, "wf-dep");
        let main = internal(&mut set, "main-svc");
        set.add_dep(main, dep, DependencyType::WaitsFor);

        set.pin_stop(dep);
        set.start_service(main);
        set.check_invariants();
        assert_eq!(set.rec(main).state, ServiceState::Started);
    }

    #[test]
    fn regular_dep_failure_cascades() {
        let mut set = ServiceSet::new_detached();
        let dep = internal(&mut set, "reg-dep");
        let main = internal(&mut set, "main-svc");
        set.add_dep(main, dep, DependencyType::Regular);

        set.pin_stop(dep);
        set.start_service(main);
        set.check_invariants();
        assert_eq!(set.rec(main).state, ServiceState::Stopped);
        assert!(set.rec(main).start_failed);
        assert_eq!(set.rec(main).stop_reason, StoppedReason::DepFailed);
    }

    #[test]
    fn milestone_failure_cascades_but_stop_after_start_does_not() {
        let mut set = ServiceSet::new_detached();

        // Failure while waiting cascades.
        let dep1 = internal(&mut set, "ms-dep1");
        let main1 = internal(&mut set, "main1");
        set.add_dep(main1, dep1, DependencyType::Milestone);
        set.pin_stop(dep1);
        set.start_service(main1);
        assert_eq!(set.rec(main1).state, ServiceState::Stopped);
        assert!(set.rec(main1).start_failed);

        // After a successful start, stopping the target leaves the
        // dependent running.
        let dep2 = internal(&mut set, "ms-dep2");
        let main2 = internal(&mut set, "main2");
        set.add_dep(main2, dep2, DependencyType::Milestone);
        set.start_service(main2);
        assert_eq!(set.rec(main2).state, ServiceState::Started);
        assert_eq!(set.rec(dep2).state, ServiceState::Started);

        set.stop_service(dep2);
        set.check_invariants();
        assert_eq!(set.rec(dep2).state, ServiceState::Stopped);
        assert_eq!(set.rec(main2).state, ServiceState::Started);
    }

    #[test]
    fn before_edge_orders_start() {
        // "a before b": starting both concurrently yields
        // a.started_time <= b.started_time. The ordering edge is stored on
        // b, which waits for a.
        let mut set = ServiceSet::new_detached();
        let a = internal(&mut set, "a");
        let b = internal(&mut set, "b");
        let parent = internal(&mut set, "parent");
        set.add_dep(b, a, DependencyType::Before);
        set.add_dep(parent, a, DependencyType::Regular);
        set.add_dep(parent, b, DependencyType::Regular);

        set.start_service(parent);
        set.check_invariants();
        assert_eq!(set.rec(a).state, ServiceState::Started);
        assert_eq!(set.rec(b).state, ServiceState::Started);
        let ta = set.rec(a).started_time.unwrap();
        let tb = set.rec(b).started_time.unwrap();
        assert!(ta <= tb);

        set.stop_service(parent);
        set.check_invariants();
        assert_eq!(set.rec(a).state, ServiceState::Stopped);
        assert_eq!(set.rec(b).state, ServiceState::Stopped);
    }

    #[test]
    fn before_edge_orders_start_regardless_of_request_order() {
        // Even when b is pulled up first, it waits for a.
        let mut set = ServiceSet::new_detached();
        let b = internal(&mut set, "b");
        let a = internal(&mut set, "a");
        let parent = internal(&mut set, "parent");
        set.add_dep(b, a, DependencyType::Before);
        set.add_dep(parent, b, DependencyType::Regular);
        set.add_dep(parent, a, DependencyType::Regular);

        set.start_service(parent);
        set.check_invariants();
        let ta = set.rec(a).started_time.unwrap();
        let tb = set.rec(b).started_time.unwrap();
        assert!(ta <= tb, "a must reach STARTED before b");
    }

    #[test]
    fn after_edge_does_not_couple_lifecycles() {
        // Ordering edges never touch required_by; stopping the target
        // leaves the dependent running.
        let mut set = ServiceSet::new_detached();
        let a = internal(&mut set, "a");
        let b = internal(&mut set, "b");
        set.add_dep(a, b, DependencyType::After);

        set.start_service(b);
        let rb_before = set.rec(b).required_by;
        set.start_service(a);
        set.check_invariants();
        assert_eq!(set.rec(b).required_by, rb_before);
        assert_eq!(set.rec(a).state, ServiceState::Started);

        set.stop_service(b);
        set.check_invariants();
        assert_eq!(set.rec(b).state, ServiceState::Stopped);
        assert_eq!(set.rec(a).state, ServiceState::Started);
    }

    #[test]
    fn pin_started_defers_stop_until_unpin() {
        // Pinning started defers the stop; unpinning applies it exactly once.
        let mut set = ServiceSet::new_detached();
        let svc = internal(&mut set, "pinned");

        set.start_service(svc);
        set.pin_start(svc);
        set.stop_service(svc);
        set.check_invariants();
        assert_eq!(set.rec(svc).state, ServiceState::Started);
        assert_eq!(set.rec(svc).desired, ServiceState::Stopped);

        set.unpin(svc);
        set.process_queues();
        set.check_invariants();
        assert_eq!(set.rec(svc).state, ServiceState::Stopped);
    }

    #[test]
    fn pin_stopped_blocks_start() {
        let mut set = ServiceSet::new_detached();
        let svc = internal(&mut set, "held-down");
        set.pin_stop(svc);
        set.start_service(svc);
        set.check_invariants();
        assert_eq!(set.rec(svc).state, ServiceState::Stopped);
    }

    #[test]
    fn dept_pin_propagates_to_hard_deps() {
        let mut set = ServiceSet::new_detached();
        let dep = internal(&mut set, "dep");
        let main = internal(&mut set, "main");
        set.add_dep(main, dep, DependencyType::Regular);

        set.start_service(main);
        set.pin_start(main);
        drained(&mut set);
        assert!(set.rec(dep).dept_pinned_started);

        // Stop cascade is blocked by the transitive pin.
        set.stop_service(dep);
        assert_eq!(set.rec(dep).state, ServiceState::Started);

        set.unpin(main);
        drained(&mut set);
        assert!(!set.rec(dep).dept_pinned_started);
    }

    #[test]
    fn restart_returns_to_started() {
        let mut set = ServiceSet::new_detached();
        let svc = internal(&mut set, "restartable");
        set.start_service(svc);
        assert!(set.restart(svc));
        set.process_queues();
        set.check_invariants();
        assert_eq!(set.rec(svc).state, ServiceState::Started);
    }

    #[test]
    fn restart_propagates_dep_restart_to_dependents() {
        let mut set = ServiceSet::new_detached();
        let dep = internal(&mut set, "base");
        let main = internal(&mut set, "consumer");
        set.add_dep(main, dep, DependencyType::Regular);
        set.start_service(main);

        assert!(set.restart(dep));
        set.process_queues();
        set.check_invariants();
        assert_eq!(set.rec(dep).state, ServiceState::Started);
        assert_eq!(set.rec(main).state, ServiceState::Started);
    }

    #[test]
    fn rm_dep_releases_acquisition() {
        let mut set = ServiceSet::new_detached();
        let dep = internal(&mut set, "dep");
        let main = internal(&mut set, "main");
        set.add_dep(main, dep, DependencyType::Regular);
        set.start_service(main);
        assert_eq!(set.rec(dep).required_by, 1);

        assert!(set.rm_dep(main, dep, DependencyType::Regular));
        set.process_queues();
        set.check_invariants();
        assert_eq!(set.rec(dep).state, ServiceState::Stopped);
    }

    #[test]
    fn stop_all_services_drains_everything() {
        let mut set = ServiceSet::new_detached();
        let a = internal(&mut set, "a");
        let b = internal(&mut set, "b");
        set.add_dep(b, a, DependencyType::Regular);
        set.start_service(b);
        assert_eq!(set.count_active_services(), 2);

        set.stop_all_services(crate::ShutdownType::Halt);
        set.check_invariants();
        assert!(set.is_shutting_down());
        assert_eq!(set.count_active_services(), 0);
        assert_eq!(set.rec(a).state, ServiceState::Stopped);
        assert_eq!(set.rec(b).state, ServiceState::Stopped);
    }

    #[test]
    fn triggered_waits_for_trigger() {
        // Without a trigger the service holds in STARTING.
        let mut set = ServiceSet::new_detached();
        let svc = set.add_service("trig", ServiceKind::Triggered { is_triggered: false });

        set.start_service(svc);
        set.check_invariants();
        assert_eq!(set.rec(svc).state, ServiceState::Starting);

        set.set_trigger(svc, true);
        set.process_queues();
        set.check_invariants();
        assert_eq!(set.rec(svc).state, ServiceState::Started);
    }

    #[test]
    fn pre_triggered_starts_directly() {
        let mut set = ServiceSet::new_detached();
        let svc = set.add_service("trig", ServiceKind::Triggered { is_triggered: true });
        set.start_service(svc);
        set.check_invariants();
        assert_eq!(set.rec(svc).state, ServiceState::Started);
    }

    #[test]
    fn console_is_serialized_between_services() {
        let mut set = ServiceSet::new_detached();
        let a = internal(&mut set, "console-a");
        let b = internal(&mut set, "console-b");
        for id in [a, b] {
            set.rec_mut(id).flags.starts_on_console = true;
            set.rec_mut(id).flags.runs_on_console = true;
        }

        set.start_service(a);
        set.check_invariants();
        assert_eq!(set.rec(a).state, ServiceState::Started);
        assert!(set.rec(a).have_console);

        // The console is held, so the second service waits for it.
        set.start_service(b);
        set.check_invariants();
        assert_eq!(set.rec(b).state, ServiceState::Starting);
        assert!(set.rec(b).waiting_for_console);

        // Releasing the console hands it to the queued service.
        set.stop_service(a);
        set.check_invariants();
        assert_eq!(set.rec(b).state, ServiceState::Started);
        assert!(set.rec(b).have_console);
    }

    #[test]
    fn console_released_after_start_when_not_running_on_it() {
        let mut set = ServiceSet::new_detached();
        let svc = internal(&mut set, "console-starter");
        set.rec_mut(svc).flags.starts_on_console = true;

        set.start_service(svc);
        set.check_invariants();
        assert_eq!(set.rec(svc).state, ServiceState::Started);
        assert!(!set.rec(svc).have_console);
    }

    #[test]
    fn chain_to_starts_next_service() {
        let mut set = ServiceSet::new_detached();
        let first = internal(&mut set, "first");
        let _second = internal(&mut set, "second");
        set.rec_mut(first).chain_to = Some("second".to_string());
        set.rec_mut(first).flags.always_chain = true;

        set.start_service(first);
        set.stop_service(first);
        set.check_invariants();
        let second = set.find_service("second", false).unwrap();
        assert_eq!(set.rec(second).state, ServiceState::Started);
    }
}
