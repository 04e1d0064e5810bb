//! # The service set: record pool, edge pool, and the two-phase scheduler.
//!
//! [`ServiceSet`] owns every loaded service and every dependency edge.
//! Services and edges are identified by pool indices ([`ServiceId`],
//! [`EdgeId`]), which both endpoints of an edge share, so dependency flags
//! are observed consistently from either side.
//!
//! ## Two-phase queue drain
//! ```text
//! while prop_queue or transition_queue:
//!     while prop_queue:            # propagation runs to quiescence first
//!         pop head, do_propagation
//!     if transition_queue:
//!         pop head, execute_transition   # then exactly one transition step
//! ```
//! The separation guarantees that a failure cascade settles before any
//! transition step can observe half-propagated state. The `in_*_queue`
//! flags make each queue a set with FIFO order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Weak;
use std::time::{Duration, SystemTime};

use tracing::info;

use crate::events::Bus;
use crate::service::dep::{EdgeId, ServiceDep};
use crate::service::record::Record;
use crate::service::types::{ServiceState, ServiceType, ShutdownType};
use crate::service::ServiceKind;
use crate::supervisor::Supervisor;

/// Identifier of a service in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub(crate) usize);

/// A pooled service: common record plus variant payload.
pub struct Service {
    pub record: Record,
    pub kind: ServiceKind,
}

/// Owns all services, their edges, and the scheduling queues.
pub struct ServiceSet {
    services: Vec<Service>,
    edges: Vec<Option<ServiceDep>>,
    free_edges: Vec<usize>,
    by_name: HashMap<String, ServiceId>,

    active_services: i32,
    restart_enabled: bool,
    shutdown_type: ShutdownType,

    prop_queue: VecDeque<ServiceId>,
    transition_queue: VecDeque<ServiceId>,
    console_queue: VecDeque<ServiceId>,
    console_holder: Option<ServiceId>,

    /// Service description directories, searched in order.
    pub(crate) service_dirs: Vec<PathBuf>,
    /// Names with a load in progress, for cycle detection.
    pub(crate) loading: HashSet<String>,

    pub(crate) bus: Bus,
    /// Backpointer for spawning monitor tasks.
    pub(crate) shared: Weak<Supervisor>,

    // Boot timing
    boot_start_time: Option<SystemTime>,
    boot_ready_time: Option<SystemTime>,
    boot_service_name: String,
    kernel_uptime: Duration,
}

impl ServiceSet {
    /// Creates a set that is not attached to a running supervisor.
    ///
    /// Process-less variants are fully functional; process-backed variants
    /// need a [`Supervisor`] to host their monitor tasks.
    pub fn new_detached() -> Self {
        Self::new(Bus::default(), Weak::new(), Vec::new())
    }

    pub(crate) fn new(bus: Bus, shared: Weak<Supervisor>, service_dirs: Vec<PathBuf>) -> Self {
        Self {
            services: Vec::new(),
            edges: Vec::new(),
            free_edges: Vec::new(),
            by_name: HashMap::new(),
            active_services: 0,
            restart_enabled: true,
            shutdown_type: ShutdownType::None,
            prop_queue: VecDeque::new(),
            transition_queue: VecDeque::new(),
            console_queue: VecDeque::new(),
            console_holder: None,
            service_dirs,
            loading: HashSet::new(),
            bus,
            shared,
            boot_start_time: None,
            boot_ready_time: None,
            boot_service_name: String::new(),
            kernel_uptime: Duration::ZERO,
        }
    }

    // ---- Pool access ----

    pub fn svc(&self, id: ServiceId) -> &Service {
        &self.services[id.0]
    }

    pub fn svc_mut(&mut self, id: ServiceId) -> &mut Service {
        &mut self.services[id.0]
    }

    pub fn rec(&self, id: ServiceId) -> &Record {
        &self.services[id.0].record
    }

    pub fn rec_mut(&mut self, id: ServiceId) -> &mut Record {
        &mut self.services[id.0].record
    }

    pub fn edge(&self, id: EdgeId) -> &ServiceDep {
        self.edges[id.0].as_ref().expect("stale edge id")
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut ServiceDep {
        self.edges[id.0].as_mut().expect("stale edge id")
    }

    pub(crate) fn alloc_edge(&mut self, dep: ServiceDep) -> EdgeId {
        if let Some(slot) = self.free_edges.pop() {
            self.edges[slot] = Some(dep);
            EdgeId(slot)
        } else {
            self.edges.push(Some(dep));
            EdgeId(self.edges.len() - 1)
        }
    }

    pub(crate) fn free_edge(&mut self, id: EdgeId) {
        self.edges[id.0] = None;
        self.free_edges.push(id.0);
    }

    // ---- Registration ----

    /// Adds a service to the set and returns its id.
    pub fn add_service(&mut self, name: &str, kind: ServiceKind) -> ServiceId {
        let id = ServiceId(self.services.len());
        self.services.push(Service {
            record: Record::new(name),
            kind,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Locates a service by name. Placeholders are excluded unless requested.
    pub fn find_service(&self, name: &str, find_placeholders: bool) -> Option<ServiceId> {
        let id = *self.by_name.get(name)?;
        if !find_placeholders && self.svc(id).kind.service_type() == ServiceType::Placeholder {
            return None;
        }
        Some(id)
    }

    /// Removes the name binding of a service that failed to load.
    pub(crate) fn unregister(&mut self, id: ServiceId) {
        let name = self.rec(id).name.clone();
        self.by_name.remove(&name);
    }

    pub fn service_type(&self, id: ServiceId) -> ServiceType {
        self.svc(id).kind.service_type()
    }

    /// All registered service ids, in pool order.
    pub fn all_services(&self) -> Vec<ServiceId> {
        (0..self.services.len())
            .map(ServiceId)
            .filter(|&id| self.by_name.get(&self.rec(id).name) == Some(&id))
            .collect()
    }

    // ---- Entry points ----

    /// Starts a service and drains the queues.
    pub fn start_service(&mut self, id: ServiceId) {
        self.start(id);
        self.process_queues();
    }

    /// Stops a service and drains the queues.
    pub fn stop_service(&mut self, id: ServiceId) {
        self.stop(id, true);
        self.process_queues();
    }

    /// Stops every service for shutdown: restarts disabled, pins removed.
    pub fn stop_all_services(&mut self, shutdown_type: ShutdownType) {
        self.restart_enabled = false;
        self.shutdown_type = shutdown_type;
        info!(%shutdown_type, "stopping all services");
        for id in self.all_services() {
            self.stop(id, false);
            self.unpin(id);
        }
        self.process_queues();
    }

    // ---- Queue management ----

    pub(crate) fn add_prop_queue(&mut self, id: ServiceId) {
        if !self.rec(id).in_prop_queue {
            self.rec_mut(id).in_prop_queue = true;
            self.prop_queue.push_back(id);
        }
    }

    pub(crate) fn add_transition_queue(&mut self, id: ServiceId) {
        if !self.rec(id).in_transition_queue {
            self.rec_mut(id).in_transition_queue = true;
            self.transition_queue.push_back(id);
        }
    }

    /// Drains both queues to a fixed point.
    ///
    /// Propagation is drained fully between any two transition steps.
    pub fn process_queues(&mut self) {
        while !self.prop_queue.is_empty() || !self.transition_queue.is_empty() {
            while let Some(id) = self.prop_queue.pop_front() {
                self.rec_mut(id).in_prop_queue = false;
                self.do_propagation(id);
            }
            if let Some(id) = self.transition_queue.pop_front() {
                self.rec_mut(id).in_transition_queue = false;
                self.execute_transition(id);
            }
        }
    }

    // ---- Console queue ----

    /// Grants the console immediately when free, otherwise queues FIFO.
    pub(crate) fn append_console_queue(&mut self, id: ServiceId) {
        if self.console_holder.is_none() && self.console_queue.is_empty() {
            self.grant_console(id);
        } else {
            self.console_queue.push_back(id);
        }
    }

    pub(crate) fn grant_console(&mut self, id: ServiceId) {
        self.console_holder = Some(id);
        self.acquired_console(id);
    }

    pub(crate) fn console_released(&mut self, id: ServiceId) {
        if self.console_holder == Some(id) {
            self.console_holder = None;
        }
        if self.console_holder.is_none() {
            if let Some(front) = self.console_queue.pop_front() {
                self.grant_console(front);
            }
        }
    }

    pub(crate) fn unqueue_console(&mut self, id: ServiceId) {
        self.console_queue.retain(|&s| s != id);
    }

    // ---- Active service tracking ----

    pub(crate) fn service_active(&mut self) {
        self.active_services += 1;
    }

    pub(crate) fn service_inactive(&mut self) {
        self.active_services -= 1;
    }

    pub fn count_active_services(&self) -> i32 {
        self.active_services
    }

    /// True once automatic restarts have been disabled by shutdown.
    pub fn is_shutting_down(&self) -> bool {
        !self.restart_enabled
    }

    pub fn shutdown_type(&self) -> ShutdownType {
        self.shutdown_type
    }

    // ---- Boot timing ----

    pub fn set_boot_start_time(&mut self, t: SystemTime) {
        self.boot_start_time = Some(t);
    }

    pub fn set_boot_service_name(&mut self, name: &str) {
        self.boot_service_name = name.to_string();
    }

    pub fn set_kernel_uptime(&mut self, d: Duration) {
        self.kernel_uptime = d;
    }

    pub fn boot_start_time(&self) -> Option<SystemTime> {
        self.boot_start_time
    }

    pub fn boot_ready_time(&self) -> Option<SystemTime> {
        self.boot_ready_time
    }

    pub fn boot_service_name(&self) -> &str {
        &self.boot_service_name
    }

    pub fn kernel_uptime(&self) -> Duration {
        self.kernel_uptime
    }

    /// Stamps boot-ready when the named boot service first reaches STARTED.
    pub(crate) fn note_boot_ready(&mut self, name: &str) {
        if !self.boot_service_name.is_empty()
            && name == self.boot_service_name
            && self.boot_ready_time.is_none()
        {
            self.boot_ready_time = Some(SystemTime::now());
        }
    }

    // ---- Invariants (exercised by tests after every drain) ----

    /// Panics if any cross-record invariant is violated.
    ///
    /// Intended to be called when the queues are empty, i.e. right after
    /// `process_queues` returns.
    pub fn check_invariants(&self) {
        for id in self.all_services() {
            let rec = self.rec(id);

            // required_by = start_explicit + dependents holding acquisitions
            let holders: i32 = rec
                .dependents
                .iter()
                .filter(|&&e| self.edge(e).holding_acq)
                .count() as i32;
            let expected = holders + if rec.start_explicit { 1 } else { 0 };
            assert_eq!(
                rec.required_by, expected,
                "service '{}': required_by {} != {} holders",
                rec.name, rec.required_by, expected
            );
            assert!(rec.required_by >= 0);

            // A STARTED service has all hard dependencies STARTED.
            if rec.state == ServiceState::Started {
                for &eid in &rec.depends_on {
                    let edge = self.edge(eid);
                    if edge.is_hard() {
                        assert_eq!(
                            self.rec(edge.to).state,
                            ServiceState::Started,
                            "service '{}': hard dependency '{}' not STARTED",
                            rec.name,
                            self.rec(edge.to).name
                        );
                    }
                }
            }

            // Queue flags agree with queue membership, exactly once.
            let in_prop = self.prop_queue.iter().filter(|&&s| s == id).count();
            let in_trans = self.transition_queue.iter().filter(|&&s| s == id).count();
            assert_eq!(in_prop, if rec.in_prop_queue { 1 } else { 0 });
            assert_eq!(in_trans, if rec.in_transition_queue { 1 } else { 0 });

            // Propagation flags are consumed by the drain.
            assert!(
                !rec.prop_require
                    && !rec.prop_release
                    && !rec.prop_failure
                    && !rec.prop_start
                    && !rec.prop_stop
                    && !rec.prop_pin_dpt,
                "service '{}': propagation flag left set after drain",
                rec.name
            );
        }
    }
}
