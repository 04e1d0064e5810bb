//! # Supervisor: the shared runtime state.
//!
//! [`Supervisor`] ties the pieces together: the mutex-guarded
//! [`ServiceSet`], the event [`Bus`], and the shutdown-request channel
//! consumed by the event loop. Control connections, signal handling, and
//! per-service monitor tasks all reach the state machine through
//! [`Supervisor::with_set`], which acquires the mutex for the duration of
//! one entry-point call. The state machine itself never blocks on I/O, so
//! the critical sections stay short.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::events::Bus;
use crate::service::set::ServiceSet;
use crate::service::types::ShutdownType;

/// Shared handle to the running supervisor.
pub struct Supervisor {
    set: Mutex<ServiceSet>,
    /// Lifecycle event bus; subscribe for state-change notifications.
    pub bus: Bus,
    shutdown_tx: mpsc::UnboundedSender<ShutdownType>,
}

impl Supervisor {
    /// Creates the supervisor and the shutdown-request receiver consumed by
    /// the event loop.
    pub fn new(
        service_dirs: Vec<PathBuf>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ShutdownType>) {
        let bus = Bus::default();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        let sup = Arc::new_cyclic(|weak| Supervisor {
            set: Mutex::new(ServiceSet::new(bus.clone(), weak.clone(), service_dirs)),
            bus,
            shutdown_tx,
        });

        (sup, shutdown_rx)
    }

    /// Runs `f` with exclusive access to the service set.
    ///
    /// This is the single entry point through which all state mutation
    /// flows; callers mutate and drain the queues before releasing.
    pub fn with_set<R>(&self, f: impl FnOnce(&mut ServiceSet) -> R) -> R {
        let mut set = self.set.lock().expect("service set poisoned");
        f(&mut set)
    }

    /// Requests a shutdown; the event loop performs it.
    pub fn request_shutdown(&self, shutdown_type: ShutdownType) {
        let _ = self.shutdown_tx.send(shutdown_type);
    }
}
