//! # Runtime events and the broadcast bus.
//!
//! Service lifecycle notifications are delivered over a [`Bus`], a thin
//! wrapper around [`tokio::sync::broadcast`]. The state machine publishes an
//! [`Event`] synchronously from within the call that produced it; the event
//! loop and control connections subscribe.
//!
//! - [`Bus::publish`] sends an event to all subscribers (non-blocking).
//! - [`Bus::subscribe`] creates a new receiver for consuming events.

use tokio::sync::broadcast;

use crate::service::types::ShutdownType;

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Service reached STARTED.
    Started,
    /// Service reached STOPPED.
    Stopped,
    /// Service failed to start.
    StartFailed,
    /// An in-progress start was cancelled by a stop request.
    StartCancelled,
    /// An in-progress stop was cancelled by a start request.
    StopCancelled,
    /// Shutdown was requested (signal or control command).
    ShutdownRequested,
}

/// A runtime event with the service it concerns.
#[derive(Debug, Clone)]
pub struct Event {
    /// The kind of event.
    pub kind: EventKind,
    /// Name of the service, if applicable.
    pub service: Option<String>,
    /// Requested shutdown type, for [`EventKind::ShutdownRequested`].
    pub shutdown: Option<ShutdownType>,
}

impl Event {
    /// Creates a new event of the given kind.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            service: None,
            shutdown: None,
        }
    }

    /// Attaches a service name.
    pub fn with_service(mut self, name: impl Into<String>) -> Self {
        self.service = Some(name.into());
        self
    }

    /// Attaches a shutdown type.
    pub fn with_shutdown(mut self, st: ShutdownType) -> Self {
        self.shutdown = Some(st);
        self
    }
}

/// Broadcast channel for runtime events.
///
/// Wrapper over [`tokio::sync::broadcast`] providing `publish`/`subscribe`.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Errors are ignored if there are no active subscribers.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Subscribes to the bus and returns a new receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(1024)
    }
}
