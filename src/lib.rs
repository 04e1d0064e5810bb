//! # slinit
//!
//! **slinit** is a service supervisor and optional PID 1 init system.
//!
//! It loads declarative service descriptions, resolves an inter-service
//! dependency graph, drives each service through a start/stop state machine,
//! supervises and restarts child processes, and exposes a binary control
//! protocol over a Unix domain socket for the companion `slinitctl` tool.
//!
//! | Area              | Description                                                      | Key types                                  |
//! |-------------------|------------------------------------------------------------------|--------------------------------------------|
//! | **State machine** | Per-service lifecycle with two-phase queue scheduling.           | [`ServiceSet`], [`ServiceState`]           |
//! | **Dependencies**  | Six edge semantics from hard coupling to pure ordering.          | [`DependencyType`]                         |
//! | **Supervision**   | Five service variants with timers and restart rate limiting.     | [`ServiceKind`]                            |
//! | **Control**       | Binary request/reply protocol over a local stream socket.        | [`control::Server`], [`control::protocol`] |
//! | **Shutdown**      | Orderly halt/poweroff/reboot and soft reboot when running PID 1. | [`shutdown::SystemOps`]                    |
//! | **Events**        | Broadcast bus carrying service lifecycle events.                 | [`Bus`], [`Event`], [`EventKind`]          |
//!
//! ## Architecture
//! ```text
//! slinitctl ──socket──► control::Server ──► ServiceSet (state machine)
//!                                               │ two-phase queue drain
//!            signals ──► eventloop::EventLoop ──┤
//!       child exits ──► per-service monitors ───┘
//!                                               ▼
//!                                  shutdown executor (PID 1 only)
//! ```
//!
//! All mutation of service records happens behind a single mutex acquired at
//! each entry point (control handlers, signal handlers, monitor callbacks),
//! preserving the atomicity of the scheduler drain.

pub mod config;
pub mod control;
pub mod error;
pub mod eventloop;
pub mod events;
pub mod paths;
pub mod proc;
pub mod service;
pub mod shutdown;
pub mod supervisor;

// ---- Public re-exports ----

pub use error::LoadError;
pub use events::{Bus, Event, EventKind};
pub use service::dep::DependencyType;
pub use service::set::{ServiceId, ServiceSet};
pub use service::types::{
    AutoRestartMode, LogType, ServiceState, ServiceType, ShutdownType, StoppedReason,
};
pub use service::ServiceKind;
pub use supervisor::Supervisor;
