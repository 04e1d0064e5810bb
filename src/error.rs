//! # Error types for service loading and control handling.
//!
//! [`LoadError`] covers everything the loader and reloader can reject:
//! missing descriptions, parse failures, dependency cycles, and forbidden
//! changes to a running service. Per-service runtime failures are not
//! errors in this sense; they are routed through the state machine
//! (`failed_to_start`) and never escape to the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading or reloading a service description.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LoadError {
    /// No description file was found in any of the service directories.
    #[error("service '{name}': description not found")]
    NotFound {
        /// The requested service name.
        name: String,
    },

    /// The description file exists but could not be read.
    #[error("service '{name}': error reading {path}: {source}")]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The description file failed to parse.
    #[error("{file}:{line}: setting '{setting}': {message} (service: {name})")]
    Parse {
        name: String,
        file: PathBuf,
        line: usize,
        setting: String,
        message: String,
    },

    /// A dependency chain leads back to a service already being loaded.
    #[error("service '{name}': circular dependency detected")]
    Cycle {
        /// The service at which the cycle was detected.
        name: String,
    },

    /// The description parsed but cannot be applied (e.g. an unresolvable
    /// run-as user).
    #[error("service '{name}': {message}")]
    Invalid { name: String, message: String },

    /// A reload request was rejected.
    #[error("service '{name}': {message}")]
    ReloadRejected { name: String, message: String },
}

impl LoadError {
    /// Returns a short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            LoadError::NotFound { .. } => "load_not_found",
            LoadError::Io { .. } => "load_io",
            LoadError::Parse { .. } => "load_parse",
            LoadError::Cycle { .. } => "load_cycle",
            LoadError::Invalid { .. } => "load_invalid",
            LoadError::ReloadRejected { .. } => "reload_rejected",
        }
    }
}
