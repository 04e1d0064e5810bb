//! # Service description files: settings registry, parser, and loader.
//!
//! Descriptions are plain text, one setting per line:
//!
//! ```text
//! type = process
//! command = /usr/sbin/mydaemon --foreground
//! depends-on: network
//! restart = on-failure
//! options = signal-process-only
//! ```
//!
//! - **settings.rs** is the registry of recognized keys and the operators
//!   each accepts (`=`, `:`, `+=`); unknown keys and wrong operators are
//!   parse errors.
//! - **parser.rs** turns a file into a [`ServiceDescription`].
//! - **loader.rs** searches the service directories, creates services from
//!   descriptions (recursing into dependencies), and applies the reload
//!   rules.

mod loader;
mod parser;
mod settings;

pub use parser::{parse, parse_signal, ServiceDescription};
pub use settings::{allowed_operators, is_known_setting, Operator};
