//! The service description parser.
//!
//! `#` lines and blank lines are ignored. Every other line is
//! `key <op> value` where `<op>` is `=`, `:`, or `+=`; which operator a key
//! accepts is fixed by the settings registry. Commands are tokenized
//! shell-style, honoring `"`/`'` quoting and `\` escapes.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::config::settings::{is_known_setting, valid_operator, Operator};
use crate::error::LoadError;
use crate::service::types::{AutoRestartMode, LogType, ServiceFlags, ServiceType};

/// Parsed configuration of one service.
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    pub name: String,
    pub service_type: ServiceType,
    pub description: String,

    // Commands
    pub command: Vec<String>,
    pub stop_command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env_file: Option<PathBuf>,

    // Dependencies, by name (resolved by the loader)
    pub depends_on: Vec<String>,
    pub depends_ms: Vec<String>,
    pub waits_for: Vec<String>,
    pub before: Vec<String>,
    pub after: Vec<String>,

    // Dependency directories
    pub depends_on_d: Vec<String>,
    pub depends_ms_d: Vec<String>,
    pub waits_for_d: Vec<String>,

    // Behavior
    pub auto_restart: AutoRestartMode,
    pub smooth_recovery: bool,
    pub flags: ServiceFlags,

    // Logging
    pub log_type: LogType,
    pub log_file: Option<PathBuf>,
    pub log_buf_max: usize,

    // Process management; zero durations mean "use the default"
    pub stop_timeout: Duration,
    pub start_timeout: Duration,
    pub restart_delay: Duration,
    pub restart_interval: Duration,
    pub restart_limit_count: i32,
    pub term_signal: Signal,
    pub pid_file: Option<PathBuf>,

    // Credentials
    pub run_as: Option<String>,

    // Chaining
    pub chain_to: Option<String>,
    pub consumer_of: Option<String>,
}

impl ServiceDescription {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            service_type: ServiceType::Process,
            description: String::new(),
            command: Vec::new(),
            stop_command: Vec::new(),
            working_dir: None,
            env_file: None,
            depends_on: Vec::new(),
            depends_ms: Vec::new(),
            waits_for: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            depends_on_d: Vec::new(),
            depends_ms_d: Vec::new(),
            waits_for_d: Vec::new(),
            auto_restart: AutoRestartMode::Never,
            smooth_recovery: false,
            flags: ServiceFlags::default(),
            log_type: LogType::None,
            log_file: None,
            log_buf_max: 0,
            stop_timeout: Duration::ZERO,
            start_timeout: Duration::ZERO,
            restart_delay: Duration::ZERO,
            restart_interval: Duration::ZERO,
            restart_limit_count: 0,
            term_signal: Signal::SIGTERM,
            pid_file: None,
            run_as: None,
            chain_to: None,
            consumer_of: None,
        }
    }
}

/// Parses a service description.
pub fn parse(content: &str, name: &str, file: &std::path::Path) -> Result<ServiceDescription, LoadError> {
    let mut desc = ServiceDescription::new(name);

    for (idx, raw_line) in content.lines().enumerate() {
        let line_num = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let err_at = |setting: &str, message: String| LoadError::Parse {
            name: name.to_string(),
            file: file.to_path_buf(),
            line: line_num,
            setting: setting.to_string(),
            message,
        };

        let (setting, value, op) = match parse_line(line) {
            Some(parts) => parts,
            None => return Err(err_at("", "missing operator ('=' or ':')".to_string())),
        };

        if !is_known_setting(&setting) {
            return Err(err_at(&setting, "unknown setting".to_string()));
        }
        if !valid_operator(&setting, op) {
            return Err(err_at(&setting, "invalid operator for setting".to_string()));
        }

        apply_setting(&mut desc, &setting, &value, op)
            .map_err(|message| err_at(&setting, message))?;
    }

    Ok(desc)
}

/// Splits one line into (setting, value, operator).
fn parse_line(line: &str) -> Option<(String, String, Operator)> {
    if let Some(idx) = line.find("+=") {
        return Some((
            line[..idx].trim().to_string(),
            line[idx + 2..].trim().to_string(),
            Operator::PlusEqual,
        ));
    }

    let eq_idx = line.find('=');
    let colon_idx = line.find(':');

    match (colon_idx, eq_idx) {
        (Some(c), Some(e)) if c < e => Some((
            line[..c].trim().to_string(),
            line[c + 1..].trim().to_string(),
            Operator::Colon,
        )),
        (Some(c), None) => Some((
            line[..c].trim().to_string(),
            line[c + 1..].trim().to_string(),
            Operator::Colon,
        )),
        (_, Some(e)) => Some((
            line[..e].trim().to_string(),
            line[e + 1..].trim().to_string(),
            Operator::Equals,
        )),
        _ => None,
    }
}

fn apply_setting(
    desc: &mut ServiceDescription,
    setting: &str,
    value: &str,
    op: Operator,
) -> Result<(), String> {
    match setting {
        "type" => desc.service_type = parse_type(value)?,
        "description" => desc.description = value.to_string(),
        "command" => desc.command = split_command(value),
        "stop-command" => desc.stop_command = split_command(value),
        "working-dir" => desc.working_dir = Some(PathBuf::from(value)),
        "env-file" => desc.env_file = Some(PathBuf::from(value)),

        "depends-on" => desc.depends_on.push(value.to_string()),
        "depends-ms" => desc.depends_ms.push(value.to_string()),
        "waits-for" => desc.waits_for.push(value.to_string()),
        "before" => desc.before.push(value.to_string()),
        "after" => desc.after.push(value.to_string()),
        "depends-on.d" => desc.depends_on_d.push(value.to_string()),
        "depends-ms.d" => desc.depends_ms_d.push(value.to_string()),
        "waits-for.d" => desc.waits_for_d.push(value.to_string()),

        "restart" => desc.auto_restart = parse_restart(value)?,
        "smooth-recovery" => desc.smooth_recovery = parse_bool(value)?,

        "stop-timeout" => desc.stop_timeout = parse_duration(value)?,
        "start-timeout" => desc.start_timeout = parse_duration(value)?,
        "restart-delay" => desc.restart_delay = parse_duration(value)?,
        "restart-limit-interval" => desc.restart_interval = parse_duration(value)?,
        "restart-limit-count" => {
            desc.restart_limit_count = value
                .parse()
                .map_err(|_| format!("invalid count: {value:?}"))?;
        }

        "term-signal" => desc.term_signal = parse_signal(value)?,

        "logfile" => {
            desc.log_file = Some(PathBuf::from(value));
            if desc.log_type == LogType::None {
                desc.log_type = LogType::File;
            }
        }
        "log-type" => desc.log_type = parse_log_type(value)?,
        "log-buffer-size" => {
            desc.log_buf_max = value
                .parse()
                .map_err(|_| format!("invalid buffer size: {value:?}"))?;
        }

        "pid-file" => desc.pid_file = Some(PathBuf::from(value)),
        "run-as" => desc.run_as = Some(value.to_string()),
        "chain-to" => desc.chain_to = Some(value.to_string()),
        "consumer-of" => desc.consumer_of = Some(value.to_string()),

        "options" => apply_options(desc, value, op == Operator::PlusEqual)?,

        // Recognized but not acted upon; accepted for compatibility.
        "load-options" | "ready-notification" | "socket-listen" | "socket-permissions"
        | "socket-uid" | "socket-gid" | "rlimit-nofile" | "rlimit-core" | "rlimit-data"
        | "rlimit-as" | "cgroup" | "nice" | "ioprio" | "oom-score-adj" => {}

        _ => return Err("unknown setting".to_string()),
    }
    Ok(())
}

fn parse_type(value: &str) -> Result<ServiceType, String> {
    match value.to_ascii_lowercase().as_str() {
        "process" => Ok(ServiceType::Process),
        "bgprocess" => Ok(ServiceType::BgProcess),
        "scripted" => Ok(ServiceType::Scripted),
        "internal" => Ok(ServiceType::Internal),
        "triggered" => Ok(ServiceType::Triggered),
        other => Err(format!("unknown service type: {other}")),
    }
}

fn parse_restart(value: &str) -> Result<AutoRestartMode, String> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(AutoRestartMode::Always),
        "no" | "false" => Ok(AutoRestartMode::Never),
        "on-failure" => Ok(AutoRestartMode::OnFailure),
        other => Err(format!(
            "invalid restart value: {other} (expected yes/no/on-failure)"
        )),
    }
}

fn parse_log_type(value: &str) -> Result<LogType, String> {
    match value.to_ascii_lowercase().as_str() {
        "none" => Ok(LogType::None),
        "file" => Ok(LogType::File),
        "buffer" => Ok(LogType::Buffer),
        "pipe" => Ok(LogType::Pipe),
        other => Err(format!("unknown log type: {other}")),
    }
}

fn apply_options(desc: &mut ServiceDescription, value: &str, append: bool) -> Result<(), String> {
    if !append {
        desc.flags = ServiceFlags::default();
    }
    for opt in value.split_ascii_whitespace() {
        match opt {
            "runs-on-console" => desc.flags.runs_on_console = true,
            "starts-on-console" => desc.flags.starts_on_console = true,
            "shares-console" => desc.flags.shares_console = true,
            "pass-cs-fd" => desc.flags.pass_cs_fd = true,
            "start-interruptible" => desc.flags.start_interruptible = true,
            "skippable" => desc.flags.skippable = true,
            "signal-process-only" => desc.flags.signal_process_only = true,
            "always-chain" => desc.flags.always_chain = true,
            "kill-all-on-stop" => desc.flags.kill_all_on_stop = true,
            other => return Err(format!("unknown option: {other}")),
        }
    }
    Ok(())
}

/// Splits a command string into tokens, honoring quotes and backslash
/// escapes.
fn split_command(cmd: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;
    let mut escaped = false;

    for ch in cmd.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if let Some(q) = in_quote {
            if ch == q {
                in_quote = None;
            } else {
                current.push(ch);
            }
            continue;
        }
        match ch {
            '"' | '\'' => in_quote = Some(ch),
            ' ' | '\t' => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        other => Err(format!(
            "invalid boolean value: {other} (expected yes/no/true/false)"
        )),
    }
}

/// Durations are decimal seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration: {value:?}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err("duration must be non-negative".to_string());
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Signals are accepted by name (with or without the SIG prefix) or number.
pub fn parse_signal(value: &str) -> Result<Signal, String> {
    let upper = value.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);

    let sig = match name {
        "HUP" => Some(Signal::SIGHUP),
        "INT" => Some(Signal::SIGINT),
        "QUIT" => Some(Signal::SIGQUIT),
        "KILL" => Some(Signal::SIGKILL),
        "TERM" => Some(Signal::SIGTERM),
        "USR1" => Some(Signal::SIGUSR1),
        "USR2" => Some(Signal::SIGUSR2),
        "STOP" => Some(Signal::SIGSTOP),
        "CONT" => Some(Signal::SIGCONT),
        _ => None,
    };
    if let Some(sig) = sig {
        return Ok(sig);
    }

    let num: i32 = value
        .parse()
        .map_err(|_| format!("unknown signal: {value}"))?;
    Signal::try_from(num).map_err(|_| format!("unknown signal: {value}"))
}
