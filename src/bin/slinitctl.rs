//! slinitctl: control CLI for a running slinit instance.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use slinit::control::client::{Client, ClientError, StartStopOutcome};
use slinit::control::protocol::{
    BootTimeEntry, ServiceStatusInfo, SvcInfoEntry, STATUS_FLAG_HAS_CONSOLE,
    STATUS_FLAG_HAS_PID, STATUS_FLAG_MARKED_ACTIVE,
};
use slinit::paths;
use slinit::{ServiceState, ShutdownType};

#[derive(Parser, Debug)]
#[command(name = "slinitctl", version, about = "Control a running slinit instance")]
struct Args {
    /// Control socket path
    #[arg(long = "socket-path", short = 's', global = true)]
    socket_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all loaded services
    #[command(alias = "ls")]
    List,
    /// Start a service
    Start { service: String },
    /// Stop a service
    Stop { service: String },
    /// Restart a service (stop + start)
    Restart { service: String },
    /// Show detailed service status
    Status { service: String },
    /// Remove start/stop pins from a service
    Unpin { service: String },
    /// Trigger a triggered service
    Trigger { service: String },
    /// Send a signal to a service's process
    Signal { signal: String, service: String },
    /// Initiate system shutdown
    Shutdown {
        /// halt, poweroff, or reboot
        #[arg(default_value = "poweroff")]
        kind: String,
    },
    /// Reload a service's configuration from disk
    Reload { service: String },
    /// Show buffered service output
    Catlog {
        /// Clear the buffer after reading
        #[arg(long)]
        clear: bool,
        service: String,
    },
    /// Show boot timing analysis
    #[command(name = "boot-time", alias = "analyze")]
    BootTime,
    /// Release a service handle (protocol exerciser)
    CloseHandle { service: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let socket_path = paths::client_socket_path(args.socket_path.as_deref());

    let mut client = match Client::connect(&socket_path).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!(
                "slinitctl: failed to connect to slinit at {}: {e}",
                socket_path.display()
            );
            return ExitCode::FAILURE;
        }
    };

    let result = run_command(&mut client, args.command).await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("slinitctl: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_command(client: &mut Client, command: Command) -> Result<(), ClientError> {
    match command {
        Command::List => cmd_list(client).await,
        Command::Start { service } => cmd_start(client, &service).await,
        Command::Stop { service } => cmd_stop(client, &service).await,
        Command::Restart { service } => cmd_restart(client, &service).await,
        Command::Status { service } => cmd_status(client, &service).await,
        Command::Unpin { service } => {
            let handle = client.load_service(&service).await?;
            client.unpin_service(handle).await?;
            println!("Service '{service}' unpinned.");
            Ok(())
        }
        Command::Trigger { service } => {
            let handle = client.load_service(&service).await?;
            match client.set_trigger(handle, true).await {
                Ok(()) => {
                    println!("Service '{service}' triggered.");
                    Ok(())
                }
                Err(ClientError::Refused) => {
                    eprintln!("slinitctl: service '{service}' is not a triggered service");
                    std::process::exit(1);
                }
                Err(e) => Err(e),
            }
        }
        Command::Signal { signal, service } => cmd_signal(client, &signal, &service).await,
        Command::Shutdown { kind } => cmd_shutdown(client, &kind).await,
        Command::Reload { service } => {
            let handle = client.load_service(&service).await?;
            match client.reload_service(handle).await {
                Ok(()) => {
                    println!("Service '{service}' reloaded.");
                    Ok(())
                }
                Err(ClientError::Refused) => {
                    eprintln!(
                        "slinitctl: could not reload service '{service}'; \
                         service may be in wrong state or have incompatible changes"
                    );
                    std::process::exit(1);
                }
                Err(e) => Err(e),
            }
        }
        Command::Catlog { clear, service } => cmd_catlog(client, &service, clear).await,
        Command::BootTime => cmd_boot_time(client).await,
        Command::CloseHandle { service } => {
            let handle = client.load_service(&service).await?;
            client.close_handle(handle).await?;
            println!("Handle for '{service}' closed.");
            Ok(())
        }
    }
}

async fn cmd_list(client: &mut Client) -> Result<(), ClientError> {
    for entry in client.list_services().await? {
        println!(
            "[{}] {}{}",
            format_indicator(&entry),
            entry.name,
            format_suffix(&entry)
        );
    }
    Ok(())
}

async fn cmd_start(client: &mut Client, service: &str) -> Result<(), ClientError> {
    let handle = client.load_service(service).await?;
    match client.start_service(handle).await? {
        StartStopOutcome::Applied => println!("Service '{service}' started."),
        StartStopOutcome::AlreadyInState => println!("Service '{service}' is already started."),
    }
    Ok(())
}

async fn cmd_stop(client: &mut Client, service: &str) -> Result<(), ClientError> {
    let handle = client.load_service(service).await?;
    match client.stop_service(handle).await? {
        StartStopOutcome::Applied => println!("Service '{service}' stopped."),
        StartStopOutcome::AlreadyInState => println!("Service '{service}' is already stopped."),
    }
    Ok(())
}

async fn cmd_restart(client: &mut Client, service: &str) -> Result<(), ClientError> {
    let handle = client.load_service(service).await?;
    client.stop_service(handle).await?;
    client.start_service(handle).await?;
    println!("Service '{service}' restarted.");
    Ok(())
}

async fn cmd_status(client: &mut Client, service: &str) -> Result<(), ClientError> {
    let handle = client.load_service(service).await?;
    let status: ServiceStatusInfo = client.service_status(handle).await?;

    println!("Service: {service}");
    println!("  State:   {}", status.state);
    println!("  Target:  {}", format_target(status.target_state));
    println!("  Type:    {}", status.svc_type);
    if status.flags & STATUS_FLAG_HAS_PID != 0 {
        println!("  PID:     {}", status.pid);
    }
    if status.exit_status != 0 {
        println!("  Exit:    {}", status.exit_status);
    }
    Ok(())
}

async fn cmd_signal(client: &mut Client, signal: &str, service: &str) -> Result<(), ClientError> {
    let sig = slinit::config::parse_signal(signal).map_err(|_| ClientError::BadSignal)?;
    let handle = client.load_service(service).await?;
    client.signal(handle, sig as i32).await?;
    println!("Signal {signal} sent to service '{service}'.");
    Ok(())
}

async fn cmd_shutdown(client: &mut Client, kind: &str) -> Result<(), ClientError> {
    let shutdown_type = match kind {
        "halt" => ShutdownType::Halt,
        "poweroff" => ShutdownType::Poweroff,
        "reboot" => ShutdownType::Reboot,
        other => {
            eprintln!("slinitctl: unknown shutdown type: {other} (use halt, poweroff, or reboot)");
            std::process::exit(2);
        }
    };
    client.shutdown(shutdown_type).await?;
    println!("Shutdown ({kind}) initiated.");
    Ok(())
}

async fn cmd_catlog(client: &mut Client, service: &str, clear: bool) -> Result<(), ClientError> {
    let handle = client.load_service(service).await?;
    match client.catlog(handle, clear).await? {
        None => {
            eprintln!(
                "slinitctl: service '{service}' is not configured to buffer output \
                 (log-type != buffer)"
            );
            std::process::exit(1);
        }
        Some(data) if data.is_empty() => {
            eprintln!("(no buffered output for service '{service}')");
            Ok(())
        }
        Some(data) => {
            use std::io::Write;
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(&data);
            if data.last() != Some(&b'\n') {
                println!();
            }
            Ok(())
        }
    }
}

async fn cmd_boot_time(client: &mut Client) -> Result<(), ClientError> {
    let info = client.boot_time().await?;

    let kernel = Duration::from_nanos(info.kernel_uptime_ns.max(0) as u64);
    if info.boot_ready_ns > 0 {
        let userspace =
            Duration::from_nanos((info.boot_ready_ns - info.boot_start_ns).max(0) as u64);
        println!(
            "Startup finished in {} (kernel) + {} (userspace) = {}",
            format_duration(kernel),
            format_duration(userspace),
            format_duration(kernel + userspace)
        );
        println!(
            "{} reached after {} in userspace.",
            info.boot_svc_name,
            format_duration(userspace)
        );
    } else {
        println!(
            "Startup in progress: {} (kernel) + ... (userspace)",
            format_duration(kernel)
        );
        println!(
            "Boot service '{}' has not yet reached STARTED.",
            info.boot_svc_name
        );
    }

    let mut timed: Vec<&BootTimeEntry> =
        info.services.iter().filter(|e| e.startup_ns > 0).collect();
    if !timed.is_empty() {
        timed.sort_by(|a, b| b.startup_ns.cmp(&a.startup_ns));
        println!();
        println!("Service startup times:");
        for entry in timed {
            let dur = Duration::from_nanos(entry.startup_ns as u64);
            let suffix = if entry.pid > 0 {
                format!(" (pid: {})", entry.pid)
            } else {
                String::new()
            };
            println!("  {:>8} {}{}", format_duration(dur), entry.name, suffix);
        }
    }
    Ok(())
}

/// Renders the 8-character state indicator.
///
/// Three character zones: started bracket, transition arrows, stopped
/// bracket. Square brackets mark explicitly activated services, braces
/// mark dependency-only ones.
fn format_indicator(e: &SvcInfoEntry) -> String {
    let active = e.flags & STATUS_FLAG_MARKED_ACTIVE != 0;
    let (open, close) = if active { ('[', ']') } else { ('{', '}') };

    let mut buf = [' '; 8];
    match e.state {
        ServiceState::Started => {
            buf[0] = open;
            buf[1] = '+';
            buf[2] = close;
        }
        ServiceState::Stopped => {
            buf[5] = open;
            buf[6] = '-';
            buf[7] = close;
        }
        ServiceState::Starting => {
            buf[3] = '<';
            buf[4] = '<';
            if e.target_state == ServiceState::Started {
                buf[0] = open;
                buf[2] = close;
            } else {
                buf[5] = open;
                buf[7] = close;
            }
        }
        ServiceState::Stopping => {
            buf[3] = '>';
            buf[4] = '>';
            if e.target_state == ServiceState::Stopped {
                buf[5] = open;
                buf[7] = close;
            } else {
                buf[0] = open;
                buf[2] = close;
            }
        }
    }
    buf.iter().collect()
}

fn format_suffix(e: &SvcInfoEntry) -> String {
    let mut parts = Vec::new();
    if e.pid > 0 {
        parts.push(format!("pid: {}", e.pid));
    }
    if e.flags & STATUS_FLAG_HAS_CONSOLE != 0 {
        parts.push("has console".to_string());
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_target(state: ServiceState) -> &'static str {
    match state {
        ServiceState::Stopped => "stop",
        ServiceState::Started => "start",
        _ => "transition",
    }
}

fn format_duration(d: Duration) -> String {
    if d < Duration::from_millis(1) {
        format!("{}us", d.as_micros())
    } else if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else {
        format!("{:.3}s", d.as_secs_f64())
    }
}
