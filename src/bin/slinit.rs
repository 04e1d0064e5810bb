//! The slinit daemon: service supervisor and optional PID 1 init.

use std::sync::Arc;
use std::time::SystemTime;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use slinit::control::Server;
use slinit::eventloop::EventLoop;
use slinit::paths;
use slinit::shutdown::{self, RealSystem};
use slinit::{ShutdownType, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "slinit", version, about = "Service supervisor and init system")]
struct Args {
    /// Service description directory (comma-separated for multiple)
    #[arg(long = "services-dir")]
    services_dir: Option<String>,

    /// Control socket path
    #[arg(long = "socket-path")]
    socket_path: Option<String>,

    /// Run as the system service manager
    #[arg(long)]
    system: bool,

    /// Run as a user service manager
    #[arg(long)]
    user: bool,

    /// Name of the boot service to start
    #[arg(long = "boot-service", default_value = "boot")]
    boot_service: String,

    /// Log level (debug, info, notice, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let level = match level.to_ascii_lowercase().as_str() {
        "debug" => tracing::Level::DEBUG,
        "notice" | "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let boot_start_time = SystemTime::now();
    let args = Args::parse();

    init_logging(&args.log_level);

    if args.system && args.user {
        eprintln!("slinit: --system and --user are mutually exclusive");
        std::process::exit(2);
    }

    let is_pid1 = std::process::id() == 1;
    // PID 1 forces system mode; otherwise --user (or no flag) selects a
    // per-user manager.
    let system_mode = args.system || is_pid1;

    if is_pid1 {
        info!("slinit starting as PID 1 (init system mode)");
        shutdown::init_pid1();
    } else if system_mode {
        info!("slinit starting in system mode");
    } else {
        info!("slinit starting in user mode");
    }

    let service_dirs = paths::resolve_service_dirs(args.services_dir.as_deref(), system_mode);
    info!(dirs = ?service_dirs, "service directories");

    let socket_path = paths::resolve_socket_path(args.socket_path.as_deref(), system_mode);

    let (sup, shutdown_rx) = Supervisor::new(service_dirs);

    sup.with_set(|set| {
        set.set_boot_start_time(boot_start_time);
        set.set_boot_service_name(&args.boot_service);
        if let Ok(uptime) = paths::read_kernel_uptime() {
            set.set_kernel_uptime(uptime);
        }
    });

    // Load and start the boot service.
    let boot_loaded = sup.with_set(|set| match set.load_service(&args.boot_service) {
        Ok(id) => {
            set.start_service(id);
            true
        }
        Err(e) => {
            error!(service = %args.boot_service, error = %e, "failed to load boot service");
            false
        }
    });
    if !boot_loaded {
        if is_pid1 {
            error!("cannot proceed without boot service in init mode");
            shutdown::infinite_hold();
        }
        std::process::exit(1);
    }
    info!(service = %args.boot_service, "boot service started");

    // Control socket server; running without it is degraded but viable.
    let server = Server::new(Arc::clone(&sup), &socket_path);
    let server_running = match server.start() {
        Ok(()) => true,
        Err(e) => {
            error!(path = %socket_path.display(), error = %e, "failed to start control socket");
            false
        }
    };

    let mut event_loop = EventLoop::new(Arc::clone(&sup), shutdown_rx);
    event_loop.set_pid1_mode(is_pid1);
    event_loop.run(CancellationToken::new()).await;

    if server_running {
        server.stop();
    }

    let shutdown_type = event_loop.shutdown_type();
    if is_pid1 {
        handle_pid1_shutdown(shutdown_type);
    }

    info!("slinit shutdown complete");
}

/// Maps the final shutdown type to a system action. Never returns.
fn handle_pid1_shutdown(shutdown_type: ShutdownType) -> ! {
    let ops = RealSystem;
    match shutdown_type {
        ShutdownType::None => {
            // All services stopped with no shutdown request: boot failure.
            error!("boot failure detected, attempting reboot");
            shutdown::execute(&ops, ShutdownType::Reboot)
        }
        ShutdownType::SoftReboot => {
            let e = shutdown::soft_reboot(&ops);
            error!(error = %e, "soft reboot failed, falling back to hard reboot");
            shutdown::execute(&ops, ShutdownType::Reboot)
        }
        ShutdownType::Halt | ShutdownType::Poweroff | ShutdownType::Reboot => {
            shutdown::execute(&ops, shutdown_type)
        }
        ShutdownType::Remain => {
            info!("shutdown type is REMAIN, staying up with no services");
            shutdown::infinite_hold()
        }
    }
}
