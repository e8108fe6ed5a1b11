use clap::{Parser, Subcommand};
use serialio::config::{Config, ConfigLoader};
use serialio::logging::init_logging;
use serialio::{ConnectionSettings, DeviceCoordinator, DeviceEvent, SystemPortEnumerator};
use serialio::{PortEnumerator, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Monitor and talk to serial devices that come and go.",
    long_about = "Keeps serial ports open across unplugs and re-plugs, printing every received line and reporting connection changes."
)]
struct Args {
    /// Configuration file (default: $SERIALIO_CONFIG, ./serialio.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports present on this machine.
    List {
        /// Print a JSON array instead of one port per line.
        #[arg(long)]
        json: bool,
    },
    /// Print events from the given devices until interrupted.
    Monitor {
        /// Port to monitor; repeat for several. Defaults to `devices` from the config.
        #[arg(short, long = "device")]
        devices: Vec<String>,

        /// Print one JSON object per event.
        #[arg(long)]
        json: bool,
    },
    /// Open a device, send one line, then exit.
    Send {
        /// Destination port.
        #[arg(long)]
        to: String,

        /// Line to send; the configured line ending is appended.
        message: String,

        /// Seconds to wait for the port to open.
        #[arg(long, default_value_t = 5.0)]
        wait: f64,
    },
}

// --- Main Application Entry Point ---
#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let loaded = match args.config {
        Some(ref path) => ConfigLoader::load_from(path),
        None => ConfigLoader::load(),
    };
    let config = match loaded {
        Ok(loader) => loader.into_config(),
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("warning: logging unavailable: {e}");
    }
    if let Some(path) = args.config.as_ref() {
        tracing::debug!(path = %path.display(), "configuration loaded");
    }

    let outcome = match args.command {
        Command::List { json } => list_ports(json),
        Command::Monitor { devices, json } => monitor(&config, devices, json).await,
        Command::Send { to, message, wait } => send(&config, to, &message, wait).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn list_ports(json: bool) -> Result<()> {
    let ports = SystemPortEnumerator.list_ports()?;
    if json {
        println!("{}", serde_json::Value::from(ports));
    } else {
        for port in ports {
            println!("{port}");
        }
    }
    Ok(())
}

async fn monitor(config: &Config, devices: Vec<String>, json: bool) -> Result<()> {
    let devices = if devices.is_empty() {
        config.devices.clone()
    } else {
        devices
    };
    if devices.is_empty() {
        return Err(serialio::ConfigError::Missing(
            "no devices given; pass --device or set `devices` in the config".to_string(),
        )
        .into());
    }

    let settings = config.connection_settings()?;
    let coordinator = DeviceCoordinator::new(devices, settings);
    let mut events = coordinator.event_stream();
    let started = coordinator.start_all();
    tracing::info!(started, "monitoring");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(event) => print_event(&event, json),
                None => break,
            },
        }
    }

    shut_down(coordinator).await;
    Ok(())
}

async fn send(config: &Config, to: String, message: &str, wait: f64) -> Result<()> {
    let settings: ConnectionSettings = config.connection_settings()?;
    let wait = Duration::try_from_secs_f64(wait).map_err(|e| {
        serialio::ConfigError::invalid("--wait", format!("invalid duration: {e}"))
    })?;

    let coordinator = DeviceCoordinator::new([to.clone()], settings);
    let mut events = coordinator.event_stream();
    coordinator.start_all();

    let opened = tokio::time::timeout(wait, wait_for_open(&mut events, &to)).await;
    let result = match opened {
        Ok(true) => {
            coordinator.write(&to, message, &config.serial.line_ending);
            Ok(())
        }
        _ => {
            tracing::warn!(port = %to, "port did not open in time");
            Err(serialio::PortError::timeout(wait).into())
        }
    };

    shut_down(coordinator).await;
    result
}

async fn wait_for_open(events: &mut mpsc::UnboundedReceiver<DeviceEvent>, port: &str) -> bool {
    while let Some(event) = events.recv().await {
        if let DeviceEvent::ConnectionStatus { port: p, open: true } = &event {
            if p == port {
                return true;
            }
        }
    }
    false
}

fn print_event(event: &DeviceEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("could not encode event: {e}"),
        }
        return;
    }
    match event {
        DeviceEvent::ConnectionStatus { port, open } => {
            println!("[{port}] {}", if *open { "connected" } else { "disconnected" });
        }
        DeviceEvent::DataIncoming { port, line } => println!("[{port}] {line}"),
        DeviceEvent::PortsUpdate { ports } => println!("ports: {}", ports.join(", ")),
    }
}

/// Stop every device and wait for the loop threads off the async runtime.
async fn shut_down(coordinator: DeviceCoordinator) {
    coordinator.stop_all();
    let joined = tokio::task::spawn_blocking(move || coordinator.join_all()).await;
    if let Err(e) = joined {
        tracing::warn!("join failed: {e}");
    }
}

// --- Graceful Shutdown Handler ---
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, shutting down");
}
