//! Edge protocol translation module - entry point

use clap::{Parser, Subcommand};
use edge_ptm::config::{BridgeConfig, ModuleIdentity};
use edge_ptm::error::{BridgeError, BridgeResult};
use edge_ptm::observability::init_default_logging;
use edge_ptm::run_bridge;
use edge_ptm::telemetry::LineSensorSource;
use std::path::{Path, PathBuf};
use std::process;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

/// Bridges local sensor telemetry into the edge hub
#[derive(Parser)]
#[command(name = "edge-ptm")]
#[command(about = "Protocol translation module: sensor telemetry to edge hub MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "EDGE_PTM_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging regardless of LOG_LEVEL
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until SIGINT/SIGTERM
    Run {
        /// Newline-delimited JSON sensor readings; `-` reads stdin
        #[arg(long, value_name = "PATH", default_value = "-")]
        sensors: String,
    },
    /// Validate configuration and module identity
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

type SensorReader = Box<dyn AsyncBufRead + Unpin + Send>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    let result = match load_configuration(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Run { sensors } => run(config, &sensors).await,
            Commands::Config { show } => handle_config_command(&config, show),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(exit_code = e.exit_code(), "{}", e.redacted());
        process::exit(e.exit_code());
    }

    info!("Application shutdown complete");
}

fn load_configuration(path: Option<&Path>) -> BridgeResult<BridgeConfig> {
    let (config, source) = BridgeConfig::load(path)?;
    match source {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => warn!("No configuration file found, using built-in defaults"),
    }
    Ok(config)
}

async fn run(config: BridgeConfig, sensors: &str) -> BridgeResult<()> {
    info!(
        "Starting edge protocol translation module v{}",
        env!("CARGO_PKG_VERSION")
    );
    let source = LineSensorSource::new(open_sensor_feed(sensors).await?);
    run_bridge(&config, source, shutdown_signal()).await
}

async fn open_sensor_feed(sensors: &str) -> BridgeResult<SensorReader> {
    if sensors == "-" {
        info!("Reading sensor feed from stdin");
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(sensors).await.map_err(|e| {
        BridgeError::internal_error(format!("cannot open sensor feed {sensors}: {e}"))
    })?;
    info!("Reading sensor feed from {}", sensors);
    Ok(Box::new(BufReader::new(file)))
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> BridgeResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| BridgeError::internal_error(format!("cannot render configuration: {e}")))?;
        println!("{rendered}");
    }

    let identity = ModuleIdentity::from_env()?;
    info!(
        client_id = %identity.client_id(),
        devices = config.devices.len(),
        "Configuration valid"
    );
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("SIGTERM handler unavailable ({}), listening for SIGINT only", e);
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received SIGINT, shutting down gracefully"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl-C, shutting down gracefully");
    }
}
