// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ACSP Relay CLI
//!
//! # Usage
//!
//! ```bash
//! # Direct mode, two plugins
//! acsp-relay --local-port 12001 --server-port 12000 \
//!     --add-plugin timing:127.0.0.1:11000:11001 \
//!     --add-plugin stracker:127.0.0.1:11010:11011
//!
//! # Using a configuration file
//! acsp-relay --config acsp-relay.toml
//!
//! # Generate / check a configuration file
//! acsp-relay gen-config --output acsp-relay.toml
//! acsp-relay validate --config acsp-relay.toml
//! ```

use acsp_relay::{PluginConfig, Relay, RelayConfig, UpstreamMode};
use clap::{ArgAction, Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Configuration file picked up when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "acsp-relay.toml";

/// Statistics interval when neither the file nor the command line sets one.
const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

/// Exit status for a relay started without ports.
const EXIT_UNCONFIGURED: i32 = 2;

/// ACSP Relay
#[derive(Parser, Debug)]
#[command(name = "acsp-relay")]
#[command(about = "ACSP Relay - share one simulation server plugin port between many plugins")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML, or JSON by extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local UDP port the server sends plugin events to
    #[arg(long, visible_alias = "lp")]
    local_port: Option<u16>,

    /// Server plugin UDP port, or upstream relay TCP port with --chained
    #[arg(long, visible_alias = "sp")]
    server_port: Option<u16>,

    /// TCP port accepting downstream relays
    #[arg(long, visible_alias = "rp")]
    relay_port: Option<u16>,

    /// Add a plugin (format: "name:host:remote_port:local_port", can repeat)
    #[arg(short = 'p', long)]
    add_plugin: Vec<String>,

    /// Connect to an upstream relay over TCP instead of the server
    #[arg(long)]
    chained: bool,

    /// Server or upstream relay host
    #[arg(long)]
    host: Option<String>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// More logging (-v debug, -vv packet dumps)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Statistics reporting interval (seconds, 0 to disable)
    #[arg(long)]
    stats_interval: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    init_logging(&args)?;

    // Handle subcommands
    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(&output),
            Commands::Validate { config } => cmd_validate(&config),
        };
    }

    let config = build_config(&args)?;

    print_banner(&config);

    let mut relay = match Relay::bind(config).await {
        Ok(relay) => relay,
        Err(e) if e.is_unconfigured() => {
            error!("{}", e);
            error!("Set the ports with --local-port/--server-port or a configuration file (see --help)");
            std::process::exit(EXIT_UNCONFIGURED);
        }
        Err(e) => {
            error!("Failed to start relay: {}", e);
            return Err(e.into());
        }
    };

    // Handle shutdown signals
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping relay...");
        shutdown_signal.notify_one();
    });

    if let Err(e) = relay.run(shutdown).await {
        error!("Relay stopped: {}", e);
        return Err(e.into());
    }

    info!("Relay stopped");
    Ok(())
}

fn init_logging(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let directive = match args.verbose {
        0 => args.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));

    match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }
    Ok(())
}

/// Load the configuration file, then apply command line overrides.
fn build_config(args: &Args) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    let file = args.config.clone().or_else(|| {
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    });

    let mut config = match &file {
        Some(path) => {
            info!("Loading config from {:?}", path);
            RelayConfig::from_file(path)?
        }
        None => RelayConfig {
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            ..Default::default()
        },
    };

    if args.chained {
        config.server.mode = UpstreamMode::Chained;
    }
    if let Some(ref host) = args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.server_port {
        config.server.server_port = port;
    }
    if let Some(port) = args.local_port {
        config.server.local_port = port;
    }
    if let Some(port) = args.relay_port {
        config.relay.listen_port = port;
    }
    if let Some(secs) = args.stats_interval {
        config.stats_interval_secs = secs;
    }
    for spec in &args.add_plugin {
        config.add_plugin(spec.parse::<PluginConfig>()?);
    }

    Ok(config)
}

fn print_banner(config: &RelayConfig) {
    info!("+----------------------------------------------------+");
    info!(
        "|       ACSP Relay v{:33}|",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    let upstream = match config.server.mode {
        UpstreamMode::Direct => format!(
            "server {}:{} (local {})",
            config.server.host, config.server.server_port, config.server.local_port
        ),
        UpstreamMode::Chained => {
            format!("relay {}:{}", config.server.host, config.server.server_port)
        }
    };
    info!("|  Upstream: {:39} |", upstream);
    info!(
        "|  Relays:   {:39} |",
        if config.relay.listen_port == 0 {
            "disabled".to_string()
        } else {
            format!("tcp/{}", config.relay.listen_port)
        }
    );
    for plugin in &config.plugins {
        info!(
            "|  Plugin:   {:39} |",
            format!(
                "{} {}:{} (local {})",
                plugin.name, plugin.host, plugin.remote_port, plugin.local_port
            )
        );
    }
    info!("+----------------------------------------------------+");
}

fn cmd_gen_config(output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(&RelayConfig::example())?;
    std::fs::write(output, toml_str)?;
    println!("Generated example configuration: {}", output.display());
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = RelayConfig::from_file(path)?;
    config.validate()?;

    println!("Configuration is valid");
    println!();
    println!("Mode: {:?}", config.server.mode);
    println!(
        "Upstream: {}:{}",
        config.server.host, config.server.server_port
    );
    if config.server.mode == UpstreamMode::Direct {
        println!("Local port: {}", config.server.local_port);
    }
    if config.relay.listen_port != 0 {
        println!("Relay listener: tcp/{}", config.relay.listen_port);
    }
    println!("Plugins: {}", config.plugins.len());
    for plugin in &config.plugins {
        println!(
            "  - {} {}:{} (local {})",
            plugin.name, plugin.host, plugin.remote_port, plugin.local_port
        );
    }

    Ok(())
}
