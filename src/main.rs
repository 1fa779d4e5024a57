#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use mavswitch::config::{Config, EndpointConfig, EndpointMode, DEFAULT_BAUDRATE};
use mavswitch::control::{spawn_main_router, ControlSurface};
use mavswitch::error::RouterError;
use mavswitch::extension::ExtensionManager;
use mavswitch::filter::EndpointFilters;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "MAVLink packet router with runtime extension routers")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long, default_value = "mavswitch.toml")]
    conf_file: String,

    /// Directory for persisted extension configurations (overrides config)
    #[arg(short = 'x', long)]
    extension_dir: Option<String>,

    /// TCP listen port for the implicit server (overrides config)
    #[arg(short = 't', long)]
    tcp_port: Option<u16>,

    /// Log per-endpoint statistics periodically
    #[arg(short = 'r', long)]
    report_stats: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Ad-hoc endpoints: /dev/ttyX[:baud] (serial) or address:port (udp server)
    #[arg(value_name = "ENDPOINT")]
    endpoints: Vec<String>,
}

/// Positional arguments create ad-hoc endpoints: device paths become
/// serial endpoints, anything else a UDP server.
fn parse_positional(arg: &str, index: usize) -> EndpointConfig {
    let name = format!("cli-{}", index);
    if arg.starts_with('/') {
        let (device, baud) = match arg.rsplit_once(':') {
            Some((device, baud)) if baud.chars().all(|c| c.is_ascii_digit()) && !baud.is_empty() => {
                (device.to_string(), baud.parse().unwrap_or(DEFAULT_BAUDRATE))
            }
            _ => (arg.to_string(), DEFAULT_BAUDRATE),
        };
        EndpointConfig::Serial {
            name,
            device,
            baudrates: vec![baud],
            flow_control: false,
            baud_probe_cycles: 3,
            group: None,
            filters: EndpointFilters::default(),
        }
    } else {
        EndpointConfig::Udp {
            name,
            address: arg.to_string(),
            mode: EndpointMode::Server,
            group: None,
            filters: EndpointFilters::default(),
        }
    }
}

fn init_tracing(verbose: u8, config_level: Option<&str>) {
    let level = match verbose {
        0 => config_level.unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run() -> Result<i32> {
    let args = Args::parse();

    let mut config = if Path::new(&args.conf_file).exists() {
        let content = std::fs::read_to_string(&args.conf_file)
            .with_context(|| format!("reading {}", args.conf_file))?;
        Config::parse(&content).with_context(|| format!("parsing {}", args.conf_file))?
    } else if args.endpoints.is_empty() && args.tcp_port.is_none() {
        bail!(
            "config file '{}' not found and no endpoints given",
            args.conf_file
        );
    } else {
        Config::default()
    };

    // CLI overrides
    if let Some(port) = args.tcp_port {
        config.general.tcp_listen_port = port;
    }
    if args.report_stats {
        config.general.report_stats = true;
    }
    if let Some(dir) = &args.extension_dir {
        config.general.extension_config_dir = Some(dir.clone());
    }
    for (index, endpoint) in args.endpoints.iter().enumerate() {
        config.endpoint.push(parse_positional(endpoint, index));
    }
    config.validate()?;

    if config.endpoint.is_empty() && config.general.tcp_listen_port == 0 {
        bail!("no endpoints configured");
    }

    init_tracing(args.verbose, config.general.log_level.as_deref());
    info!(
        endpoints = config.endpoint.len(),
        tcp_listen_port = config.general.tcp_listen_port,
        "starting mavswitch"
    );

    let extension_dir = config
        .general
        .extension_config_dir
        .clone()
        .unwrap_or_else(|| "extensions".to_string());
    let manager = ExtensionManager::new(config.clone(), &extension_dir);
    let loaded = manager.load_dir();
    if loaded > 0 {
        info!(count = loaded, dir = %extension_dir, "persisted extensions registered");
    }

    let surface = ControlSurface::new(manager.clone());
    let restart_config = config.clone();
    surface.register_main_restart(move || spawn_main_router(restart_config.clone()));
    surface
        .start_main_router()
        .context("starting main router")?;
    let main_handle = surface
        .main_handle()
        .context("main router handle missing")?;

    // Small runtime just for signal handling; every router owns its own.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    runtime.block_on(async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
            }
            _ = main_handle.wait_shutdown() => {
                info!("main router exited");
            }
        }
    });

    manager.stop_all();
    let code = match surface.stop_main_router() {
        Ok(code) => code,
        Err(RouterError::AlreadyStopped(_)) => main_handle.exit_code(),
        Err(e) => {
            warn!("stopping main router: {}", e);
            1
        }
    };
    info!(code, "shutdown complete");
    Ok(code)
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
