//! Router configuration.
//!
//! Loaded from TOML with [`Config::load`]. A config names the general
//! router options, the endpoint list (routing iterates endpoints in the
//! order they appear here), and the optional log sink.
//!
//! # Example
//! ```toml
//! [general]
//! tcp_listen_port = 5760
//! dedup_period_ms = 100
//! sniffer_sysid = 0
//! extension_config_dir = "extensions"
//!
//! [[endpoint]]
//! type = "serial"
//! name = "autopilot"
//! device = "/dev/ttyACM0"
//! baudrates = [115200, 57600]
//!
//! [[endpoint]]
//! type = "udp"
//! name = "gcs"
//! address = "0.0.0.0:14550"
//! mode = "server"
//! block_msg_id_out = "0,4"
//!
//! [[endpoint]]
//! type = "tcp"
//! name = "cloud"
//! address = "127.0.0.1:5761"
//! retry_timeout_ms = 5000
//!
//! [sink]
//! logs_dir = "logs"
//! mode = "while_armed"
//! ```

use crate::error::{Result, RouterError};
use crate::filter::EndpointFilters;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;

/// Default baud rate for serial endpoints configured without one.
pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Complete router configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    /// General router options.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Endpoint list; attach order is routing order.
    #[serde(default)]
    pub endpoint: Vec<EndpointConfig>,
    /// Optional write-only log sink.
    #[serde(default)]
    pub sink: Option<SinkConfig>,
}

/// General router options.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Implicit TCP server port; 0 disables it.
    #[serde(default)]
    pub tcp_listen_port: u16,
    /// Log per-endpoint statistics periodically.
    #[serde(default)]
    pub report_stats: bool,
    /// Log level override ("trace".."error"); CLI and RUST_LOG win.
    pub log_level: Option<String>,
    /// Duplicate-suppression window in milliseconds; 0 disables.
    #[serde(default)]
    pub dedup_period_ms: u64,
    /// A system id whose ingress endpoint receives every routed message;
    /// 0 disables.
    #[serde(default)]
    pub sniffer_sysid: u8,
    /// Directory holding persisted `extension_<name>.json` records.
    pub extension_config_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            tcp_listen_port: 0,
            report_stats: false,
            log_level: None,
            dedup_period_ms: 0,
            sniffer_sysid: 0,
            extension_config_dir: None,
        }
    }
}

/// One endpoint record.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum EndpointConfig {
    /// Datagram endpoint.
    Udp {
        /// Unique endpoint name.
        name: String,
        /// Bind address (server) or peer address (client), "host:port".
        address: String,
        /// Operating mode.
        #[serde(default = "default_mode_server")]
        mode: EndpointMode,
        /// Optional group label; members share ingress for routing.
        #[serde(default)]
        group: Option<String>,
        /// Filter axes.
        #[serde(flatten)]
        filters: EndpointFilters,
    },
    /// Stream endpoint (always a client; the implicit server comes from
    /// `general.tcp_listen_port`).
    Tcp {
        /// Unique endpoint name.
        name: String,
        /// Peer address, "host:port".
        address: String,
        /// Reconnect delay after a disconnect; 0 removes the endpoint on
        /// the first terminal disconnect.
        #[serde(default = "default_retry_timeout_ms")]
        retry_timeout_ms: u64,
        /// Optional group label.
        #[serde(default)]
        group: Option<String>,
        /// Filter axes.
        #[serde(flatten)]
        filters: EndpointFilters,
    },
    /// Serial endpoint with candidate-baud discovery.
    Serial {
        /// Unique endpoint name.
        name: String,
        /// Device path, e.g. "/dev/ttyACM0".
        device: String,
        /// Candidate baud rates, probed in order.
        #[serde(default = "default_baudrates")]
        baudrates: Vec<u32>,
        /// Enable RTS/CTS flow control.
        #[serde(default)]
        flow_control: bool,
        /// Full wraps of the baud list before the endpoint turns failed.
        #[serde(default = "default_baud_probe_cycles")]
        baud_probe_cycles: u32,
        /// Optional group label.
        #[serde(default)]
        group: Option<String>,
        /// Filter axes.
        #[serde(flatten)]
        filters: EndpointFilters,
    },
}

/// Operating mode for datagram endpoints.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    /// Send to a fixed peer, receive from anyone.
    Client,
    /// Bind and learn peers from ingress traffic.
    Server,
}

fn default_mode_server() -> EndpointMode {
    EndpointMode::Server
}

fn default_retry_timeout_ms() -> u64 {
    5000
}

fn default_baudrates() -> Vec<u32> {
    vec![DEFAULT_BAUDRATE]
}

fn default_baud_probe_cycles() -> u32 {
    3
}

impl EndpointConfig {
    /// The endpoint's configured name.
    pub fn name(&self) -> &str {
        match self {
            Self::Udp { name, .. } | Self::Tcp { name, .. } | Self::Serial { name, .. } => name,
        }
    }

    /// The endpoint's group label, if any.
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Udp { group, .. } | Self::Tcp { group, .. } | Self::Serial { group, .. } => {
                group.as_deref()
            }
        }
    }

    /// The endpoint's filter axes.
    pub fn filters(&self) -> &EndpointFilters {
        match self {
            Self::Udp { filters, .. }
            | Self::Tcp { filters, .. }
            | Self::Serial { filters, .. } => filters,
        }
    }
}

/// Log sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Directory receiving tlog files.
    pub logs_dir: String,
    /// When to log.
    #[serde(default)]
    pub mode: SinkMode,
    /// Dialect hint recorded alongside the logs.
    pub dialect: Option<String>,
    /// Rotate the active file once it exceeds this size; 0 disables.
    #[serde(default)]
    pub max_size_mb: u64,
    /// Keep at most this many files, pruning the oldest; 0 disables.
    #[serde(default)]
    pub max_files: u64,
}

/// When the sink writes.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    /// Log from startup to shutdown.
    #[default]
    Always,
    /// Open a log on arming, close it on disarm.
    WhileArmed,
    /// Never log.
    Disabled,
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().display().to_string();
        let content = fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| RouterError::filesystem(&path_str, e))?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML configuration string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| RouterError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for conflicts before any endpoint opens.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut bind_ports = HashSet::new();

        if self.general.tcp_listen_port != 0 {
            bind_ports.insert(self.general.tcp_listen_port);
        }

        for (i, endpoint) in self.endpoint.iter().enumerate() {
            let name = endpoint.name();
            if name.is_empty() {
                return Err(RouterError::config(format!(
                    "Endpoint {} has an empty name",
                    i
                )));
            }
            if !names.insert(name.to_string()) {
                return Err(RouterError::config(format!(
                    "Duplicate endpoint name '{}'",
                    name
                )));
            }

            match endpoint {
                EndpointConfig::Udp { address, mode, .. } => {
                    let addr = parse_addr(address, name)?;
                    if *mode == EndpointMode::Server && !bind_ports.insert(addr.port()) {
                        return Err(RouterError::config(format!(
                            "Duplicate bind port {} on endpoint '{}'",
                            addr.port(),
                            name
                        )));
                    }
                }
                EndpointConfig::Tcp { address, .. } => {
                    parse_addr(address, name)?;
                }
                EndpointConfig::Serial {
                    device, baudrates, ..
                } => {
                    if device.is_empty() {
                        return Err(RouterError::config(format!(
                            "Serial endpoint '{}' has an empty device path",
                            name
                        )));
                    }
                    if baudrates.is_empty() {
                        return Err(RouterError::config(format!(
                            "Serial endpoint '{}' has no baud rates",
                            name
                        )));
                    }
                    for &baud in baudrates {
                        if !(300..=4_000_000).contains(&baud) {
                            return Err(RouterError::config(format!(
                                "Invalid baud rate {} on endpoint '{}' (must be 300-4000000)",
                                baud, name
                            )));
                        }
                    }
                }
            }

            let filters = endpoint.filters();
            for (set, axis) in [
                (&filters.allow_msg_id_out, "allow_msg_id_out"),
                (&filters.block_msg_id_out, "block_msg_id_out"),
                (&filters.allow_msg_id_in, "allow_msg_id_in"),
                (&filters.block_msg_id_in, "block_msg_id_in"),
            ] {
                for &msg_id in set {
                    if msg_id > 0xFF_FFFF {
                        return Err(RouterError::config(format!(
                            "Invalid {} value {} on endpoint '{}' (message ids are 24-bit)",
                            axis, msg_id, name
                        )));
                    }
                }
            }
        }

        if let Some(sink) = &self.sink {
            if sink.mode != SinkMode::Disabled && sink.logs_dir.is_empty() {
                return Err(RouterError::config("Sink logs_dir must not be empty"));
            }
        }

        Ok(())
    }

    /// Find an endpoint record by name.
    pub fn find_endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoint.iter().find(|e| e.name() == name)
    }
}

fn parse_addr(address: &str, name: &str) -> Result<std::net::SocketAddr> {
    address.parse().map_err(|e| {
        RouterError::config(format!(
            "Invalid address '{}' on endpoint '{}': {}",
            address, name, e
        ))
    })
}
