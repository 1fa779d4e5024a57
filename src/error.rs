//! Error types for mavswitch.
//!
//! Structured errors carry enough context to tell *which* endpoint, device,
//! or extension failed. The control surface maps a subset of these variants
//! onto its wire-level error codes.

use std::io;
use thiserror::Error;

/// Main error type for router and control-surface operations.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Configuration errors (parsing, validation, missing files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network I/O errors (bind failures, socket errors)
    #[error("Network error on endpoint '{endpoint}': {source}")]
    Network {
        /// Name or address of the endpoint that failed
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Serial port errors (device not found, permission denied)
    #[error("Serial port error on '{device}': {source}")]
    Serial {
        /// Path to the serial device
        device: String,
        /// Underlying serial error
        #[source]
        source: tokio_serial::Error,
    },

    /// MAVLink protocol errors (invalid frames, parsing failures)
    #[error("MAVLink protocol error: {0}")]
    Protocol(String),

    /// File system errors (log files, persisted extension configs)
    #[error("Filesystem error at '{path}': {source}")]
    Filesystem {
        /// Path that caused the error
        path: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Endpoint initialization errors
    #[error("Failed to initialize {endpoint_type} endpoint: {reason}")]
    EndpointInit {
        /// Type of endpoint (tcp, udp, serial, sink)
        endpoint_type: String,
        /// Reason for failure
        reason: String,
    },

    /// An extension with this name is already registered
    #[error("Extension '{0}' already exists")]
    Duplicate(String),

    /// No free attach point of the requested family in the main config
    #[error("No available attach point for extension '{0}'")]
    NoAttachPoint(String),

    /// Unknown extension or thread name
    #[error("'{0}' not found")]
    NotFound(String),

    /// Start requested while the worker is already running
    #[error("'{0}' is already running")]
    AlreadyRunning(String),

    /// Stop requested while the worker is already stopped
    #[error("'{0}' is already stopped")]
    AlreadyStopped(String),

    /// Cooperative stop exceeded its join deadline; worker left to finish
    #[error("Stopping '{0}' timed out; worker marked failed")]
    StopTimeout(String),

    /// Other unexpected errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results that use RouterError
pub type Result<T> = std::result::Result<T, RouterError>;

impl RouterError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new network error
    pub fn network(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Create a new serial error
    pub fn serial(device: impl Into<String>, source: tokio_serial::Error) -> Self {
        Self::Serial {
            device: device.into(),
            source,
        }
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new filesystem error
    pub fn filesystem(path: impl Into<String>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Create a new endpoint initialization error
    pub fn endpoint_init(endpoint_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EndpointInit {
            endpoint_type: endpoint_type.into(),
            reason: reason.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short machine-readable code for the control surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "invalid",
            Self::Duplicate(_) => "duplicate",
            Self::NoAttachPoint(_) => "no_attach_point",
            Self::NotFound(_) => "not_found",
            Self::AlreadyRunning(_) => "already_running",
            Self::AlreadyStopped(_) => "already_stopped",
            Self::StopTimeout(_) => "stop_timeout",
            _ => "internal",
        }
    }
}

impl From<io::Error> for RouterError {
    fn from(err: io::Error) -> Self {
        Self::Network {
            endpoint: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<tokio_serial::Error> for RouterError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::Serial {
            device: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("JSON error: {}", err))
    }
}
