//! Extension routers: isolated router instances spawned at runtime.
//!
//! Each extension owns a worker thread running its own router — its own
//! event loop, endpoints, dedup cache, and exit flag — and talks to the
//! main router only through the traffic crossing its attach point. The
//! manager here owns the registry, discovers attach points in the main
//! configuration by name prefix, persists one JSON record per extension,
//! and stops workers cooperatively: request exit on that instance's
//! handle, then wait out a join deadline. A worker that will not stop is
//! marked failed and leaked, never killed.

use crate::config::{Config, EndpointConfig, EndpointMode};
use crate::error::{Result, RouterError};
use crate::filter::EndpointFilters;
use crate::router::{run_router_blocking, RouterHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How long `stop` waits for the worker to publish its router handle.
const HANDLE_WAIT_POLLS: u32 = 20;
const HANDLE_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Join deadline for a cooperative stop.
const STOP_JOIN_DEADLINE: Duration = Duration::from_secs(5);

/// Bounded join when the worker never initialized.
const FALLBACK_JOIN_DEADLINE: Duration = Duration::from_secs(2);

/// Transport family of an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionType {
    /// Joined over a loopback datagram attach point.
    Internal,
    /// Joined over a TCP attach point.
    Tcp,
    /// Joined over a UDP attach point.
    Udp,
}

impl ExtensionType {
    /// Conventional name prefix of this family's attach points in the
    /// main configuration.
    pub fn attach_prefix(&self) -> &'static str {
        match self {
            Self::Internal => "internal-router-point",
            Self::Tcp => "tcp-extension-point",
            Self::Udp => "udp-extension-point",
        }
    }
}

impl fmt::Display for ExtensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Internal => "internal",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of an extension worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionState {
    /// Worker spawned, router not yet published.
    Starting,
    /// Router handle published, event loop running.
    Running,
    /// Stop in progress.
    Stopping,
    /// Worker joined after a clean exit.
    Stopped,
    /// Worker died, never initialized, or outlived its stop deadline.
    Failed,
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Mode of a persisted datagram endpoint record.
///
/// The on-disk spelling is capitalized; lowercase is accepted on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UdpRecordMode {
    #[serde(rename = "Server", alias = "server")]
    Server,
    #[serde(rename = "Client", alias = "client")]
    Client,
}

/// Persisted datagram endpoint of an extension's thread config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpEndpointRecord {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub mode: UdpRecordMode,
}

/// Persisted stream endpoint of an extension's thread config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpointRecord {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Reconnect delay in milliseconds.
    pub retry_timeout: u64,
}

/// General section of an extension's thread config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionGeneral {
    /// Implicit TCP server port of the extension router.
    pub tcp_server_port: u16,
}

/// The full router configuration an extension worker runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionThreadConfig {
    #[serde(default)]
    pub general: ExtensionGeneral,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub udp_endpoints: Vec<UdpEndpointRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tcp_endpoints: Vec<TcpEndpointRecord>,
}

impl ExtensionThreadConfig {
    /// Expand the persisted records into a router [`Config`].
    pub fn to_router_config(&self) -> Config {
        let mut config = Config::default();
        config.general.tcp_listen_port = self.general.tcp_server_port;

        for udp in &self.udp_endpoints {
            config.endpoint.push(EndpointConfig::Udp {
                name: udp.name.clone(),
                address: format!("{}:{}", udp.address, udp.port),
                mode: match udp.mode {
                    UdpRecordMode::Server => EndpointMode::Server,
                    UdpRecordMode::Client => EndpointMode::Client,
                },
                group: None,
                filters: EndpointFilters::default(),
            });
        }
        for tcp in &self.tcp_endpoints {
            config.endpoint.push(EndpointConfig::Tcp {
                name: tcp.name.clone(),
                address: format!("{}:{}", tcp.address, tcp.port),
                retry_timeout_ms: tcp.retry_timeout,
                group: None,
                filters: EndpointFilters::default(),
            });
        }
        config
    }
}

/// An extension as declared over the control surface and persisted to
/// `extension_<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExtensionType,
    /// The extension's own peer address.
    pub address: String,
    /// The extension's own peer port.
    pub port: u16,
    /// Attach point on the main router; auto-assigned when empty.
    #[serde(default)]
    pub assigned_extension_point: String,
    /// The synthesized router config the worker runs.
    #[serde(default)]
    pub extension_thread_config: ExtensionThreadConfig,
}

/// Snapshot of one registry entry, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExtensionType,
    pub address: String,
    pub port: u16,
    pub assigned_extension_point: String,
    pub state: ExtensionState,
    pub thread_id: u64,
}

struct ExtensionRecord {
    config: ExtensionConfig,
    state: ExtensionState,
    /// Published by the worker under the registry mutex; the only way
    /// `stop` can reach the right router instance.
    router: Option<RouterHandle>,
    thread: Option<std::thread::JoinHandle<()>>,
    thread_id: u64,
}

impl ExtensionRecord {
    fn snapshot(&self) -> ExtensionSnapshot {
        ExtensionSnapshot {
            name: self.config.name.clone(),
            kind: self.config.kind,
            address: self.config.address.clone(),
            port: self.config.port,
            assigned_extension_point: self.config.assigned_extension_point.clone(),
            state: self.state,
            thread_id: self.thread_id,
        }
    }
}

/// Registry and lifecycle of all extension routers.
pub struct ExtensionManager {
    registry: Mutex<HashMap<String, ExtensionRecord>>,
    config_dir: PathBuf,
    main_config: Config,
    next_thread_id: AtomicU64,
}

impl ExtensionManager {
    /// Build a manager scanning `main_config` for attach points and
    /// persisting records under `config_dir`.
    pub fn new(main_config: Config, config_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            config_dir: config_dir.into(),
            main_config,
            next_thread_id: AtomicU64::new(0),
        })
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("extension_{}.json", name))
    }

    /// Parse a control-surface JSON payload and create the extension.
    pub fn create_from_json(self: &Arc<Self>, payload: &[u8]) -> Result<ExtensionSnapshot> {
        let config: ExtensionConfig = serde_json::from_slice(payload)
            .map_err(|e| RouterError::config(format!("invalid extension config: {}", e)))?;
        self.create(config)
    }

    /// Create an extension: validate, assign an attach point, synthesize
    /// its thread config, persist it, and spawn the worker.
    pub fn create(self: &Arc<Self>, config: ExtensionConfig) -> Result<ExtensionSnapshot> {
        validate_extension_config(&config)?;

        let mut config = config;
        {
            let mut registry = self.registry.lock();
            if registry.contains_key(&config.name) {
                return Err(RouterError::Duplicate(config.name));
            }

            let point = self
                .assign_attach_point(&registry, config.kind)
                .ok_or_else(|| RouterError::NoAttachPoint(config.name.clone()))?;
            info!(
                extension = %config.name,
                attach_point = %point,
                "attach point assigned"
            );
            config.assigned_extension_point = point;
            self.synthesize_thread_config(&mut config)?;
            self.persist(&config)?;

            registry.insert(
                config.name.clone(),
                ExtensionRecord {
                    config: config.clone(),
                    state: ExtensionState::Starting,
                    router: None,
                    thread: None,
                    thread_id: 0,
                },
            );
        }

        if let Err(e) = self.spawn_worker(&config.name) {
            // Roll back so a retry can succeed.
            self.registry.lock().remove(&config.name);
            let _ = std::fs::remove_file(self.config_path(&config.name));
            return Err(e);
        }

        self.get(&config.name)
    }

    /// Restart a stopped extension with its stored configuration.
    pub fn start(self: &Arc<Self>, name: &str) -> Result<()> {
        {
            let mut registry = self.registry.lock();
            let record = registry
                .get_mut(name)
                .ok_or_else(|| RouterError::NotFound(name.to_string()))?;
            match record.state {
                ExtensionState::Starting
                | ExtensionState::Running
                | ExtensionState::Stopping => {
                    return Err(RouterError::AlreadyRunning(name.to_string()))
                }
                ExtensionState::Stopped | ExtensionState::Failed => {}
            }
            record.state = ExtensionState::Starting;
            record.router = None;
            record.thread = None;
        }
        self.spawn_worker(name)
    }

    /// Stop an extension cooperatively.
    ///
    /// Waits up to a second for the worker to publish its router handle,
    /// requests exit on that instance alone, then joins with a 5 s
    /// deadline. Exceeding the deadline marks the record failed and
    /// leaks the worker.
    pub fn stop(&self, name: &str) -> Result<()> {
        // Wait for the worker-published handle, releasing the registry
        // between polls.
        let mut router = None;
        for _ in 0..HANDLE_WAIT_POLLS {
            {
                let mut registry = self.registry.lock();
                let record = registry
                    .get_mut(name)
                    .ok_or_else(|| RouterError::NotFound(name.to_string()))?;
                match record.state {
                    ExtensionState::Stopped | ExtensionState::Failed => {
                        return Err(RouterError::AlreadyStopped(name.to_string()))
                    }
                    _ => {}
                }
                if let Some(handle) = record.router.clone() {
                    record.state = ExtensionState::Stopping;
                    router = Some(handle);
                    break;
                }
            }
            std::thread::sleep(HANDLE_WAIT_POLL_INTERVAL);
        }

        let thread = {
            let mut registry = self.registry.lock();
            registry.get_mut(name).and_then(|r| r.thread.take())
        };

        let Some(router) = router else {
            // The worker never initialized; bounded join and give up.
            error!(extension = name, "router never published, marking failed");
            if let Some(thread) = thread {
                let _ = join_with_deadline(thread, FALLBACK_JOIN_DEADLINE);
            }
            self.finish_stop(name, ExtensionState::Failed);
            return Err(RouterError::StopTimeout(name.to_string()));
        };

        // Exit flag of this instance only; peers are untouched.
        router.request_exit(0);

        let joined = match thread {
            Some(thread) => join_with_deadline(thread, STOP_JOIN_DEADLINE).is_some(),
            None => true,
        };

        if joined {
            self.finish_stop(name, ExtensionState::Stopped);
            info!(extension = name, "extension stopped");
            Ok(())
        } else {
            // Deliberately leaked: killing the worker would corrupt
            // descriptor state.
            warn!(extension = name, "worker outlived stop deadline, leaked");
            self.finish_stop(name, ExtensionState::Failed);
            Err(RouterError::StopTimeout(name.to_string()))
        }
    }

    fn finish_stop(&self, name: &str, state: ExtensionState) {
        let mut registry = self.registry.lock();
        if let Some(record) = registry.get_mut(name) {
            record.state = state;
            record.router = None;
        }
    }

    /// Stop (best effort), remove the persisted file, erase the entry.
    pub fn delete(&self, name: &str) -> Result<()> {
        match self.stop(name) {
            Ok(()) => {}
            Err(RouterError::AlreadyStopped(_)) => {}
            Err(RouterError::NotFound(n)) => return Err(RouterError::NotFound(n)),
            Err(e) => warn!(extension = name, "stop during delete: {}", e),
        }

        let path = self.config_path(name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "failed to remove config: {}", e);
            }
        }

        self.registry.lock().remove(name);
        info!(extension = name, "extension deleted");
        Ok(())
    }

    /// Snapshot one extension.
    pub fn get(&self, name: &str) -> Result<ExtensionSnapshot> {
        self.registry
            .lock()
            .get(name)
            .map(ExtensionRecord::snapshot)
            .ok_or_else(|| RouterError::NotFound(name.to_string()))
    }

    /// Snapshot every extension, sorted by name.
    pub fn list(&self) -> Vec<ExtensionSnapshot> {
        let mut all: Vec<_> = self
            .registry
            .lock()
            .values()
            .map(ExtensionRecord::snapshot)
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Stop every running extension; used at process shutdown.
    pub fn stop_all(&self) {
        let names: Vec<String> = self.registry.lock().keys().cloned().collect();
        for name in names {
            match self.stop(&name) {
                Ok(()) | Err(RouterError::AlreadyStopped(_)) => {}
                Err(e) => warn!(extension = %name, "shutdown stop failed: {}", e),
            }
        }
    }

    /// Register every persisted `extension_*.json` without starting it.
    ///
    /// Returns the number of records loaded; unparseable files are
    /// logged and skipped.
    pub fn load_dir(&self) -> usize {
        let entries = match std::fs::read_dir(&self.config_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %self.config_dir.display(), "cannot scan extension dir: {}", e);
                }
                return 0;
            }
        };

        let mut loaded = 0;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.starts_with("extension_") || !file_name.ends_with(".json") {
                continue;
            }

            let path = entry.path();
            let config: ExtensionConfig = match std::fs::read(&path)
                .map_err(RouterError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(RouterError::from))
            {
                Ok(config) => config,
                Err(e) => {
                    error!(path = %path.display(), "skipping unreadable extension config: {}", e);
                    continue;
                }
            };

            let name = config.name.clone();
            let mut registry = self.registry.lock();
            if registry.contains_key(&name) {
                warn!(extension = %name, "duplicate persisted extension skipped");
                continue;
            }
            registry.insert(
                name.clone(),
                ExtensionRecord {
                    config,
                    state: ExtensionState::Stopped,
                    router: None,
                    thread: None,
                    thread_id: 0,
                },
            );
            info!(extension = %name, "persisted extension registered (not started)");
            loaded += 1;
        }
        loaded
    }

    /// First unused attach point of the right family, by name prefix.
    fn assign_attach_point(
        &self,
        registry: &HashMap<String, ExtensionRecord>,
        kind: ExtensionType,
    ) -> Option<String> {
        let used: HashSet<&str> = registry
            .values()
            .map(|r| r.config.assigned_extension_point.as_str())
            .filter(|point| !point.is_empty())
            .collect();

        let prefix = kind.attach_prefix();
        self.main_config
            .endpoint
            .iter()
            .filter(|endpoint| match kind {
                ExtensionType::Tcp => matches!(endpoint, EndpointConfig::Tcp { .. }),
                ExtensionType::Udp | ExtensionType::Internal => {
                    matches!(endpoint, EndpointConfig::Udp { .. })
                }
            })
            .find(|endpoint| {
                endpoint.name().starts_with(prefix) && !used.contains(endpoint.name())
            })
            .map(|endpoint| endpoint.name().to_string())
    }

    /// Build the worker's config: the attach point joined in client role
    /// (the main side runs the server role) plus the user endpoint.
    fn synthesize_thread_config(&self, config: &mut ExtensionConfig) -> Result<()> {
        let point = self
            .main_config
            .find_endpoint(&config.assigned_extension_point)
            .ok_or_else(|| {
                RouterError::config(format!(
                    "attach point '{}' missing from main configuration",
                    config.assigned_extension_point
                ))
            })?;

        let mut thread_config = ExtensionThreadConfig {
            general: ExtensionGeneral {
                tcp_server_port: stable_server_port(&config.name),
            },
            ..Default::default()
        };

        match point {
            EndpointConfig::Udp { name, address, .. } => {
                let (host, port) = split_address(address)?;
                thread_config.udp_endpoints.push(UdpEndpointRecord {
                    name: name.clone(),
                    address: host,
                    port,
                    mode: UdpRecordMode::Client,
                });
            }
            EndpointConfig::Tcp { name, address, .. } => {
                let (host, port) = split_address(address)?;
                thread_config.tcp_endpoints.push(TcpEndpointRecord {
                    name: name.clone(),
                    address: host,
                    port,
                    retry_timeout: 5000,
                });
            }
            EndpointConfig::Serial { .. } => {
                return Err(RouterError::config(
                    "serial endpoints cannot serve as attach points",
                ));
            }
        }

        match config.kind {
            ExtensionType::Tcp => thread_config.tcp_endpoints.push(TcpEndpointRecord {
                name: config.name.clone(),
                address: config.address.clone(),
                port: config.port,
                retry_timeout: 5000,
            }),
            ExtensionType::Udp | ExtensionType::Internal => {
                thread_config.udp_endpoints.push(UdpEndpointRecord {
                    name: config.name.clone(),
                    address: config.address.clone(),
                    port: config.port,
                    mode: UdpRecordMode::Client,
                })
            }
        }

        config.extension_thread_config = thread_config;
        Ok(())
    }

    fn persist(&self, config: &ExtensionConfig) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)
            .map_err(|e| RouterError::filesystem(self.config_dir.display().to_string(), e))?;
        let path = self.config_path(&config.name);
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&path, json)
            .map_err(|e| RouterError::filesystem(path.display().to_string(), e))?;
        info!(path = %path.display(), "extension config saved");
        Ok(())
    }

    /// Spawn the worker thread running the extension's router.
    fn spawn_worker(self: &Arc<Self>, name: &str) -> Result<()> {
        let router_config = {
            let registry = self.registry.lock();
            let record = registry
                .get(name)
                .ok_or_else(|| RouterError::NotFound(name.to_string()))?;
            let config = record.config.extension_thread_config.to_router_config();
            config.validate()?;
            config
        };

        let thread_id = self.next_thread_id.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = Arc::clone(self);
        let name_owned = name.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("extension-{}", name))
            .spawn(move || worker_body(manager, name_owned, router_config))
            .map_err(|e| RouterError::internal(format!("failed to spawn worker: {}", e)))?;

        let mut registry = self.registry.lock();
        if let Some(record) = registry.get_mut(name) {
            record.thread = Some(thread);
            record.thread_id = thread_id;
        }
        Ok(())
    }
}

/// The extension worker: build the router, publish its handle, run it,
/// and record the outcome.
fn worker_body(manager: Arc<ExtensionManager>, name: String, router_config: Config) {
    info!(extension = %name, "worker starting");

    let handle = RouterHandle::new(&name);
    {
        let mut registry = manager.registry.lock();
        match registry.get_mut(&name) {
            Some(record) => {
                record.router = Some(handle.clone());
                record.state = ExtensionState::Running;
            }
            None => {
                warn!(extension = %name, "record vanished before start");
                return;
            }
        }
    }

    let code = run_router_blocking(&name, &router_config, handle);

    let mut registry = manager.registry.lock();
    if let Some(record) = registry.get_mut(&name) {
        record.router = None;
        // A stop in progress owns the final state; only a
        // self-initiated exit lands here in a live state.
        if matches!(
            record.state,
            ExtensionState::Starting | ExtensionState::Running
        ) {
            record.state = if code == 0 {
                ExtensionState::Stopped
            } else {
                ExtensionState::Failed
            };
        }
    }
    info!(extension = %name, code, "worker finished");
}

/// Poll a worker thread up to `deadline`; `Some(value)` when it joined.
///
/// The handle is dropped (detaching the thread) when the deadline
/// passes — that is the deliberate leak.
pub(crate) fn join_with_deadline<T>(
    thread: std::thread::JoinHandle<T>,
    deadline: Duration,
) -> Option<T> {
    let start = Instant::now();
    while !thread.is_finished() {
        if start.elapsed() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    thread.join().ok()
}

fn validate_extension_config(config: &ExtensionConfig) -> Result<()> {
    if config.name.is_empty() {
        return Err(RouterError::config("extension name must not be empty"));
    }
    if config
        .name
        .contains(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
    {
        return Err(RouterError::config(format!(
            "extension name '{}' must be alphanumeric with - or _",
            config.name
        )));
    }
    if config.address.is_empty() {
        return Err(RouterError::config("extension address must not be empty"));
    }
    if config.port == 0 {
        return Err(RouterError::config("extension port must not be 0"));
    }
    Ok(())
}

/// Deterministic per-extension TCP server port in 50000..60000.
///
/// FNV-1a over the name, so a persisted record reloads onto the same
/// port instead of drawing a fresh random one.
fn stable_server_port(name: &str) -> u16 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    50_000 + (hash % 10_000) as u16
}

fn split_address(address: &str) -> Result<(String, u16)> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        RouterError::config(format!("address '{}' is not host:port", address))
    })?;
    let port = port
        .parse::<u16>()
        .map_err(|e| RouterError::config(format!("bad port in '{}': {}", address, e)))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn main_config_with_points() -> Config {
        Config::parse(
            r#"
[[endpoint]]
type = "udp"
name = "udp-extension-point-1"
address = "127.0.0.1:25001"
mode = "server"

[[endpoint]]
type = "udp"
name = "udp-extension-point-2"
address = "127.0.0.1:25002"
mode = "server"

[[endpoint]]
type = "tcp"
name = "tcp-extension-point-1"
address = "127.0.0.1:25101"

[[endpoint]]
type = "udp"
name = "internal-router-point-1"
address = "127.0.0.1:25201"
mode = "server"
"#,
        )
        .expect("main config")
    }

    fn extension(name: &str, kind: ExtensionType) -> ExtensionConfig {
        ExtensionConfig {
            name: name.to_string(),
            kind,
            address: "127.0.0.1".to_string(),
            port: 33000,
            assigned_extension_point: String::new(),
            extension_thread_config: ExtensionThreadConfig::default(),
        }
    }

    #[test]
    fn test_attach_prefixes() {
        assert_eq!(
            ExtensionType::Internal.attach_prefix(),
            "internal-router-point"
        );
        assert_eq!(ExtensionType::Tcp.attach_prefix(), "tcp-extension-point");
        assert_eq!(ExtensionType::Udp.attach_prefix(), "udp-extension-point");
    }

    #[test]
    fn test_assign_attach_point_first_free_by_name() {
        let manager = ExtensionManager::new(main_config_with_points(), "unused");
        let mut registry = HashMap::new();

        let first = manager
            .assign_attach_point(&registry, ExtensionType::Udp)
            .expect("first point");
        assert_eq!(first, "udp-extension-point-1");

        // Mark it used and ask again.
        let mut used = extension("a", ExtensionType::Udp);
        used.assigned_extension_point = first;
        registry.insert(
            "a".to_string(),
            ExtensionRecord {
                config: used,
                state: ExtensionState::Running,
                router: None,
                thread: None,
                thread_id: 1,
            },
        );
        let second = manager
            .assign_attach_point(&registry, ExtensionType::Udp)
            .expect("second point");
        assert_eq!(second, "udp-extension-point-2");

        // Family prefixes do not cross.
        let tcp = manager
            .assign_attach_point(&registry, ExtensionType::Tcp)
            .expect("tcp point");
        assert_eq!(tcp, "tcp-extension-point-1");
        let internal = manager
            .assign_attach_point(&registry, ExtensionType::Internal)
            .expect("internal point");
        assert_eq!(internal, "internal-router-point-1");
    }

    #[test]
    fn test_synthesized_config_joins_attach_point_as_client() {
        let manager = ExtensionManager::new(main_config_with_points(), "unused");
        let mut config = extension("video", ExtensionType::Udp);
        config.assigned_extension_point = "udp-extension-point-1".to_string();
        manager
            .synthesize_thread_config(&mut config)
            .expect("synthesize");

        let thread = &config.extension_thread_config;
        assert_eq!(thread.udp_endpoints.len(), 2);
        assert_eq!(thread.udp_endpoints[0].name, "udp-extension-point-1");
        assert_eq!(thread.udp_endpoints[0].mode, UdpRecordMode::Client);
        assert_eq!(thread.udp_endpoints[0].port, 25001);
        assert_eq!(thread.udp_endpoints[1].name, "video");
        assert!((50_000..60_000).contains(&thread.general.tcp_server_port));

        let router_config = thread.to_router_config();
        router_config.validate().expect("synthesized config valid");
        assert_eq!(router_config.endpoint.len(), 2);
    }

    #[test]
    fn test_json_round_trip() {
        let manager = ExtensionManager::new(main_config_with_points(), "unused");
        let mut config = extension("relay", ExtensionType::Tcp);
        config.assigned_extension_point = "tcp-extension-point-1".to_string();
        manager
            .synthesize_thread_config(&mut config)
            .expect("synthesize");

        let json = serde_json::to_string_pretty(&config).expect("serialize");
        let reloaded: ExtensionConfig = serde_json::from_str(&json).expect("reload");
        assert_eq!(reloaded, config);
        assert_eq!(
            reloaded.extension_thread_config,
            config.extension_thread_config
        );
    }

    #[test]
    fn test_loads_capitalized_and_lowercase_modes() {
        let json = r#"{
            "name": "old", "type": "udp", "address": "127.0.0.1", "port": 33000,
            "assigned_extension_point": "udp-extension-point-1",
            "extension_thread_config": {
                "general": {"tcp_server_port": 51000},
                "udp_endpoints": [
                    {"name": "p", "address": "127.0.0.1", "port": 25001, "mode": "Server"},
                    {"name": "q", "address": "127.0.0.1", "port": 25002, "mode": "client"}
                ]
            }
        }"#;
        let config: ExtensionConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(
            config.extension_thread_config.udp_endpoints[0].mode,
            UdpRecordMode::Server
        );
        assert_eq!(
            config.extension_thread_config.udp_endpoints[1].mode,
            UdpRecordMode::Client
        );
    }

    #[test]
    fn test_stable_server_port_is_deterministic_and_in_range() {
        let a = stable_server_port("video");
        let b = stable_server_port("video");
        assert_eq!(a, b);
        assert!((50_000..60_000).contains(&a));
        assert!((50_000..60_000).contains(&stable_server_port("relay")));
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        assert!(validate_extension_config(&extension("", ExtensionType::Udp)).is_err());

        let mut no_port = extension("x", ExtensionType::Udp);
        no_port.port = 0;
        assert!(validate_extension_config(&no_port).is_err());

        let mut no_addr = extension("x", ExtensionType::Udp);
        no_addr.address = String::new();
        assert!(validate_extension_config(&no_addr).is_err());

        assert!(validate_extension_config(&extension("bad name", ExtensionType::Udp)).is_err());
        assert!(validate_extension_config(&extension("ok-name_2", ExtensionType::Udp)).is_ok());
    }

    #[test]
    fn test_split_address() {
        let (host, port) = split_address("127.0.0.1:14550").expect("split");
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 14550);
        assert!(split_address("nonsense").is_err());
    }
}
