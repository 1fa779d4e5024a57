//! The router instance: one event loop, one thread, one set of endpoints.
//!
//! A [`Router`] owns everything it touches: the endpoint slots, the dedup
//! cache, the event channel, and (through its [`tokio::task::JoinSet`])
//! every I/O task it spawned. Teardown is therefore a cancel-and-join:
//! each descriptor dies exactly once with its owner, and no two router
//! instances ever share one.
//!
//! Shutdown is cooperative and strictly per-instance: a
//! [`RouterHandle::request_exit`] cancels this router's token and nothing
//! else. The process may host one main router plus any number of extension
//! routers, each on its own thread with its own handle.

use crate::config::{Config, EndpointConfig, EndpointMode, SinkMode};
use crate::dedup::{Dedup, PacketStatus};
use crate::endpoint_core::{
    AcceptState, EndpointId, IngressCore, RoutedMessage, RouterEvent,
};
use crate::endpoints::{serial, sink, tcp, udp};
use crate::error::{Result, RouterError};
use crate::filter::EndpointFilters;
use crate::stats::EndpointStats;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Router event queue depth; ingress tasks await when it fills, which is
/// the input-side backpressure.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Per-endpoint transmit queue depth. A full queue is the would-block
/// condition: the copy is dropped and counted.
const TX_QUEUE_DEPTH: usize = 512;

/// Aggregated warnings and statistics cadence.
const AGGREGATE_INTERVAL: Duration = Duration::from_secs(5);

/// How long teardown waits for endpoint tasks before aborting them.
const TEARDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Cloneable control handle of one router instance.
///
/// Holds this instance's cancellation token and exit code; cancelling one
/// handle never affects another router.
#[derive(Clone, Debug)]
pub struct RouterHandle {
    name: Arc<str>,
    cancel: CancellationToken,
    exit_code: Arc<AtomicI32>,
}

impl RouterHandle {
    /// Fresh handle for a router that has not started yet.
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            cancel: CancellationToken::new(),
            exit_code: Arc::new(AtomicI32::new(0)),
        }
    }

    /// The router's name ("main" or the extension name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask this instance to exit on its next loop turn.
    pub fn request_exit(&self, code: i32) {
        info!(router = %self.name, code, "exit requested");
        self.exit_code.store(code, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// True once an exit was requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve once this instance begins shutting down.
    pub async fn wait_shutdown(&self) {
        self.cancel.cancelled().await
    }

    /// The exit code recorded by [`Self::request_exit`].
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Transport family of an endpoint slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Serial,
    Udp,
    Tcp,
    Sink,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Serial => "serial",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Sink => "sink",
        };
        f.write_str(s)
    }
}

/// Router-side state of one attached endpoint.
struct EndpointSlot {
    id: EndpointId,
    name: String,
    kind: EndpointKind,
    filters: EndpointFilters,
    group: Option<String>,
    /// (system, component) pairs observed on this endpoint's ingress.
    seen_ids: HashSet<(u8, u8)>,
    /// Ingress here carried the sniffer system id; this slot sees all.
    saw_sniffer: bool,
    /// Invalid slots stay listed (serial after probe failure) but are
    /// skipped by routing.
    valid: bool,
    tx: mpsc::Sender<RoutedMessage>,
    stats: Arc<EndpointStats>,
}

/// A single-threaded MAVLink router instance.
pub struct Router {
    handle: RouterHandle,
    events_tx: mpsc::Sender<RouterEvent>,
    events_rx: mpsc::Receiver<RouterEvent>,
    endpoints: Vec<EndpointSlot>,
    next_endpoint: usize,
    dedup: Dedup,
    sniffer_sysid: u8,
    report_stats: bool,
    tasks: JoinSet<()>,
    // Aggregated between 5 s flushes to avoid log storms
    unknown_dst: u64,
    dedup_drops: u64,
}

impl Router {
    /// Create a router bound to a handle; no endpoints attached yet.
    pub fn new(name: &str, handle: RouterHandle) -> Self {
        debug_assert_eq!(handle.name(), name);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            handle,
            events_tx,
            events_rx,
            endpoints: Vec::new(),
            next_endpoint: 0,
            dedup: Dedup::new(Duration::ZERO),
            sniffer_sysid: 0,
            report_stats: false,
            tasks: JoinSet::new(),
            unknown_dst: 0,
            dedup_drops: 0,
        }
    }

    /// This router's control handle.
    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    /// Names of the attached endpoints, in routing order.
    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.name.clone()).collect()
    }

    fn alloc_id(&mut self) -> EndpointId {
        let id = EndpointId(self.next_endpoint);
        self.next_endpoint += 1;
        id
    }

    /// Construct and register every endpoint of `config`.
    ///
    /// All transports are prepared (bound/opened) before any task is
    /// spawned, so a failure leaves the router exactly as it was: the
    /// already-prepared sockets are dropped on the error path.
    pub async fn attach_endpoints(&mut self, config: &Config) -> Result<()> {
        if !self.endpoints.is_empty() {
            return Err(RouterError::internal("endpoints already attached"));
        }

        self.dedup
            .set_period(Duration::from_millis(config.general.dedup_period_ms));
        if config.general.dedup_period_ms > 0 {
            info!(
                router = %self.handle.name(),
                period_ms = config.general.dedup_period_ms,
                "message de-duplication enabled"
            );
        }
        self.sniffer_sysid = config.general.sniffer_sysid;
        if self.sniffer_sysid != 0 {
            info!(
                sysid = self.sniffer_sysid,
                "an endpoint carrying this system id will sniff all messages"
            );
        }
        self.report_stats = config.general.report_stats;

        // Prepare phase: open every transport, spawn nothing yet.
        enum Prepared {
            Udp {
                socket: UdpSocket,
                mode: EndpointMode,
                target: Option<SocketAddr>,
            },
            Tcp {
                address: String,
                retry_timeout: Duration,
            },
            Serial {
                device: String,
                baudrates: Vec<u32>,
                flow_control: bool,
                probe_cycles: u32,
            },
        }

        let mut prepared = Vec::with_capacity(config.endpoint.len());
        for endpoint in &config.endpoint {
            let item = match endpoint {
                EndpointConfig::Udp {
                    name,
                    address,
                    mode,
                    ..
                } => {
                    let (socket, target) = udp::prepare(name, address, *mode).await?;
                    Prepared::Udp {
                        socket,
                        mode: *mode,
                        target,
                    }
                }
                EndpointConfig::Tcp {
                    address,
                    retry_timeout_ms,
                    ..
                } => Prepared::Tcp {
                    address: address.clone(),
                    retry_timeout: Duration::from_millis(*retry_timeout_ms),
                },
                EndpointConfig::Serial {
                    name,
                    device,
                    baudrates,
                    flow_control,
                    baud_probe_cycles,
                    ..
                } => {
                    let first_baud = baudrates
                        .first()
                        .copied()
                        .unwrap_or(crate::config::DEFAULT_BAUDRATE);
                    serial::probe_device(name, device, first_baud).await?;
                    Prepared::Serial {
                        device: device.clone(),
                        baudrates: baudrates.clone(),
                        flow_control: *flow_control,
                        probe_cycles: *baud_probe_cycles,
                    }
                }
            };
            prepared.push(item);
        }

        let listener = if config.general.tcp_listen_port != 0 {
            Some(tcp::prepare_listener(config.general.tcp_listen_port).await?)
        } else {
            None
        };

        let sink_cfg = match &config.sink {
            Some(cfg) if cfg.mode != SinkMode::Disabled => {
                sink::prepare(cfg).await?;
                Some(cfg.clone())
            }
            _ => None,
        };

        // Spawn phase: nothing below can fail.
        for (endpoint, item) in config.endpoint.iter().zip(prepared) {
            let id = self.alloc_id();
            let name = endpoint.name().to_string();
            let stats = Arc::new(EndpointStats::new());
            let (tx, rx) = mpsc::channel(TX_QUEUE_DEPTH);
            let core = IngressCore::new(
                id,
                name.clone(),
                endpoint.filters().clone(),
                stats.clone(),
                self.events_tx.clone(),
            );
            let cancel = self.handle.cancel_token().child_token();

            let kind = match item {
                Prepared::Udp {
                    socket,
                    mode,
                    target,
                } => {
                    self.tasks
                        .spawn(udp::run(socket, mode, target, core, rx, cancel));
                    EndpointKind::Udp
                }
                Prepared::Tcp {
                    address,
                    retry_timeout,
                } => {
                    self.tasks
                        .spawn(tcp::run_client(address, retry_timeout, core, rx, cancel));
                    EndpointKind::Tcp
                }
                Prepared::Serial {
                    device,
                    baudrates,
                    flow_control,
                    probe_cycles,
                } => {
                    self.tasks.spawn(serial::run(
                        device,
                        baudrates,
                        flow_control,
                        probe_cycles,
                        core,
                        rx,
                        cancel,
                    ));
                    EndpointKind::Serial
                }
            };

            info!(router = %self.handle.name(), endpoint = %name, %kind, %id, "endpoint attached");
            self.endpoints.push(EndpointSlot {
                id,
                name,
                kind,
                filters: endpoint.filters().clone(),
                group: endpoint.group().map(str::to_string),
                seen_ids: HashSet::new(),
                saw_sniffer: false,
                valid: true,
                tx,
                stats,
            });
        }

        if let Some(listener) = listener {
            let events = self.events_tx.clone();
            let cancel = self.handle.cancel_token().child_token();
            self.tasks.spawn(tcp::run_server(listener, events, cancel));
        }

        if let Some(cfg) = sink_cfg {
            let id = self.alloc_id();
            let stats = Arc::new(EndpointStats::new());
            let (tx, rx) = mpsc::channel(TX_QUEUE_DEPTH);
            let cancel = self.handle.cancel_token().child_token();
            self.tasks.spawn(sink::run(cfg, stats.clone(), rx, cancel));
            self.endpoints.push(EndpointSlot {
                id,
                name: "log-sink".to_string(),
                kind: EndpointKind::Sink,
                filters: EndpointFilters::default(),
                group: None,
                seen_ids: HashSet::new(),
                saw_sniffer: false,
                valid: true,
                tx,
                stats,
            });
        }

        Ok(())
    }

    /// Drive the router until its handle is cancelled.
    ///
    /// Returns the exit code: 0 for a requested stop, non-zero after a
    /// critical endpoint failure.
    pub async fn run(&mut self) -> i32 {
        info!(
            router = %self.handle.name(),
            endpoints = self.endpoints.len(),
            "router running"
        );

        let mut aggregate = tokio::time::interval(AGGREGATE_INTERVAL);
        aggregate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        aggregate.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = self.handle.cancel_token().cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = aggregate.tick() => self.flush_aggregates(),
            }
        }

        self.teardown().await;
        self.handle.exit_code()
    }

    fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Inbound(msg) => {
                if self.dedup.check(&msg.raw) == PacketStatus::Duplicate {
                    self.dedup_drops += 1;
                    return;
                }
                self.note_ingress(&msg);
                self.route(msg);
            }
            RouterEvent::Attach { peer, stream } => self.attach_dynamic(peer, stream),
            RouterEvent::Closed { id, retain } => self.reap(id, retain),
            RouterEvent::Fatal { name, error } => {
                error!(endpoint = %name, %error, "critical endpoint failed");
                self.handle.request_exit(1);
            }
        }
    }

    /// Learn routing hints from an ingress frame.
    fn note_ingress(&mut self, msg: &RoutedMessage) {
        let sniffer = self.sniffer_sysid;
        if let Some(slot) = self.endpoints.iter_mut().find(|e| e.id == msg.source) {
            slot.seen_ids
                .insert((msg.header.system_id, msg.header.component_id));
            if sniffer != 0 && msg.header.system_id == sniffer && !slot.saw_sniffer {
                info!(endpoint = %slot.name, sysid = sniffer, "sniffer system attached here");
                slot.saw_sniffer = true;
            }
        }
    }

    /// Evaluate every endpoint in attach order and enqueue accepted copies.
    fn route(&mut self, msg: RoutedMessage) {
        let mut known = false;

        for idx in 0..self.endpoints.len() {
            let slot = &self.endpoints[idx];
            if slot.id == msg.source || !slot.valid {
                continue;
            }

            let verdict = self.accept(idx, &msg);
            let slot = &self.endpoints[idx];
            match verdict {
                AcceptState::Accepted => {
                    known = true;
                    trace!(endpoint = %slot.name, msg_id = msg.message_id, "accepted");
                    match slot.tx.try_send(msg.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            slot.stats.queue_overflows.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!(endpoint = %slot.name, "egress queue closed, marking invalid");
                            self.endpoints[idx].valid = false;
                        }
                    }
                }
                AcceptState::Filtered => known = true,
                AcceptState::Rejected => {}
            }
        }

        if !known {
            self.unknown_dst += 1;
            trace!(
                msg_id = msg.message_id,
                target_sys = msg.target.system_id,
                target_comp = msg.target.component_id,
                "message to unknown destination"
            );
        }
    }

    /// The per-endpoint accept decision.
    ///
    /// Order matters: sniffer first (bypasses filters), then the egress
    /// filter axes, then the learned destinations, then group traversal.
    fn accept(&self, idx: usize, msg: &RoutedMessage) -> AcceptState {
        let slot = &self.endpoints[idx];

        // The sink logs every routed copy.
        if slot.kind == EndpointKind::Sink {
            return AcceptState::Accepted;
        }

        if slot.saw_sniffer {
            return AcceptState::Accepted;
        }

        if let Some(axis) = slot.filters.check_outgoing(&msg.header, msg.message_id) {
            slot.stats.note_filter_drop(axis);
            return AcceptState::Filtered;
        }

        if msg.target.is_broadcast() {
            return AcceptState::Accepted;
        }

        if self.group_sees(idx, msg.target.system_id, msg.target.component_id) {
            return AcceptState::Accepted;
        }

        // Group traversal: siblings of the ingress endpoint accept even
        // with empty seen_ids.
        if let Some(slot_group) = slot.group.as_deref() {
            let ingress_group = self
                .endpoints
                .iter()
                .find(|e| e.id == msg.source)
                .and_then(|e| e.group.as_deref());
            if ingress_group == Some(slot_group) {
                return AcceptState::Accepted;
            }
        }

        AcceptState::Rejected
    }

    /// Does this slot, or any group sibling, know the exact target pair?
    ///
    /// Group members share ingress knowledge.
    fn group_sees(&self, idx: usize, target_sys: u8, target_comp: u8) -> bool {
        let slot = &self.endpoints[idx];
        let group = slot.group.as_deref();
        self.endpoints
            .iter()
            .filter(|other| {
                other.id == slot.id
                    || (group.is_some() && other.group.as_deref() == group)
            })
            .any(|member| member.seen_ids.contains(&(target_sys, target_comp)))
    }

    /// Attach a dynamic endpoint for a connection accepted by the
    /// implicit TCP server.
    fn attach_dynamic(&mut self, peer: SocketAddr, stream: TcpStream) {
        let id = self.alloc_id();
        let name = format!("tcp:{}", peer);
        let stats = Arc::new(EndpointStats::new());
        stats.connections.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(TX_QUEUE_DEPTH);
        let core = IngressCore::new(
            id,
            name.clone(),
            EndpointFilters::default(),
            stats.clone(),
            self.events_tx.clone(),
        );
        let cancel = self.handle.cancel_token().child_token();
        self.tasks.spawn(tcp::run_accepted(stream, core, rx, cancel));

        info!(endpoint = %name, %id, "dynamic endpoint attached");
        self.endpoints.push(EndpointSlot {
            id,
            name,
            kind: EndpointKind::Tcp,
            filters: EndpointFilters::default(),
            group: None,
            seen_ids: HashSet::new(),
            saw_sniffer: false,
            valid: true,
            tx,
            stats,
        });
    }

    /// Handle an endpoint task that finished.
    fn reap(&mut self, id: EndpointId, retain: bool) {
        if retain {
            if let Some(slot) = self.endpoints.iter_mut().find(|e| e.id == id) {
                debug!(endpoint = %slot.name, "endpoint invalid, kept for visibility");
                slot.valid = false;
            }
        } else if let Some(pos) = self.endpoints.iter().position(|e| e.id == id) {
            let slot = self.endpoints.remove(pos);
            info!(endpoint = %slot.name, "endpoint removed");
        }
    }

    /// Emit aggregated warnings and optional statistics.
    fn flush_aggregates(&mut self) {
        if self.unknown_dst > 0 {
            warn!(
                router = %self.handle.name(),
                count = self.unknown_dst,
                "messages to unknown destinations in the last {:?}",
                AGGREGATE_INTERVAL
            );
            self.unknown_dst = 0;
        }
        if self.dedup_drops > 0 {
            debug!(router = %self.handle.name(), count = self.dedup_drops, "duplicates dropped");
            self.dedup_drops = 0;
        }
        if self.report_stats {
            for slot in &self.endpoints {
                info!(endpoint = %slot.name, kind = %slot.kind, "{}", slot.stats.snapshot());
            }
        }
    }

    /// Cancel children, drop slots, and join every task this router
    /// spawned. Leaves the instance reusable via a fresh handle.
    async fn teardown(&mut self) {
        self.handle.cancel_token().cancel();
        self.endpoints.clear();

        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(TEARDOWN_JOIN_TIMEOUT, drain).await.is_err() {
            warn!(router = %self.handle.name(), "endpoint tasks slow to stop, aborting");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        info!(router = %self.handle.name(), "router stopped");
    }
}

/// Build a current-thread runtime and drive one router to completion.
///
/// This is the body of every router thread: the main router and each
/// extension worker call it from their own `std::thread`.
pub fn run_router_blocking(name: &str, config: &Config, handle: RouterHandle) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(router = name, "failed to build runtime: {}", e);
            return 1;
        }
    };

    runtime.block_on(async {
        let mut router = Router::new(name, handle);
        match router.attach_endpoints(config).await {
            Ok(()) => router.run().await,
            Err(e) => {
                error!(router = name, "failed to attach endpoints: {}", e);
                1
            }
        }
    })
}
