//! Datagram endpoint.
//!
//! Client mode sends to one configured peer and receives from anyone.
//! Server mode binds an address and learns its peers from ingress traffic;
//! egress goes to every learned peer. The peer table is capped and evicts
//! its oldest entry on overflow.

use crate::config::EndpointMode;
use crate::endpoint_core::{IngressCore, RoutedMessage};
use crate::error::{Result, RouterError};
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::Ordering;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Most peers a server endpoint remembers.
const MAX_PEERS: usize = 16;

/// Learned peers, oldest first.
pub struct PeerTable {
    peers: VecDeque<SocketAddr>,
    cap: usize,
}

impl PeerTable {
    /// Empty table holding at most `cap` peers.
    pub fn new(cap: usize) -> Self {
        Self {
            peers: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Record a peer; a full table discards its oldest entry.
    pub fn learn(&mut self, addr: SocketAddr) {
        if self.peers.contains(&addr) {
            return;
        }
        if self.peers.len() == self.cap {
            if let Some(evicted) = self.peers.pop_front() {
                debug!(%evicted, "peer table full, oldest peer dropped");
            }
        }
        self.peers.push_back(addr);
    }

    /// Learned peers, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.peers.iter()
    }

    /// Number of learned peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when nothing was learned yet.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Bind the socket for an endpoint; returns the fixed peer for clients.
pub async fn prepare(
    name: &str,
    address: &str,
    mode: EndpointMode,
) -> Result<(UdpSocket, Option<SocketAddr>)> {
    match mode {
        EndpointMode::Server => {
            let socket = UdpSocket::bind(address)
                .await
                .map_err(|e| RouterError::network(name, e))?;
            info!(endpoint = name, %address, "udp server bound");
            Ok((socket, None))
        }
        EndpointMode::Client => {
            let target = address
                .to_socket_addrs()
                .map_err(|e| RouterError::network(name, e))?
                .next()
                .ok_or_else(|| {
                    RouterError::endpoint_init("udp", format!("cannot resolve '{}'", address))
                })?;
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| RouterError::network(name, e))?;
            info!(endpoint = name, peer = %target, "udp client ready");
            Ok((socket, Some(target)))
        }
    }
}

/// Drive one datagram endpoint until cancellation.
pub async fn run(
    socket: UdpSocket,
    mode: EndpointMode,
    target: Option<SocketAddr>,
    mut core: IngressCore,
    mut out_rx: mpsc::Receiver<RoutedMessage>,
    cancel: CancellationToken,
) {
    let mut peers = PeerTable::new(MAX_PEERS);
    let mut buf = [0u8; 65535];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((len, addr)) => {
                        if mode == EndpointMode::Server {
                            peers.learn(addr);
                        }
                        if !core.feed(&buf[..len]).await {
                            break;
                        }
                    }
                    Err(e) => {
                        // Transient on connectionless sockets (e.g. ICMP
                        // port unreachable bounced back on some platforms).
                        debug!(endpoint = %core.name, "udp recv error: {}", e);
                    }
                }
            }
            msg = out_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Some(peer) = target {
                    match socket.send_to(&msg.raw, peer).await {
                        Ok(_) => core.stats.add_tx(msg.raw.len() as u64),
                        Err(e) => debug!(endpoint = %core.name, %peer, "udp send error: {}", e),
                    }
                } else {
                    let mut sent = false;
                    for peer in peers.iter() {
                        match socket.send_to(&msg.raw, peer).await {
                            Ok(_) => {
                                sent = true;
                                core.stats.bytes_tx.fetch_add(msg.raw.len() as u64, Ordering::Relaxed);
                            }
                            Err(e) => debug!(endpoint = %core.name, %peer, "udp send error: {}", e),
                        }
                    }
                    if sent {
                        core.stats.frames_tx.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    warn!(endpoint = %core.name, "udp endpoint stopped");
}
