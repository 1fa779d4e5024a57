//! Shared endpoint machinery.
//!
//! Every transport endpoint splits into an ingress half (bytes → frames →
//! router events) and an egress half (bounded queue → transport). This
//! module holds the pieces common to all of them: the routed-message type,
//! the ingress pipeline with filtering and accounting, and the generic
//! read/write loop used by stream-shaped transports (TCP, serial).

use crate::error::RouterError;
use crate::filter::EndpointFilters;
use crate::framing::{FrameParser, ParsedFrame, SeqTracker};
use crate::mavlink_utils::MessageTarget;
use crate::stats::EndpointStats;
use bytes::Bytes;
use mavlink::{MavHeader, MavlinkVersion};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Unique identifier of a routing endpoint within one router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub usize);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.0)
    }
}

/// A routed MAVLink message: raw wire bytes plus cached metadata so the
/// routing loop never re-parses.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    /// Ingress endpoint that received this frame.
    pub source: EndpointId,
    /// Header with source system, component, and sequence.
    pub header: MavHeader,
    /// Message id (8-bit for v1, 24-bit for v2).
    pub message_id: u32,
    /// Protocol version of the frame.
    pub version: MavlinkVersion,
    /// Addressee extracted at ingress.
    pub target: MessageTarget,
    /// The exact wire frame; forwarding is byte-transparent.
    pub raw: Bytes,
}

impl RoutedMessage {
    /// Build a routed message from a parsed frame.
    pub fn from_frame(source: EndpointId, frame: ParsedFrame) -> Self {
        Self {
            source,
            header: frame.header,
            message_id: frame.message_id,
            version: frame.version,
            target: frame.target,
            raw: frame.raw,
        }
    }
}

/// Per-endpoint routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptState {
    /// Write the message out this endpoint.
    Accepted,
    /// An egress filter dropped it; the destination still counts as known.
    Filtered,
    /// This endpoint is not a destination for the message.
    Rejected,
}

/// Events delivered to the owning router's loop.
#[derive(Debug)]
pub enum RouterEvent {
    /// A frame passed ingress filtering and wants routing.
    Inbound(RoutedMessage),
    /// The implicit TCP server accepted a connection; attach it as a
    /// dynamic endpoint.
    Attach {
        /// Peer address, used as the endpoint name.
        peer: SocketAddr,
        /// The accepted connection.
        stream: TcpStream,
    },
    /// An endpoint task finished. `retain` keeps the slot listed as
    /// invalid (serial after baud-search failure); otherwise it is removed.
    Closed {
        /// The endpoint that finished.
        id: EndpointId,
        /// Keep the slot in the endpoint list.
        retain: bool,
    },
    /// A critical endpoint failed; the router exits with a failure code.
    Fatal {
        /// Human-readable origin.
        name: String,
        /// What went wrong.
        error: RouterError,
    },
}

/// Ingress pipeline of one endpoint: parser, sequence accounting,
/// ingress-direction filters, and the hand-off to the router.
pub struct IngressCore {
    /// Endpoint identity.
    pub id: EndpointId,
    /// Endpoint name for logs.
    pub name: String,
    /// This endpoint's filters (ingress axes are applied here).
    pub filters: EndpointFilters,
    /// Shared counters.
    pub stats: Arc<EndpointStats>,
    events: mpsc::Sender<RouterEvent>,
    parser: FrameParser,
    seq: SeqTracker,
}

impl IngressCore {
    /// Build the pipeline for one endpoint.
    pub fn new(
        id: EndpointId,
        name: String,
        filters: EndpointFilters,
        stats: Arc<EndpointStats>,
        events: mpsc::Sender<RouterEvent>,
    ) -> Self {
        Self {
            id,
            name,
            filters,
            stats,
            events,
            parser: FrameParser::new(),
            seq: SeqTracker::new(),
        }
    }

    /// Clone of the router event sender, for endpoint-level events.
    pub fn events(&self) -> mpsc::Sender<RouterEvent> {
        self.events.clone()
    }

    /// Frames handed to the router so far.
    pub fn frames_handled(&self) -> u64 {
        self.stats.frames_handled.load(Ordering::Relaxed)
    }

    /// CRC-valid frames seen so far, filtered or not (the serial baud
    /// probe watches this).
    pub fn frames_seen(&self) -> u64 {
        self.stats.frames_rx.load(Ordering::Relaxed)
    }

    /// Feed transport bytes through the pipeline.
    ///
    /// Returns `false` once the router is gone and the endpoint should
    /// wind down.
    pub async fn feed(&mut self, data: &[u8]) -> bool {
        self.stats.add_rx(data.len() as u64);
        self.parser.push(data);

        let mut alive = true;
        while let Some(frame) = self.parser.parse_next() {
            self.stats.frames_rx.fetch_add(1, Ordering::Relaxed);
            let gap = self.seq.note(frame.header.sequence);
            if gap > 0 {
                self.stats.seq_gaps.fetch_add(gap, Ordering::Relaxed);
            }

            if let Some(axis) = self.filters.check_incoming(&frame.header, frame.message_id) {
                trace!(endpoint = %self.name, ?axis, msg_id = frame.message_id, "filtered in");
                self.stats.filtered_in.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.stats.frames_handled.fetch_add(1, Ordering::Relaxed);
            let msg = RoutedMessage::from_frame(self.id, frame);
            if self.events.send(RouterEvent::Inbound(msg)).await.is_err() {
                alive = false;
                break;
            }
        }

        let damage = self.parser.take_damage();
        if damage.crc_errors > 0 {
            self.stats
                .crc_errors
                .fetch_add(damage.crc_errors, Ordering::Relaxed);
        }
        if damage.discarded_bytes > 0 {
            self.stats
                .discarded_bytes
                .fetch_add(damage.discarded_bytes, Ordering::Relaxed);
        }

        alive
    }
}

/// How a stream loop ended; the caller picks the reconnect policy.
#[derive(Debug)]
pub enum StreamEnd {
    /// The router asked everything to stop.
    Cancelled,
    /// Clean zero-byte read from the peer.
    PeerClosed,
    /// Transport error on either half.
    Error(io::Error),
}

/// Drive one connected stream transport until it ends.
///
/// Reads feed the ingress pipeline; queued egress messages are written
/// through a buffered writer, draining opportunistically before each flush
/// to keep syscalls off the per-frame path.
pub async fn run_stream_loop<R, W>(
    mut reader: R,
    writer: W,
    core: &mut IngressCore,
    out_rx: &mut mpsc::Receiver<RoutedMessage>,
    cancel: CancellationToken,
) -> StreamEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = writer.flush().await;
                return StreamEnd::Cancelled;
            }
            read_res = reader.read(&mut buf) => {
                match read_res {
                    Ok(0) => {
                        let _ = writer.flush().await;
                        return StreamEnd::PeerClosed;
                    }
                    Ok(n) => {
                        if !core.feed(&buf[..n]).await {
                            return StreamEnd::Cancelled;
                        }
                    }
                    Err(e) => return StreamEnd::Error(e),
                }
            }
            msg = out_rx.recv() => {
                let Some(msg) = msg else {
                    // Router dropped its sender: shutdown in progress.
                    let _ = writer.flush().await;
                    return StreamEnd::Cancelled;
                };
                if let Err(e) = writer.write_all(&msg.raw).await {
                    return StreamEnd::Error(e);
                }
                core.stats.add_tx(msg.raw.len() as u64);

                // Drain whatever queued up behind it, then flush once.
                while let Ok(next) = out_rx.try_recv() {
                    if let Err(e) = writer.write_all(&next.raw).await {
                        return StreamEnd::Error(e);
                    }
                    core.stats.add_tx(next.raw.len() as u64);
                }
                if let Err(e) = writer.flush().await {
                    return StreamEnd::Error(e);
                }
            }
        }
    }
}
