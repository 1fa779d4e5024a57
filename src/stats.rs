//! Per-endpoint traffic counters.
//!
//! Counters are plain relaxed atomics: the ingress task, the writer task,
//! and the routing loop all touch the same `EndpointStats`, and the
//! periodic reporter reads them from the router task. Snapshots are plain
//! values for logging and the control surface.

use crate::filter::FilterAxis;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of one endpoint.
#[derive(Debug, Default)]
pub struct EndpointStats {
    /// Bytes read from the transport.
    pub bytes_rx: AtomicU64,
    /// CRC-valid frames produced by the parser.
    pub frames_rx: AtomicU64,
    /// Frames that failed CRC or payload validation.
    pub crc_errors: AtomicU64,
    /// Bytes skipped while hunting for a start byte.
    pub discarded_bytes: AtomicU64,
    /// Sequence-number gaps observed on ingress.
    pub seq_gaps: AtomicU64,
    /// Frames that passed the ingress filters and reached the router.
    pub frames_handled: AtomicU64,
    /// Frames dropped by ingress-direction filters.
    pub filtered_in: AtomicU64,

    /// Bytes written to the transport.
    pub bytes_tx: AtomicU64,
    /// Frames written to the transport.
    pub frames_tx: AtomicU64,
    /// Egress frames filtered on the message-id axis.
    pub filter_drop_msg_id: AtomicU64,
    /// Egress frames filtered on the source-component axis.
    pub filter_drop_src_comp: AtomicU64,
    /// Egress frames filtered on the source-system axis.
    pub filter_drop_src_sys: AtomicU64,
    /// Accepted frames dropped because the transmit queue was full.
    pub queue_overflows: AtomicU64,

    /// Successful connects (stream) or baud locks (serial).
    pub connections: AtomicU64,
    /// Disconnects and terminal probe failures.
    pub disconnects: AtomicU64,
    /// Baud-rate changes while probing (serial only).
    pub baud_changes: AtomicU64,
}

impl EndpointStats {
    /// Fresh zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count bytes read from the transport.
    pub fn add_rx(&self, bytes: u64) {
        self.bytes_rx.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count a frame and its bytes written to the transport.
    pub fn add_tx(&self, bytes: u64) {
        self.bytes_tx.fetch_add(bytes, Ordering::Relaxed);
        self.frames_tx.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an egress filter drop on the given axis.
    pub fn note_filter_drop(&self, axis: FilterAxis) {
        let counter = match axis {
            FilterAxis::MsgId => &self.filter_drop_msg_id,
            FilterAxis::SrcComp => &self.filter_drop_src_comp,
            FilterAxis::SrcSys => &self.filter_drop_src_sys,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters into a plain value.
    pub fn snapshot(&self) -> EndpointStatsSnapshot {
        EndpointStatsSnapshot {
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            frames_rx: self.frames_rx.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            discarded_bytes: self.discarded_bytes.load(Ordering::Relaxed),
            seq_gaps: self.seq_gaps.load(Ordering::Relaxed),
            frames_handled: self.frames_handled.load(Ordering::Relaxed),
            filtered_in: self.filtered_in.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            frames_tx: self.frames_tx.load(Ordering::Relaxed),
            filter_drop_msg_id: self.filter_drop_msg_id.load(Ordering::Relaxed),
            filter_drop_src_comp: self.filter_drop_src_comp.load(Ordering::Relaxed),
            filter_drop_src_sys: self.filter_drop_src_sys.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            baud_changes: self.baud_changes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EndpointStats`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EndpointStatsSnapshot {
    pub bytes_rx: u64,
    pub frames_rx: u64,
    pub crc_errors: u64,
    pub discarded_bytes: u64,
    pub seq_gaps: u64,
    pub frames_handled: u64,
    pub filtered_in: u64,
    pub bytes_tx: u64,
    pub frames_tx: u64,
    pub filter_drop_msg_id: u64,
    pub filter_drop_src_comp: u64,
    pub filter_drop_src_sys: u64,
    pub queue_overflows: u64,
    pub connections: u64,
    pub disconnects: u64,
    pub baud_changes: u64,
}

impl EndpointStatsSnapshot {
    /// Total egress filter drops across the three axes.
    pub fn filter_drops(&self) -> u64 {
        self.filter_drop_msg_id + self.filter_drop_src_comp + self.filter_drop_src_sys
    }
}

impl fmt::Display for EndpointStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx {}B/{} frames (crc {}, seq gaps {}), tx {}B/{} frames, \
             filtered in/out {}/{}, queue overflows {}",
            self.bytes_rx,
            self.frames_rx,
            self.crc_errors,
            self.seq_gaps,
            self.bytes_tx,
            self.frames_tx,
            self.filtered_in,
            self.filter_drops(),
            self.queue_overflows,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_drops_land_on_their_counter() {
        let stats = EndpointStats::new();
        stats.note_filter_drop(FilterAxis::MsgId);
        stats.note_filter_drop(FilterAxis::MsgId);
        stats.note_filter_drop(FilterAxis::SrcSys);

        let snap = stats.snapshot();
        assert_eq!(snap.filter_drop_msg_id, 2);
        assert_eq!(snap.filter_drop_src_comp, 0);
        assert_eq!(snap.filter_drop_src_sys, 1);
        assert_eq!(snap.filter_drops(), 3);
    }

    #[test]
    fn test_tx_accounting() {
        let stats = EndpointStats::new();
        stats.add_tx(12);
        stats.add_tx(21);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_tx, 33);
        assert_eq!(snap.frames_tx, 2);
    }

    #[test]
    fn test_display_is_one_line() {
        let snap = EndpointStats::new().snapshot();
        let line = snap.to_string();
        assert!(!line.contains('\n'));
        assert!(line.contains("rx"));
    }
}
