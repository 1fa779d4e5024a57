//! Write-only log sink.
//!
//! The sink is a pseudo-endpoint receiving a copy of every routed message
//! and appending it to a tlog file: an 8-byte big-endian microsecond
//! timestamp followed by the raw frame. `while_armed` mode opens a file
//! when the vehicle arms and closes it on disarm, watching the HEARTBEAT
//! base-mode bit straight in the raw payload; routed frames stay opaque
//! bytes everywhere else. Rotation caps bound file size and count.

use crate::config::{SinkConfig, SinkMode};
use crate::endpoint_core::RoutedMessage;
use crate::error::{Result, RouterError};
use crate::stats::EndpointStats;
use mavlink::MavlinkVersion;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// HEARTBEAT base-mode flag for an armed vehicle.
const MAV_MODE_FLAG_SAFETY_ARMED: u8 = 0x80;

/// Create the log directory; attach fails if it cannot exist.
pub async fn prepare(cfg: &SinkConfig) -> Result<()> {
    fs::create_dir_all(&cfg.logs_dir)
        .await
        .map_err(|e| RouterError::filesystem(&cfg.logs_dir, e))
}

/// Read the armed bit from a HEARTBEAT frame, if this is one.
///
/// v2 zero-truncation may cut the base-mode byte; a missing byte decodes
/// as zero, which reads as disarmed.
fn heartbeat_armed(msg: &RoutedMessage) -> Option<bool> {
    if msg.message_id != 0 {
        return None;
    }
    let payload_start = match msg.version {
        MavlinkVersion::V2 => 10,
        MavlinkVersion::V1 => 6,
    };
    let declared_len = usize::from(*msg.raw.get(1)?);
    // Wire order: custom_mode u32, type, autopilot, base_mode, ...
    let base_mode = if declared_len > 6 {
        msg.raw.get(payload_start + 6).copied().unwrap_or(0)
    } else {
        0
    };
    Some(base_mode & MAV_MODE_FLAG_SAFETY_ARMED != 0)
}

struct ActiveLog {
    writer: BufWriter<File>,
    path: PathBuf,
    written: u64,
}

struct SinkLogger {
    cfg: SinkConfig,
    stats: Arc<EndpointStats>,
    active: Option<ActiveLog>,
    armed: bool,
    sequence: u64,
}

impl SinkLogger {
    fn new(cfg: SinkConfig, stats: Arc<EndpointStats>) -> Self {
        Self {
            cfg,
            stats,
            active: None,
            armed: false,
            sequence: 0,
        }
    }

    async fn open_log(&mut self) -> Result<()> {
        self.prune_old_logs().await;

        let stamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        self.sequence += 1;
        let filename = format!("flight_{}_{:04}.tlog", stamp_us, self.sequence);
        let path = Path::new(&self.cfg.logs_dir).join(filename);

        let file = File::create(&path)
            .await
            .map_err(|e| RouterError::filesystem(path.display().to_string(), e))?;
        info!(path = %path.display(), "sink logging to new file");
        self.active = Some(ActiveLog {
            writer: BufWriter::new(file),
            path,
            written: 0,
        });
        Ok(())
    }

    async fn close_log(&mut self) {
        if let Some(mut log) = self.active.take() {
            if let Err(e) = log.writer.flush().await {
                error!(path = %log.path.display(), "sink flush error: {}", e);
            }
            info!(path = %log.path.display(), bytes = log.written, "sink log closed");
        }
    }

    /// Delete the oldest logs beyond the configured file cap.
    async fn prune_old_logs(&self) {
        if self.cfg.max_files == 0 {
            return;
        }
        let Ok(mut entries) = fs::read_dir(&self.cfg.logs_dir).await else {
            return;
        };
        let mut logs = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tlog") {
                logs.push(path);
            }
        }
        // Timestamped names sort chronologically.
        logs.sort();
        // One slot is about to be taken by the new file.
        let keep = (self.cfg.max_files as usize).saturating_sub(1);
        while logs.len() > keep {
            let oldest = logs.remove(0);
            match fs::remove_file(&oldest).await {
                Ok(()) => info!(path = %oldest.display(), "pruned old log"),
                Err(e) => warn!(path = %oldest.display(), "failed to prune log: {}", e),
            }
        }
    }

    async fn handle(&mut self, msg: &RoutedMessage) {
        if self.cfg.mode == SinkMode::WhileArmed {
            if let Some(armed) = heartbeat_armed(msg) {
                if armed != self.armed {
                    self.armed = armed;
                    if armed {
                        info!("vehicle armed, opening log");
                        if let Err(e) = self.open_log().await {
                            error!("failed to open log: {}", e);
                        }
                    } else {
                        info!("vehicle disarmed, closing log");
                        self.close_log().await;
                    }
                }
            }
            if self.active.is_none() {
                return;
            }
        } else if self.active.is_none() {
            if let Err(e) = self.open_log().await {
                error!("failed to open log: {}", e);
                return;
            }
        }

        let Some(log) = self.active.as_mut() else {
            return;
        };

        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;

        let write = async {
            log.writer.write_all(&timestamp_us.to_be_bytes()).await?;
            log.writer.write_all(&msg.raw).await
        };
        match write.await {
            Ok(()) => {
                log.written += 8 + msg.raw.len() as u64;
                self.stats.add_tx(msg.raw.len() as u64);
            }
            Err(e) => {
                error!(path = %log.path.display(), "sink write error: {}", e);
                self.close_log().await;
                return;
            }
        }

        // Size rotation
        if self.cfg.max_size_mb > 0 {
            let limit = self.cfg.max_size_mb * 1024 * 1024;
            if self.active.as_ref().is_some_and(|l| l.written >= limit) {
                self.close_log().await;
                // always-mode reopens lazily on the next message;
                // while_armed reopens only if still armed
                if self.cfg.mode == SinkMode::WhileArmed && self.armed {
                    if let Err(e) = self.open_log().await {
                        error!("failed to rotate log: {}", e);
                    }
                }
            }
        }
    }
}

/// Drain routed copies into the log until cancellation.
pub async fn run(
    cfg: SinkConfig,
    stats: Arc<EndpointStats>,
    mut rx: mpsc::Receiver<RoutedMessage>,
    cancel: CancellationToken,
) {
    if let Some(dialect) = &cfg.dialect {
        info!(dialect, "sink dialect hint recorded");
    }
    let mut logger = SinkLogger::new(cfg, stats);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                logger.handle(&msg).await;
            }
        }
    }

    logger.close_log().await;
    info!("sink stopped");
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::endpoint_core::EndpointId;
    use crate::mavlink_utils::MessageTarget;
    use bytes::Bytes;
    use mavlink::common::{HEARTBEAT_DATA, MavMessage, MavModeFlag};
    use mavlink::MavHeader;

    fn heartbeat_msg(armed: bool) -> RoutedMessage {
        let mut data = HEARTBEAT_DATA::default();
        // `MavModeFlag`'s bindgen-generated `Default` impl resolves to the
        // first declared flag (SAFETY_ARMED) rather than an empty bitset, so
        // the unarmed case must clear it explicitly instead of relying on
        // `HEARTBEAT_DATA::default()`.
        data.base_mode = if armed {
            MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED
        } else {
            MavModeFlag::empty()
        };
        let msg = MavMessage::HEARTBEAT(data);
        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, MavHeader::default(), &msg).expect("write");
        RoutedMessage {
            source: EndpointId(0),
            header: MavHeader::default(),
            message_id: 0,
            version: MavlinkVersion::V2,
            target: MessageTarget::BROADCAST,
            raw: Bytes::from(buf),
        }
    }

    #[test]
    fn test_heartbeat_armed_bit() {
        assert_eq!(heartbeat_armed(&heartbeat_msg(false)), Some(false));
        assert_eq!(heartbeat_armed(&heartbeat_msg(true)), Some(true));
    }

    #[test]
    fn test_non_heartbeat_has_no_armed_state() {
        let mut msg = heartbeat_msg(true);
        msg.message_id = 30;
        assert_eq!(heartbeat_armed(&msg), None);
    }

    #[tokio::test]
    async fn test_always_mode_writes_tlog_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = SinkConfig {
            logs_dir: dir.path().display().to_string(),
            mode: SinkMode::Always,
            dialect: None,
            max_size_mb: 0,
            max_files: 0,
        };
        let mut logger = SinkLogger::new(cfg, Arc::new(EndpointStats::new()));

        let msg = heartbeat_msg(false);
        logger.handle(&msg).await;
        logger.close_log().await;

        let mut entries = std::fs::read_dir(dir.path())
            .expect("read dir")
            .collect::<Vec<_>>();
        assert_eq!(entries.len(), 1);
        let path = entries.remove(0).expect("entry").path();
        let content = std::fs::read(path).expect("read log");
        assert_eq!(content.len(), 8 + msg.raw.len());
        assert_eq!(&content[8..], &msg.raw[..]);
    }

    #[tokio::test]
    async fn test_while_armed_gates_on_heartbeat() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = SinkConfig {
            logs_dir: dir.path().display().to_string(),
            mode: SinkMode::WhileArmed,
            dialect: None,
            max_size_mb: 0,
            max_files: 0,
        };
        let mut logger = SinkLogger::new(cfg, Arc::new(EndpointStats::new()));

        // Disarmed traffic produces no file.
        logger.handle(&heartbeat_msg(false)).await;
        assert!(logger.active.is_none());

        // Arming opens one; disarming closes it.
        logger.handle(&heartbeat_msg(true)).await;
        assert!(logger.active.is_some());
        logger.handle(&heartbeat_msg(false)).await;
        assert!(logger.active.is_none());

        assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 1);
    }
}
