//! Serial endpoint with automatic baud-rate discovery.
//!
//! The endpoint walks the configured candidate list: every probe interval
//! it checks whether the parser produced a valid frame since the last
//! probe. Traffic locks the current rate; silence advances to the next
//! candidate, wrapping around. After `baud_probe_cycles` full wraps
//! without traffic the endpoint is failed — terminal, but it stays in the
//! router's endpoint list and never takes the router down.

use crate::endpoint_core::{IngressCore, RoutedMessage, RouterEvent};
use crate::error::{Result, RouterError};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the baud probe re-evaluates.
const BAUD_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Verify the device can be opened at all; attach fails otherwise.
pub async fn probe_device(name: &str, device: &str, baud: u32) -> Result<()> {
    tokio_serial::new(device, baud)
        .open_native_async()
        .map(drop)
        .map_err(|e| {
            warn!(endpoint = name, device, "cannot open serial device");
            RouterError::serial(device, e)
        })
}

/// What ended one stint at a given baud rate.
enum BaudOutcome {
    /// Router shutdown.
    Cancelled,
    /// Probe interval passed with no valid frame while unlocked.
    Silent,
    /// Port error or EOF.
    IoError,
}

/// Drive one serial endpoint through probing, lock, and failure.
pub async fn run(
    device: String,
    baudrates: Vec<u32>,
    flow_control: bool,
    probe_cycles: u32,
    mut core: IngressCore,
    mut out_rx: mpsc::Receiver<RoutedMessage>,
    cancel: CancellationToken,
) {
    let events = core.events();
    let id = core.id;
    let mut baud_idx = 0usize;
    let mut cycles = 0u32;
    let mut locked = false;

    if baudrates.is_empty() {
        warn!(endpoint = %core.name, "no baud rates configured");
        let _ = events.send(RouterEvent::Closed { id, retain: true }).await;
        return;
    }

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let baud = baudrates[baud_idx % baudrates.len()];
        let flow = if flow_control {
            tokio_serial::FlowControl::Hardware
        } else {
            tokio_serial::FlowControl::None
        };

        let opened = tokio_serial::new(&device, baud)
            .flow_control(flow)
            .open_native_async();

        let outcome = match opened {
            Ok(mut port) => {
                #[cfg(unix)]
                port.set_exclusive(false).ok();
                debug!(endpoint = %core.name, device = %device, baud, "probing baud rate");
                run_at_baud(port, &mut core, &mut out_rx, &cancel, &mut locked, baud).await
            }
            Err(e) => {
                warn!(endpoint = %core.name, device = %device, "open failed: {}", e);
                // Back off for a probe interval before the next candidate.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(BAUD_PROBE_INTERVAL) => {}
                }
                BaudOutcome::Silent
            }
        };

        match outcome {
            BaudOutcome::Cancelled => return,
            BaudOutcome::IoError if locked => {
                // Lost an established link: start probing again at the
                // same rate.
                warn!(endpoint = %core.name, device = %device, "serial link lost, reprobing");
                core.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                locked = false;
                cycles = 0;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            BaudOutcome::Silent | BaudOutcome::IoError => {
                core.stats.baud_changes.fetch_add(1, Ordering::Relaxed);
                baud_idx += 1;
                if baud_idx % baudrates.len() == 0 {
                    cycles += 1;
                    if probe_cycles > 0 && cycles >= probe_cycles {
                        warn!(
                            endpoint = %core.name,
                            device = %device,
                            cycles,
                            "no traffic on any baud rate, endpoint failed"
                        );
                        core.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                        let _ = events.send(RouterEvent::Closed { id, retain: true }).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Run the port at one baud rate until silence, error, or cancellation.
async fn run_at_baud(
    port: tokio_serial::SerialStream,
    core: &mut IngressCore,
    out_rx: &mut mpsc::Receiver<RoutedMessage>,
    cancel: &CancellationToken,
    locked: &mut bool,
    baud: u32,
) -> BaudOutcome {
    let (mut reader, writer) = tokio::io::split(port);
    let mut writer = BufWriter::new(writer);
    let mut buf = [0u8; 4096];

    let mut probe = tokio::time::interval(BAUD_PROBE_INTERVAL);
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    probe.tick().await; // immediate first tick
    let mut frames_at_probe = core.frames_seen();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = writer.flush().await;
                return BaudOutcome::Cancelled;
            }
            read_res = reader.read(&mut buf) => {
                match read_res {
                    Ok(0) => return BaudOutcome::IoError,
                    Ok(n) => {
                        if !core.feed(&buf[..n]).await {
                            return BaudOutcome::Cancelled;
                        }
                    }
                    Err(e) => {
                        debug!(endpoint = %core.name, "serial read error: {}", e);
                        return BaudOutcome::IoError;
                    }
                }
            }
            msg = out_rx.recv() => {
                let Some(msg) = msg else { return BaudOutcome::Cancelled };
                if let Err(e) = writer.write_all(&msg.raw).await {
                    debug!(endpoint = %core.name, "serial write error: {}", e);
                    return BaudOutcome::IoError;
                }
                core.stats.add_tx(msg.raw.len() as u64);
                if let Err(e) = writer.flush().await {
                    debug!(endpoint = %core.name, "serial flush error: {}", e);
                    return BaudOutcome::IoError;
                }
            }
            _ = probe.tick() => {
                let seen = core.frames_seen();
                if seen > frames_at_probe {
                    if !*locked {
                        *locked = true;
                        core.stats.connections.fetch_add(1, Ordering::Relaxed);
                        info!(endpoint = %core.name, baud, "baud rate locked");
                    }
                } else if !*locked {
                    return BaudOutcome::Silent;
                }
                frames_at_probe = seen;
            }
        }
    }
}
