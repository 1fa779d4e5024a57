//! Stream endpoint.
//!
//! Configured TCP endpoints are clients with a reconnect policy: a
//! non-zero `retry_timeout_ms` keeps the endpoint listed and reconnecting
//! forever; zero removes it after the first terminal disconnect. The
//! implicit TCP server turns every accepted connection into a dynamic
//! endpoint, attached and removed at runtime by the router. A listener
//! failure is the one critical error that takes the owning router down.

use crate::endpoint_core::{
    run_stream_loop, IngressCore, RoutedMessage, RouterEvent, StreamEnd,
};
use crate::error::{Result, RouterError};
use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bind the implicit server's listening socket.
pub async fn prepare_listener(port: u16) -> Result<TcpListener> {
    let address = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| RouterError::network("tcp-server", e))?;
    info!(%address, "tcp server listening");
    Ok(listener)
}

/// Accept loop of the implicit server. Connections are handed to the
/// router, which attaches them as dynamic endpoints.
pub async fn run_server(
    listener: TcpListener,
    events: mpsc::Sender<RouterEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "tcp server accepted connection");
                        if events.send(RouterEvent::Attach { peer, stream }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("tcp accept transient error: {}", e);
                    }
                    Err(e) => {
                        error!("tcp listener failed: {}", e);
                        let _ = events
                            .send(RouterEvent::Fatal {
                                name: "tcp-server".to_string(),
                                error: RouterError::network("tcp-server", e),
                            })
                            .await;
                        break;
                    }
                }
            }
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Drive one accepted (dynamic) endpoint until it disconnects.
pub async fn run_accepted(
    stream: TcpStream,
    mut core: IngressCore,
    mut out_rx: mpsc::Receiver<RoutedMessage>,
    cancel: CancellationToken,
) {
    let events = core.events();
    let id = core.id;
    stream.set_nodelay(true).ok();
    let (read, write) = stream.into_split();

    match run_stream_loop(read, write, &mut core, &mut out_rx, cancel).await {
        StreamEnd::Cancelled => {}
        StreamEnd::PeerClosed => {
            info!(endpoint = %core.name, "peer closed connection");
            core.stats.disconnects.fetch_add(1, Ordering::Relaxed);
            let _ = events.send(RouterEvent::Closed { id, retain: false }).await;
        }
        StreamEnd::Error(e) => {
            warn!(endpoint = %core.name, "connection error: {}", e);
            core.stats.disconnects.fetch_add(1, Ordering::Relaxed);
            let _ = events.send(RouterEvent::Closed { id, retain: false }).await;
        }
    }
}

/// Drive one configured client endpoint, reconnecting per its policy.
pub async fn run_client(
    address: String,
    retry_timeout: Duration,
    mut core: IngressCore,
    mut out_rx: mpsc::Receiver<RoutedMessage>,
    cancel: CancellationToken,
) {
    let events = core.events();
    let id = core.id;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            res = TcpStream::connect(&address) => res,
        };

        match connected {
            Ok(stream) => {
                info!(endpoint = %core.name, %address, "connected");
                core.stats.connections.fetch_add(1, Ordering::Relaxed);
                stream.set_nodelay(true).ok();
                let (read, write) = stream.into_split();

                match run_stream_loop(read, write, &mut core, &mut out_rx, cancel.clone()).await {
                    StreamEnd::Cancelled => return,
                    StreamEnd::PeerClosed => {
                        warn!(endpoint = %core.name, %address, "connection lost");
                        core.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    StreamEnd::Error(e) => {
                        warn!(endpoint = %core.name, %address, "connection error: {}", e);
                        core.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(e) => {
                warn!(endpoint = %core.name, %address, "connect failed: {}", e);
            }
        }

        if retry_timeout.is_zero() {
            // No retry story: detach from the router.
            let _ = events.send(RouterEvent::Closed { id, retain: false }).await;
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(retry_timeout) => {}
        }
    }
}
