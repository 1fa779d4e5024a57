//! Router lifecycle: the implicit TCP server, dynamic endpoints, and
//! stream reconnect policy.

use mavlink::common::{MavMessage, HEARTBEAT_DATA};
use mavlink::MavHeader;
use mavswitch::config::Config;
use mavswitch::router::{Router, RouterHandle};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

fn heartbeat(sys: u8, seq: u8) -> Vec<u8> {
    let header = MavHeader {
        system_id: sys,
        component_id: 1,
        sequence: seq,
    };
    let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA::default());
    let mut buf = Vec::new();
    mavlink::write_v2_msg(&mut buf, header, &msg).expect("write heartbeat");
    buf
}

async fn start_router(toml: &str) -> (RouterHandle, tokio::task::JoinHandle<i32>) {
    let config = Config::parse(toml).expect("test config");
    let handle = RouterHandle::new("test");
    let mut router = Router::new("test", handle.clone());
    router
        .attach_endpoints(&config)
        .await
        .expect("attach endpoints");
    let task = tokio::spawn(async move { router.run().await });
    (handle, task)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accepted_connections_become_routed_endpoints() {
    let (handle, task) = start_router(
        r#"
[general]
tcp_listen_port = 27031

[[endpoint]]
type = "udp"
name = "out"
address = "127.0.0.1:27032"
mode = "client"
"#,
    )
    .await;

    let peer = UdpSocket::bind("127.0.0.1:27032").await.expect("bind peer");

    let mut client_a = TcpStream::connect("127.0.0.1:27031")
        .await
        .expect("connect a");
    let mut client_b = TcpStream::connect("127.0.0.1:27031")
        .await
        .expect("connect b");
    // Give the router a moment to attach both dynamic endpoints.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A frame written by client A reaches the UDP peer and client B.
    let frame = heartbeat(1, 0);
    client_a.write_all(&frame).await.expect("write");
    client_a.flush().await.expect("flush");

    let mut buf = [0u8; 512];
    let (len, _) = timeout(RECV_TIMEOUT, peer.recv_from(&mut buf))
        .await
        .expect("udp peer should receive")
        .expect("recv");
    assert_eq!(&buf[..len], &frame[..]);

    let mut received = vec![0u8; frame.len()];
    timeout(RECV_TIMEOUT, client_b.read_exact(&mut received))
        .await
        .expect("client b should receive")
        .expect("read");
    assert_eq!(received, frame);

    // Dropping a client must not disturb the router.
    drop(client_a);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_shutting_down());

    handle.request_exit(0);
    let code = task.await.expect("router join");
    assert_eq!(code, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_client_reconnects_after_refused_connect() {
    // Router starts before anyone listens on the stream address, so the
    // first connect is refused and the retry timer has to do the work.
    let (handle, task) = start_router(
        r#"
[[endpoint]]
type = "udp"
name = "ingress"
address = "127.0.0.1:27042"
mode = "server"

[[endpoint]]
type = "tcp"
name = "stream"
address = "127.0.0.1:27041"
retry_timeout_ms = 300
"#,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    let listener = TcpListener::bind("127.0.0.1:27041")
        .await
        .expect("bind listener");
    let (mut accepted, _) = timeout(RECV_TIMEOUT, listener.accept())
        .await
        .expect("client should reconnect")
        .expect("accept");

    // Traffic flows over the reconnected stream.
    let feeder = UdpSocket::bind("127.0.0.1:0").await.expect("bind feeder");
    let frame = heartbeat(1, 0);
    feeder
        .send_to(&frame, "127.0.0.1:27042")
        .await
        .expect("send");

    let mut received = vec![0u8; frame.len()];
    timeout(RECV_TIMEOUT, accepted.read_exact(&mut received))
        .await
        .expect("stream should receive")
        .expect("read");
    assert_eq!(received, frame);

    handle.request_exit(0);
    let code = task.await.expect("router join");
    assert_eq!(code, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_retry_stream_endpoint_detaches_quietly() {
    // Nobody listens on the stream address and retry is disabled: the
    // endpoint detaches after the failed connect, the router keeps
    // routing.
    let (handle, task) = start_router(
        r#"
[[endpoint]]
type = "udp"
name = "ingress"
address = "127.0.0.1:27052"
mode = "server"

[[endpoint]]
type = "udp"
name = "out"
address = "127.0.0.1:27053"
mode = "client"

[[endpoint]]
type = "tcp"
name = "gone"
address = "127.0.0.1:27051"
retry_timeout_ms = 0
"#,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_shutting_down(), "non-critical failure must not exit");

    // Routing still works without the detached endpoint.
    let feeder = UdpSocket::bind("127.0.0.1:0").await.expect("bind feeder");
    let peer = UdpSocket::bind("127.0.0.1:27053").await.expect("bind peer");
    let frame = heartbeat(1, 0);
    feeder
        .send_to(&frame, "127.0.0.1:27052")
        .await
        .expect("send");

    let mut buf = [0u8; 512];
    let (len, _) = timeout(RECV_TIMEOUT, peer.recv_from(&mut buf))
        .await
        .expect("peer should receive")
        .expect("recv");
    assert_eq!(&buf[..len], &frame[..]);

    handle.request_exit(0);
    let code = task.await.expect("router join");
    assert_eq!(code, 0);
}
