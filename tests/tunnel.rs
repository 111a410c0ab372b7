//! End-to-end tunnel tests: a real TCP client, a listener, the in-process
//! mesh, a connector, and a real TCP echo backend.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use bytes::Bytes;
use culvert::codec::{Delivery, Encapsulation};
use culvert::connector::ConnectorConfig;
use culvert::listener::ListenerConfig;
use culvert::manage::Management;
use culvert::mesh::{Frame, MeshRouter};
use culvert::stats::StatsSnapshot;

/// Echo server: per connection, read until the client half-closes, then
/// write everything back and close. The reply only starts after our EOF, so
/// a completed echo proves half-close propagated end to end.
async fn spawn_echo_backend(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut data = Vec::new();
                if socket.read_to_end(&mut data).await.is_ok() {
                    let _ = socket.write_all(&data).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });
    addr
}

fn listener_config(name: &str, address: &str) -> ListenerConfig {
    ListenerConfig {
        name: name.into(),
        address: address.into(),
        host: "127.0.0.1".into(),
        port: 0,
        encapsulation: Encapsulation::Lite,
        site_id: None,
        ssl_profile: None,
        authenticate_peer: false,
    }
}

fn connector_config(name: &str, address: &str, backend: SocketAddr) -> ConnectorConfig {
    ConnectorConfig {
        name: name.into(),
        address: address.into(),
        host: backend.ip().to_string(),
        port: backend.port(),
        encapsulation: Encapsulation::Lite,
        site_id: None,
        ssl_profile: None,
        authenticate_peer: false,
    }
}

/// One listener and one connector wired to a fresh echo backend. Returns
/// the management root and the listener's bound port.
async fn echo_tunnel(delay: Duration) -> (Management, u16) {
    let mgmt = Management::new(MeshRouter::new());
    let backend = spawn_echo_backend(delay).await;
    mgmt.create_connector(connector_config("backend", "svc", backend))
        .await
        .unwrap();
    mgmt.create_listener(listener_config("front", "svc"))
        .await
        .unwrap();
    let port = mgmt.read("front").await.unwrap().port;
    (mgmt, port)
}

/// Write a payload, half-close, and read the echo back.
async fn echo_once(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(payload).await.unwrap();
    client.shutdown().await.unwrap();
    let mut reply = Vec::with_capacity(payload.len());
    client.read_to_end(&mut reply).await.unwrap();
    reply
}

/// Poll an async probe until it reports true, panicking after 5 seconds.
/// Settlement and teardown run after the client sees its reply, so counter
/// assertions need a drain wait.
async fn wait_for<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn echoes_payloads_of_varied_sizes() {
    let (mgmt, port) = echo_tunnel(Duration::ZERO).await;
    let mut total: u64 = 0;

    for size in [0usize, 1, 1024, 500_000] {
        let payload = patterned(size);
        let reply = echo_once(port, &payload).await;
        assert_eq!(reply, payload, "echo corrupted at size {size}");
        total += size as u64;
    }

    // Both entities must agree: what went in came out, on each side.
    wait_for("counters to drain", || {
        let mgmt = mgmt.clone();
        async move {
            let front = mgmt.read("front").await.unwrap().stats;
            let back = mgmt.read("backend").await.unwrap().stats;
            front.bytes_in == total
                && front.bytes_out == total
                && back.bytes_in == total
                && back.bytes_out == total
                && front.connections_closed == 4
        }
    })
    .await;

    let front = mgmt.read("front").await.unwrap().stats;
    assert_eq!(front.connections_opened, 4);
    assert_eq!(front.connections_closed, 4);
}

#[tokio::test]
async fn survives_payload_larger_than_flow_window() {
    // The backend sits on the data for a while, forcing the flow window
    // shut: the payload is eight times the per-direction window, so the
    // listener must stop reading and resume as settlements return credit.
    let (_mgmt, port) = echo_tunnel(Duration::from_millis(400)).await;
    let payload = patterned(1024 * 1024);

    let reply = tokio::time::timeout(Duration::from_secs(30), echo_once(port, &payload))
        .await
        .expect("backpressured tunnel must drain, not deadlock");
    assert_eq!(reply.len(), payload.len());
    assert_eq!(reply, payload);
}

#[tokio::test]
async fn refuses_clients_while_address_is_dark() {
    let mgmt = Management::new(MeshRouter::new());
    mgmt.create_listener(listener_config("front", "nobody-home"))
        .await
        .unwrap();
    let port = mgmt.read("front").await.unwrap().port;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf)).await;
    match read {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("refused client must not receive data, got {n} bytes"),
        Err(_) => panic!("refusal must be prompt, not a hang"),
    }

    let front = mgmt.read("front").await.unwrap().stats;
    assert_eq!(front.connections_opened, 0);
    assert_eq!(front.bytes_in, 0);
}

#[tokio::test]
async fn half_close_lets_the_reply_flow_back() {
    // The echo backend replies only after seeing EOF. The client half-closes
    // and still receives the full reply, so CloseWrite crossed the mesh in
    // one direction while payload crossed in the other.
    let (_mgmt, port) = echo_tunnel(Duration::ZERO).await;
    let payload = patterned(32 * 1024);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&payload).await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, payload);
}

#[tokio::test]
async fn out_of_sequence_delivery_resets_only_its_connection() {
    // A healthy echo tunnel on one address, and a hand-rolled peer on a
    // second address that answers every stream with a delivery numbered far
    // ahead of the expected sequence. The misnumbered connection must reset;
    // the healthy tunnel must not notice.
    let (mgmt, echo_port) = echo_tunnel(Duration::ZERO).await;
    mgmt.create_listener(listener_config("suspect", "rogue"))
        .await
        .unwrap();
    let rogue_port = mgmt.read("suspect").await.unwrap().port;

    let mut reg = mgmt.mesh().register_connector("rogue");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(inbound) = reg.streams.recv().await {
            let delivery = Delivery::payload(5, Bytes::from_static(b"x"));
            let _ = inbound
                .link
                .tx
                .send(Frame::Delivery(Encapsulation::Lite.encode(&delivery)));
            // Keep the link open so the reset comes from sequencing, not
            // from a dropped channel.
            held.push(inbound.link);
        }
    });

    let mut client = TcpStream::connect(("127.0.0.1", rogue_port)).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf)).await;
    match read {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("sequence violation must not deliver payload, got {n} bytes"),
        Err(_) => panic!("sequence violation must reset promptly"),
    }

    wait_for("violating connection to be counted closed", || {
        let mgmt = mgmt.clone();
        async move {
            let snap = mgmt.read("suspect").await.unwrap().stats;
            snap.connections_opened == 1 && snap.connections_closed == 1
        }
    })
    .await;

    // Sibling connections keep serving after the reset.
    let reply = echo_once(echo_port, b"still alive").await;
    assert_eq!(reply, b"still alive");
}

#[tokio::test]
async fn balances_round_robin_across_shared_address_connectors() {
    let mgmt = Management::new(MeshRouter::new());
    for i in 0..3 {
        let backend = spawn_echo_backend(Duration::ZERO).await;
        mgmt.create_connector(connector_config(&format!("c{i}"), "svc", backend))
            .await
            .unwrap();
    }
    mgmt.create_listener(listener_config("front", "svc"))
        .await
        .unwrap();
    let port = mgmt.read("front").await.unwrap().port;

    for _ in 0..30 {
        let reply = echo_once(port, b"ping").await;
        assert_eq!(reply, b"ping");
    }

    // Strict rotation over three connectors: 10 tunnels each, plus the
    // dispatcher placeholder each connector opened at creation.
    wait_for("tunnels to land on every connector", || {
        let mgmt = mgmt.clone();
        async move {
            for i in 0..3 {
                let snap = mgmt.read(&format!("c{i}")).await.unwrap().stats;
                if snap.connections_opened != 11 {
                    return false;
                }
            }
            true
        }
    })
    .await;
}

#[tokio::test]
async fn entity_lifecycle_is_repeatable() {
    // Create, use, drain, snapshot, delete — twice. Both cycles must
    // produce identical counters: the dispatcher placeholder contributes
    // exactly one opened connection per connector lifetime, and every
    // opened connection is eventually closed.
    let mesh = MeshRouter::new();
    let mut cycles: Vec<(StatsSnapshot, StatsSnapshot)> = Vec::new();

    for _ in 0..2 {
        let mgmt = Management::new(mesh.clone());
        let backend = spawn_echo_backend(Duration::ZERO).await;
        mgmt.create_connector(connector_config("backend", "svc", backend))
            .await
            .unwrap();
        mgmt.create_listener(listener_config("front", "svc"))
            .await
            .unwrap();
        let port = mgmt.read("front").await.unwrap().port;

        let reply = echo_once(port, b"0123456789").await;
        assert_eq!(reply.len(), 10);

        wait_for("tunnel to drain", || {
            let mgmt = mgmt.clone();
            async move {
                let front = mgmt.read("front").await.unwrap().stats;
                let back = mgmt.read("backend").await.unwrap().stats;
                front.connections_closed == 1
                    && back.connections_closed == 1
                    && back.bytes_out == 10
            }
        })
        .await;

        let front = mgmt.read("front").await.unwrap().stats;
        let back = mgmt.read("backend").await.unwrap().stats;
        mgmt.delete("front").await.unwrap();
        mgmt.delete("backend").await.unwrap();
        cycles.push((front, back));
    }

    assert_eq!(cycles[0], cycles[1]);
    let (front, back) = cycles[0];
    assert_eq!(front.connections_opened, 1);
    assert_eq!(front.connections_closed, 1);
    assert_eq!(front.bytes_in, 10);
    assert_eq!(front.bytes_out, 10);
    // Dispatcher placeholder plus one served tunnel.
    assert_eq!(back.connections_opened, 2);
    assert_eq!(back.connections_closed, 1);
}
