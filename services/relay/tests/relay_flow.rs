
use std::time::Duration;

use harness::{
    pattern, read_to_close, spawn_relay, spawn_relay_with, AdminClient, GatedConnector,
    TcpEchoBackend, IO_TIMEOUT,
};
use plfm_relay::Destination;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn local_dest(port: u16) -> Destination {
    Destination::new("127.0.0.1", port)
}

async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn echo_roundtrip_preserves_bytes() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = spawn_relay(local_dest(backend.addr.port())).await.unwrap();

    let mut client = TcpStream::connect(relay.proxy_addr()).await.unwrap();
    let payload = pattern(256 * 1024);

    let (mut read_half, mut write_half) = client.split();
    let mut received = vec![0u8; payload.len()];
    let (write_result, read_result) = tokio::join!(
        async {
            for chunk in payload.chunks(1000) {
                write_half.write_all(chunk).await?;
            }
            Ok::<_, std::io::Error>(())
        },
        timeout(IO_TIMEOUT, read_half.read_exact(&mut received)),
    );
    write_result.unwrap();
    read_result.expect("echo timed out").unwrap();

    assert_eq!(received, payload);
    assert_eq!(backend.connection_count(), 1);

    let stats = relay.shutdown().await;
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.bytes_to_upstream, payload.len() as u64);
    assert_eq!(stats.bytes_to_client, payload.len() as u64);
}

#[tokio::test]
async fn each_direction_is_forwarded_unmodified() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = spawn_relay(local_dest(upstream.local_addr().unwrap().port()))
        .await
        .unwrap();

    let mut client = TcpStream::connect(relay.proxy_addr()).await.unwrap();
    let (mut server, _) = timeout(IO_TIMEOUT, upstream.accept()).await.unwrap().unwrap();

    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 18];
    timeout(IO_TIMEOUT, server.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");

    let binary: Vec<u8> = (0..=255u8).collect();
    server.write_all(&binary).await.unwrap();
    let mut back = vec![0u8; binary.len()];
    timeout(IO_TIMEOUT, client.read_exact(&mut back)).await.unwrap().unwrap();
    assert_eq!(back, binary);

    relay.shutdown().await;
}

#[tokio::test]
async fn client_disconnect_tears_down_both_channels() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = spawn_relay(local_dest(upstream.local_addr().unwrap().port()))
        .await
        .unwrap();
    let mut admin = AdminClient::connect(relay.shell_addr()).await.unwrap();

    let client = TcpStream::connect(relay.proxy_addr()).await.unwrap();
    let (mut server, _) = timeout(IO_TIMEOUT, upstream.accept()).await.unwrap().unwrap();
    assert_eq!(admin.wait_for_count(1).await, 1);

    drop(client);

    // Upstream side is closed too
    read_to_close(&mut server).await.unwrap();
    assert_eq!(admin.wait_for_count(0).await, 0);

    relay.shutdown().await;
}

#[tokio::test]
async fn upstream_disconnect_tears_down_both_channels() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = spawn_relay(local_dest(upstream.local_addr().unwrap().port()))
        .await
        .unwrap();
    let mut admin = AdminClient::connect(relay.shell_addr()).await.unwrap();

    let mut client = TcpStream::connect(relay.proxy_addr()).await.unwrap();
    let (server, _) = timeout(IO_TIMEOUT, upstream.accept()).await.unwrap().unwrap();
    assert_eq!(admin.wait_for_count(1).await, 1);

    drop(server);

    read_to_close(&mut client).await.unwrap();
    assert_eq!(admin.wait_for_count(0).await, 0);

    let stats = relay.shutdown().await;
    assert_eq!(stats.connections_closed, 1);
}

#[tokio::test]
async fn failed_upstream_connect_closes_client() {
    let relay = spawn_relay(local_dest(dead_port().await)).await.unwrap();
    let mut admin = AdminClient::connect(relay.shell_addr()).await.unwrap();

    let mut client = TcpStream::connect(relay.proxy_addr()).await.unwrap();
    read_to_close(&mut client).await.unwrap();
    assert_eq!(admin.wait_for_count(0).await, 0);

    let stats = relay.shutdown().await;
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.upstream_connect_failures, 1);
}

#[tokio::test]
async fn bytes_sent_before_upstream_connects_are_delivered() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connector = GatedConnector::closed(Some(upstream.local_addr().unwrap()));
    let relay = spawn_relay_with(Destination::new("backend.internal", 80), connector.clone())
        .await
        .unwrap();
    let mut admin = AdminClient::connect(relay.shell_addr()).await.unwrap();

    // Larger than a single read so the output queue has to hold several chunks
    let payload = pattern(300 * 1024);
    let mut client = TcpStream::connect(relay.proxy_addr()).await.unwrap();
    timeout(IO_TIMEOUT, client.write_all(&payload))
        .await
        .expect("relay should keep reading while upstream is pending")
        .unwrap();

    assert_eq!(admin.wait_for_count(1).await, 1);
    assert!(
        timeout(Duration::from_millis(50), upstream.accept()).await.is_err(),
        "upstream must not be connected before the gate opens"
    );

    connector.release();
    let (mut server, _) = timeout(IO_TIMEOUT, upstream.accept()).await.unwrap().unwrap();
    let mut received = vec![0u8; payload.len()];
    timeout(IO_TIMEOUT, server.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, payload);

    assert_eq!(connector.requests(), vec![Destination::new("backend.internal", 80)]);
    relay.shutdown().await;
}

#[tokio::test]
async fn connections_are_independent() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = spawn_relay(local_dest(backend.addr.port())).await.unwrap();
    let mut admin = AdminClient::connect(relay.shell_addr()).await.unwrap();

    let mut first = TcpStream::connect(relay.proxy_addr()).await.unwrap();
    let mut second = TcpStream::connect(relay.proxy_addr()).await.unwrap();
    assert_eq!(admin.wait_for_count(2).await, 2);

    first.write_all(b"one").await.unwrap();
    second.write_all(b"two").await.unwrap();

    let mut buf = [0u8; 3];
    timeout(IO_TIMEOUT, first.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"one");
    timeout(IO_TIMEOUT, second.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"two");

    drop(first);
    assert_eq!(admin.wait_for_count(1).await, 1);

    second.write_all(b"still").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(IO_TIMEOUT, second.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"still");

    relay.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_open_connections() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = spawn_relay(local_dest(backend.addr.port())).await.unwrap();
    let mut admin = AdminClient::connect(relay.shell_addr()).await.unwrap();

    let mut client = TcpStream::connect(relay.proxy_addr()).await.unwrap();
    assert_eq!(admin.wait_for_count(1).await, 1);

    relay.shutdown().await;

    read_to_close(&mut client).await.unwrap();
    assert!(admin.count().await.is_err());
}
