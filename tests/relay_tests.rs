/// End-to-end relay tests through a running proxy
mod common;

use common::*;
use rand::RngCore;
use std::time::Duration;
use tcproxy::AcceptorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn basic_relay(kind: AcceptorKind) {
    let (echo_addr, _echo) = start_echo_server().await;
    let (server, proxy_addr) = start_proxy(test_settings(kind), echo_addr);

    let test_data = b"Hello through the proxy!";
    let response = test_proxy_connection(proxy_addr, test_data, TIMEOUT)
        .await
        .expect("Relay failed");
    assert_eq!(response, test_data);

    let stats = server.stats();
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.bytes_upstream, test_data.len() as u64);

    server.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_basic_relay_non_blocking() {
    basic_relay(AcceptorKind::NonBlocking).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_basic_relay_blocking() {
    basic_relay(AcceptorKind::Blocking).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_random_payload_is_byte_exact() {
    let (echo_addr, _echo) = start_echo_server().await;
    let settings = tcproxy::ProxySettings::builder()
        .workers(2)
        .buffer_size(4096)
        .build()
        .unwrap();
    let (server, proxy_addr) = start_proxy(settings, echo_addr);

    let mut payload = vec![0u8; 4 * 1024 * 1024];
    rand::rng().fill_bytes(&mut payload);

    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let expected = payload.clone();
    let writer_task = tokio::spawn(async move {
        // 不规则的分块写入
        let mut offset = 0;
        let mut size = 1;
        while offset < payload.len() {
            let end = (offset + size).min(payload.len());
            writer.write_all(&payload[offset..end]).await.unwrap();
            offset = end;
            size = size * 7 % 65521 + 1;
        }
        writer
    });

    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(30), reader.read_exact(&mut received))
        .await
        .expect("Timeout receiving payload")
        .unwrap();
    let _writer = writer_task.await.unwrap();

    assert!(received == expected, "relayed payload differs");

    let stats = server.stats();
    assert_eq!(stats.bytes_upstream, expected.len() as u64);
    assert_eq!(stats.bytes_downstream, expected.len() as u64);
    server.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bidirectional_relay_with_socket_options() {
    const SIZE: usize = 3 * 1024 * 1024;

    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();
    let settings = tcproxy::ProxySettings::builder()
        .workers(1)
        .buffer_size(1024)
        .recv_buffer_size(8192)
        .send_buffer_size(8192)
        .no_delay(true)
        .keep_alive(true)
        .build()
        .unwrap();
    let (server, proxy_addr) = start_proxy(settings, remote_addr);

    let mut upstream_payload = vec![0u8; SIZE];
    let mut downstream_payload = vec![0u8; SIZE];
    rand::rng().fill_bytes(&mut upstream_payload);
    rand::rng().fill_bytes(&mut downstream_payload);

    // 远程一侧：同时发送和接收，读取前稍作延迟以制造背压
    let to_client = downstream_payload.clone();
    let remote_task = tokio::spawn(async move {
        let (stream, _) = remote.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let sender = tokio::spawn(async move {
            writer.write_all(&to_client).await.unwrap();
            writer
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut received = vec![0u8; SIZE];
        reader.read_exact(&mut received).await.unwrap();
        let _writer = sender.await.unwrap();
        received
    });

    let client = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut reader, mut writer) = client.into_split();
    let to_remote = upstream_payload.clone();
    let sender = tokio::spawn(async move {
        writer.write_all(&to_remote).await.unwrap();
        writer
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut from_remote = vec![0u8; SIZE];
    timeout(Duration::from_secs(30), reader.read_exact(&mut from_remote))
        .await
        .expect("Timeout receiving from remote")
        .unwrap();
    let _writer = timeout(Duration::from_secs(30), sender)
        .await
        .expect("Timeout sending to remote")
        .unwrap();
    let at_remote = timeout(Duration::from_secs(30), remote_task)
        .await
        .expect("Timeout at remote")
        .unwrap();

    assert!(from_remote == downstream_payload, "downstream bytes differ");
    assert!(at_remote == upstream_payload, "upstream bytes differ");

    let stats = server.stats();
    assert_eq!(stats.bytes_upstream, SIZE as u64);
    assert_eq!(stats.bytes_downstream, SIZE as u64);
    server.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multiple_connections() {
    let (echo_addr, _echo) = start_echo_server().await;
    let (server, proxy_addr) = start_proxy(test_settings(AcceptorKind::NonBlocking), echo_addr);

    let mut tasks = Vec::new();
    for i in 0..32 {
        tasks.push(tokio::spawn(async move {
            let data = format!("connection #{} says hello", i).into_bytes();
            let response = test_proxy_connection(proxy_addr, &data, TIMEOUT).await;
            (data, response)
        }));
    }

    for task in tasks {
        let (data, response) = task.await.unwrap();
        assert_eq!(response.expect("Relay failed"), data);
    }

    assert_eq!(server.stats().connections_accepted, 32);
    assert_eq!(server.stats().pairs_registered, 32);
    server.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_close_closes_remote() {
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();
    let (server, proxy_addr) = start_proxy(test_settings(AcceptorKind::NonBlocking), remote_addr);

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut upstream, _) = timeout(TIMEOUT, remote.accept()).await.unwrap().unwrap();

    client.write_all(b"bye").await.unwrap();
    drop(client);

    let mut received = Vec::new();
    timeout(TIMEOUT, upstream.read_to_end(&mut received))
        .await
        .expect("Remote side was not closed")
        .unwrap();
    assert_eq!(received, b"bye");

    assert!(wait_until(TIMEOUT, || server.stats().active_pairs == 0).await);
    server.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_close_closes_client() {
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();
    let (server, proxy_addr) = start_proxy(test_settings(AcceptorKind::Blocking), remote_addr);

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut upstream, _) = timeout(TIMEOUT, remote.accept()).await.unwrap().unwrap();
    upstream.write_all(b"closing now").await.unwrap();
    drop(upstream);

    let mut received = Vec::new();
    timeout(TIMEOUT, client.read_to_end(&mut received))
        .await
        .expect("Client side was not closed")
        .unwrap();
    assert_eq!(received, b"closing now");

    assert!(wait_until(TIMEOUT, || server.stats().active_pairs == 0).await);
    server.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unresponsive_remote_keeps_memory_bounded() {
    let (sink_addr, _sink) = start_sink_server().await;
    let settings = tcproxy::ProxySettings::builder()
        .workers(1)
        .buffer_size(4096)
        .recv_buffer_size(16 * 1024)
        .send_buffer_size(16 * 1024)
        .build()
        .unwrap();
    let (server, proxy_addr) = start_proxy(settings, sink_addr);

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let chunk = vec![0x5au8; 64 * 1024];

    // 远程从不读取，写入最终会被阻塞
    let blocked = timeout(Duration::from_secs(3), async {
        for _ in 0..1024 {
            client.write_all(&chunk).await?;
        }
        Ok::<_, std::io::Error>(())
    })
    .await;
    assert!(blocked.is_err(), "writes should stall behind a silent remote");

    let stats = server.stats();
    assert!(stats.backpressure_pauses >= 1);
    assert!(stats.pending_buffers <= 1);
    assert!(stats.bytes_upstream < 1024 * chunk.len() as u64);

    // 入站一侧已暂停读取，连接只会在关闭时被释放
    server.shutdown().unwrap();
    assert_eq!(server.stats().pending_buffers, 0);
    assert_eq!(server.stats().active_pairs, 0);
    drop(client);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_remote_closes_client() {
    let dead_addr = format!("127.0.0.1:{}", get_available_port())
        .parse()
        .unwrap();
    let (server, proxy_addr) = start_proxy(test_settings(AcceptorKind::NonBlocking), dead_addr);

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(TIMEOUT, client.read(&mut buf))
        .await
        .expect("Client was not closed after connect failure");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(wait_until(TIMEOUT, || server.stats().connect_failures == 1).await);
    assert!(wait_until(TIMEOUT, || server.stats().active_pairs == 0).await);
    server.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_open_connections() {
    let (echo_addr, _echo) = start_echo_server().await;
    let (server, proxy_addr) = start_proxy(test_settings(AcceptorKind::NonBlocking), echo_addr);

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    server.shutdown().unwrap();
    assert!(!server.is_running());

    let mut rest = Vec::new();
    let read = timeout(TIMEOUT, client.read_to_end(&mut rest))
        .await
        .expect("Connection left open after shutdown");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(server.stats().active_pairs, 0);

    // 监听端口已关闭
    assert!(TcpStream::connect(proxy_addr).await.is_err());
}
