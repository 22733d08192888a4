/// Common utilities for integration tests
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tcproxy::{AcceptorKind, PortMapping, ProxyServer, ProxySettings, RemoteEndpoint};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::time::timeout;

/// Find an available port
#[allow(dead_code)]
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Create a simple echo server for testing
#[allow(dead_code)]
pub async fn start_echo_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get echo addr");

    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });

    (addr, handle)
}

/// Create a server that accepts connections but never reads from them
#[allow(dead_code)]
pub async fn start_sink_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind sink server");
    let addr = listener.local_addr().expect("Failed to get sink addr");

    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    (addr, handle)
}

/// Proxy settings suitable for tests
#[allow(dead_code)]
pub fn test_settings(kind: AcceptorKind) -> ProxySettings {
    ProxySettings::builder()
        .acceptor(kind)
        .workers(2)
        .build()
        .expect("Invalid test settings")
}

/// Start a proxy forwarding an ephemeral local port to `remote`
#[allow(dead_code)]
pub fn start_proxy(settings: ProxySettings, remote: SocketAddr) -> (ProxyServer, SocketAddr) {
    let mapping = PortMapping::new(
        "test",
        "127.0.0.1:0".parse().unwrap(),
        RemoteEndpoint::new(remote.ip().to_string(), remote.port()),
    );

    let server = ProxyServer::new(settings);
    let addrs = server.start(&[mapping]).expect("Failed to start proxy");
    (server, addrs[0])
}

/// Test data transmission through proxy
#[allow(dead_code)]
pub async fn test_proxy_connection(
    proxy_addr: SocketAddr,
    test_data: &[u8],
    timeout_duration: Duration,
) -> Result<Vec<u8>, String> {
    timeout(timeout_duration, async {
        let mut stream = TcpStream::connect(proxy_addr)
            .await
            .map_err(|e| format!("Failed to connect to proxy: {}", e))?;

        stream
            .write_all(test_data)
            .await
            .map_err(|e| format!("Failed to write data: {}", e))?;

        let mut response = Vec::new();
        let mut buf = vec![0u8; 8192];

        while response.len() < test_data.len() {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(e) => return Err(format!("Failed to read response: {}", e)),
            }
        }

        Ok(response)
    })
    .await
    .map_err(|_| "Timeout waiting for response".to_string())?
}

/// Poll `cond` until it holds or the timeout expires
#[allow(dead_code)]
pub async fn wait_until(timeout_duration: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout_duration;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
