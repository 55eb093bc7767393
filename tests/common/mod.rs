//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use wsgroup::{Client, ClientOptions, Hub, Server, ServerOptions};

/// RFC 6455 sample nonce.
pub const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

/// Upper bound for any single expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Installs a subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Receives the next item or panics after [`EVENT_TIMEOUT`].
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Asserts nothing arrives within `window`.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, window: Duration) {
    if let Ok(Some(item)) = timeout(window, rx.recv()).await {
        panic!("unexpected event: {item:?}");
    }
}

/// Server on an ephemeral loopback port, sharing `hub`.
pub async fn listening_server(hub: &Hub, options: ServerOptions) -> (Server, SocketAddr) {
    let server = Server::new(options.with_host("127.0.0.1").with_hub(hub.clone())).expect("server options");
    let addr = server.listen().await.expect("listen");
    (server, addr)
}

/// Client sharing `hub`.
pub fn client(hub: &Hub) -> Client {
    Client::new(ClientOptions::default().with_hub(hub.clone())).expect("client options")
}

/// Sends a raw upgrade request and returns the socket.
pub async fn raw_upgrade(addr: SocketAddr, path: &str, key: &str, extra: &[(&str, &str)]) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );
    for (name, value) in extra {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.expect("write request");
    stream
}

/// Reads until EOF.
pub async fn read_all(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    let _ = timeout(EVENT_TIMEOUT, stream.read_to_end(&mut out)).await;
    String::from_utf8_lossy(&out).into_owned()
}

/// Reads the first chunk the server sends.
pub async fn read_some(stream: &mut TcpStream) -> String {
    let mut buf = vec![0u8; 1024];
    let n = timeout(EVENT_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("timed out reading")
        .expect("read");
    String::from_utf8_lossy(&buf[..n]).into_owned()
}
