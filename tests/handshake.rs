//! Upgrade handshake over raw sockets.

mod common;

use std::time::Duration;

use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use wsgroup::{Hub, ServerOptions, Verdict, VerifyClient};

use common::{KEY, assert_quiet, init_tracing, listening_server, raw_upgrade, read_all, read_some, recv};

#[tokio::test]
async fn test_accepts_valid_key() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let key = STANDARD.encode([7u8; 16]);
    let mut stream = raw_upgrade(addr, "/", &key, &[]).await;
    let response = read_some(&mut stream).await;

    assert!(response.starts_with("HTTP/1.1 101"), "{response}");
    let accept = derive_accept_key(key.as_bytes());
    assert!(response.contains(&accept), "{response}");

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_bad_key_destroys_socket_without_answer() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (joins, mut join_rx) = mpsc::unbounded_channel();
    server.on_connection(move |_, _| {
        let _ = joins.send(());
    })?;

    let short = &KEY[..23];
    let mut stream = raw_upgrade(addr, "/", short, &[]).await;
    assert_eq!(read_all(&mut stream).await, "");
    assert_quiet(&mut join_rx, Duration::from_millis(100)).await;

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_sync_verify_rejects_with_default_status() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let verify = VerifyClient::sync(|info| info.origin.as_deref() == Some("https://trusted.example"));
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0).with_verify_client(verify)).await;

    let mut rejected = raw_upgrade(addr, "/", KEY, &[("Origin", "https://evil.example")]).await;
    let response = read_all(&mut rejected).await;
    assert!(response.starts_with("HTTP/1.1 400 Client verification failed"), "{response}");

    let mut accepted = raw_upgrade(addr, "/", KEY, &[("Origin", "https://trusted.example")]).await;
    assert!(read_some(&mut accepted).await.starts_with("HTTP/1.1 101"));

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_async_verify_custom_rejection() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let verify = VerifyClient::with_async(|info| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if info.request.header("Authorization").is_some() {
            Verdict::allow()
        } else {
            Verdict::reject_with(401, "Unauthorized")
        }
    });
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0).with_verify_client(verify)).await;

    let mut anonymous = raw_upgrade(addr, "/", KEY, &[]).await;
    let response = read_all(&mut anonymous).await;
    assert!(response.starts_with("HTTP/1.1 401 Unauthorized"), "{response}");

    let mut authorized = raw_upgrade(addr, "/", KEY, &[("Authorization", "Bearer t")]).await;
    assert!(read_some(&mut authorized).await.starts_with("HTTP/1.1 101"));

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_path_mismatch_on_last_listener() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0).with_path("/chat")).await;

    let mut wrong = raw_upgrade(addr, "/other", KEY, &[]).await;
    let response = read_all(&mut wrong).await;
    assert!(response.starts_with("HTTP/1.1 400 URL not supported"), "{response}");

    // Query strings do not take part in path matching.
    let mut right = raw_upgrade(addr, "/chat?room=1", KEY, &[]).await;
    assert!(read_some(&mut right).await.starts_with("HTTP/1.1 101"));

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_plain_request_gets_426() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await?;
    let response = read_all(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 426"), "{response}");
    assert!(response.contains("Upgrade: websocket"), "{response}");

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_malformed_head_gets_400_and_socket_error() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (errors, mut error_rx) = mpsc::unbounded_channel();
    server.on_socket_error(move |error| {
        let _ = errors.send(error.to_string());
    })?;

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(b"\x01\x02 garbage\r\n\r\n").await?;
    let response = read_all(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    recv(&mut error_rx).await;

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_deflate_offer_is_declined() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let options = ServerOptions::with_port(0).with_per_message_deflate(wsgroup::PerMessageDeflate::Flag(true));
    let (server, addr) = listening_server(&hub, options).await;

    let mut stream = raw_upgrade(
        addr,
        "/",
        KEY,
        &[("Sec-WebSocket-Extensions", "permessage-deflate; client_max_window_bits")],
    )
    .await;
    let response = read_some(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 101"), "{response}");
    assert!(!response.to_ascii_lowercase().contains("sec-websocket-extensions"), "{response}");

    server.close();
    Ok(())
}
