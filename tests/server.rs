//! Server lifecycle against real sockets.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::io::duplex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;

use wsgroup::http::{HEAD_TIMEOUT, MAX_HEAD_SIZE, read_head};
use wsgroup::{
    AddressFamily, CloseInfo, Connection, HandshakeState, HttpOptions, HttpServer, Hub, Server,
    ServerOptions, UpgradeRequest,
};

use common::{assert_quiet, client, init_tracing, listening_server, raw_upgrade, read_some, recv};

/// Echoes every message and reports close codes.
fn echo_with_close_report(connection: &Connection, closes: mpsc::UnboundedSender<u16>) {
    let reply = connection.clone();
    connection
        .on_message(move |payload| reply.send(payload))
        .expect("message slot");
    connection
        .on_close(move |info| {
            let _ = closes.send(info.code);
        })
        .expect("close slot");
}

#[tokio::test]
async fn test_ping_pong_exchange_closes_normally() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (server_closes, mut server_closed) = mpsc::unbounded_channel();
    server.on_connection(move |connection, _request| {
        let reply = connection.clone();
        connection
            .on_message(move |payload| {
                if payload.as_text() == Some("ping-test") {
                    reply.send("pong-test");
                }
            })
            .expect("message slot");
        let closes = server_closes.clone();
        connection
            .on_close(move |info| {
                let _ = closes.send(info.code);
            })
            .expect("close slot");
    })?;

    let client = client(&hub);
    let connection = client.connect(&format!("ws://{addr}/"))?;

    let (messages, mut received) = mpsc::unbounded_channel();
    let (client_closes, mut client_closed) = mpsc::unbounded_channel();
    {
        let sender = connection.clone();
        connection.on_open(move || sender.send("ping-test"))?;
    }
    {
        let closer = connection.clone();
        connection.on_message(move |payload| {
            let _ = messages.send(payload.as_text().map(str::to_owned));
            closer.close(1000, "");
        })?;
    }
    connection.on_close(move |info| {
        let _ = client_closes.send(info.code);
    })?;

    assert_eq!(recv(&mut received).await.as_deref(), Some("pong-test"));
    assert_eq!(recv(&mut client_closed).await, 1000);
    assert_eq!(recv(&mut server_closed).await, 1000);
    assert!(!connection.is_open());

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_messages_in_order_then_close() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (events, mut rx) = mpsc::unbounded_channel();
    server.on_connection(move |connection, _| {
        let on_message = events.clone();
        connection
            .on_message(move |payload| {
                let _ = on_message.send(payload.as_text().unwrap_or_default().to_owned());
            })
            .expect("message slot");
        let on_close = events.clone();
        connection
            .on_close(move |_| {
                let _ = on_close.send("<close>".to_owned());
            })
            .expect("close slot");
    })?;

    let client = client(&hub);
    let connection = client.connect(&format!("ws://{addr}/"))?;
    {
        let sender = connection.clone();
        connection.on_open(move || {
            sender.send("a");
            sender.send("b");
            sender.send("c");
            sender.close(1000, "done");
        })?;
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(recv(&mut rx).await);
    }
    assert_eq!(seen, ["a", "b", "c", "<close>"]);

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_broadcast_reaches_every_open_client() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (joined, mut joins) = mpsc::unbounded_channel();
    server.on_connection(move |_, _| {
        let _ = joined.send(());
    })?;

    let client = client(&hub);
    let (deliveries, mut delivered) = mpsc::unbounded_channel();
    let mut connections = Vec::new();
    for id in 0..3 {
        let connection = client.connect(&format!("ws://{addr}/"))?;
        let deliveries = deliveries.clone();
        connection.on_message(move |payload| {
            let _ = deliveries.send((id, payload.as_bytes().to_vec()));
        })?;
        connections.push(connection);
    }
    for _ in 0..3 {
        recv(&mut joins).await;
    }

    assert_eq!(server.clients().len(), 3);
    assert_eq!(server.broadcast("news", None)?, 3);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let (id, bytes) = recv(&mut delivered).await;
        assert_eq!(bytes, b"news");
        ids.push(id);
    }
    ids.sort_unstable();
    assert_eq!(ids, [0, 1, 2]);

    let mut visited = 0;
    server.clients().for_each(|connection| {
        assert!(connection.is_open());
        visited += 1;
    });
    assert_eq!(visited, 3);

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_broadcast_skips_connection_closing_in_same_turn() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (joined, mut joins) = mpsc::unbounded_channel();
    server.on_connection(move |connection, request| {
        let _ = joined.send((request.path().to_owned(), connection));
    })?;

    let client = client(&hub);
    let mut receivers = Vec::new();
    let mut connections = Vec::new();
    for path in ["/keep-1", "/keep-2", "/leaving"] {
        let connection = client.connect(&format!("ws://{addr}{path}"))?;
        let (tx, rx) = mpsc::unbounded_channel();
        connection.on_message(move |payload| {
            let _ = tx.send(payload.as_text().map(str::to_owned));
        })?;
        receivers.push(rx);
        connections.push(connection);
    }

    let mut leaving = None;
    for _ in 0..3 {
        let (path, connection) = recv(&mut joins).await;
        if path == "/leaving" {
            leaving = Some(connection);
        }
    }
    let leaving = leaving.expect("leaving connection joined");

    leaving.close(1000, "bye");
    assert!(!leaving.is_open());
    assert_eq!(server.clients().len(), 2);

    let mut visited = 0;
    server.clients().for_each(|connection| {
        assert_ne!(connection, &leaving);
        visited += 1;
    });
    assert_eq!(visited, 2);

    assert_eq!(server.broadcast("after close", None)?, 2);

    let mut leaving_rx = receivers.pop().expect("three receivers");
    for rx in &mut receivers {
        assert_eq!(recv(rx).await.as_deref(), Some("after close"));
    }
    assert_quiet(&mut leaving_rx, Duration::from_millis(200)).await;

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_broadcast_forces_frame_type() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (joined, mut joins) = mpsc::unbounded_channel();
    server.on_connection(move |_, _| {
        let _ = joined.send(());
    })?;

    let client = client(&hub);
    let connection = client.connect(&format!("ws://{addr}/"))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.on_message(move |payload| {
        let _ = tx.send(payload);
    })?;
    recv(&mut joins).await;

    server.broadcast("as bytes", Some(true))?;
    let payload = recv(&mut rx).await;
    assert!(payload.is_binary());
    assert_eq!(payload.as_bytes(), b"as bytes");

    assert!(server.broadcast(vec![0xc3_u8, 0x28], Some(false)).is_err());

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_binary_broadcast_keeps_bytes() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (joined, mut joins) = mpsc::unbounded_channel();
    server.on_connection(move |_, _| {
        let _ = joined.send(());
    })?;

    let connection = client(&hub).connect(&format!("ws://{addr}/"))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.on_message(move |payload| {
        let _ = tx.send(payload);
    })?;
    recv(&mut joins).await;

    server.broadcast(vec![0u8, 159, 146, 150], None)?;
    let payload = recv(&mut rx).await;
    assert!(payload.is_binary());
    assert_eq!(payload.as_bytes(), &[0u8, 159, 146, 150]);

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_send_after_terminate_reports_not_open() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (results, mut result_rx) = mpsc::unbounded_channel();
    let (closes, mut close_rx) = mpsc::unbounded_channel();
    server.on_connection(move |connection, _| {
        let closes = closes.clone();
        connection
            .on_close(move |info| {
                let _ = closes.send(info.code);
            })
            .expect("close slot");

        connection.terminate();
        let results = results.clone();
        connection.send_with(
            "too late",
            wsgroup::SendOptions::default(),
            Some(Box::new(move |result| {
                let _ = results.send(result.map_err(|e| e.is_not_open()));
            })),
        );
    })?;

    let connection = client(&hub).connect(&format!("ws://{addr}/"))?;
    let (client_closes, mut client_closed) = mpsc::unbounded_channel();
    connection.on_close(move |info| {
        let _ = client_closes.send(info.code);
    })?;

    assert_eq!(recv(&mut result_rx).await, Err(true));
    assert_eq!(recv(&mut close_rx).await, CloseInfo::ABNORMAL);
    assert_eq!(recv(&mut client_closed).await, CloseInfo::ABNORMAL);

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_oversized_message_closes_with_1009() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0).with_max_payload(16)).await;

    let (closes, mut close_rx) = mpsc::unbounded_channel();
    server.on_connection(move |connection, _| echo_with_close_report(&connection, closes.clone()))?;

    let connection = client(&hub).connect(&format!("ws://{addr}/"))?;
    {
        let sender = connection.clone();
        connection.on_open(move || sender.send("x".repeat(64)))?;
    }

    assert_eq!(recv(&mut close_rx).await, CloseInfo::MESSAGE_TOO_BIG);
    server.close();
    Ok(())
}

#[tokio::test]
async fn test_peer_address_reports_both_ends() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (peers, mut peer_rx) = mpsc::unbounded_channel();
    server.on_connection(move |connection, request| {
        let _ = peers.send((connection.peer_address(), request.remote_addr()));
    })?;

    let _connection = client(&hub).connect(&format!("ws://{addr}/"))?;

    let (peer, remote) = recv(&mut peer_rx).await;
    let peer = peer.expect("peer address");
    assert_eq!(peer.local_port(), addr.port());
    assert_eq!(peer.remote_family(), AddressFamily::V4);
    assert_eq!(peer.remote_address(), "127.0.0.1");
    assert_eq!(Some(peer.remote), remote);

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_auto_ping_keeps_live_clients_and_drops_silent_ones() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (closes, mut close_rx) = mpsc::unbounded_channel();
    let (joined, mut joins) = mpsc::unbounded_channel();
    server.on_connection(move |connection, request| {
        let closes = closes.clone();
        let path = request.path().to_owned();
        connection
            .on_close(move |info| {
                let _ = closes.send((path.clone(), info.code));
            })
            .expect("close slot");
        let _ = joined.send(());
    })?;

    let live = client(&hub).connect(&format!("ws://{addr}/live"))?;
    let (pings, mut ping_rx) = mpsc::unbounded_channel();
    live.on_ping(move |data| {
        let _ = pings.send(data);
    })?;

    // Completes the handshake, then never reads again.
    let _silent = raw_upgrade(addr, "/silent", common::KEY, &[]).await;

    recv(&mut joins).await;
    recv(&mut joins).await;
    server.start_auto_ping(Duration::from_millis(40), "hb")?;

    assert_eq!(&recv(&mut ping_rx).await[..], b"hb");
    assert_eq!(recv(&mut close_rx).await, ("/silent".to_owned(), CloseInfo::ABNORMAL));
    assert!(live.is_open());
    assert_eq!(server.clients().len(), 1);

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_close_keeps_existing_connections() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (messages, mut message_rx) = mpsc::unbounded_channel();
    let (joined, mut joins) = mpsc::unbounded_channel();
    server.on_connection(move |connection, _| {
        let messages = messages.clone();
        connection
            .on_message(move |payload| {
                let _ = messages.send(payload.as_text().unwrap_or_default().to_owned());
            })
            .expect("message slot");
        let _ = joined.send(());
    })?;

    let client = client(&hub);
    let existing = client.connect(&format!("ws://{addr}/"))?;
    let (opens, mut open_rx) = mpsc::unbounded_channel();
    existing.on_open(move || {
        let _ = opens.send(());
    })?;
    recv(&mut joins).await;
    recv(&mut open_rx).await;

    server.close();
    existing.send("still here");
    assert_eq!(recv(&mut message_rx).await, "still here");

    let late = client.connect(&format!("ws://{addr}/"))?;
    let (errors, mut error_rx) = mpsc::unbounded_channel();
    late.on_error(move |error| {
        let _ = errors.send(error.to_string());
    })?;
    recv(&mut error_rx).await;
    assert!(!late.is_open());

    Ok(())
}

#[tokio::test]
async fn test_close_with_callback_runs_after_delay() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let options = ServerOptions::with_port(0).with_close_callback_delay(Duration::from_millis(30));
    let (server, _addr) = listening_server(&hub, options).await;

    let (done, mut done_rx) = mpsc::unbounded_channel();
    server.close_with_callback(move || {
        let _ = done.send(());
    });
    recv(&mut done_rx).await;
    assert!(server.start_auto_ping(Duration::from_secs(1), "x").is_err());
    Ok(())
}

#[tokio::test]
async fn test_listening_event() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let server = Server::new(ServerOptions::with_port(0).with_host("127.0.0.1").with_hub(hub))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_listening(move |addr| {
        let _ = tx.send(addr);
    })?;

    let addr = server.listen().await?;
    assert_eq!(recv(&mut rx).await, addr);
    server.close();
    Ok(())
}

#[tokio::test]
async fn test_attached_servers_split_by_path() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let http = HttpServer::bind("127.0.0.1:0".parse()?, HttpOptions::default()).await?;

    let mut servers = Vec::new();
    let (joins, mut join_rx) = mpsc::unbounded_channel();
    for path in ["/a", "/b"] {
        let server = Server::new(
            ServerOptions::with_server(http.clone())
                .with_path(path)
                .with_hub(hub.clone()),
        )?;
        let joins = joins.clone();
        server.on_connection(move |_, request| {
            let _ = joins.send((path, request.path().to_owned()));
        })?;
        server.listen().await?;
        servers.push(server);
    }

    let client = client(&hub);
    let _b = client.connect(&format!("ws://{}/b", http.local_addr()))?;
    assert_eq!(recv(&mut join_rx).await, ("/b", "/b".to_owned()));

    let mut raw = raw_upgrade(http.local_addr(), "/c", common::KEY, &[]).await;
    assert!(read_some(&mut raw).await.starts_with("HTTP/1.1 400 URL not supported"));

    for server in &servers {
        server.close();
    }
    http.close();
    Ok(())
}

#[tokio::test]
async fn test_handle_upgrade_without_http_server() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let server = Server::new(ServerOptions::no_server().with_hub(hub))?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let (accepted, mut accepted_rx) = mpsc::unbounded_channel::<Connection>();
    let upgrade = {
        let server = server.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let (head, rest) = read_head(&mut stream, MAX_HEAD_SIZE, HEAD_TIMEOUT)
                .await
                .expect("request head");
            let request = UpgradeRequest::parse(&head).expect("request");
            server
                .handle_upgrade(request, stream, rest, move |connection| {
                    let _ = accepted.send(connection);
                })
                .await
        })
    };

    let (mut ws, _response) = tokio_tungstenite::connect_async(format!("ws://{addr}/manual")).await?;
    assert_eq!(upgrade.await?, HandshakeState::Transferred);

    let connection = recv(&mut accepted_rx).await;
    connection.send("hello");
    let message = ws.next().await.expect("frame")?;
    assert_eq!(message, Message::Text("hello".into()));

    ws.close(None).await?;
    Ok(())
}

#[tokio::test]
async fn test_adopt_upgraded_stream() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let server = Server::new(ServerOptions::no_server().with_hub(hub))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_connection(move |connection, request| {
        let tx = tx.clone();
        let path = request.path().to_owned();
        connection
            .on_message(move |payload| {
                let _ = tx.send((path.clone(), payload.as_text().unwrap_or_default().to_owned()));
            })
            .expect("message slot");
    })?;

    let (client_io, server_io) = duplex(4096);
    let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let mut client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

    server.adopt(server_ws, UpgradeRequest::new("GET", "/adopted"))?;
    client_ws.send(Message::Text("over duplex".into())).await?;

    assert_eq!(recv(&mut rx).await, ("/adopted".to_owned(), "over duplex".to_owned()));
    assert_eq!(server.clients().len(), 1);

    server.close();
    assert!(
        server
            .adopt(
                WebSocketStream::from_raw_socket(duplex(64).1, Role::Server, None).await,
                UpgradeRequest::new("GET", "/late"),
            )
            .is_err()
    );
    Ok(())
}

#[tokio::test]
async fn test_shared_request_reaches_connection_event() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<UpgradeRequest>>();
    server.on_connection(move |_, request| {
        let _ = tx.send(request);
    })?;

    let _raw = raw_upgrade(addr, "/room?id=7", common::KEY, &[("Origin", "https://app.example")]).await;
    let request = recv(&mut rx).await;
    assert_eq!(request.path(), "/room");
    assert_eq!(request.query(), Some("id=7"));
    assert_eq!(request.origin(), Some("https://app.example"));

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_server_error_events_for_bad_sockets() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (server, addr) = listening_server(&hub, ServerOptions::with_port(0)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_socket_error(move |error| {
        let _ = tx.send(error.is_transport_error());
    })?;

    let stream = tokio::net::TcpStream::connect(addr).await?;
    drop(stream);
    assert!(recv(&mut rx).await);

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_zero_max_payload_rejected() {
    let err = Server::new(ServerOptions::with_port(0).with_max_payload(0)).unwrap_err();
    assert!(err.is_usage_error());
}
