//! wsgroup - WebSocket connection-lifecycle manager.
//!
//! Accepts raw sockets from an HTTP layer, takes over the upgrade handshake,
//! and manages the resulting connections in groups that share policy and
//! bulk operations (broadcast, keepalive ping, graceful close).
//!
//! # Architecture
//!
//! ```text
//! HttpServer ──upgrade──► Coordinator ──ticket──► Engine ──callbacks──► Bridge ──events──► Connection
//!                         (path, verify, key)     (I/O tasks)          (EventLoop)
//! ```
//!
//! Key design principles:
//!
//! - The [`engine`] is the only code that touches sockets and framing; it
//!   speaks in opaque handles.
//! - Every callback runs on one [`EventLoop`], in order, never inline inside
//!   the call that caused it.
//! - A [`Connection`] is OPEN exactly while it holds an engine handle.
//! - Synchronous misuse returns `Err`; everything asynchronous is an event.
//!
//! # Quick Start
//!
//! ```no_run
//! use wsgroup::{Result, Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::new(ServerOptions::with_port(9001))?;
//!
//!     server.on_connection(|connection, _request| {
//!         let echo = connection.clone();
//!         let _ = connection.on_message(move |payload| echo.send(payload));
//!     })?;
//!
//!     let addr = server.listen().await?;
//!     println!("listening on {addr}");
//!     tokio::signal::ctrl_c().await?;
//!     server.close();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`server`] | [`Server`], options and events |
//! | [`client`] | [`Client`] and `connect` |
//! | [`connection`] | Per-socket [`Connection`] and its events |
//! | [`group`] | Connection groups |
//! | [`handshake`] | Upgrade coordinator and client verification |
//! | [`http`] | Request heads and the upgrade listener chain |
//! | [`engine`] | Handle-based frame engine |
//! | [`event_loop`] | Callback scheduling |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Handle types |

// ============================================================================
// Modules
// ============================================================================

/// Engine callbacks to connection events.
mod bridge;

/// WebSocket client.
pub mod client;

/// Per-socket connection object.
pub mod connection;

/// Handle-based frame engine.
///
/// Owns sockets, framing and the handle tables; everything above it works
/// with [`ConnHandle`] and [`GroupHandle`].
pub mod engine;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Single cooperative scheduling context.
pub mod event_loop;

/// Connection groups.
pub mod group;

/// Upgrade handshake coordinator.
pub mod handshake;

/// Generic HTTP layer.
pub mod http;

/// Shared engine and event loop.
pub mod hub;

/// Opaque handles.
///
/// Newtype wrappers prevent mixing connection, group and ticket handles.
pub mod identifiers;

/// Single-slot listener registry.
pub mod listeners;

/// Message payloads.
pub mod payload;

/// WebSocket server.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

// Server and client
pub use client::{Client, ClientOptions};
pub use server::{
    Clients, PerMessageDeflate, Server, ServerConfig, ServerEvent, ServerEventKind, ServerOptions,
};

// Connection types
pub use connection::{Connection, Event, EventKind, ReadyState, SendOptions, Variant};
pub use engine::{AddressFamily, CloseInfo, PeerAddress};
pub use payload::Payload;

// Handshake types
pub use handshake::{ClientInfo, HandshakeState, Verdict, VerifyClient};
pub use http::{HttpOptions, HttpServer, UpgradeRequest};

// Runtime
pub use event_loop::EventLoop;
pub use hub::Hub;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnHandle, GroupHandle, TicketId};
