//! WebSocket server.
//!
//! A [`Server`] owns one server group and receives upgrade requests from one
//! of three places, chosen by [`ServerOptions`]:
//!
//! | Mode | Source of upgrades |
//! |------|--------------------|
//! | `port` | Its own [`HttpServer`], bound by [`Server::listen`] |
//! | `server` | An existing [`HttpServer`], joined by [`Server::listen`] |
//! | `no_server` | [`Server::handle_upgrade`] and [`Server::adopt`] only |
//!
//! # Events
//!
//! | Event | Payload |
//! |-------|---------|
//! | `listening` | Bound address |
//! | `connection` | [`Connection`] and its [`UpgradeRequest`] |
//! | `error` | HTTP server failure |
//! | `socket_error` | Socket failure before the upgrade |
//!
//! # Example
//!
//! ```ignore
//! use wsgroup::{Server, ServerOptions};
//!
//! let server = Server::new(ServerOptions::with_port(0))?;
//! server.on_connection(|connection, _request| {
//!     let echo = connection.clone();
//!     connection.on_message(move |payload| echo.send(payload)).ok();
//! })?;
//! let addr = server.listen().await?;
//! ```

// ============================================================================
// Submodules
// ============================================================================

mod options;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::lookup_host;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Variant};
use crate::engine::{Transport, UpgradeContext};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::handshake::{Coordinator, HandshakeOutcome, HandshakeState};
use crate::http::{HttpOptions, HttpServer, ListenerId, PendingUpgrade, UpgradeListener, UpgradeRequest};
use crate::hub::Hub;
use crate::listeners::{EventKey, Listeners};
use crate::payload::Payload;

// ============================================================================
// Re-exports
// ============================================================================

pub use options::{DEFAULT_CLOSE_CALLBACK_DELAY, DEFAULT_HOST, PerMessageDeflate, ServerConfig, ServerOptions};

// ============================================================================
// Events
// ============================================================================

/// Server event slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    /// The server is accepting upgrades.
    Listening,
    /// A client connected.
    Connection,
    /// The HTTP server failed.
    Error,
    /// A socket failed before its upgrade.
    SocketError,
}

impl ServerEventKind {
    /// Event name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Listening => "listening",
            Self::Connection => "connection",
            Self::Error => "error",
            Self::SocketError => "socket_error",
        }
    }
}

impl EventKey for ServerEventKind {
    fn name(&self) -> &'static str {
        self.as_str()
    }
}

/// A server event.
#[derive(Debug)]
pub enum ServerEvent {
    /// The server is accepting upgrades on this address.
    Listening(SocketAddr),
    /// A client connected.
    Connection(Connection, Arc<UpgradeRequest>),
    /// The HTTP server failed.
    Error(Error),
    /// A socket failed before its upgrade.
    SocketError(Error),
}

impl ServerEvent {
    /// Slot this event is delivered to.
    #[must_use]
    pub const fn kind(&self) -> ServerEventKind {
        match self {
            Self::Listening(_) => ServerEventKind::Listening,
            Self::Connection(..) => ServerEventKind::Connection,
            Self::Error(_) => ServerEventKind::Error,
            Self::SocketError(_) => ServerEventKind::SocketError,
        }
    }
}

// ============================================================================
// Server
// ============================================================================

struct Attachment {
    http: HttpServer,
    listener: ListenerId,
    owned: bool,
}

struct ServerInner {
    options: ServerOptions,
    hub: Hub,
    group: Group,
    coordinator: Coordinator,
    listeners: Arc<Listeners<ServerEventKind, ServerEvent>>,
    attachment: Mutex<Option<Attachment>>,
    closed: AtomicBool,
}

/// WebSocket server. Cloning shares the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("group", &self.inner.group)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// Server - Constructor
// ============================================================================

impl Server {
    /// Creates a server. Nothing is bound until [`listen`](Self::listen).
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the options select no mode or several
    pub fn new(options: ServerOptions) -> Result<Self> {
        options.validate()?;

        let hub = options.hub.clone().unwrap_or_default();
        let group = Group::create(hub.engine(), options.policy(), Variant::Server);
        let coordinator = Coordinator::new(options.path.clone(), options.verify_client.clone());
        let listeners: Arc<Listeners<ServerEventKind, ServerEvent>> = Arc::new(Listeners::new());

        {
            let listeners = Arc::clone(&listeners);
            group.set_upgrade_callback(move |connection, request| {
                listeners.emit(
                    ServerEventKind::Connection,
                    ServerEvent::Connection(connection, request),
                );
            });
        }

        debug!(?options, "Server created");

        Ok(Self {
            inner: Arc::new(ServerInner {
                options,
                hub,
                group,
                coordinator,
                listeners,
                attachment: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

// ============================================================================
// Server - Lifecycle
// ============================================================================

impl Server {
    /// Starts receiving upgrades from the configured HTTP server.
    ///
    /// Binds a new one in `port` mode, joins the given one in `server` mode.
    /// Emits `listening` on success.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] in `no_server` mode, when already listening, or
    ///   after close
    /// - [`Error::Io`] if binding fails
    pub async fn listen(&self) -> Result<SocketAddr> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::config("server is closed"));
        }
        if self.inner.attachment.lock().is_some() {
            return Err(Error::config("server is already listening"));
        }

        let (http, owned) = match (&self.inner.options.server, self.inner.options.port) {
            (Some(http), _) => (http.clone(), false),
            (None, Some(port)) => (self.bind(port).await?, true),
            (None, None) => return Err(Error::config("a `no_server` server has nothing to listen on")),
        };

        let weak = Arc::downgrade(&self.inner);
        let listener = http.add_upgrade_listener(weak as Weak<dyn UpgradeListener>);
        let addr = http.local_addr();

        {
            let mut attachment = self.inner.attachment.lock();
            if attachment.is_some() {
                http.remove_upgrade_listener(listener);
                if owned {
                    http.close();
                }
                return Err(Error::config("server is already listening"));
            }
            *attachment = Some(Attachment { http, listener, owned });
        }

        info!(%addr, "Server listening");
        self.inner.emit(ServerEvent::Listening(addr));
        Ok(addr)
    }

    async fn bind(&self, port: u16) -> Result<HttpServer> {
        let host = self.inner.options.host.as_deref().unwrap_or(DEFAULT_HOST);
        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::config(format!("host `{host}` did not resolve")))?;

        let options = HttpOptions {
            no_delay: self.inner.options.no_delay,
            ..HttpOptions::default()
        };
        HttpServer::bind(addr, options).await
    }

    /// Address upgrades are accepted on, once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .attachment
            .lock()
            .as_ref()
            .map(|attachment| attachment.http.local_addr())
    }

    /// Stops accepting upgrades and closes the group.
    ///
    /// Open connections keep working until they close. Idempotent. Dropping
    /// the last clone of a server closes it too.
    pub fn close(&self) {
        if self.inner.shutdown() {
            info!("Server closed");
        }
    }

    /// Closes the server, then runs `callback` on the loop after the
    /// configured close callback delay.
    pub fn close_with_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.close();
        self.inner
            .hub
            .event_loop()
            .defer_after(self.inner.options.close_callback_delay, callback);
    }
}

// ============================================================================
// Server - Upgrades
// ============================================================================

impl Server {
    /// Upgrades a request received outside any [`HttpServer`].
    ///
    /// `callback` receives the connection instead of the `connection` event.
    /// `head` holds bytes already read past the request head.
    pub async fn handle_upgrade(
        &self,
        request: UpgradeRequest,
        transport: impl Transport,
        head: Bytes,
        callback: impl FnOnce(Connection) + Send + 'static,
    ) -> HandshakeState {
        let pending = PendingUpgrade::new(Arc::new(request), Box::new(transport), head, None);
        self.inner
            .coordinator
            .run(&self.inner.group, pending, true, Some(Box::new(callback)))
            .await
            .state()
    }

    /// Adds a stream that already completed its WebSocket handshake.
    ///
    /// The `connection` event fires with `request`.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] if the server is closed
    pub fn adopt<S>(&self, ws: WebSocketStream<S>, request: UpgradeRequest) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.inner
            .group
            .adopt(ws, None, UpgradeContext::new(Arc::new(request)))
    }
}

// ============================================================================
// Server - Group Operations
// ============================================================================

impl Server {
    /// Sends one message to every open client.
    ///
    /// `binary` picks the frame type; `None` keeps the payload's own.
    /// Returns the number of recipients.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPayload`] if text is forced on non-UTF-8 bytes
    pub fn broadcast(&self, payload: impl Into<Payload>, binary: Option<bool>) -> Result<usize> {
        let payload = payload.into();
        let binary = binary.unwrap_or_else(|| payload.is_binary());
        self.inner.group.broadcast(payload, binary)
    }

    /// Pings every client each `interval`, terminating silent ones.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] if the server is closed
    /// - [`Error::Config`] if `interval` is zero
    pub fn start_auto_ping(&self, interval: Duration, payload: impl Into<Bytes>) -> Result<()> {
        self.inner.group.start_auto_ping(interval, payload)
    }

    /// View of the open clients.
    #[must_use]
    pub fn clients(&self) -> Clients<'_> {
        Clients {
            group: &self.inner.group,
        }
    }

    /// The hub this server runs on.
    #[inline]
    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }
}

/// Snapshot view of a server's open connections.
#[derive(Debug)]
pub struct Clients<'a> {
    group: &'a Group,
}

impl Clients<'_> {
    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.group.size()
    }

    /// Returns `true` if no connection is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` for each connection open now.
    pub fn for_each(&self, f: impl FnMut(&Connection)) {
        self.group.for_each(f);
    }
}

// ============================================================================
// Server - Listeners
// ============================================================================

impl Server {
    /// Registers a callback for an event.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on(&self, kind: ServerEventKind, callback: impl Fn(ServerEvent) + Send + Sync + 'static) -> Result<()> {
        self.inner.listeners.on(kind, Arc::new(callback))
    }

    /// Registers a callback removed after its first call.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn once(&self, kind: ServerEventKind, callback: impl Fn(ServerEvent) + Send + Sync + 'static) -> Result<()> {
        self.inner.listeners.once(kind, Arc::new(callback))
    }

    /// Empties one event slot. Returns `true` if it held a callback.
    pub fn remove_listener(&self, kind: ServerEventKind) -> bool {
        self.inner.listeners.remove(kind)
    }

    /// Empties every event slot.
    pub fn remove_all_listeners(&self) {
        self.inner.listeners.clear();
    }

    /// Registers a `listening` callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on_listening(&self, f: impl Fn(SocketAddr) + Send + Sync + 'static) -> Result<()> {
        self.on(ServerEventKind::Listening, move |event| {
            if let ServerEvent::Listening(addr) = event {
                f(addr);
            }
        })
    }

    /// Registers a `connection` callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on_connection(&self, f: impl Fn(Connection, Arc<UpgradeRequest>) + Send + Sync + 'static) -> Result<()> {
        self.on(ServerEventKind::Connection, move |event| {
            if let ServerEvent::Connection(connection, request) = event {
                f(connection, request);
            }
        })
    }

    /// Registers an `error` callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on_error(&self, f: impl Fn(Error) + Send + Sync + 'static) -> Result<()> {
        self.on(ServerEventKind::Error, move |event| {
            if let ServerEvent::Error(error) = event {
                f(error);
            }
        })
    }

    /// Registers a `socket_error` callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on_socket_error(&self, f: impl Fn(Error) + Send + Sync + 'static) -> Result<()> {
        self.on(ServerEventKind::SocketError, move |event| {
            if let ServerEvent::SocketError(error) = event {
                f(error);
            }
        })
    }
}

// ============================================================================
// ServerInner - Upgrade Listener
// ============================================================================

impl ServerInner {
    /// Detaches from the HTTP server and closes the group.
    ///
    /// Returns `false` if already shut down.
    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(attachment) = self.attachment.lock().take() {
            attachment.http.remove_upgrade_listener(attachment.listener);
            if attachment.owned {
                attachment.http.close();
            }
        }

        self.group.close();
        true
    }

    /// Delivers an event on the loop.
    fn emit(&self, event: ServerEvent) {
        let listeners = Arc::clone(&self.listeners);
        self.hub.event_loop().defer(move || {
            listeners.emit(event.kind(), event);
        });
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if self.shutdown() {
            debug!("Server dropped without close");
        }
    }
}

#[async_trait]
impl UpgradeListener for ServerInner {
    async fn on_upgrade(&self, pending: PendingUpgrade, last: bool) -> Option<PendingUpgrade> {
        if self.closed.load(Ordering::SeqCst) {
            return Some(pending);
        }

        match self.coordinator.run(&self.group, pending, last, None).await {
            HandshakeOutcome::Declined(pending) => Some(pending),
            HandshakeOutcome::Transferred | HandshakeOutcome::Aborted => None,
        }
    }

    fn on_error(&self, error: &Error) {
        warn!(error = %error, "HTTP server error");
        self.emit(ServerEvent::Error(Error::transport(error.to_string())));
    }

    fn on_socket_error(&self, error: &Error) {
        debug!(error = %error, "Socket error");
        self.emit(ServerEvent::SocketError(Error::transport(error.to_string())));
    }
}

// ============================================================================
// Tests
// ============================================================================
