//! Minimal HTTP/1.1 server that only knows how to hand off upgrades.
//!
//! Each accepted socket has its request head read and parsed. Non-upgrade
//! requests are answered with `426`, malformed heads with `400`. Upgrade
//! requests are offered to the registered [`UpgradeListener`]s in
//! registration order until one takes them.
//!
//! ```text
//! accept → read_head → parse ─┬─ not upgrade → 426
//!                             ├─ malformed   → 400
//!                             └─ upgrade     → listener 1 → listener 2 → …
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::engine::{PeerAddress, Transport};
use crate::error::{Error, Result};

use super::request::{HEAD_TIMEOUT, MAX_HEAD_SIZE, UpgradeRequest, read_head};
use super::response::{reason_phrase, write_status};

// ============================================================================
// Constants
// ============================================================================

/// How often the accept loop checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// HttpOptions
// ============================================================================

/// Socket and request-head limits for an [`HttpServer`].
#[derive(Debug, Clone, Copy)]
pub struct HttpOptions {
    /// Set `TCP_NODELAY` on accepted sockets.
    pub no_delay: bool,
    /// Time allowed for the request head to arrive.
    pub head_timeout: Duration,
    /// Largest accepted request head.
    pub max_head_size: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            no_delay: true,
            head_timeout: HEAD_TIMEOUT,
            max_head_size: MAX_HEAD_SIZE,
        }
    }
}

// ============================================================================
// PendingUpgrade
// ============================================================================

/// An upgrade request whose socket has not been claimed yet.
pub struct PendingUpgrade {
    request: Arc<UpgradeRequest>,
    transport: Option<Box<dyn Transport>>,
    head: Bytes,
    peer: Option<PeerAddress>,
}

impl PendingUpgrade {
    /// Wraps a parsed request and the socket it arrived on.
    ///
    /// `head` holds bytes already read past the request head.
    #[must_use]
    pub fn new(
        request: Arc<UpgradeRequest>,
        transport: Box<dyn Transport>,
        head: Bytes,
        peer: Option<PeerAddress>,
    ) -> Self {
        Self {
            request,
            transport: Some(transport),
            head,
            peer,
        }
    }

    /// The originating request.
    #[inline]
    #[must_use]
    pub fn request(&self) -> &Arc<UpgradeRequest> {
        &self.request
    }

    /// Returns `true` while the socket is still attached.
    #[inline]
    #[must_use]
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Socket endpoints, if known.
    #[inline]
    #[must_use]
    pub fn peer(&self) -> Option<PeerAddress> {
        self.peer
    }

    /// Detaches the socket, leaving the request behind.
    pub(crate) fn take_transport(&mut self) -> Option<(Box<dyn Transport>, Bytes)> {
        self.transport
            .take()
            .map(|transport| (transport, std::mem::take(&mut self.head)))
    }

    /// Answers with an error status and shuts the socket down.
    pub async fn abort(mut self, code: u16, reason: &str) {
        if let Some((mut transport, _)) = self.take_transport() {
            if let Err(e) = write_status(&mut transport, code, reason).await {
                trace!(error = %e, "Abort response write failed");
            }
        }
    }

    /// Drops the socket without writing anything.
    pub fn destroy(mut self) {
        drop(self.take_transport());
    }
}

impl fmt::Debug for PendingUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingUpgrade")
            .field("target", &self.request.target())
            .field("has_transport", &self.transport.is_some())
            .field("head_len", &self.head.len())
            .finish()
    }
}

// ============================================================================
// UpgradeListener
// ============================================================================

/// Consumer of upgrade requests from an [`HttpServer`].
#[async_trait]
pub trait UpgradeListener: Send + Sync {
    /// Offers an upgrade request.
    ///
    /// Return `None` once the request is handled (upgraded or aborted), or
    /// give it back to pass it to the next listener. `last` is `true` for the
    /// final listener in the chain.
    async fn on_upgrade(&self, pending: PendingUpgrade, last: bool) -> Option<PendingUpgrade>;

    /// The server failed to accept a socket.
    fn on_error(&self, _error: &Error) {}

    /// A socket failed before its request head was complete.
    fn on_socket_error(&self, _error: &Error) {}
}

/// Identifies a registered upgrade listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ============================================================================
// HttpServer
// ============================================================================

struct HttpServerInner {
    local_addr: SocketAddr,
    options: HttpOptions,
    listeners: RwLock<Vec<(ListenerId, Weak<dyn UpgradeListener>)>>,
    next_listener: AtomicU64,
    shutdown: AtomicBool,
}

/// A bound HTTP server. Cloning shares the same socket.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<HttpServerInner>,
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.inner.local_addr)
            .field("listeners", &self.inner.listeners.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// HttpServer - Constructor
// ============================================================================

impl HttpServer {
    /// Binds `addr` and starts the accept loop.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if binding fails
    pub async fn bind(addr: SocketAddr, options: HttpOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let server = Self {
            inner: Arc::new(HttpServerInner {
                local_addr,
                options,
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
            }),
        };

        let inner = Arc::clone(&server.inner);
        tokio::spawn(inner.accept_loop(listener));

        info!(%local_addr, "HTTP server listening");
        Ok(server)
    }
}

// ============================================================================
// HttpServer - Public API
// ============================================================================

impl HttpServer {
    /// Address the server is bound to.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Port the server is bound to.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Appends a listener to the upgrade chain.
    ///
    /// Only a weak reference is kept; a dropped listener leaves the chain.
    pub fn add_upgrade_listener(&self, listener: Weak<dyn UpgradeListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, listener));
        trace!(id = id.0, "Upgrade listener added");
        id
    }

    /// Removes a listener from the upgrade chain.
    pub fn remove_upgrade_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    /// Stops accepting sockets. Already-upgraded connections are unaffected.
    pub fn close(&self) {
        if !self.inner.shutdown.swap(true, Ordering::SeqCst) {
            info!(local_addr = %self.inner.local_addr, "HTTP server closing");
        }
    }
}

// ============================================================================
// HttpServer - Accept Loop
// ============================================================================

impl HttpServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("Accept loop shutting down");
                break;
            }

            // Accept with timeout to allow checking the shutdown flag
            match timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move { inner.handle_socket(stream, addr).await });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    let e = Error::from(e);
                    for listener in self.live_listeners() {
                        listener.on_error(&e);
                    }
                }
                Err(_) => continue,
            }
        }
    }

    async fn handle_socket(&self, mut stream: TcpStream, remote: SocketAddr) {
        if self.options.no_delay
            && let Err(e) = stream.set_nodelay(true)
        {
            trace!(error = %e, "set_nodelay failed");
        }

        let peer = stream
            .local_addr()
            .ok()
            .map(|local| PeerAddress::new(remote, local));

        let (head, rest) = match read_head(&mut stream, self.options.max_head_size, self.options.head_timeout).await {
            Ok(parts) => parts,
            Err(e) => {
                debug!(%remote, error = %e, "Request head read failed");
                self.socket_error(&e);
                return;
            }
        };

        let request = match UpgradeRequest::parse(&head) {
            Ok(request) => request.with_remote_addr(remote),
            Err(e) => {
                debug!(%remote, error = %e, "Malformed request head");
                let _ = write_status(&mut stream, 400, reason_phrase(400)).await;
                self.socket_error(&e);
                return;
            }
        };

        if !request.is_upgrade() {
            trace!(%remote, method = request.method(), target = request.target(), "Not an upgrade request");
            let _ = write_status(&mut stream, 426, reason_phrase(426)).await;
            return;
        }

        let pending = PendingUpgrade::new(Arc::new(request), Box::new(stream), rest, peer);
        self.dispatch(pending).await;
    }

    async fn dispatch(&self, mut pending: PendingUpgrade) {
        let listeners = self.live_listeners();
        let count = listeners.len();

        for (index, listener) in listeners.into_iter().enumerate() {
            match listener.on_upgrade(pending, index + 1 == count).await {
                Some(declined) => pending = declined,
                None => return,
            }
        }

        warn!(target = pending.request().target(), "No upgrade listener took the request");
        pending.abort(400, reason_phrase(400)).await;
    }

    fn socket_error(&self, error: &Error) {
        for listener in self.live_listeners() {
            listener.on_socket_error(error);
        }
    }

    fn live_listeners(&self) -> Vec<Arc<dyn UpgradeListener>> {
        self.listeners
            .read()
            .iter()
            .filter_map(|(_, listener)| listener.upgrade())
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
