//! Per-socket connection object.
//!
//! A [`Connection`] wraps an engine handle. While the handle is present the
//! connection is OPEN and operations are forwarded to the engine; once it is
//! cleared (by `close`, `terminate` or a disconnection) the connection is
//! CLOSED for good and send-class operations become no-ops.
//!
//! Server and client connections differ only in which engine entry points
//! they call. The choice is made once, at construction, through a
//! [`VariantOps`] dispatch table.
//!
//! # Events
//!
//! | Event | Payload | When |
//! |-------|---------|------|
//! | `open` | - | Client handshake completed |
//! | `message` | [`Payload`] | Data frame received |
//! | `close` | [`CloseInfo`] | Connection gone (exactly once, last) |
//! | `ping` | [`Bytes`] | Ping received (already answered) |
//! | `pong` | [`Bytes`] | Pong received |
//! | `error` | [`Error`] | Client connection failed |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::engine::{CloseInfo, Engine, PeerAddress, SendCompletion};
use crate::error::{Error, Result};
use crate::identifiers::ConnHandle;
use crate::listeners::{EventKey, Listeners};
use crate::payload::Payload;

// ============================================================================
// Events
// ============================================================================

/// Connection event slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Client handshake completed.
    Open,
    /// Data frame received.
    Message,
    /// Connection closed.
    Close,
    /// Ping received.
    Ping,
    /// Pong received.
    Pong,
    /// Connection failed.
    Error,
}

impl EventKind {
    /// Event name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Message => "message",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
        }
    }
}

impl EventKey for EventKind {
    fn name(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection event.
#[derive(Debug)]
pub enum Event {
    /// Client handshake completed.
    Open,
    /// Data frame received.
    Message(Payload),
    /// Connection closed.
    Close(CloseInfo),
    /// Ping received.
    Ping(Bytes),
    /// Pong received.
    Pong(Bytes),
    /// Connection failed.
    Error(Error),
}

impl Event {
    /// Slot this event is delivered to.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Message(_) => EventKind::Message,
            Self::Close(_) => EventKind::Close,
            Self::Ping(_) => EventKind::Ping,
            Self::Pong(_) => EventKind::Pong,
            Self::Error(_) => EventKind::Error,
        }
    }
}

// ============================================================================
// State Types
// ============================================================================

/// Readiness derived from handle presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Handle present; operations reach the socket.
    Open,
    /// No handle; operations are no-ops.
    Closed,
}

/// Which side of the protocol a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Accepted by a server.
    Server,
    /// Opened by a client.
    Client,
}

/// Options for [`Connection::send_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Force a binary (`true`) or text (`false`) frame. Inferred from the
    /// payload when `None`.
    pub binary: Option<bool>,
    /// Compression hint.
    pub compress: Option<bool>,
}

impl SendOptions {
    /// Forces a binary frame.
    #[inline]
    #[must_use]
    pub fn binary() -> Self {
        Self {
            binary: Some(true),
            compress: None,
        }
    }

    /// Forces a text frame.
    #[inline]
    #[must_use]
    pub fn text() -> Self {
        Self {
            binary: Some(false),
            compress: None,
        }
    }

    /// Sets the compression hint. Ignored while no connection negotiates
    /// permessage-deflate, which is always.
    #[inline]
    #[must_use]
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }
}

// ============================================================================
// Dispatch Table
// ============================================================================

/// Engine entry points for one connection variant.
pub(crate) struct VariantOps {
    send: fn(&Engine<Connection>, ConnHandle, Message, bool, Option<SendCompletion>),
    ping: fn(&Engine<Connection>, ConnHandle, Bytes),
    close: fn(&Engine<Connection>, ConnHandle, u16, &str) -> Result<()>,
    terminate: fn(&Engine<Connection>, ConnHandle) -> Result<()>,
}

static SERVER_OPS: VariantOps = VariantOps {
    send: Engine::server_send,
    ping: Engine::server_ping,
    close: Engine::server_close,
    terminate: Engine::server_terminate,
};

static CLIENT_OPS: VariantOps = VariantOps {
    send: Engine::client_send,
    ping: Engine::client_ping,
    close: Engine::client_close,
    terminate: Engine::client_terminate,
};

impl Variant {
    const fn ops(self) -> &'static VariantOps {
        match self {
            Self::Server => &SERVER_OPS,
            Self::Client => &CLIENT_OPS,
        }
    }
}

// ============================================================================
// Close Codes
// ============================================================================

/// Returns `true` for close codes an endpoint may send.
#[must_use]
pub const fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Replaces codes an endpoint may not send with 1000.
#[must_use]
pub fn sanitize_close_code(code: u16) -> u16 {
    if is_valid_close_code(code) {
        code
    } else {
        debug!(code, "Invalid close code, using 1000");
        CloseInfo::NORMAL
    }
}

// ============================================================================
// Connection
// ============================================================================

struct ConnectionInner {
    handle: Mutex<Option<ConnHandle>>,
    variant: Variant,
    ops: &'static VariantOps,
    engine: Engine<Connection>,
    listeners: Listeners<EventKind, Event>,
}

/// A WebSocket connection. Cloning shares the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &*self.inner.handle.lock())
            .field("variant", &self.inner.variant)
            .field("listeners", &self.inner.listeners)
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

// ============================================================================
// Connection - Constructor
// ============================================================================

impl Connection {
    pub(crate) fn new(engine: Engine<Connection>, variant: Variant, handle: Option<ConnHandle>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                handle: Mutex::new(handle),
                variant,
                ops: variant.ops(),
                engine,
                listeners: Listeners::new(),
            }),
        }
    }
}

// ============================================================================
// Connection - Public API
// ============================================================================

impl Connection {
    /// Sends a message, inferring the frame type from the payload.
    pub fn send(&self, payload: impl Into<Payload>) {
        self.send_with(payload, SendOptions::default(), None);
    }

    /// Sends a message with explicit options and an optional completion.
    ///
    /// The completion always runs on a later loop turn. A closed connection
    /// reports [`Error::NotOpen`]; forcing text on non-UTF-8 bytes reports
    /// [`Error::InvalidPayload`].
    pub fn send_with(&self, payload: impl Into<Payload>, options: SendOptions, completion: Option<SendCompletion>) {
        let Some(handle) = self.handle() else {
            trace!("send on closed connection");
            if let Some(completion) = completion {
                self.inner
                    .engine
                    .event_loop()
                    .defer(move || completion(Err(Error::NotOpen)));
            }
            return;
        };

        let message = match payload.into().into_message(options.binary) {
            Ok(message) => message,
            Err(e) => {
                if let Some(completion) = completion {
                    self.inner.engine.event_loop().defer(move || completion(Err(e)));
                }
                return;
            }
        };

        (self.inner.ops.send)(
            &self.inner.engine,
            handle,
            message,
            options.compress.unwrap_or(false),
            completion,
        );
    }

    /// Sends a ping. No-op when closed.
    pub fn ping(&self, payload: impl Into<Bytes>) {
        if let Some(handle) = self.handle() {
            (self.inner.ops.ping)(&self.inner.engine, handle, payload.into());
        }
    }

    /// Sends an unsolicited pong. No-op when closed.
    pub fn pong(&self, payload: impl Into<Bytes>) {
        if let Some(handle) = self.handle() {
            self.inner.engine.pong(handle, payload.into());
        }
    }

    /// Starts a graceful close.
    ///
    /// The connection is CLOSED immediately; the `close` event follows once
    /// the closing handshake finishes or times out. Codes an endpoint may not
    /// send are replaced with 1000.
    pub fn close(&self, code: u16, reason: &str) {
        let Some(handle) = self.clear_handle() else {
            return;
        };

        let code = sanitize_close_code(code);
        debug!(%handle, code, reason, "Closing connection");
        if let Err(e) = (self.inner.ops.close)(&self.inner.engine, handle, code, reason) {
            trace!(%handle, error = %e, "Close request dropped");
        }
    }

    /// Drops the socket without a closing handshake.
    ///
    /// The `close` event follows with code 1006.
    pub fn terminate(&self) {
        let Some(handle) = self.clear_handle() else {
            return;
        };

        debug!(%handle, "Terminating connection");
        if let Err(e) = (self.inner.ops.terminate)(&self.inner.engine, handle) {
            trace!(%handle, error = %e, "Terminate request dropped");
        }
    }

    /// Current readiness.
    #[inline]
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        if self.inner.handle.lock().is_some() {
            ReadyState::Open
        } else {
            ReadyState::Closed
        }
    }

    /// Returns `true` while the connection is OPEN.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Socket endpoints. `None` when closed or unknown.
    #[must_use]
    pub fn peer_address(&self) -> Option<PeerAddress> {
        self.handle()
            .and_then(|handle| self.inner.engine.peer_address(handle))
    }

    /// Server or client.
    #[inline]
    #[must_use]
    pub fn variant(&self) -> Variant {
        self.inner.variant
    }
}

// ============================================================================
// Connection - Listeners
// ============================================================================

impl Connection {
    /// Registers a callback for an event.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on(&self, kind: EventKind, callback: impl Fn(Event) + Send + Sync + 'static) -> Result<()> {
        self.inner.listeners.on(kind, Arc::new(callback))
    }

    /// Registers a callback removed after its first call.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn once(&self, kind: EventKind, callback: impl Fn(Event) + Send + Sync + 'static) -> Result<()> {
        self.inner.listeners.once(kind, Arc::new(callback))
    }

    /// Empties one event slot. Returns `true` if it held a callback.
    pub fn remove_listener(&self, kind: EventKind) -> bool {
        self.inner.listeners.remove(kind)
    }

    /// Empties every event slot.
    pub fn remove_all_listeners(&self) {
        self.inner.listeners.clear();
    }

    /// Registers an `open` callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on_open(&self, f: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.on(EventKind::Open, move |event| {
            if let Event::Open = event {
                f();
            }
        })
    }

    /// Registers a `message` callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on_message(&self, f: impl Fn(Payload) + Send + Sync + 'static) -> Result<()> {
        self.on(EventKind::Message, move |event| {
            if let Event::Message(payload) = event {
                f(payload);
            }
        })
    }

    /// Registers a `close` callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on_close(&self, f: impl Fn(CloseInfo) + Send + Sync + 'static) -> Result<()> {
        self.on(EventKind::Close, move |event| {
            if let Event::Close(info) = event {
                f(info);
            }
        })
    }

    /// Registers a `ping` callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on_ping(&self, f: impl Fn(Bytes) + Send + Sync + 'static) -> Result<()> {
        self.on(EventKind::Ping, move |event| {
            if let Event::Ping(data) = event {
                f(data);
            }
        })
    }

    /// Registers a `pong` callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on_pong(&self, f: impl Fn(Bytes) + Send + Sync + 'static) -> Result<()> {
        self.on(EventKind::Pong, move |event| {
            if let Event::Pong(data) = event {
                f(data);
            }
        })
    }

    /// Registers an `error` callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on_error(&self, f: impl Fn(Error) + Send + Sync + 'static) -> Result<()> {
        self.on(EventKind::Error, move |event| {
            if let Event::Error(error) = event {
                f(error);
            }
        })
    }
}

// ============================================================================
// Connection - Bridge Hooks
// ============================================================================

impl Connection {
    #[inline]
    pub(crate) fn handle(&self) -> Option<ConnHandle> {
        *self.inner.handle.lock()
    }

    pub(crate) fn set_handle(&self, handle: ConnHandle) {
        *self.inner.handle.lock() = Some(handle);
    }

    pub(crate) fn clear_handle(&self) -> Option<ConnHandle> {
        self.inner.handle.lock().take()
    }

    /// Clears the handle only if it still refers to `handle`.
    pub(crate) fn release_handle(&self, handle: ConnHandle) {
        let mut current = self.inner.handle.lock();
        if *current == Some(handle) {
            *current = None;
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        self.inner.listeners.emit(event.kind(), event);
    }

    /// Delivers a terminal event, then empties every slot.
    ///
    /// Listeners often hold clones of their own connection; clearing them
    /// breaks that cycle once nothing more can be delivered.
    pub(crate) fn emit_last(&self, event: Event) {
        self.emit(event);
        self.inner.listeners.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use crate::engine::EngineConfig;
    use crate::event_loop::EventLoop;

    fn closed_connection(variant: Variant) -> (EventLoop, Connection) {
        let event_loop = EventLoop::new();
        let engine = Engine::new(event_loop.clone(), EngineConfig::default());
        (event_loop, Connection::new(engine, variant, None))
    }

    #[test]
    fn test_close_code_validity() {
        assert!(is_valid_close_code(1000));
        assert!(is_valid_close_code(1011));
        assert!(is_valid_close_code(4999));
        assert!(!is_valid_close_code(1005));
        assert!(!is_valid_close_code(1006));
        assert!(!is_valid_close_code(1015));
        assert!(!is_valid_close_code(2999));
        assert!(!is_valid_close_code(5000));
        assert_eq!(sanitize_close_code(1006), 1000);
        assert_eq!(sanitize_close_code(4000), 4000);
    }

    proptest! {
        #[test]
        fn prop_sanitized_code_is_sendable(code in any::<u16>()) {
            let sanitized = sanitize_close_code(code);
            prop_assert!(is_valid_close_code(sanitized));
            if is_valid_close_code(code) {
                prop_assert_eq!(sanitized, code);
            }
        }
    }

    #[tokio::test]
    async fn test_send_on_closed_reports_not_open_later() {
        let (event_loop, connection) = closed_connection(Variant::Server);
        assert_eq!(connection.ready_state(), ReadyState::Closed);

        let reported = Arc::new(Mutex::new(None));
        {
            let reported = Arc::clone(&reported);
            connection.send_with(
                "hello",
                SendOptions::default(),
                Some(Box::new(move |result| {
                    *reported.lock() = Some(matches!(result, Err(Error::NotOpen)));
                })),
            );
        }

        assert!(reported.lock().is_none());
        event_loop.barrier().await;
        assert_eq!(*reported.lock(), Some(true));
    }

    #[tokio::test]
    async fn test_closed_operations_are_noops() {
        let (_event_loop, connection) = closed_connection(Variant::Client);
        connection.send("x");
        connection.ping(Bytes::from_static(b"p"));
        connection.pong(Bytes::new());
        connection.close(1000, "");
        connection.terminate();
        assert!(!connection.is_open());
        assert!(connection.peer_address().is_none());
        assert_eq!(connection.variant(), Variant::Client);
    }

    #[tokio::test]
    async fn test_duplicate_listener_rejected() {
        let (_event_loop, connection) = closed_connection(Variant::Server);
        connection.on_message(|_| {}).unwrap();

        let err = connection.on(EventKind::Message, |_| {}).unwrap_err();
        assert!(matches!(err, Error::DuplicateListener { event: "message" }));

        assert!(connection.remove_listener(EventKind::Message));
        connection.on_message(|_| {}).unwrap();
    }

    #[tokio::test]
    async fn test_emit_routes_by_kind() {
        let (_event_loop, connection) = closed_connection(Variant::Server);
        let pings = Arc::new(AtomicUsize::new(0));

        {
            let pings = Arc::clone(&pings);
            connection
                .on_ping(move |data| {
                    assert_eq!(&data[..], b"hb");
                    pings.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        connection.emit(Event::Ping(Bytes::from_static(b"hb")));
        connection.emit(Event::Pong(Bytes::from_static(b"hb")));
        assert_eq!(pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_last_frees_self_referencing_listener() {
        let (_event_loop, connection) = closed_connection(Variant::Server);
        let echo = connection.clone();
        connection.on_message(move |payload| echo.send(payload)).unwrap();
        connection.on_close(|_| {}).unwrap();

        let weak = Arc::downgrade(&connection.inner);
        connection.emit_last(Event::Close(CloseInfo::new(1000, "")));
        assert!(!connection.remove_listener(EventKind::Message));

        drop(connection);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_release_handle_only_matching() {
        let (_event_loop, connection) = closed_connection(Variant::Client);
        let current = ConnHandle::next();
        connection.set_handle(current);

        connection.release_handle(ConnHandle::next());
        assert!(connection.is_open());

        connection.release_handle(current);
        assert!(!connection.is_open());
    }
}
