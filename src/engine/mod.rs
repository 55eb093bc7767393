//! Frame engine binding.
//!
//! The engine is the only part of the crate that touches sockets and
//! WebSocket framing (provided by `tokio-tungstenite`). Everything above it
//! talks to it through opaque handles:
//!
//! | Concern | Operations |
//! |---------|------------|
//! | Groups | `create_group`, `close_group`, `broadcast`, `for_each_connection`, `group_size`, `start_auto_ping` |
//! | Connections | `server_*` / `client_*` send, ping, close, terminate; `pong`; `peer_address` |
//! | Handshake | `transfer_socket`, `upgrade`, `adopt`, `connect` |
//! | User data | `attach_user_data`, `lookup_user_data`, `clear_user_data` |
//!
//! Every callback registered on a group runs on the [`EventLoop`], never on
//! an I/O task, and never while an engine lock is held.
//!
//! # Tables
//!
//! ```text
//! groups:       GroupHandle → { policy, role, callbacks, members, closed, auto_ping }
//! connections:  ConnHandle  → { group, role, outbound queue, user data, peer, liveness }
//! ```
//!
//! The two tables are never locked at the same time.

// ============================================================================
// Submodules
// ============================================================================

mod io;
mod policy;
mod ticket;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_tungstenite::tungstenite::handshake::client::Request as ClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::http::UpgradeRequest;
use crate::identifiers::{ConnHandle, GroupHandle};
use crate::payload::Payload;

use self::io::{Liveness, Outbound};

// ============================================================================
// Re-exports
// ============================================================================

pub use policy::{DEFAULT_MAX_PAYLOAD, GroupPolicy, PERMESSAGE_DEFLATE, SLIDING_DEFLATE_WINDOW};
pub use ticket::{AddressFamily, PeerAddress, TransferTicket, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Default time allowed for the peer to answer a close frame.
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Types
// ============================================================================

/// Send completion callback. Always invoked on a later loop turn.
pub type SendCompletion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// One-shot callback attached to a single upgrade.
pub type UpgradeCallback<U> = Box<dyn FnOnce(U) + Send + 'static>;

/// Which side of the protocol a group or connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted connections (frames unmasked).
    Server,
    /// Outgoing connections (frames masked).
    Client,
}

impl From<Role> for WsRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Server => Self::Server,
            Role::Client => Self::Client,
        }
    }
}

/// Close code and reason reported at disconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close status code.
    pub code: u16,
    /// Close reason text.
    pub reason: String,
}

impl CloseInfo {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Close frame carried no status code.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a closing handshake.
    pub const ABNORMAL: u16 = 1006;
    /// Message exceeded the payload limit.
    pub const MESSAGE_TOO_BIG: u16 = 1009;

    /// Creates a close info.
    #[inline]
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Close frame without a status code.
    #[inline]
    #[must_use]
    pub fn no_status() -> Self {
        Self::new(Self::NO_STATUS, "")
    }

    /// Connection lost without a closing handshake.
    #[inline]
    #[must_use]
    pub fn abnormal() -> Self {
        Self::new(Self::ABNORMAL, "")
    }
}

/// Context carried through a single upgrade, from ticket to open callback.
pub struct UpgradeContext<U> {
    /// The originating handshake request.
    pub request: Arc<UpgradeRequest>,
    /// Callback for this upgrade only; the group default applies if absent.
    pub on_upgrade: Option<UpgradeCallback<U>>,
}

impl<U> UpgradeContext<U> {
    /// Creates a context without a per-upgrade callback.
    #[inline]
    #[must_use]
    pub fn new(request: Arc<UpgradeRequest>) -> Self {
        Self {
            request,
            on_upgrade: None,
        }
    }
}

/// What the engine knows about a connection at open time.
pub enum OpenContext<U> {
    /// Server side: the upgrade that produced the connection.
    Upgrade(UpgradeContext<U>),
    /// Client side: the user data supplied to `connect`.
    Connect(U),
}

/// Engine callbacks registered per group.
pub struct GroupCallbacks<U> {
    /// A connection finished its handshake.
    pub on_open: Box<dyn Fn(ConnHandle, OpenContext<U>) + Send + Sync>,
    /// A data frame arrived.
    pub on_message: Box<dyn Fn(ConnHandle, Payload) + Send + Sync>,
    /// The connection is gone; the handle is no longer usable.
    pub on_disconnection: Box<dyn Fn(ConnHandle, CloseInfo) + Send + Sync>,
    /// A ping arrived (already answered by the engine).
    pub on_ping: Box<dyn Fn(ConnHandle, Bytes) + Send + Sync>,
    /// A pong arrived.
    pub on_pong: Box<dyn Fn(ConnHandle, Bytes) + Send + Sync>,
    /// A client connection could not be established.
    pub on_error: Option<Box<dyn Fn(U, Error) + Send + Sync>>,
}

/// Engine tuning.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Time allowed for the peer to answer a close frame.
    pub close_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

struct GroupRecord<U> {
    policy: GroupPolicy,
    role: Role,
    callbacks: Arc<GroupCallbacks<U>>,
    members: FxHashSet<ConnHandle>,
    /// Client connects started but not yet resolved.
    pending: usize,
    closed: bool,
    auto_ping: Option<JoinHandle<()>>,
}

impl<U> GroupRecord<U> {
    #[inline]
    fn drained(&self) -> bool {
        self.closed && self.members.is_empty() && self.pending == 0
    }
}

struct ConnRecord<U> {
    group: GroupHandle,
    role: Role,
    outbound: mpsc::UnboundedSender<Outbound>,
    user_data: Option<U>,
    peer: Option<PeerAddress>,
    liveness: Arc<Liveness>,
}

struct EngineInner<U> {
    event_loop: EventLoop,
    config: EngineConfig,
    groups: RwLock<FxHashMap<GroupHandle, GroupRecord<U>>>,
    connections: RwLock<FxHashMap<ConnHandle, ConnRecord<U>>>,
}

// ============================================================================
// Engine
// ============================================================================

/// Handle-based WebSocket engine.
///
/// `U` is the per-connection user data type stored alongside each record.
pub struct Engine<U> {
    inner: Arc<EngineInner<U>>,
}

impl<U> Clone for Engine<U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<U> fmt::Debug for Engine<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("groups", &self.inner.groups.read().len())
            .field("connections", &self.inner.connections.read().len())
            .finish()
    }
}

// ============================================================================
// Engine - Constructor
// ============================================================================

impl<U> Engine<U>
where
    U: Clone + Send + Sync + 'static,
{
    /// Creates an engine that dispatches on `event_loop`.
    #[must_use]
    pub fn new(event_loop: EventLoop, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                event_loop,
                config,
                groups: RwLock::new(FxHashMap::default()),
                connections: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    /// Returns the loop callbacks are dispatched on.
    #[inline]
    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Returns the engine tuning.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns the number of open connections across all groups.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .values()
            .filter(|record| record.liveness.is_open())
            .count()
    }
}

// ============================================================================
// Engine - Groups
// ============================================================================

impl<U> Engine<U>
where
    U: Clone + Send + Sync + 'static,
{
    /// Allocates a group.
    pub fn create_group(
        &self,
        policy: GroupPolicy,
        role: Role,
        callbacks: GroupCallbacks<U>,
    ) -> GroupHandle {
        let handle = GroupHandle::next();

        self.inner.groups.write().insert(
            handle,
            GroupRecord {
                policy,
                role,
                callbacks: Arc::new(callbacks),
                members: FxHashSet::default(),
                pending: 0,
                closed: false,
                auto_ping: None,
            },
        );

        debug!(group = %handle, ?role, bits = policy.bits(), max_payload = policy.max_payload, "Group created");
        handle
    }

    /// Closes a group to new connections.
    ///
    /// Existing members stay routed until they disconnect, and client
    /// connects already under way still complete; the record is dropped
    /// with the last of them. Returns `false` if the group was already
    /// closed or unknown.
    pub fn close_group(&self, group: GroupHandle) -> bool {
        let mut groups = self.inner.groups.write();

        let Some(record) = groups.get_mut(&group) else {
            return false;
        };
        if record.closed {
            return false;
        }

        record.closed = true;
        if let Some(task) = record.auto_ping.take() {
            task.abort();
        }

        let members = record.members.len();
        let pending = record.pending;
        if record.drained() {
            groups.remove(&group);
        }

        debug!(%group, members, pending, "Group closed");
        true
    }

    /// Number of open connections in the group.
    ///
    /// A connection told to close or terminate no longer counts.
    #[must_use]
    pub fn group_size(&self, group: GroupHandle) -> usize {
        self.live_members(group).len()
    }

    /// Calls `f` for each connection open at call time.
    ///
    /// Iterates over a snapshot; connections that close during iteration
    /// are still visited, connections that open are not. Connections
    /// already closing are skipped.
    pub fn for_each_connection(&self, group: GroupHandle, mut f: impl FnMut(ConnHandle, Option<U>)) {
        for (handle, user_data) in self.live_members(group) {
            f(handle, user_data);
        }
    }

    /// Sends one frame to every connection open at call time.
    ///
    /// Returns the number of recipients the frame was queued for.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPayload`] if text is forced on non-UTF-8 bytes
    pub fn broadcast(&self, group: GroupHandle, payload: Payload, binary: bool) -> Result<usize> {
        let message = payload.into_message(Some(binary))?;
        let targets = self.member_queues(group);

        let mut delivered = 0;
        for outbound in targets {
            let frame = Outbound::Frame {
                message: message.clone(),
                completion: None,
            };
            if outbound.send(frame).is_ok() {
                delivered += 1;
            }
        }

        trace!(%group, delivered, "Broadcast queued");
        Ok(delivered)
    }

    /// Pings every member every `interval`.
    ///
    /// A member that sent nothing since the previous ping is terminated.
    /// Calling again replaces the running schedule.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] if the group is closed or unknown
    pub fn start_auto_ping(&self, group: GroupHandle, interval: Duration, payload: Bytes) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::config("auto-ping interval must be non-zero"));
        }

        let mut groups = self.inner.groups.write();
        let record = groups
            .get_mut(&group)
            .filter(|record| !record.closed)
            .ok_or(Error::GroupClosed)?;

        let engine = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if !engine.ping_members(group, &payload) {
                    break;
                }
            }
        });

        if let Some(previous) = record.auto_ping.replace(task) {
            previous.abort();
        }

        debug!(%group, interval_ms = interval.as_millis() as u64, "Auto-ping started");
        Ok(())
    }

    /// One keepalive tick. Returns `false` once the group is gone.
    fn ping_members(&self, group: GroupHandle, payload: &Bytes) -> bool {
        let members: Vec<ConnHandle> = {
            let groups = self.inner.groups.read();
            match groups.get(&group) {
                Some(record) if !record.closed => record.members.iter().copied().collect(),
                _ => return false,
            }
        };

        let connections = self.inner.connections.read();
        for handle in members {
            let Some(record) = connections.get(&handle) else {
                continue;
            };
            if !record.liveness.is_open() {
                continue;
            }

            let command = if record.liveness.arm_ping() {
                debug!(%handle, "Keepalive ping unanswered, terminating");
                record.liveness.mark_closing();
                Outbound::Terminate
            } else {
                Outbound::Frame {
                    message: Message::Ping(payload.clone()),
                    completion: None,
                }
            };
            let _ = record.outbound.send(command);
        }

        true
    }

    fn live_members(&self, group: GroupHandle) -> Vec<(ConnHandle, Option<U>)> {
        let members = self.members(group);
        let connections = self.inner.connections.read();

        members
            .into_iter()
            .filter_map(|handle| {
                connections
                    .get(&handle)
                    .filter(|record| record.liveness.is_open())
                    .map(|record| (handle, record.user_data.clone()))
            })
            .collect()
    }

    fn member_queues(&self, group: GroupHandle) -> Vec<mpsc::UnboundedSender<Outbound>> {
        let members = self.members(group);
        let connections = self.inner.connections.read();

        members
            .into_iter()
            .filter_map(|handle| {
                connections
                    .get(&handle)
                    .filter(|record| record.liveness.is_open())
                    .map(|record| record.outbound.clone())
            })
            .collect()
    }

    fn members(&self, group: GroupHandle) -> Vec<ConnHandle> {
        self.inner
            .groups
            .read()
            .get(&group)
            .map(|record| record.members.iter().copied().collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Engine - Handshake
// ============================================================================

impl<U> Engine<U>
where
    U: Clone + Send + Sync + 'static,
{
    /// Detaches a raw transport into a single-use ticket.
    ///
    /// `head` holds bytes already read past the request head.
    #[must_use]
    pub fn transfer_socket(
        &self,
        transport: Box<dyn Transport>,
        head: Bytes,
        peer: Option<PeerAddress>,
        secure: bool,
    ) -> TransferTicket {
        TransferTicket::new(transport, head, peer, secure)
    }

    /// Completes a server handshake on a transferred socket.
    ///
    /// Writes the `101 Switching Protocols` answer, then registers the
    /// connection and fires the group's open callback with `context`.
    /// Runs in the background; failures after this call returns only
    /// destroy the socket.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] if the group no longer accepts connections
    ///   (the ticket's socket is destroyed)
    pub fn upgrade(
        &self,
        group: GroupHandle,
        ticket: TransferTicket,
        key: &str,
        extensions: Option<&str>,
        protocol: Option<&str>,
        context: UpgradeContext<U>,
    ) -> Result<()> {
        let policy = self.open_group_policy(group)?;

        let response = accept_response(key, policy.negotiate_extensions(extensions), protocol);
        let ticket_id = ticket.id();
        let engine = self.clone();

        tokio::spawn(async move {
            let (mut stream, peer) = match ticket.redeem() {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(error = %e, "Upgrade dropped");
                    return;
                }
            };

            if let Err(e) = stream.write_all(response.as_bytes()).await {
                debug!(ticket = %ticket_id, error = %e, "Handshake response write failed");
                return;
            }

            let ws = WebSocketStream::from_raw_socket(
                stream,
                WsRole::Server,
                Some(policy.websocket_config()),
            )
            .await;

            if let Err(e) = engine.register(group, Role::Server, ws, peer, OpenContext::Upgrade(context), false) {
                debug!(ticket = %ticket_id, error = %e, "Upgraded socket refused");
            }
        });

        Ok(())
    }

    /// Adopts a stream that already completed its WebSocket handshake.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] if the group no longer accepts connections
    pub fn adopt<S>(
        &self,
        group: GroupHandle,
        ws: WebSocketStream<S>,
        peer: Option<PeerAddress>,
        context: UpgradeContext<U>,
    ) -> Result<ConnHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.register(group, Role::Server, ws, peer, OpenContext::Upgrade(context), false)
    }

    /// Opens a client connection in the background.
    ///
    /// On success the group's open callback fires with
    /// [`OpenContext::Connect`]; on failure its error callback receives
    /// `user_data`. Either happens even if the group closes meanwhile.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] if the group no longer accepts connections
    pub fn connect(
        &self,
        group: GroupHandle,
        request: ClientRequest,
        no_delay: bool,
        user_data: U,
    ) -> Result<()> {
        let policy = {
            let mut groups = self.inner.groups.write();
            let record = groups
                .get_mut(&group)
                .filter(|record| !record.closed)
                .ok_or(Error::GroupClosed)?;
            record.pending += 1;
            record.policy
        };
        let engine = self.clone();

        tokio::spawn(async move {
            let uri = request.uri().to_string();
            let result = tokio_tungstenite::connect_async_with_config(
                request,
                Some(policy.websocket_config()),
                no_delay,
            )
            .await;

            match result {
                Ok((ws, _response)) => {
                    let peer = match ws.get_ref() {
                        MaybeTlsStream::Plain(stream) => match (stream.peer_addr(), stream.local_addr()) {
                            (Ok(remote), Ok(local)) => Some(PeerAddress::new(remote, local)),
                            _ => None,
                        },
                        _ => None,
                    };

                    debug!(%uri, "Client connected");
                    if let Err(e) = engine.register(group, Role::Client, ws, peer, OpenContext::Connect(user_data.clone()), true) {
                        engine.fail_pending(group, user_data, e);
                    }
                }
                Err(e) => {
                    debug!(%uri, error = %e, "Client connect failed");
                    engine.fail_pending(group, user_data, Error::from(e));
                }
            }
        });

        Ok(())
    }

    fn open_group_policy(&self, group: GroupHandle) -> Result<GroupPolicy> {
        self.inner
            .groups
            .read()
            .get(&group)
            .filter(|record| !record.closed)
            .map(|record| record.policy)
            .ok_or(Error::GroupClosed)
    }

    /// Resolves a pending connect as failed and reports `error`.
    fn fail_pending(&self, group: GroupHandle, user_data: U, error: Error) {
        let callbacks = {
            let mut groups = self.inner.groups.write();
            let callbacks = groups.get_mut(&group).map(|record| {
                record.pending = record.pending.saturating_sub(1);
                Arc::clone(&record.callbacks)
            });
            if groups.get(&group).is_some_and(GroupRecord::drained) {
                groups.remove(&group);
            }
            callbacks
        };

        if let Some(callbacks) = callbacks {
            self.inner.event_loop.defer(move || {
                if let Some(on_error) = &callbacks.on_error {
                    on_error(user_data, error);
                }
            });
        }
    }

    /// Inserts a record, fires the open callback, and starts the I/O task.
    ///
    /// `pending` resolves a connect counted by [`connect`](Self::connect);
    /// such a connection joins even if the group closed meanwhile.
    fn register<S>(
        &self,
        group: GroupHandle,
        role: Role,
        ws: WebSocketStream<S>,
        peer: Option<PeerAddress>,
        context: OpenContext<U>,
        pending: bool,
    ) -> Result<ConnHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handle = ConnHandle::next();

        let callbacks = {
            let mut groups = self.inner.groups.write();
            let record = groups
                .get_mut(&group)
                .filter(|record| pending || !record.closed)
                .ok_or(Error::GroupClosed)?;

            debug_assert_eq!(record.role, role, "connection role differs from group role");
            if pending {
                record.pending = record.pending.saturating_sub(1);
            }
            record.members.insert(handle);
            Arc::clone(&record.callbacks)
        };

        let (outbound, rx) = mpsc::unbounded_channel();
        let liveness = Arc::new(Liveness::new());

        self.inner.connections.write().insert(
            handle,
            ConnRecord {
                group,
                role,
                outbound,
                user_data: None,
                peer,
                liveness: Arc::clone(&liveness),
            },
        );

        info!(%handle, %group, ?role, "Connection opened");

        {
            let callbacks = Arc::clone(&callbacks);
            self.inner
                .event_loop
                .defer(move || (callbacks.on_open)(handle, context));
        }

        tokio::spawn(io::drive(self.clone(), handle, ws, rx, callbacks, liveness));
        Ok(handle)
    }

    /// Posts the disconnection, then drops the record.
    fn finish(&self, handle: ConnHandle, callbacks: Arc<GroupCallbacks<U>>, info: CloseInfo) {
        let engine = self.clone();
        self.inner.event_loop.defer(move || {
            (callbacks.on_disconnection)(handle, info);
            engine.release(handle);
        });
    }

    fn release(&self, handle: ConnHandle) {
        let Some(record) = self.inner.connections.write().remove(&handle) else {
            return;
        };

        let mut groups = self.inner.groups.write();
        if let Some(group) = groups.get_mut(&record.group) {
            group.members.remove(&handle);
            if group.drained() {
                groups.remove(&record.group);
                trace!(group = %record.group, "Closed group drained");
            }
        }
    }
}

// ============================================================================
// Engine - Connections
// ============================================================================

impl<U> Engine<U>
where
    U: Clone + Send + Sync + 'static,
{
    /// Sends a frame on a server connection.
    pub fn server_send(&self, handle: ConnHandle, message: Message, compress: bool, completion: Option<SendCompletion>) {
        self.send_frame(Role::Server, handle, message, compress, completion);
    }

    /// Sends a frame on a client connection.
    pub fn client_send(&self, handle: ConnHandle, message: Message, compress: bool, completion: Option<SendCompletion>) {
        self.send_frame(Role::Client, handle, message, compress, completion);
    }

    /// Sends a ping on a server connection.
    pub fn server_ping(&self, handle: ConnHandle, payload: Bytes) {
        self.send_frame(Role::Server, handle, Message::Ping(payload), false, None);
    }

    /// Sends a ping on a client connection.
    pub fn client_ping(&self, handle: ConnHandle, payload: Bytes) {
        self.send_frame(Role::Client, handle, Message::Ping(payload), false, None);
    }

    /// Sends an unsolicited pong.
    pub fn pong(&self, handle: ConnHandle, payload: Bytes) {
        let role = self.role_of(handle);
        if let Some(role) = role {
            self.send_frame(role, handle, Message::Pong(payload), false, None);
        }
    }

    /// Starts the closing handshake on a server connection.
    pub fn server_close(&self, handle: ConnHandle, code: u16, reason: &str) -> Result<()> {
        self.command(Role::Server, handle, Outbound::Close { code, reason: reason.to_owned() })
    }

    /// Starts the closing handshake on a client connection.
    pub fn client_close(&self, handle: ConnHandle, code: u16, reason: &str) -> Result<()> {
        self.command(Role::Client, handle, Outbound::Close { code, reason: reason.to_owned() })
    }

    /// Drops a server connection without a closing handshake.
    pub fn server_terminate(&self, handle: ConnHandle) -> Result<()> {
        self.command(Role::Server, handle, Outbound::Terminate)
    }

    /// Drops a client connection without a closing handshake.
    pub fn client_terminate(&self, handle: ConnHandle) -> Result<()> {
        self.command(Role::Client, handle, Outbound::Terminate)
    }

    /// Returns both socket endpoints of a connection.
    #[must_use]
    pub fn peer_address(&self, handle: ConnHandle) -> Option<PeerAddress> {
        self.inner
            .connections
            .read()
            .get(&handle)
            .and_then(|record| record.peer)
    }

    fn role_of(&self, handle: ConnHandle) -> Option<Role> {
        self.inner.connections.read().get(&handle).map(|record| record.role)
    }

    fn queue(&self, role: Role, handle: ConnHandle) -> Result<mpsc::UnboundedSender<Outbound>> {
        let connections = self.inner.connections.read();
        let record = connections
            .get(&handle)
            .ok_or_else(|| Error::invalid_handle(handle))?;

        if record.role != role {
            warn!(%handle, expected = ?role, actual = ?record.role, "Engine entry point does not match connection role");
        }

        Ok(record.outbound.clone())
    }

    fn command(&self, role: Role, handle: ConnHandle, command: Outbound) -> Result<()> {
        let outbound = self.queue(role, handle)?;
        if matches!(command, Outbound::Close { .. } | Outbound::Terminate) {
            self.mark_closing(handle);
        }
        outbound.send(command).map_err(|_| Error::NotOpen)
    }

    fn mark_closing(&self, handle: ConnHandle) {
        if let Some(record) = self.inner.connections.read().get(&handle) {
            record.liveness.mark_closing();
        }
    }

    fn send_frame(
        &self,
        role: Role,
        handle: ConnHandle,
        message: Message,
        compress: bool,
        completion: Option<SendCompletion>,
    ) {
        if compress {
            trace!(%handle, "Compression not negotiated, sending uncompressed");
        }

        let outbound = match self.queue(role, handle) {
            Ok(outbound) => outbound,
            Err(e) => {
                if let Some(completion) = completion {
                    self.inner.event_loop.defer(move || completion(Err(e)));
                }
                return;
            }
        };

        if let Err(mpsc::error::SendError(Outbound::Frame { completion: Some(completion), .. })) =
            outbound.send(Outbound::Frame { message, completion })
        {
            self.inner
                .event_loop
                .defer(move || completion(Err(Error::NotOpen)));
        }
    }
}

// ============================================================================
// Engine - User Data
// ============================================================================

impl<U> Engine<U>
where
    U: Clone + Send + Sync + 'static,
{
    /// Associates user data with a connection.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHandle`] if the handle is unknown
    pub fn attach_user_data(&self, handle: ConnHandle, user_data: U) -> Result<()> {
        let mut connections = self.inner.connections.write();
        let record = connections
            .get_mut(&handle)
            .ok_or_else(|| Error::invalid_handle(handle))?;
        record.user_data = Some(user_data);
        Ok(())
    }

    /// Returns the user data of a connection.
    #[must_use]
    pub fn lookup_user_data(&self, handle: ConnHandle) -> Option<U> {
        self.inner
            .connections
            .read()
            .get(&handle)
            .and_then(|record| record.user_data.clone())
    }

    /// Removes and returns the user data of a connection.
    pub fn clear_user_data(&self, handle: ConnHandle) -> Option<U> {
        self.inner
            .connections
            .write()
            .get_mut(&handle)
            .and_then(|record| record.user_data.take())
    }
}

// ============================================================================
// Handshake Response
// ============================================================================

/// Builds the `101 Switching Protocols` response.
///
/// The first offered sub-protocol is selected.
fn accept_response(key: &str, extensions: Option<String>, protocol: Option<&str>) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        derive_accept_key(key.as_bytes())
    );

    if let Some(selected) = protocol
        .and_then(|offer| offer.split(',').map(str::trim).find(|p| !p.is_empty()))
    {
        response.push_str("Sec-WebSocket-Protocol: ");
        response.push_str(selected);
        response.push_str("\r\n");
    }

    if let Some(extensions) = extensions {
        response.push_str("Sec-WebSocket-Extensions: ");
        response.push_str(&extensions);
        response.push_str("\r\n");
    }

    response.push_str("\r\n");
    response
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    fn noop_callbacks() -> GroupCallbacks<u32> {
        GroupCallbacks {
            on_open: Box::new(|_, _| {}),
            on_message: Box::new(|_, _| {}),
            on_disconnection: Box::new(|_, _| {}),
            on_ping: Box::new(|_, _| {}),
            on_pong: Box::new(|_, _| {}),
            on_error: None,
        }
    }

    #[test]
    fn test_accept_response_rfc_example() {
        let response = accept_response("dGhlIHNhbXBsZSBub25jZQ==", None, None);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(!response.contains("Sec-WebSocket-Protocol"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_accept_response_selects_first_protocol() {
        let response = accept_response("dGhlIHNhbXBsZSBub25jZQ==", None, Some(" chat , superchat"));
        assert!(response.contains("Sec-WebSocket-Protocol: chat\r\n"));
    }

    #[tokio::test]
    async fn test_close_group_is_idempotent() {
        let engine: Engine<u32> = Engine::new(EventLoop::new(), EngineConfig::default());
        let group = engine.create_group(GroupPolicy::default(), Role::Server, noop_callbacks());

        assert!(engine.close_group(group));
        assert!(!engine.close_group(group));
        assert_eq!(engine.group_size(group), 0);
    }

    #[tokio::test]
    async fn test_auto_ping_on_closed_group_fails() {
        let engine: Engine<u32> = Engine::new(EventLoop::new(), EngineConfig::default());
        let group = engine.create_group(GroupPolicy::default(), Role::Server, noop_callbacks());
        engine.close_group(group);

        let result = engine.start_auto_ping(group, Duration::from_secs(1), Bytes::new());
        assert!(matches!(result, Err(Error::GroupClosed)));
    }

    #[tokio::test]
    async fn test_send_to_unknown_handle_reports_async() {
        let event_loop = EventLoop::new();
        let engine: Engine<u32> = Engine::new(event_loop.clone(), EngineConfig::default());
        let result = Arc::new(Mutex::new(None));

        {
            let result = Arc::clone(&result);
            engine.server_send(
                ConnHandle::next(),
                Message::Text("x".into()),
                false,
                Some(Box::new(move |r| *result.lock() = Some(r.is_err()))),
            );
        }

        assert!(result.lock().is_none());
        event_loop.barrier().await;
        assert_eq!(*result.lock(), Some(true));
    }

    #[tokio::test]
    async fn test_upgrade_on_closed_group_destroys_socket() {
        use tokio::io::{AsyncReadExt, duplex};

        let engine: Engine<u32> = Engine::new(EventLoop::new(), EngineConfig::default());
        let group = engine.create_group(GroupPolicy::default(), Role::Server, noop_callbacks());
        engine.close_group(group);

        let (mut client, server) = duplex(1024);
        let ticket = engine.transfer_socket(Box::new(server), Bytes::new(), None, false);
        let request = Arc::new(UpgradeRequest::new("GET", "/"));

        let result = engine.upgrade(group, ticket, "dGhlIHNhbXBsZSBub25jZQ==", None, None, UpgradeContext::new(request));
        assert!(matches!(result, Err(Error::GroupClosed)));

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_user_data_on_unknown_handle() {
        let engine: Engine<u32> = Engine::new(EventLoop::new(), EngineConfig::default());
        let handle = ConnHandle::next();

        assert!(engine.attach_user_data(handle, 7).is_err());
        assert_eq!(engine.lookup_user_data(handle), None);
        assert_eq!(engine.clear_user_data(handle), None);
        assert!(engine.peer_address(handle).is_none());
    }

    #[tokio::test]
    async fn test_pending_connect_outlives_group_close() {
        use tokio::net::TcpListener;
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let event_loop = EventLoop::new();
        let engine: Engine<u32> = Engine::new(event_loop.clone(), EngineConfig::default());
        let (errors, mut failed) = mpsc::unbounded_channel();
        let callbacks = GroupCallbacks {
            on_error: Some(Box::new(move |user_data: u32, _error: Error| {
                let _ = errors.send(user_data);
            })),
            ..noop_callbacks()
        };
        let group = engine.create_group(GroupPolicy::default(), Role::Client, callbacks);

        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let request = format!("ws://{addr}/").into_client_request().unwrap();
        engine.connect(group, request, true, 42).unwrap();
        assert!(engine.close_group(group));

        let user_data = tokio::time::timeout(Duration::from_secs(5), failed.recv()).await.unwrap();
        assert_eq!(user_data, Some(42));
        assert!(!engine.close_group(group));
        assert!(engine.inner.groups.read().get(&group).is_none());
    }

    #[tokio::test]
    async fn test_closing_connection_leaves_group_views() {
        use tokio::io::duplex;

        let engine: Engine<u32> = Engine::new(EventLoop::new(), EngineConfig::default());
        let group = engine.create_group(GroupPolicy::default(), Role::Server, noop_callbacks());

        let (_client, server) = duplex(1024);
        let ws = WebSocketStream::from_raw_socket(server, WsRole::Server, None).await;
        let request = Arc::new(UpgradeRequest::new("GET", "/"));
        let handle = engine.adopt(group, ws, None, UpgradeContext::new(request)).unwrap();
        assert_eq!(engine.group_size(group), 1);

        engine.server_close(handle, 1000, "bye").unwrap();

        assert_eq!(engine.group_size(group), 0);
        assert_eq!(engine.connection_count(), 0);
        assert_eq!(engine.broadcast(group, Payload::from("late"), false).unwrap(), 0);

        let mut visited = 0;
        engine.for_each_connection(group, |_, _| visited += 1);
        assert_eq!(visited, 0);
    }
}
