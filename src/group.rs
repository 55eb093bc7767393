//! Connection groups.
//!
//! A [`Group`] owns an engine group handle, the policy shared by its members
//! and the callback that receives newly accepted connections. Closing a
//! group only stops new joins; members keep working until they disconnect.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::client::Request as ClientRequest;
use tracing::debug;

use crate::bridge::{self, ConnectionCallback, UpgradeSlot};
use crate::connection::{Connection, Variant};
use crate::engine::{Engine, GroupPolicy, PeerAddress, Role, TransferTicket, UpgradeContext};
use crate::error::{Error, Result};
use crate::http::UpgradeRequest;
use crate::identifiers::GroupHandle;
use crate::payload::Payload;

// ============================================================================
// Group
// ============================================================================

struct GroupInner {
    handle: Mutex<Option<GroupHandle>>,
    engine: Engine<Connection>,
    policy: GroupPolicy,
    variant: Variant,
    upgrade_slot: UpgradeSlot,
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            self.upgrade_slot.lock().take();
            self.engine.close_group(handle);
            debug!(group = %handle, "Group dropped without close");
        }
    }
}

/// A set of connections sharing policy and bulk operations.
///
/// Cloning shares the group; dropping the last clone closes it.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("handle", &*self.inner.handle.lock())
            .field("variant", &self.inner.variant)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

// ============================================================================
// Group - Constructor
// ============================================================================

impl Group {
    /// Creates a group on `engine`.
    #[must_use]
    pub fn create(engine: &Engine<Connection>, policy: GroupPolicy, variant: Variant) -> Self {
        let upgrade_slot: UpgradeSlot = Arc::new(Mutex::new(None));
        let callbacks = bridge::group_callbacks(engine, variant, &upgrade_slot);
        let role = match variant {
            Variant::Server => Role::Server,
            Variant::Client => Role::Client,
        };
        let handle = engine.create_group(policy, role, callbacks);

        Self {
            inner: Arc::new(GroupInner {
                handle: Mutex::new(Some(handle)),
                engine: engine.clone(),
                policy,
                variant,
                upgrade_slot,
            }),
        }
    }
}

// ============================================================================
// Group - Accessors
// ============================================================================

impl Group {
    /// Engine handle; `None` after [`close`](Self::close).
    #[inline]
    #[must_use]
    pub fn handle(&self) -> Option<GroupHandle> {
        *self.inner.handle.lock()
    }

    /// Returns `true` once closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle().is_none()
    }

    /// Shared policy.
    #[inline]
    #[must_use]
    pub fn policy(&self) -> GroupPolicy {
        self.inner.policy
    }

    /// Server or client group.
    #[inline]
    #[must_use]
    pub fn variant(&self) -> Variant {
        self.inner.variant
    }

    /// The engine the group lives on.
    #[inline]
    #[must_use]
    pub fn engine(&self) -> &Engine<Connection> {
        &self.inner.engine
    }

    /// Sets the callback that receives each accepted connection.
    pub fn set_upgrade_callback(&self, callback: impl Fn(Connection, Arc<UpgradeRequest>) + Send + Sync + 'static) {
        let callback: ConnectionCallback = Arc::new(callback);
        *self.inner.upgrade_slot.lock() = Some(callback);
    }
}

// ============================================================================
// Group - Bulk Operations
// ============================================================================

impl Group {
    /// Sends one frame to every connection open now.
    ///
    /// Returns the number of recipients; closed recipients are skipped.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPayload`] if text is forced on non-UTF-8 bytes
    pub fn broadcast(&self, payload: impl Into<Payload>, binary: bool) -> Result<usize> {
        match self.handle() {
            Some(handle) => self.inner.engine.broadcast(handle, payload.into(), binary),
            None => Ok(0),
        }
    }

    /// Pings every member each `interval`, terminating silent ones.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] if the group is closed
    /// - [`Error::Config`] if `interval` is zero
    pub fn start_auto_ping(&self, interval: Duration, payload: impl Into<Bytes>) -> Result<()> {
        let handle = self.handle().ok_or(Error::GroupClosed)?;
        self.inner.engine.start_auto_ping(handle, interval, payload.into())
    }

    /// Calls `f` for every connection open now.
    pub fn for_each(&self, mut f: impl FnMut(&Connection)) {
        if let Some(handle) = self.handle() {
            self.inner.engine.for_each_connection(handle, |_, connection| {
                if let Some(connection) = connection {
                    f(&connection);
                }
            });
        }
    }

    /// Number of open connections.
    #[must_use]
    pub fn size(&self) -> usize {
        self.handle()
            .map_or(0, |handle| self.inner.engine.group_size(handle))
    }

    /// Stops new joins, detaches the upgrade callback and auto-ping.
    ///
    /// Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let Some(handle) = self.inner.handle.lock().take() else {
            return false;
        };

        self.inner.upgrade_slot.lock().take();
        self.inner.engine.close_group(handle);
        debug!(group = %handle, "Group released");
        true
    }
}

// ============================================================================
// Group - Joining
// ============================================================================

impl Group {
    /// Completes a server handshake for a transferred socket.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] if the group is closed (the socket is dropped)
    pub fn upgrade(
        &self,
        ticket: TransferTicket,
        key: &str,
        extensions: Option<&str>,
        protocol: Option<&str>,
        context: UpgradeContext<Connection>,
    ) -> Result<()> {
        let handle = self.handle().ok_or(Error::GroupClosed)?;
        self.inner
            .engine
            .upgrade(handle, ticket, key, extensions, protocol, context)
    }

    /// Adds an already-upgraded stream.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] if the group is closed
    pub fn adopt<S>(
        &self,
        ws: WebSocketStream<S>,
        peer: Option<PeerAddress>,
        context: UpgradeContext<Connection>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handle = self.handle().ok_or(Error::GroupClosed)?;
        self.inner.engine.adopt(handle, ws, peer, context).map(|_| ())
    }

    /// Starts a client connection; `connection` becomes OPEN on success.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] if the group is closed
    pub fn connect(&self, request: ClientRequest, no_delay: bool, connection: Connection) -> Result<()> {
        let handle = self.handle().ok_or(Error::GroupClosed)?;
        self.inner
            .engine
            .connect(handle, request, no_delay, connection)
    }
}

// ============================================================================
// Tests
// ============================================================================
