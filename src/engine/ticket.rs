//! Socket ownership transfer.
//!
//! A [`TransferTicket`] is the only way a raw transport reaches the engine.
//! It is created by [`Engine::transfer_socket`](super::Engine::transfer_socket)
//! and consumed by value by [`Engine::upgrade`](super::Engine::upgrade), so the
//! HTTP layer cannot touch the socket again once it has been handed over and
//! a ticket cannot be redeemed twice.
//!
//! Bytes the HTTP layer read past the request head travel with the ticket and
//! are replayed to the engine before the socket itself is read.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::TicketId;

// ============================================================================
// Transport
// ============================================================================

/// Any byte stream the engine can run WebSocket framing over.
///
/// Plain TCP streams, TLS streams produced by a TLS acceptor and in-memory
/// duplex pipes all qualify.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// ============================================================================
// PeerAddress
// ============================================================================

/// Address family of a socket endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl AddressFamily {
    /// Returns the conventional family name.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::V4 => "IPv4",
            Self::V6 => "IPv6",
        }
    }
}

impl From<&SocketAddr> for AddressFamily {
    fn from(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() { Self::V4 } else { Self::V6 }
    }
}

/// Both endpoints of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    /// Remote endpoint.
    pub remote: SocketAddr,
    /// Local endpoint.
    pub local: SocketAddr,
}

impl PeerAddress {
    /// Creates a peer address pair.
    #[inline]
    #[must_use]
    pub const fn new(remote: SocketAddr, local: SocketAddr) -> Self {
        Self { remote, local }
    }

    /// Remote port.
    #[inline]
    #[must_use]
    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }

    /// Remote IP address in text form.
    #[inline]
    #[must_use]
    pub fn remote_address(&self) -> String {
        self.remote.ip().to_string()
    }

    /// Remote address family.
    #[inline]
    #[must_use]
    pub fn remote_family(&self) -> AddressFamily {
        AddressFamily::from(&self.remote)
    }

    /// Local port.
    #[inline]
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    /// Local IP address in text form.
    #[inline]
    #[must_use]
    pub fn local_address(&self) -> String {
        self.local.ip().to_string()
    }

    /// Local address family.
    #[inline]
    #[must_use]
    pub fn local_family(&self) -> AddressFamily {
        AddressFamily::from(&self.local)
    }
}

// ============================================================================
// Rewind
// ============================================================================

/// Transport wrapper that replays already-read bytes first.
pub(crate) struct Rewind {
    prefix: Bytes,
    inner: Box<dyn Transport>,
}

impl Rewind {
    pub(crate) fn new(prefix: Bytes, inner: Box<dyn Transport>) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for Rewind {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ============================================================================
// TransferTicket
// ============================================================================

/// One-time ownership of a raw transport on its way into the engine.
///
/// Dropping an unredeemed ticket destroys the transport.
pub struct TransferTicket {
    id: TicketId,
    transport: Option<Rewind>,
    peer: Option<PeerAddress>,
    secure: bool,
}

impl TransferTicket {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        head: Bytes,
        peer: Option<PeerAddress>,
        secure: bool,
    ) -> Self {
        let id = TicketId::next();
        debug!(ticket = %id, secure, buffered = head.len(), "Socket detached for transfer");

        Self {
            id,
            transport: Some(Rewind::new(head, transport)),
            peer,
            secure,
        }
    }

    /// Returns the ticket identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> TicketId {
        self.id
    }

    /// Returns `true` if the transport is a TLS session.
    #[inline]
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Returns the socket endpoints, if known.
    #[inline]
    #[must_use]
    pub fn peer(&self) -> Option<PeerAddress> {
        self.peer
    }

    /// Redeems the ticket.
    pub(crate) fn redeem(mut self) -> Result<(Rewind, Option<PeerAddress>)> {
        let transport = self.transport.take();
        debug_assert!(transport.is_some(), "transfer ticket redeemed twice");

        let transport =
            transport.ok_or_else(|| Error::engine(format!("{} already redeemed", self.id)))?;
        Ok((transport, self.peer))
    }
}

impl fmt::Debug for TransferTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTicket")
            .field("id", &self.id)
            .field("redeemed", &self.transport.is_none())
            .field("peer", &self.peer)
            .field("secure", &self.secure)
            .finish()
    }
}

impl Drop for TransferTicket {
    fn drop(&mut self) {
        if self.transport.is_some() {
            debug!(ticket = %self.id, "Transfer ticket abandoned, transport destroyed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
