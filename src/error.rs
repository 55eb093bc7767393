//! Error types for wsgroup.
//!
//! Two reporting channels exist and never mix:
//!
//! - Calls that fail as a direct result of the caller's own request
//!   (duplicate listener, malformed options, bad URL) return `Err` immediately.
//! - Failures that originate asynchronously in the engine or the transport
//!   are delivered as events (`error`, `socket_error`, send callbacks) and
//!   are never returned or panicked.
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Listener | [`Error::DuplicateListener`] |
//! | Connection | [`Error::NotOpen`], [`Error::InvalidHandle`], [`Error::InvalidPayload`] |
//! | Handshake | [`Error::HandshakeRejected`] |
//! | Group | [`Error::GroupClosed`] |
//! | Transport | [`Error::Transport`], [`Error::Tls`], [`Error::Engine`] |
//! | Configuration | [`Error::Config`], [`Error::InvalidUrl`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::connection::EventKind;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Listener Errors
    // ========================================================================
    /// A listener is already registered for this event.
    ///
    /// Remove the existing listener before registering a new one.
    #[error("Duplicate listener for event: {event}")]
    DuplicateListener {
        /// Name of the event slot that is already taken.
        event: &'static str,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// The connection is not open.
    ///
    /// Only ever delivered to a send completion callback.
    #[error("WebSocket is not open")]
    NotOpen,

    /// The engine has no record of this handle.
    #[error("Invalid engine handle: {handle}")]
    InvalidHandle {
        /// Display form of the stale handle.
        handle: String,
    },

    /// Payload cannot be sent with the requested opcode.
    #[error("Invalid payload: {message}")]
    InvalidPayload {
        /// Why the payload was refused.
        message: String,
    },

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// The upgrade request was rejected before transfer.
    #[error("Handshake rejected: {code} {reason}")]
    HandshakeRejected {
        /// HTTP status code sent to the peer.
        code: u16,
        /// HTTP reason phrase sent to the peer.
        reason: String,
    },

    // ========================================================================
    // Group Errors
    // ========================================================================
    /// The group has been closed and accepts no new connections.
    #[error("Group closed")]
    GroupClosed,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport-level failure (accept, read, write).
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// TLS session failure reported by the transport.
    #[error("TLS error: {message}")]
    Tls {
        /// Description of the TLS failure.
        message: String,
    },

    /// Engine-level failure (client connect, protocol violation).
    #[error("Engine error: {message}")]
    Engine {
        /// Description of the engine failure.
        message: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid options.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Client URL could not be used.
    #[error("Invalid URL: {message}")]
    InvalidUrl {
        /// Description of the URL problem.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON configuration error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket protocol error from the engine codec.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a duplicate listener error.
    #[inline]
    pub fn duplicate_listener(event: EventKind) -> Self {
        Self::DuplicateListener {
            event: event.as_str(),
        }
    }

    /// Creates a duplicate listener error from a raw event name.
    #[inline]
    pub fn duplicate_listener_named(event: &'static str) -> Self {
        Self::DuplicateListener { event }
    }

    /// Creates an invalid handle error.
    #[inline]
    pub fn invalid_handle(handle: impl std::fmt::Display) -> Self {
        Self::InvalidHandle {
            handle: handle.to_string(),
        }
    }

    /// Creates an invalid payload error.
    #[inline]
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Creates a handshake rejection.
    #[inline]
    pub fn handshake_rejected(code: u16, reason: impl Into<String>) -> Self {
        Self::HandshakeRejected {
            code,
            reason: reason.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a TLS error.
    #[inline]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Creates an engine error.
    #[inline]
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    #[inline]
    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the error was raised synchronously by API misuse.
    #[inline]
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateListener { .. } | Self::Config { .. } | Self::InvalidUrl { .. }
        )
    }

    /// Returns `true` if this is a transport-originated error.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Tls { .. } | Self::Io(_) | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the connection was not usable for the operation.
    #[inline]
    #[must_use]
    pub fn is_not_open(&self) -> bool {
        matches!(self, Self::NotOpen | Self::InvalidHandle { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
