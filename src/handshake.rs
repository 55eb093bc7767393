//! Upgrade handshake coordinator.
//!
//! Takes a [`PendingUpgrade`] from the HTTP layer and drives it through:
//!
//! ```text
//! Received ──path mismatch──► (declined | Aborted 400)
//!    │
//!    ▼
//! Verifying ──rejected──► Rejected ──► Aborted <code>
//!    │
//!    ▼
//! Accepted ──bad key / no socket──► Aborted (destroyed)
//!    │
//!    ▼
//! Transferred
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::engine::{UpgradeCallback, UpgradeContext};
use crate::group::Group;
use crate::http::{PendingUpgrade, UpgradeRequest};

// ============================================================================
// Constants
// ============================================================================

/// Length of a base64-encoded 16-byte `Sec-WebSocket-Key`.
pub const KEY_LENGTH: usize = 24;

/// Default status for a failed client verification.
pub const DEFAULT_REJECT_CODE: u16 = 400;

/// Default reason for a failed client verification.
pub const DEFAULT_REJECT_REASON: &str = "Client verification failed";

/// Reason sent when the request path does not match.
pub const PATH_MISMATCH_REASON: &str = "URL not supported";

// ============================================================================
// HandshakeState
// ============================================================================

/// Coordinator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Request received, path not yet checked.
    Received,
    /// Waiting on the client verification predicate.
    Verifying,
    /// Verification passed; socket about to be transferred.
    Accepted,
    /// Verification failed.
    Rejected,
    /// Socket handed to the engine.
    Transferred,
    /// Request answered with an error or socket destroyed.
    Aborted,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Verifying => "verifying",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Transferred => "transferred",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// How a coordinator run ended.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// The engine owns the socket now.
    Transferred,
    /// The request was refused.
    Aborted,
    /// Path mismatch; hand the request to the next listener.
    Declined(PendingUpgrade),
}

impl HandshakeOutcome {
    /// Final state of the run.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        match self {
            Self::Transferred => HandshakeState::Transferred,
            Self::Aborted | Self::Declined(_) => HandshakeState::Aborted,
        }
    }
}

// ============================================================================
// Client Verification
// ============================================================================

/// What the verification predicate sees.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// `Origin` header, if sent.
    pub origin: Option<String>,
    /// Whether the request arrived over TLS.
    pub secure: bool,
    /// The full request.
    pub request: Arc<UpgradeRequest>,
}

impl ClientInfo {
    fn from_request(request: &Arc<UpgradeRequest>) -> Self {
        Self {
            origin: request.origin().map(str::to_owned),
            secure: request.is_secure(),
            request: Arc::clone(request),
        }
    }
}

/// Answer of an asynchronous verification predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Accept the client.
    pub allow: bool,
    /// Status code sent on rejection.
    pub code: u16,
    /// Reason sent on rejection.
    pub reason: String,
}

impl Verdict {
    /// Accepts the client.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allow: true,
            code: 0,
            reason: String::new(),
        }
    }

    /// Rejects with the default status and reason.
    #[must_use]
    pub fn reject() -> Self {
        Self::reject_with(DEFAULT_REJECT_CODE, DEFAULT_REJECT_REASON)
    }

    /// Rejects with a custom status and reason.
    #[must_use]
    pub fn reject_with(code: u16, reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            code,
            reason: reason.into(),
        }
    }
}

impl From<bool> for Verdict {
    fn from(allow: bool) -> Self {
        if allow { Self::allow() } else { Self::reject() }
    }
}

type SyncPredicate = Arc<dyn Fn(&ClientInfo) -> bool + Send + Sync>;
type AsyncPredicate = Arc<dyn Fn(ClientInfo) -> BoxFuture<'static, Verdict> + Send + Sync>;

/// Client verification predicate.
#[derive(Clone)]
pub enum VerifyClient {
    /// Answers immediately.
    Sync(SyncPredicate),
    /// Answers later, optionally with a custom rejection.
    Async(AsyncPredicate),
}

impl VerifyClient {
    /// Wraps a synchronous predicate.
    pub fn sync(predicate: impl Fn(&ClientInfo) -> bool + Send + Sync + 'static) -> Self {
        Self::Sync(Arc::new(predicate))
    }

    /// Wraps an asynchronous predicate.
    pub fn with_async<F, Fut>(predicate: F) -> Self
    where
        F: Fn(ClientInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        Self::Async(Arc::new(move |info| predicate(info).boxed()))
    }

    async fn verify(&self, info: ClientInfo) -> Verdict {
        match self {
            Self::Sync(predicate) => Verdict::from(predicate(&info)),
            Self::Async(predicate) => predicate(info).await,
        }
    }
}

impl fmt::Debug for VerifyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("VerifyClient::Sync"),
            Self::Async(_) => f.write_str("VerifyClient::Async"),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Returns `true` if `key` has the length of an encoded 16-byte nonce.
#[inline]
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    key.len() == KEY_LENGTH
}

/// Path filter and verification policy for one server.
#[derive(Debug, Clone, Default)]
pub struct Coordinator {
    path: Option<String>,
    verify: Option<VerifyClient>,
}

impl Coordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(path: Option<String>, verify: Option<VerifyClient>) -> Self {
        Self { path, verify }
    }

    /// Runs one upgrade request to completion.
    ///
    /// `last` tells whether another upgrade listener could still take the
    /// request on a path mismatch.
    pub async fn run(
        &self,
        group: &Group,
        mut pending: PendingUpgrade,
        last: bool,
        on_upgrade: Option<UpgradeCallback<Connection>>,
    ) -> HandshakeOutcome {
        let request = Arc::clone(pending.request());
        trace!(state = %HandshakeState::Received, target = request.target(), "Handshake");

        if let Some(path) = &self.path
            && request.path() != path.as_str()
        {
            if !last {
                trace!(expected = %path, actual = request.path(), "Path mismatch, declining");
                return HandshakeOutcome::Declined(pending);
            }
            debug!(expected = %path, actual = request.path(), "Path mismatch, aborting");
            pending.abort(400, PATH_MISMATCH_REASON).await;
            return HandshakeOutcome::Aborted;
        }

        if let Some(verify) = &self.verify {
            trace!(state = %HandshakeState::Verifying, "Handshake");
            let verdict = verify.verify(ClientInfo::from_request(&request)).await;
            if !verdict.allow {
                debug!(state = %HandshakeState::Rejected, code = verdict.code, reason = %verdict.reason, "Client verification failed");
                pending.abort(verdict.code, &verdict.reason).await;
                return HandshakeOutcome::Aborted;
            }
        }

        trace!(state = %HandshakeState::Accepted, "Handshake");

        let key = match request.websocket_key() {
            Some(key) if is_valid_key(key) => key,
            other => {
                debug!(key = ?other, "Invalid Sec-WebSocket-Key, destroying socket");
                pending.destroy();
                return HandshakeOutcome::Aborted;
            }
        };

        let peer = pending.peer();
        let Some((transport, head)) = pending.take_transport() else {
            debug!("Socket already detached");
            return HandshakeOutcome::Aborted;
        };

        let ticket = group
            .engine()
            .transfer_socket(transport, head, peer, request.is_secure());

        let context = UpgradeContext {
            request: Arc::clone(&request),
            on_upgrade,
        };

        match group.upgrade(ticket, key, request.extensions(), request.protocol(), context) {
            Ok(()) => {
                trace!(state = %HandshakeState::Transferred, "Handshake");
                HandshakeOutcome::Transferred
            }
            Err(e) => {
                debug!(error = %e, "Upgrade refused");
                HandshakeOutcome::Aborted
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
