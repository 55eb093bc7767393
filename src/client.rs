//! WebSocket client.
//!
//! A [`Client`] owns one client group. [`Client::connect`] validates the URL
//! synchronously and returns a CLOSED [`Connection`] at once; it turns OPEN
//! and emits `open` when the handshake completes, or emits `error` if it
//! fails.
//!
//! # Example
//!
//! ```ignore
//! use wsgroup::{Client, ClientOptions};
//!
//! let client = Client::new(ClientOptions::default())?;
//! let connection = client.connect("ws://127.0.0.1:9001/chat")?;
//! let sender = connection.clone();
//! connection.on_open(move || sender.send("hello"))?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::debug;
use url::Url;

use crate::connection::{Connection, Variant};
use crate::engine::{DEFAULT_MAX_PAYLOAD, GroupPolicy};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::hub::Hub;

// ============================================================================
// ClientOptions
// ============================================================================

/// Options for [`Client::new`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Largest accepted message.
    pub max_payload: usize,
    /// Set `TCP_NODELAY` on outgoing sockets.
    pub no_delay: bool,
    /// Engine and loop to run on; a private one is created when `None`.
    pub hub: Option<Hub>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            no_delay: true,
            hub: None,
        }
    }
}

impl ClientOptions {
    /// Sets the largest accepted message.
    #[inline]
    #[must_use]
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Sets `TCP_NODELAY` on outgoing sockets.
    #[inline]
    #[must_use]
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Runs the client on a shared hub.
    #[inline]
    #[must_use]
    pub fn with_hub(mut self, hub: Hub) -> Self {
        self.hub = Some(hub);
        self
    }
}

// ============================================================================
// Client
// ============================================================================

/// WebSocket client group. Cloning shares the same group; dropping the last
/// clone closes it like [`close`](Client::close).
#[derive(Clone)]
pub struct Client {
    hub: Hub,
    group: Group,
    no_delay: bool,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("group", &self.group)
            .field("no_delay", &self.no_delay)
            .finish()
    }
}

impl Client {
    /// Creates a client.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `max_payload` is zero
    pub fn new(options: ClientOptions) -> Result<Self> {
        if options.max_payload == 0 {
            return Err(Error::config("`max_payload` must be greater than zero"));
        }

        let hub = options.hub.unwrap_or_default();
        let policy = GroupPolicy {
            max_payload: options.max_payload,
            ..GroupPolicy::default()
        };
        let group = Group::create(hub.engine(), policy, Variant::Client);

        Ok(Self {
            hub,
            group,
            no_delay: options.no_delay,
        })
    }

    /// Starts connecting to `url` (`ws://` or `wss://`).
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if the URL does not parse, has another scheme,
    ///   or has no host
    /// - [`Error::GroupClosed`] after [`close`](Self::close)
    pub fn connect(&self, url: &str) -> Result<Connection> {
        let parsed = Url::parse(url).map_err(|e| Error::invalid_url(format!("{url}: {e}")))?;

        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::invalid_url(format!(
                "{url}: scheme must be ws or wss, got {}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(Error::invalid_url(format!("{url}: missing host")));
        }

        let request = parsed
            .as_str()
            .into_client_request()
            .map_err(|e| Error::invalid_url(format!("{url}: {e}")))?;

        let connection = Connection::new(self.hub.engine().clone(), Variant::Client, None);
        self.group.connect(request, self.no_delay, connection.clone())?;

        debug!(%url, "Client connecting");
        Ok(connection)
    }

    /// Pings every open connection each `interval`.
    ///
    /// # Errors
    ///
    /// - [`Error::GroupClosed`] after [`close`](Self::close)
    pub fn start_auto_ping(&self, interval: Duration, payload: impl Into<Bytes>) -> Result<()> {
        self.group.start_auto_ping(interval, payload)
    }

    /// Number of open connections.
    #[must_use]
    pub fn size(&self) -> usize {
        self.group.size()
    }

    /// Stops new connections. Open ones keep working. Idempotent.
    pub fn close(&self) -> bool {
        self.group.close()
    }

    /// The hub this client runs on.
    #[inline]
    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

// ============================================================================
// Tests
// ============================================================================
