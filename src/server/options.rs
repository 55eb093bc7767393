//! Server configuration.
//!
//! # Example
//!
//! ```ignore
//! use wsgroup::ServerOptions;
//!
//! let options = ServerOptions::with_port(8080)
//!     .with_path("/chat")
//!     .with_max_payload(1024 * 1024);
//! ```
//!
//! The plain-data subset can also be loaded from JSON through
//! [`ServerConfig`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{DEFAULT_MAX_PAYLOAD, GroupPolicy, PERMESSAGE_DEFLATE, SLIDING_DEFLATE_WINDOW};
use crate::error::{Error, Result};
use crate::handshake::VerifyClient;
use crate::http::HttpServer;
use crate::hub::Hub;

// ============================================================================
// Constants
// ============================================================================

/// Default delay before a `close_with_callback` callback runs.
pub const DEFAULT_CLOSE_CALLBACK_DELAY: Duration = Duration::from_secs(20);

/// Default host for servers that bind their own port.
pub const DEFAULT_HOST: &str = "0.0.0.0";

// ============================================================================
// PerMessageDeflate
// ============================================================================

/// permessage-deflate setting.
///
/// Only recorded in the group policy. The frame codec has no deflate
/// support, so offers are always declined and frames go out uncompressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PerMessageDeflate {
    /// `true` / `false`.
    Flag(bool),
    /// `{ "server_no_context_takeover": … }`.
    Options {
        /// Reset the compression context after every message.
        #[serde(default)]
        server_no_context_takeover: bool,
    },
}

impl Default for PerMessageDeflate {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl PerMessageDeflate {
    /// Engine policy bits for this setting.
    #[must_use]
    pub const fn policy_bits(&self) -> u32 {
        match self {
            Self::Flag(true) => PERMESSAGE_DEFLATE | SLIDING_DEFLATE_WINDOW,
            Self::Options {
                server_no_context_takeover: false,
            } => PERMESSAGE_DEFLATE | SLIDING_DEFLATE_WINDOW,
            Self::Options {
                server_no_context_takeover: true,
            } => PERMESSAGE_DEFLATE,
            Self::Flag(false) => 0,
        }
    }
}

// ============================================================================
// ServerOptions
// ============================================================================

/// Options for [`Server::new`](crate::Server::new).
///
/// Exactly one of `port`, `server` and `no_server` must be set.
#[derive(Clone)]
pub struct ServerOptions {
    /// Bind a new HTTP server on this port (0 picks one).
    pub port: Option<u16>,
    /// Host to bind when `port` is set.
    pub host: Option<String>,
    /// Attach to an existing HTTP server.
    pub server: Option<HttpServer>,
    /// Accept upgrades only through `handle_upgrade` / `adopt`.
    pub no_server: bool,
    /// Accept only this request path.
    pub path: Option<String>,
    /// permessage-deflate setting.
    pub per_message_deflate: PerMessageDeflate,
    /// Largest accepted message.
    pub max_payload: usize,
    /// Set `TCP_NODELAY` on accepted sockets.
    pub no_delay: bool,
    /// Client verification predicate.
    pub verify_client: Option<VerifyClient>,
    /// Delay before a `close_with_callback` callback runs.
    pub close_callback_delay: Duration,
    /// Engine and loop to run on; a private one is created when `None`.
    pub hub: Option<Hub>,
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("port", &self.port)
            .field("host", &self.host)
            .field("server", &self.server.as_ref().map(HttpServer::local_addr))
            .field("no_server", &self.no_server)
            .field("path", &self.path)
            .field("per_message_deflate", &self.per_message_deflate)
            .field("max_payload", &self.max_payload)
            .field("no_delay", &self.no_delay)
            .field("verify_client", &self.verify_client)
            .field("close_callback_delay", &self.close_callback_delay)
            .finish_non_exhaustive()
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: None,
            host: None,
            server: None,
            no_server: false,
            path: None,
            per_message_deflate: PerMessageDeflate::Flag(false),
            max_payload: DEFAULT_MAX_PAYLOAD,
            no_delay: true,
            verify_client: None,
            close_callback_delay: DEFAULT_CLOSE_CALLBACK_DELAY,
            hub: None,
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ServerOptions {
    /// Options with no mode selected.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a server binding its own port.
    #[inline]
    #[must_use]
    pub fn with_port(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }

    /// Options for a server attached to an existing HTTP server.
    #[inline]
    #[must_use]
    pub fn with_server(server: HttpServer) -> Self {
        Self {
            server: Some(server),
            ..Self::default()
        }
    }

    /// Options for a server fed only through `handle_upgrade` / `adopt`.
    #[inline]
    #[must_use]
    pub fn no_server() -> Self {
        Self {
            no_server: true,
            ..Self::default()
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ServerOptions {
    /// Sets the bind host.
    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Restricts upgrades to one path.
    #[inline]
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the permessage-deflate setting.
    ///
    /// Stored as policy bits only: handshakes still decline the extension.
    #[inline]
    #[must_use]
    pub fn with_per_message_deflate(mut self, setting: PerMessageDeflate) -> Self {
        self.per_message_deflate = setting;
        self
    }

    /// Sets the largest accepted message.
    #[inline]
    #[must_use]
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Sets `TCP_NODELAY` on accepted sockets.
    #[inline]
    #[must_use]
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Sets the client verification predicate.
    #[inline]
    #[must_use]
    pub fn with_verify_client(mut self, verify: VerifyClient) -> Self {
        self.verify_client = Some(verify);
        self
    }

    /// Sets the `close_with_callback` delay.
    #[inline]
    #[must_use]
    pub fn with_close_callback_delay(mut self, delay: Duration) -> Self {
        self.close_callback_delay = delay;
        self
    }

    /// Runs the server on a shared hub.
    #[inline]
    #[must_use]
    pub fn with_hub(mut self, hub: Hub) -> Self {
        self.hub = Some(hub);
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ServerOptions {
    /// Checks the mode selection and limits.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] unless exactly one of `port`, `server`,
    ///   `no_server` is set, or if `max_payload` is zero
    pub fn validate(&self) -> Result<()> {
        let modes = usize::from(self.port.is_some())
            + usize::from(self.server.is_some())
            + usize::from(self.no_server);

        if modes != 1 {
            return Err(Error::config(
                "exactly one of `port`, `server` or `no_server` must be provided",
            ));
        }
        if self.max_payload == 0 {
            return Err(Error::config("`max_payload` must be greater than zero"));
        }
        Ok(())
    }

    /// Group policy derived from these options.
    #[must_use]
    pub fn policy(&self) -> GroupPolicy {
        GroupPolicy::from_bits(self.per_message_deflate.policy_bits(), self.max_payload)
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

/// Serializable subset of [`ServerOptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// See [`ServerOptions::port`].
    pub port: Option<u16>,
    /// See [`ServerOptions::host`].
    pub host: Option<String>,
    /// See [`ServerOptions::no_server`].
    pub no_server: bool,
    /// See [`ServerOptions::path`].
    pub path: Option<String>,
    /// See [`ServerOptions::per_message_deflate`].
    pub per_message_deflate: Option<PerMessageDeflate>,
    /// See [`ServerOptions::max_payload`].
    pub max_payload: Option<usize>,
    /// See [`ServerOptions::no_delay`].
    pub no_delay: Option<bool>,
    /// Close callback delay in milliseconds.
    pub close_callback_delay_ms: Option<u64>,
}

impl ServerConfig {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed or has unknown fields
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<ServerConfig> for ServerOptions {
    fn from(config: ServerConfig) -> Self {
        let defaults = Self::default();
        Self {
            port: config.port,
            host: config.host,
            server: None,
            no_server: config.no_server,
            path: config.path,
            per_message_deflate: config.per_message_deflate.unwrap_or_default(),
            max_payload: config.max_payload.unwrap_or(defaults.max_payload),
            no_delay: config.no_delay.unwrap_or(defaults.no_delay),
            verify_client: None,
            close_callback_delay: config
                .close_callback_delay_ms
                .map_or(defaults.close_callback_delay, Duration::from_millis),
            hub: None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
