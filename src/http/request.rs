//! Upgrade request heads.
//!
//! Only the request line and header block are ever read; the body of an
//! upgrade request is empty by definition. Parsing is line-based on CRLF.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::http::{HeaderMap, Request};
use tracing::{trace, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Largest accepted request head.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Time allowed for a complete request head to arrive.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of each socket read while collecting the head.
const READ_CHUNK: usize = 1024;

// ============================================================================
// UpgradeRequest
// ============================================================================

/// The HTTP request that asked for a protocol upgrade.
///
/// Shared with user code through the `connection` event and the client
/// verification predicate.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    method: String,
    target: String,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    secure: bool,
}

impl UpgradeRequest {
    /// Creates a request with no headers.
    #[must_use]
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: HeaderMap::new(),
            remote_addr: None,
            secure: false,
        }
    }

    /// Adds a header. Names or values that are not valid HTTP are skipped.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.append_header(name.as_bytes(), value.as_bytes());
        self
    }

    /// Sets the remote socket address.
    #[inline]
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Marks the request as received over TLS.
    #[inline]
    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Copies method, target and headers from an `http` request.
    #[must_use]
    pub fn from_http<B>(request: &Request<B>) -> Self {
        Self {
            method: request.method().as_str().to_owned(),
            target: request.uri().to_string(),
            headers: request.headers().clone(),
            remote_addr: None,
            secure: request.uri().scheme_str() == Some("https"),
        }
    }

    /// Parses a request head (request line and headers, CRLF terminated).
    ///
    /// # Errors
    ///
    /// - [`Error::Transport`] if the head is not a valid HTTP/1.x request
    pub fn parse(head: &[u8]) -> Result<Self> {
        let mut lines = head.split(|b| *b == b'\n').map(|line| line.strip_suffix(b"\r").unwrap_or(line));

        let request_line = lines
            .next()
            .ok_or_else(|| Error::transport("empty request head"))?;
        let request_line = std::str::from_utf8(request_line)
            .map_err(|_| Error::transport("request line is not UTF-8"))?;

        let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::transport(format!("malformed request line: {request_line}")));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(Error::transport(format!("unsupported HTTP version: {version}")));
        }

        let mut request = Self::new(method, target);

        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon = line
                .iter()
                .position(|b| *b == b':')
                .ok_or_else(|| Error::transport("header line without colon"))?;
            let name = &line[..colon];
            let value = line[colon + 1..].trim_ascii();
            request.append_header(name, value);
        }

        trace!(method = %request.method, target = %request.target, headers = request.headers.len(), "Request head parsed");
        Ok(request)
    }

    fn append_header(&mut self, name: &[u8], value: &[u8]) {
        match (HeaderName::from_bytes(name), HeaderValue::from_bytes(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => warn!(name = %String::from_utf8_lossy(name), "Skipping invalid header"),
        }
    }
}

// ============================================================================
// UpgradeRequest - Accessors
// ============================================================================

impl UpgradeRequest {
    /// Request method.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw request target (path and query).
    #[inline]
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Request path without the query string.
    #[must_use]
    pub fn path(&self) -> &str {
        let target = self.target.split(['?', '#']).next().unwrap_or_default();

        // Absolute-form targets carry scheme and authority.
        match target.find("://") {
            Some(scheme_end) => {
                let rest = &target[scheme_end + 3..];
                rest.find('/').map_or("/", |slash| &rest[slash..])
            }
            None => target,
        }
    }

    /// Query string, if any.
    #[inline]
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }

    /// All headers.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if present and valid text.
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// `Origin` header.
    #[inline]
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
    }

    /// `Sec-WebSocket-Key` header.
    #[inline]
    #[must_use]
    pub fn websocket_key(&self) -> Option<&str> {
        self.header("sec-websocket-key")
    }

    /// `Sec-WebSocket-Extensions` header.
    #[inline]
    #[must_use]
    pub fn extensions(&self) -> Option<&str> {
        self.header("sec-websocket-extensions")
    }

    /// `Sec-WebSocket-Protocol` header.
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.header("sec-websocket-protocol")
    }

    /// Returns `true` if this is a `GET` asking to upgrade to WebSocket.
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
            && self
                .header("upgrade")
                .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
    }

    /// Remote socket address, if known.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Returns `true` if the request arrived over TLS.
    #[inline]
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

// ============================================================================
// Head Reading
// ============================================================================

/// Reads from `stream` until a complete request head is buffered.
///
/// Returns the head (including the blank line) and any bytes read after it.
///
/// # Errors
///
/// - [`Error::Transport`] on EOF, oversized head, or timeout
/// - [`Error::Io`] on read failure
pub async fn read_head<S>(stream: &mut S, max_size: usize, limit: Duration) -> Result<(Bytes, Bytes)>
where
    S: AsyncRead + Unpin,
{
    timeout(limit, read_until_head(stream, max_size))
        .await
        .map_err(|_| Error::transport(format!("request head not received within {}ms", limit.as_millis())))?
}

async fn read_until_head<S>(stream: &mut S, max_size: usize) -> Result<(Bytes, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = buf.split_to(end).freeze();
            return Ok((head, buf.freeze()));
        }
        if buf.len() > max_size {
            return Err(Error::transport(format!("request head exceeds {max_size} bytes")));
        }

        buf.reserve(READ_CHUNK);
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::transport("connection closed before request head completed"));
        }
    }
}

/// Offset just past the `\r\n\r\n` terminating the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

// ============================================================================
// Tests
// ============================================================================
