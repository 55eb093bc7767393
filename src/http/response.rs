//! Minimal HTTP responses for refused requests.

// ============================================================================
// Imports
// ============================================================================

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::Result;

// ============================================================================
// Status Lines
// ============================================================================

/// Default reason phrase for the statuses this crate sends.
#[must_use]
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

/// Formats a complete `Connection: close` response whose body repeats the
/// reason.
#[must_use]
pub fn status_response(code: u16, reason: &str) -> String {
    let mut response = format!(
        "HTTP/1.1 {code} {reason}\r\n\
         Connection: close\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n",
        reason.len()
    );
    if code == 426 {
        response.push_str("Upgrade: websocket\r\n");
    }
    response.push_str("\r\n");
    response.push_str(reason);
    response
}

/// Writes a status response and shuts the write side down.
///
/// # Errors
///
/// - [`crate::Error::Io`] if the write fails
pub async fn write_status<S>(stream: &mut S, code: u16, reason: &str) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    trace!(code, reason, "Writing status response");
    stream.write_all(status_response(code, reason).as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, duplex};

    #[test]
    fn test_status_response_format() {
        let response = status_response(400, "URL not supported");
        assert!(response.starts_with("HTTP/1.1 400 URL not supported\r\n"));
        assert!(response.contains("Content-Length: 17\r\n"));
        assert!(response.ends_with("\r\n\r\nURL not supported"));
    }

    #[test]
    fn test_upgrade_required_advertises_websocket() {
        let response = status_response(426, reason_phrase(426));
        assert!(response.contains("Upgrade: websocket\r\n"));
    }

    #[tokio::test]
    async fn test_write_status_then_eof() {
        let (mut client, mut server) = duplex(1024);
        write_status(&mut server, 401, "Unauthorized").await.unwrap();

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert!(received.starts_with("HTTP/1.1 401 Unauthorized"));
    }

    #[tokio::test]
    async fn test_write_status_exact_bytes() {
        let expected = status_response(404, "Not Found");
        let mut mock = tokio_test::io::Builder::new()
            .write(expected.as_bytes())
            .build();

        write_status(&mut mock, 404, "Not Found").await.unwrap();
    }
}
