//! Group-wide policy: payload limit and compression bits.

// ============================================================================
// Imports
// ============================================================================

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;

// ============================================================================
// Constants
// ============================================================================

/// Policy bit: permessage-deflate enabled.
pub const PERMESSAGE_DEFLATE: u32 = 1;

/// Policy bit: keep the deflate window between messages.
pub const SLIDING_DEFLATE_WINDOW: u32 = 16;

/// Default maximum message size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

// ============================================================================
// GroupPolicy
// ============================================================================

/// Configuration shared by every connection in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPolicy {
    /// Largest accepted message or frame, in bytes.
    pub max_payload: usize,
    /// Whether permessage-deflate may be negotiated.
    pub compression: bool,
    /// Whether the server keeps its compression context between messages.
    pub sliding_window: bool,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            compression: false,
            sliding_window: false,
        }
    }
}

impl GroupPolicy {
    /// Builds a policy from engine policy bits.
    #[must_use]
    pub const fn from_bits(bits: u32, max_payload: usize) -> Self {
        Self {
            max_payload,
            compression: bits & PERMESSAGE_DEFLATE != 0,
            sliding_window: bits & SLIDING_DEFLATE_WINDOW != 0,
        }
    }

    /// Encodes the compression flags as engine policy bits.
    #[must_use]
    pub const fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.compression {
            bits |= PERMESSAGE_DEFLATE;
            if self.sliding_window {
                bits |= SLIDING_DEFLATE_WINDOW;
            }
        }
        bits
    }

    /// Codec limits for connections in this group.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_payload))
            .max_frame_size(Some(self.max_payload))
    }

    /// Chooses the `Sec-WebSocket-Extensions` answer for a client offer.
    ///
    /// The codec in use has no deflate implementation, so an offer is only
    /// recorded; nothing is ever accepted and frames stay uncompressed.
    #[must_use]
    pub fn negotiate_extensions(&self, offered: Option<&str>) -> Option<String> {
        if let Some(offer) = offered
            && self.compression
            && offer.contains("permessage-deflate")
        {
            debug!(offer, "permessage-deflate offered, declining");
        }
        None
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = GroupPolicy::default();
        assert_eq!(policy.max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(policy.bits(), 0);
    }

    #[test]
    fn test_bits_round_trip() {
        let policy = GroupPolicy::from_bits(PERMESSAGE_DEFLATE | SLIDING_DEFLATE_WINDOW, 1024);
        assert!(policy.compression);
        assert!(policy.sliding_window);
        assert_eq!(policy.bits(), PERMESSAGE_DEFLATE | SLIDING_DEFLATE_WINDOW);
    }

    #[test]
    fn test_sliding_window_requires_compression() {
        let policy = GroupPolicy {
            max_payload: 10,
            compression: false,
            sliding_window: true,
        };
        assert_eq!(policy.bits(), 0);
    }

    #[test]
    fn test_extensions_never_accepted() {
        let policy = GroupPolicy::from_bits(PERMESSAGE_DEFLATE, 1024);
        assert_eq!(
            policy.negotiate_extensions(Some("permessage-deflate; client_max_window_bits")),
            None
        );
        assert_eq!(policy.negotiate_extensions(None), None);
    }

    #[test]
    fn test_websocket_config_limits() {
        let config = GroupPolicy::from_bits(0, 4096).websocket_config();
        assert_eq!(config.max_message_size, Some(4096));
        assert_eq!(config.max_frame_size, Some(4096));
    }
}
