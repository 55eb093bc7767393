//! Message payloads.
//!
//! A [`Payload`] is what user code sends and receives. The opcode is inferred
//! from the variant (text vs. binary) unless the sender overrides it.

// ============================================================================
// Imports
// ============================================================================

use bytes::Bytes;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};

// ============================================================================
// Payload
// ============================================================================

/// Data frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text (opcode 0x1).
    Text(String),
    /// Arbitrary bytes (opcode 0x2).
    Binary(Bytes),
}

impl Payload {
    /// Returns `true` for binary payloads.
    #[inline]
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    /// Returns the text if this is a text payload.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// Returns the payload length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts into an engine frame.
    ///
    /// `binary` overrides the inferred opcode. Forcing text on bytes that
    /// are not valid UTF-8 fails with [`Error::InvalidPayload`].
    pub(crate) fn into_message(self, binary: Option<bool>) -> Result<Message> {
        let binary = binary.unwrap_or_else(|| self.is_binary());

        match (self, binary) {
            (Self::Text(text), false) => Ok(Message::Text(text.into())),
            (Self::Text(text), true) => Ok(Message::Binary(Bytes::from(text))),
            (Self::Binary(data), true) => Ok(Message::Binary(data)),
            (Self::Binary(data), false) => {
                let text = std::str::from_utf8(&data)
                    .map_err(|e| Error::invalid_payload(format!("text frame is not UTF-8: {e}")))?;
                Ok(Message::Text(text.to_owned().into()))
            }
        }
    }

    /// Converts a received data frame. Control frames yield `None`.
    pub(crate) fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Self::Text(text.as_str().to_owned())),
            Message::Binary(data) => Some(Self::Binary(data)),
            _ => None,
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(data))
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(data))
    }
}

// ============================================================================
// Tests
// ============================================================================
