//! Frame message type.
//!
//! Every message on the wire is one JSON text frame of the form:
//!
//! ```json
//! {
//!   "kind": "ReceiverMessage",
//!   "action": "chat",
//!   "data": { ... }
//! }
//! ```
//!
//! Frames are self-contained: there are no sequence numbers and no
//! correlation ids.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, from_str, to_string};

use crate::error::Result;

// ============================================================================
// FrameKind
// ============================================================================

/// The six frame kinds of the protocol.
///
/// | Kind | Direction | Purpose |
/// |------|-----------|---------|
/// | `SenderRequest` | both | Open request / acknowledgment |
/// | `SenderMessage` | Local → Remote | Payload on an open sender |
/// | `SenderClose` | both | Sender closed |
/// | `ReceiverRequest` | both | Open request / acknowledgment |
/// | `ReceiverMessage` | Remote → Local | Payload on an open receiver |
/// | `ReceiverClose` | both | Receiver closed |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Sender open request (local) or acknowledgment (remote).
    SenderRequest,
    /// Sender closed.
    SenderClose,
    /// Payload sent through an open sender.
    SenderMessage,
    /// Receiver open request (local) or acknowledgment (remote).
    ReceiverRequest,
    /// Payload delivered to an open receiver.
    ReceiverMessage,
    /// Receiver closed.
    ReceiverClose,
}

impl FrameKind {
    /// Returns the wire tag.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SenderRequest => "SenderRequest",
            Self::SenderClose => "SenderClose",
            Self::SenderMessage => "SenderMessage",
            Self::ReceiverRequest => "ReceiverRequest",
            Self::ReceiverMessage => "ReceiverMessage",
            Self::ReceiverClose => "ReceiverClose",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,

    /// Logical channel this frame belongs to.
    pub action: String,

    /// Opaque payload. A missing field decodes as `null`.
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    /// Creates a new frame.
    #[inline]
    #[must_use]
    pub fn new(kind: FrameKind, action: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            action: action.into(),
            data,
        }
    }

    /// Decodes a frame from a JSON text message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the text is not a valid
    /// frame, including frames with an unknown `kind`.
    #[inline]
    pub fn decode(text: &str) -> Result<Self> {
        Ok(from_str(text)?)
    }

    /// Encodes the frame as a JSON text message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    #[inline]
    pub fn encode(&self) -> Result<String> {
        Ok(to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
