//! Error types for muxstream.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use muxstream::{Connection, Result};
//!
//! async fn example(connection: &Connection) -> Result<()> {
//!     let sender = connection.new_sender("chat")?;
//!     sender.open(serde_json::Value::Null).await?;
//!     sender.send(serde_json::json!({ "text": "hi" }))?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::AlreadyConnected`], [`Error::NotReady`], [`Error::ConnectionDropped`] |
//! | Caller misuse | [`Error::DuplicateAction`], [`Error::ClosedForever`], [`Error::AlreadyOpen`], [`Error::StillOpening`], [`Error::NotOpen`] |
//! | Remote | [`Error::Remote`] |
//! | External | [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::result::Result as StdResult;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::channel::ChannelRole;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when the base address or channel path is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport failure.
    ///
    /// Returned when the socket cannot be established or breaks.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// `connect()` called while a socket is still owned.
    #[error("Connection already started")]
    AlreadyConnected,

    /// Frame sent while the socket is not fully open.
    #[error("Connection not ready")]
    NotReady,

    /// The owning connection no longer exists.
    #[error("Connection dropped")]
    ConnectionDropped,

    // ========================================================================
    // Channel Errors
    // ========================================================================
    /// A channel for this action is already registered.
    #[error("{role} already exists for action `{action}`")]
    DuplicateAction {
        /// Channel direction.
        role: ChannelRole,
        /// The duplicated action.
        action: String,
    },

    /// The channel was permanently closed.
    ///
    /// Obtain a new channel from the connection to reuse the action.
    #[error("{role} `{action}` closed forever")]
    ClosedForever {
        /// Channel direction.
        role: ChannelRole,
        /// Channel action.
        action: String,
    },

    /// `open()` called while already opening or open.
    #[error("{role} `{action}` already opened")]
    AlreadyOpen {
        /// Channel direction.
        role: ChannelRole,
        /// Channel action.
        action: String,
    },

    /// Close attempted before the pending `open()` finished.
    #[error("{role} `{action}` still opening")]
    StillOpening {
        /// Channel direction.
        role: ChannelRole,
        /// Channel action.
        action: String,
    },

    /// Operation requires an opened channel.
    #[error("{role} `{action}` not open")]
    NotOpen {
        /// Channel direction.
        role: ChannelRole,
        /// Channel action.
        action: String,
    },

    // ========================================================================
    // Remote Errors
    // ========================================================================
    /// The remote end closed the channel or the stream dropped.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a duplicate action error.
    #[inline]
    pub fn duplicate_action(role: ChannelRole, action: impl Into<String>) -> Self {
        Self::DuplicateAction {
            role,
            action: action.into(),
        }
    }

    /// Creates a closed forever error.
    #[inline]
    pub fn closed_forever(role: ChannelRole, action: impl Into<String>) -> Self {
        Self::ClosedForever {
            role,
            action: action.into(),
        }
    }

    /// Creates an already open error.
    #[inline]
    pub fn already_open(role: ChannelRole, action: impl Into<String>) -> Self {
        Self::AlreadyOpen {
            role,
            action: action.into(),
        }
    }

    /// Creates a still opening error.
    #[inline]
    pub fn still_opening(role: ChannelRole, action: impl Into<String>) -> Self {
        Self::StillOpening {
            role,
            action: action.into(),
        }
    }

    /// Creates a not open error.
    #[inline]
    pub fn not_open(role: ChannelRole, action: impl Into<String>) -> Self {
        Self::NotOpen {
            role,
            action: action.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::AlreadyConnected
                | Self::NotReady
                | Self::ConnectionDropped
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the remote end closed the channel.
    #[inline]
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Returns the remote error, if any.
    #[inline]
    #[must_use]
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed when `open()` or `connect()` is
    /// called again.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::NotReady
                | Self::Remote(_)
                | Self::WebSocket(_)
                | Self::ChannelClosed(_)
        )
    }
}

impl From<RemoteError> for Error {
    fn from(remote: RemoteError) -> Self {
        Self::Remote(remote)
    }
}

// ============================================================================
// RemoteError
// ============================================================================

/// Structured error reported by the remote end or by a dropped stream.
///
/// Delivered to channel error listeners and carried by [`Error::Remote`].
///
/// # Decoding
///
/// Close payloads are accepted in three shapes:
///
/// | Payload | Result |
/// |---------|--------|
/// | `"NOT_FOUND"` | kind `NOT_FOUND`, no data |
/// | `{"kind": "NOT_FOUND", "data": "x"}` | kind `NOT_FOUND`, data `"x"` |
/// | `{"NOT_FOUND": "x"}` | kind `NOT_FOUND`, data `"x"` |
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// Error kind, e.g. `STREAM_CLOSED`.
    pub kind: String,
    /// Extra data associated with the error.
    pub data: Value,
}

impl RemoteError {
    /// Kind used when the underlying connection closed.
    pub const STREAM_CLOSED: &'static str = "STREAM_CLOSED";

    /// Kind used when the remote closed without a decodable reason.
    pub const OTHER: &'static str = "Other";

    /// Creates a new remote error.
    #[inline]
    #[must_use]
    pub fn new(kind: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
        }
    }

    /// Error delivered to open channels when the connection closes.
    #[inline]
    #[must_use]
    pub fn stream_closed() -> Self {
        Self::new(Self::STREAM_CLOSED, "Stream closed")
    }

    /// Decodes a close payload.
    ///
    /// Returns `None` for an empty string or a value matching none of the
    /// accepted shapes.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(kind) if kind.is_empty() => None,
            Value::String(kind) => Some(Self::new(kind.as_str(), Value::Null)),
            Value::Object(map) => {
                if let Some(kind) = map.get("kind") {
                    let kind = match kind {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let data = map.get("data").cloned().unwrap_or(Value::Null);
                    return Some(Self::new(kind, data));
                }

                map.iter()
                    .next()
                    .map(|(kind, data)| Self::new(kind.as_str(), data.clone()))
            }
            _ => None,
        }
    }

    /// Returns the message carried in `data`.
    ///
    /// Strings are returned verbatim, `null` yields an empty string and
    /// other values are rendered as JSON.
    #[must_use]
    pub fn message(&self) -> String {
        match &self.data {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Returns `true` if this error was caused by the connection closing.
    #[inline]
    #[must_use]
    pub fn is_stream_closed(&self) -> bool {
        self.kind == Self::STREAM_CLOSED
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message())
    }
}

impl std::error::Error for RemoteError {}

// ============================================================================
// Tests
// ============================================================================
