//! Inbound channel.
//!
//! A [`Receiver`] follows the same lifecycle as a
//! [`Sender`](super::Sender) and additionally delivers `ReceiverMessage`
//! payloads to its message listeners.
//!
//! Unlike a sender, a receiver can be closed temporarily with
//! [`Receiver::close_temporary`], which keeps its registration so `open()`
//! can be called again on the same handle.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RemoteError, Result};
use crate::listeners::{Listeners, Subscription};
use crate::protocol::{Frame, FrameKind};

use super::ChannelState;
use super::core::ChannelCore;

// ============================================================================
// Types
// ============================================================================

/// Transformation applied to every inbound payload before it reaches the
/// message listeners.
pub type ParseFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Shared receiver state, registered in the connection's receiver table.
pub(crate) struct ReceiverInner {
    pub(crate) core: Arc<ChannelCore>,
    parse_fn: RwLock<ParseFn>,
    message_listeners: Listeners<Value>,
}

impl ReceiverInner {
    /// Creates the receiver state around a registered core.
    pub(crate) fn new(core: Arc<ChannelCore>) -> Self {
        let identity: ParseFn = Arc::new(|data: Value| data);
        Self {
            core,
            parse_fn: RwLock::new(identity),
            message_listeners: Listeners::new(),
        }
    }

    /// Handles a frame routed by the connection.
    pub(crate) fn handle_frame(&self, frame: Frame) {
        if frame.kind != FrameKind::ReceiverMessage {
            self.core.handle_frame(frame);
            return;
        }

        if self.core.state() != ChannelState::Opened {
            warn!(
                action = %frame.action,
                state = ?self.core.state(),
                "Dropping message for receiver that is not open"
            );
            return;
        }

        let parse_fn = Arc::clone(&*self.parse_fn.read());
        let message = parse_fn(frame.data);
        self.message_listeners.trigger(&message);
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Inbound logical channel bound to one action.
///
/// Created by [`Connection::new_receiver`](crate::Connection::new_receiver).
/// Cloning yields another handle to the same channel.
///
/// # Example
///
/// ```no_run
/// use muxstream::Connection;
/// use serde_json::Value;
///
/// # async fn example(connection: Connection) -> muxstream::Result<()> {
/// let receiver = connection.new_receiver("events")?;
/// receiver.on_message(|msg| println!("event: {msg}"));
/// receiver.open(Value::Null).await?;
///
/// // later: stop receiving but keep the registration
/// receiver.close_temporary()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Receiver {
    pub(crate) inner: Arc<ReceiverInner>,
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("action", &self.action())
            .field("state", &self.state())
            .field("message_listeners", &self.inner.message_listeners.len())
            .finish()
    }
}

impl Receiver {
    /// Wraps registered receiver state.
    pub(crate) fn from_inner(inner: Arc<ReceiverInner>) -> Self {
        Self { inner }
    }
}

// ============================================================================
// Receiver - Accessors
// ============================================================================

impl Receiver {
    /// Returns the action this receiver is bound to.
    #[inline]
    #[must_use]
    pub fn action(&self) -> &str {
        self.inner.core.action()
    }

    /// Returns the current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.core.state()
    }

    /// Returns `true` if `open()` may be called.
    #[inline]
    #[must_use]
    pub fn is_ready_to_open(&self) -> bool {
        self.state() == ChannelState::ReadyToOpen
    }

    /// Returns `true` if messages are being delivered.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Opened
    }

    /// Returns `true` if the receiver was closed forever.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::ClosedForever
    }
}

// ============================================================================
// Receiver - Lifecycle
// ============================================================================

impl Receiver {
    /// Opens the receiver.
    ///
    /// Waits until the connection is usable, sends a `ReceiverRequest`
    /// carrying `request` and waits for the remote to acknowledge it.
    ///
    /// # Errors
    ///
    /// - [`Error::ClosedForever`](crate::Error::ClosedForever) if closed forever
    /// - [`Error::AlreadyOpen`](crate::Error::AlreadyOpen) if opening or open
    /// - [`Error::Remote`](crate::Error::Remote) if the remote rejected the
    ///   request or the connection closed during the handshake
    /// - [`Error::NotReady`](crate::Error::NotReady) if the request could not
    ///   be sent
    pub async fn open(&self, request: Value) -> Result<()> {
        self.inner.core.open(request).await
    }

    /// Closes the receiver but keeps it registered.
    ///
    /// If open, a `ReceiverClose` frame is sent; failing to send it is only
    /// logged. Afterwards the receiver is in [`ChannelState::ReadyToOpen`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::StillOpening`](crate::Error::StillOpening) while an
    /// `open()` call is in flight.
    pub fn close_temporary(&self) -> Result<()> {
        self.inner.core.shut(ChannelState::ReadyToOpen).map(|_| ())
    }

    /// Closes the receiver and unregisters it from the connection.
    ///
    /// Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StillOpening`](crate::Error::StillOpening) while an
    /// `open()` call is in flight.
    pub fn close(&self) -> Result<()> {
        self.inner.core.shut(ChannelState::ClosedForever).map(|_| ())
    }

    /// Replaces the parse function applied to inbound payloads.
    ///
    /// The function must not fail; panicking inside it is a caller bug.
    pub fn set_parse_fn<F>(&self, parse_fn: F)
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let parse_fn: ParseFn = Arc::new(parse_fn);
        *self.inner.parse_fn.write() = parse_fn;
        debug!(action = %self.action(), "Parse function replaced");
    }

    /// Registers a listener for parsed inbound messages.
    pub fn on_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.message_listeners.add(listener)
    }

    /// Registers a listener for channel errors.
    ///
    /// An error means the receiver is back in
    /// [`ChannelState::ReadyToOpen`] and `open()` may be called again.
    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RemoteError) + Send + Sync + 'static,
    {
        self.inner.core.error_listeners().add(listener)
    }
}

// ============================================================================
// Tests
// ============================================================================
