//! Shared channel state machine.
//!
//! Both [`Sender`](super::Sender) and [`Receiver`](super::Receiver) wrap a
//! [`ChannelCore`], which owns the lifecycle state, the pending open
//! handshake and the error listeners.
//!
//! # Handshake
//!
//! At most one `open()` is in flight per channel. Its completion lives in a
//! single oneshot slot: the acknowledgment resolves it, a remote close or a
//! dropped connection rejects it.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::result::Result as StdResult;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{Error, RemoteError, Result};
use crate::listeners::{Listeners, Subscription};
use crate::protocol::Frame;
use crate::transport::connection::ConnectionInner;

use super::{ChannelRole, ChannelState};

// ============================================================================
// Types
// ============================================================================

/// Completion slot of an in-flight open handshake.
type PendingOpen = oneshot::Sender<StdResult<(), RemoteError>>;

/// Mutable part of a channel.
struct CoreState {
    state: ChannelState,
    pending: Option<PendingOpen>,
    close_subscription: Option<Subscription>,
}

// ============================================================================
// ChannelCore
// ============================================================================

/// Lifecycle and handshake shared by senders and receivers.
pub(crate) struct ChannelCore {
    role: ChannelRole,
    action: String,
    connection: Weak<ConnectionInner>,
    state: Mutex<CoreState>,
    error_listeners: Listeners<RemoteError>,
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCore")
            .field("role", &self.role)
            .field("action", &self.action)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ChannelCore - Constructor
// ============================================================================

impl ChannelCore {
    /// Creates a channel in [`ChannelState::ReadyToOpen`] and subscribes it
    /// to the connection's close event.
    pub(crate) fn new(
        role: ChannelRole,
        action: String,
        connection: &Arc<ConnectionInner>,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            role,
            action,
            connection: Arc::downgrade(connection),
            state: Mutex::new(CoreState {
                state: ChannelState::ReadyToOpen,
                pending: None,
                close_subscription: None,
            }),
            error_listeners: Listeners::new(),
        });

        let weak = Arc::downgrade(&core);
        let subscription = connection.close_listeners().add(move |_| {
            if let Some(core) = weak.upgrade() {
                core.on_connection_closed();
            }
        });
        core.state.lock().close_subscription = Some(subscription);

        core
    }
}

// ============================================================================
// ChannelCore - Accessors
// ============================================================================

impl ChannelCore {
    #[inline]
    pub(crate) fn role(&self) -> ChannelRole {
        self.role
    }

    #[inline]
    pub(crate) fn action(&self) -> &str {
        &self.action
    }

    #[inline]
    pub(crate) fn state(&self) -> ChannelState {
        self.state.lock().state
    }

    #[inline]
    pub(crate) fn error_listeners(&self) -> &Listeners<RemoteError> {
        &self.error_listeners
    }

    /// Upgrades the back-reference to the owning connection.
    fn connection(&self) -> Result<Arc<ConnectionInner>> {
        self.connection.upgrade().ok_or(Error::ConnectionDropped)
    }
}

// ============================================================================
// ChannelCore - Open
// ============================================================================

impl ChannelCore {
    /// Opens the channel.
    ///
    /// Waits for the connection, sends the request frame carrying `request`
    /// and waits for the acknowledgment.
    pub(crate) async fn open(&self, request: Value) -> Result<()> {
        let connection = self.connection()?;

        let ack = {
            let mut state = self.state.lock();
            match state.state {
                ChannelState::ReadyToOpen => {}
                ChannelState::ClosedForever => {
                    return Err(Error::closed_forever(self.role, &self.action));
                }
                _ => return Err(Error::already_open(self.role, &self.action)),
            }

            let (tx, rx) = oneshot::channel();
            state.pending = Some(tx);
            state.state = ChannelState::WaitingOnConnection;
            rx
        };

        let mut guard = OpenGuard {
            core: self,
            armed: true,
        };

        connection.wait_ready().await;
        self.state.lock().state = ChannelState::Opening;

        let request = Frame::new(self.role.request_kind(), self.action.as_str(), request);
        let result = match connection.send(&request) {
            Ok(()) => match ack.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(remote)) => Err(Error::Remote(remote)),
                Err(e) => Err(Error::ChannelClosed(e)),
            },
            Err(e) => Err(e),
        };

        guard.armed = false;

        let mut state = self.state.lock();
        state.pending = None;
        match &result {
            Ok(()) => debug!(role = %self.role, action = %self.action, "Channel opened"),
            Err(e) => {
                if state.state == ChannelState::Opening {
                    state.state = ChannelState::ReadyToOpen;
                }
                debug!(role = %self.role, action = %self.action, error = %e, "Channel open failed");
            }
        }

        result
    }
}

/// Reverts an abandoned `open()` to [`ChannelState::ReadyToOpen`].
struct OpenGuard<'a> {
    core: &'a ChannelCore,
    armed: bool,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut state = self.core.state.lock();
        if state.state.is_opening() {
            state.state = ChannelState::ReadyToOpen;
            state.pending = None;
            debug!(role = %self.core.role, action = %self.core.action, "Open cancelled");
        }
    }
}

// ============================================================================
// ChannelCore - Inbound Frames
// ============================================================================

impl ChannelCore {
    /// Handles a request or close frame routed to this channel.
    pub(crate) fn handle_frame(&self, frame: Frame) {
        if frame.kind == self.role.request_kind() {
            self.on_request_ack();
        } else if frame.kind == self.role.close_kind() {
            self.on_remote_close(&frame.data);
        } else {
            warn!(
                role = %self.role,
                action = %self.action,
                kind = %frame.kind,
                "Unexpected frame for channel"
            );
        }
    }

    /// The remote acknowledged the open request.
    fn on_request_ack(&self) {
        let mut state = self.state.lock();
        if state.state != ChannelState::Opening {
            debug!(
                role = %self.role,
                action = %self.action,
                state = ?state.state,
                "Acknowledgment without pending open"
            );
            return;
        }

        match state.pending.take() {
            Some(pending) => {
                state.state = ChannelState::Opened;
                let _ = pending.send(Ok(()));
                trace!(role = %self.role, action = %self.action, "Open acknowledged");
            }
            None => debug!(role = %self.role, action = %self.action, "Duplicate acknowledgment"),
        }
    }

    /// The remote closed the channel.
    fn on_remote_close(&self, data: &Value) {
        let error = RemoteError::from_json(data).unwrap_or_else(|| {
            if !data.is_null() && data.as_str() != Some("") {
                warn!(action = %self.action, data = %data, "Close payload is not an error");
            }
            RemoteError::new(
                RemoteError::OTHER,
                format!("{} closed unexpectedly", self.role),
            )
        });

        self.close_with_error(error);
    }

    /// The connection closed.
    fn on_connection_closed(&self) {
        let state = self.state.lock();
        if state.state < ChannelState::Opening {
            return;
        }

        self.route_error(state, RemoteError::stream_closed());
    }

    /// Rejects the pending open or reports `error` to the listeners.
    pub(crate) fn close_with_error(&self, error: RemoteError) {
        let state = self.state.lock();
        self.route_error(state, error);
    }

    fn route_error(&self, mut state: MutexGuard<'_, CoreState>, error: RemoteError) {
        match state.state {
            ChannelState::Opening => match state.pending.take() {
                Some(pending) => {
                    let _ = pending.send(Err(error));
                }
                None => debug!(action = %self.action, error = %error, "Error after acknowledgment"),
            },
            ChannelState::ClosedForever | ChannelState::WaitingOnConnection => {
                debug!(
                    role = %self.role,
                    action = %self.action,
                    state = ?state.state,
                    error = %error,
                    "Ignoring error for channel without request"
                );
            }
            ChannelState::ReadyToOpen | ChannelState::Opened => {
                state.state = ChannelState::ReadyToOpen;
                drop(state);

                debug!(role = %self.role, action = %self.action, error = %error, "Channel closed");
                self.error_listeners.trigger(&error);
            }
        }
    }
}

// ============================================================================
// ChannelCore - Outbound
// ============================================================================

impl ChannelCore {
    /// Sends a payload frame. Requires [`ChannelState::Opened`].
    pub(crate) fn send(&self, data: Value) -> Result<()> {
        if self.state() != ChannelState::Opened {
            return Err(Error::not_open(self.role, &self.action));
        }

        let connection = self.connection()?;
        connection.send(&Frame::new(self.role.message_kind(), self.action.as_str(), data))
    }

    /// Closes the channel, moving it to `next`.
    ///
    /// Returns `Ok(false)` if the channel was already closed forever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StillOpening`] while an `open()` is in flight.
    pub(crate) fn shut(self: &Arc<Self>, next: ChannelState) -> Result<bool> {
        let (was_opened, subscription) = {
            let mut state = self.state.lock();
            match state.state {
                ChannelState::ClosedForever => return Ok(false),
                ChannelState::WaitingOnConnection | ChannelState::Opening => {
                    return Err(Error::still_opening(self.role, &self.action));
                }
                ChannelState::ReadyToOpen | ChannelState::Opened => {}
            }

            let was_opened = state.state == ChannelState::Opened;
            state.state = next;
            let subscription = if next == ChannelState::ClosedForever {
                state.close_subscription.take()
            } else {
                None
            };
            (was_opened, subscription)
        };

        let connection = self.connection.upgrade();

        if was_opened {
            let frame = Frame::new(self.role.close_kind(), self.action.as_str(), Value::Null);
            match &connection {
                Some(connection) => {
                    if let Err(e) = connection.send(&frame) {
                        warn!(role = %self.role, action = %self.action, error = %e, "Could not send close frame");
                    }
                }
                None => debug!(action = %self.action, "Connection dropped, close frame skipped"),
            }
        }

        if next == ChannelState::ClosedForever {
            if let Some(connection) = &connection {
                connection.unregister(self);
            }
            if let Some(subscription) = subscription {
                subscription.unsubscribe();
            }
            debug!(role = %self.role, action = %self.action, "Channel closed forever");
        }

        Ok(true)
    }
}
