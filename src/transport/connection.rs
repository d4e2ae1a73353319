//! Multiplexed WebSocket connection.
//!
//! A [`Connection`] owns at most one WebSocket at a time and routes every
//! inbound frame to the sender or receiver registered for its action.
//!
//! # Routing
//!
//! | Frame Kind | Table |
//! |------------|-------|
//! | `SenderRequest`, `SenderClose` | senders |
//! | `ReceiverRequest`, `ReceiverMessage`, `ReceiverClose` | receivers |
//! | `SenderMessage` | dropped |
//!
//! Frames that cannot be decoded or have no matching channel are logged and
//! dropped; the remote may be stale or racing a close.
//!
//! # Lifecycle
//!
//! The connection object persists across reconnects. Each call to
//! [`Connection::connect`] creates a fresh socket handle which is released
//! again when the socket closes, after which `connect()` may be called
//! again.

// ============================================================================
// Imports
// ============================================================================

use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::channel::core::ChannelCore;
use crate::channel::receiver::ReceiverInner;
use crate::channel::{ChannelRole, Receiver, Sender};
use crate::error::{Error, Result};
use crate::listeners::{Listeners, Subscription};
use crate::protocol::{Frame, FrameKind};

use super::config::{ConnectionBuilder, ConnectionConfig};
use super::socket::{self, SocketCommand};

// ============================================================================
// Types
// ============================================================================

/// Live socket owned by the connection.
struct SocketHandle {
    /// Identifies the socket task this handle belongs to.
    generation: u64,
    /// Queue to the socket task.
    commands: mpsc::UnboundedSender<SocketCommand>,
    /// `true` once the transport is fully open and until close is requested.
    open: bool,
    /// Set by [`Connection::close`]; a late open event releases the socket.
    close_requested: bool,
}

/// Socket-related state.
#[derive(Default)]
struct SocketState {
    handle: Option<SocketHandle>,
    connected: bool,
    ready_waiters: Vec<oneshot::Sender<()>>,
    next_generation: u64,
}

// ============================================================================
// ConnectionInner
// ============================================================================

/// Shared connection state.
///
/// Channels keep a weak reference to it.
pub(crate) struct ConnectionInner {
    config: ConnectionConfig,
    socket: Mutex<SocketState>,
    open_listeners: Listeners<()>,
    error_listeners: Listeners<Error>,
    close_listeners: Listeners<()>,
    senders: Mutex<FxHashMap<String, Arc<ChannelCore>>>,
    receivers: Mutex<FxHashMap<String, Arc<ReceiverInner>>>,
}

impl ConnectionInner {
    #[inline]
    pub(crate) fn close_listeners(&self) -> &Listeners<()> {
        &self.close_listeners
    }

    /// Resolves at the next open event, or immediately if connected.
    pub(crate) async fn wait_ready(&self) {
        let ready = {
            let mut socket = self.socket.lock();
            if socket.connected {
                return;
            }

            let (tx, rx) = oneshot::channel();
            socket.ready_waiters.retain(|waiter| !waiter.is_closed());
            socket.ready_waiters.push(tx);
            rx
        };

        let _ = ready.await;
    }

    /// Serializes and queues a frame.
    pub(crate) fn send(&self, frame: &Frame) -> Result<()> {
        let text = frame.encode()?;

        let socket = self.socket.lock();
        let handle = socket
            .handle
            .as_ref()
            .filter(|handle| handle.open)
            .ok_or(Error::NotReady)?;

        handle
            .commands
            .send(SocketCommand::Send(text))
            .map_err(|_| Error::NotReady)?;

        trace!(kind = %frame.kind, action = %frame.action, "Frame queued");
        Ok(())
    }

    /// Removes a permanently closed channel from its table.
    ///
    /// Only the exact channel is removed; a newer channel registered for the
    /// same action stays.
    pub(crate) fn unregister(&self, core: &Arc<ChannelCore>) {
        let action = core.action();
        match core.role() {
            ChannelRole::Sender => {
                let mut senders = self.senders.lock();
                if senders.get(action).is_some_and(|entry| Arc::ptr_eq(entry, core)) {
                    senders.remove(action);
                }
            }
            ChannelRole::Receiver => {
                let mut receivers = self.receivers.lock();
                if receivers
                    .get(action)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.core, core))
                {
                    receivers.remove(action);
                }
            }
        }
    }
}

// ============================================================================
// ConnectionInner - Transport Events
// ============================================================================

impl ConnectionInner {
    /// Returns `true` if `generation` is the current socket.
    fn is_current(socket: &SocketState, generation: u64) -> bool {
        socket
            .handle
            .as_ref()
            .is_some_and(|handle| handle.generation == generation)
    }

    /// The transport finished opening.
    pub(crate) fn on_transport_open(&self, generation: u64) {
        let waiters = {
            let mut socket = self.socket.lock();
            let Some(handle) = socket
                .handle
                .as_mut()
                .filter(|handle| handle.generation == generation)
            else {
                return;
            };

            if handle.close_requested {
                socket.handle = None;
                debug!(generation, "Socket opened after close was requested");
                return;
            }

            handle.open = true;
            socket.connected = true;
            std::mem::take(&mut socket.ready_waiters)
        };

        info!(url = ?self.config.transport_url().ok(), "Connection established");

        for waiter in waiters {
            let _ = waiter.send(());
        }
        self.open_listeners.trigger(&());
    }

    /// A text frame arrived.
    pub(crate) fn on_transport_message(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, text = %text, "Failed to deserialize frame");
                return;
            }
        };

        trace!(kind = %frame.kind, action = %frame.action, "Frame received");

        match frame.kind {
            FrameKind::SenderRequest | FrameKind::SenderClose => {
                let sender = self.senders.lock().get(&frame.action).cloned();
                match sender {
                    Some(core) => core.handle_frame(frame),
                    None => debug!(action = %frame.action, kind = %frame.kind, "Sender not found"),
                }
            }

            FrameKind::ReceiverRequest | FrameKind::ReceiverMessage | FrameKind::ReceiverClose => {
                let receiver = self.receivers.lock().get(&frame.action).cloned();
                match receiver {
                    Some(receiver) => receiver.handle_frame(frame),
                    None => debug!(action = %frame.action, kind = %frame.kind, "Receiver not found"),
                }
            }

            FrameKind::SenderMessage => {
                warn!(action = %frame.action, "Received unexpected SenderMessage");
            }
        }
    }

    /// The transport reported an error.
    pub(crate) fn on_transport_error(&self, generation: u64, error: Error) {
        let connected = {
            let socket = self.socket.lock();
            if !Self::is_current(&socket, generation) {
                return;
            }
            socket.connected
        };

        warn!(error = %error, connected, "Transport error");
        self.error_listeners.trigger(&error);

        if connected {
            self.teardown(generation);
        } else {
            self.release(generation);
        }
    }

    /// The transport closed.
    pub(crate) fn on_transport_close(&self, generation: u64) {
        let connected = {
            let socket = self.socket.lock();
            if !Self::is_current(&socket, generation) {
                return;
            }
            socket.connected
        };

        if connected {
            self.teardown(generation);
        } else {
            debug!("Ignoring close before open");
            self.release(generation);
        }
    }

    /// Clears the connected state, releases the socket and notifies close
    /// listeners.
    fn teardown(&self, generation: u64) {
        {
            let mut socket = self.socket.lock();
            if !Self::is_current(&socket, generation) || !socket.connected {
                return;
            }
            socket.connected = false;
            socket.handle = None;
        }

        info!("Connection closed");
        self.close_listeners.trigger(&());
    }

    /// Releases a socket that never opened.
    fn release(&self, generation: u64) {
        let mut socket = self.socket.lock();
        if Self::is_current(&socket, generation) && !socket.connected {
            socket.handle = None;
            debug!(generation, "Released socket that never opened");
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Multiplexed connection to one server endpoint.
///
/// Cloning yields another handle to the same connection.
///
/// # Example
///
/// ```no_run
/// use muxstream::Connection;
/// use serde_json::Value;
///
/// # async fn example() -> muxstream::Result<()> {
/// let connection = Connection::new("http://example.com", "/stream")?;
/// connection.on_close(|| eprintln!("connection lost"));
/// connection.connect()?;
///
/// let receiver = connection.new_receiver("news")?;
/// receiver.on_message(|msg| println!("{msg}"));
/// receiver.open(Value::Null).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.inner.config.addr())
            .field("path", &self.inner.config.path())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection - Constructor
// ============================================================================

impl Connection {
    /// Creates a connection for `addr` with the channel `path`.
    ///
    /// Shortcut for `Connection::builder().addr(addr).path(path).build()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address or path is invalid.
    pub fn new(addr: impl Into<String>, path: impl Into<String>) -> Result<Self> {
        ConnectionBuilder::new().addr(addr).path(path).build()
    }

    /// Creates a builder for configuring a connection.
    #[inline]
    #[must_use]
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Creates a connection from a validated config.
    pub(crate) fn from_config(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                socket: Mutex::new(SocketState::default()),
                open_listeners: Listeners::new(),
                error_listeners: Listeners::new(),
                close_listeners: Listeners::new(),
                senders: Mutex::new(FxHashMap::default()),
                receivers: Mutex::new(FxHashMap::default()),
            }),
        }
    }
}

// ============================================================================
// Connection - Accessors
// ============================================================================

impl Connection {
    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Returns the derived WebSocket address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address is invalid.
    #[inline]
    pub fn transport_url(&self) -> Result<String> {
        self.inner.config.transport_url()
    }

    /// Returns `true` while the socket is open.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.socket.lock().connected
    }
}

// ============================================================================
// Connection - Lifecycle
// ============================================================================

impl Connection {
    /// Starts connecting if there is no socket.
    ///
    /// Returns immediately; the open event fires once the WebSocket
    /// handshake completes. Failures are reported to the error listeners.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyConnected`] if a socket is already owned
    /// - [`Error::Config`] if the address is invalid
    /// - [`Error::Connection`] if called outside a Tokio runtime
    pub fn connect(&self) -> Result<()> {
        let mut state = self.inner.socket.lock();
        if state.handle.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let url = self.inner.config.transport_url()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::connection(format!("No Tokio runtime: {e}")))?;

        let generation = state.next_generation;
        state.next_generation += 1;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        state.handle = Some(SocketHandle {
            generation,
            commands: commands_tx,
            open: false,
            close_requested: false,
        });
        drop(state);

        debug!(url = %url, generation, "Connecting");
        runtime.spawn(socket::run(
            Arc::downgrade(&self.inner),
            generation,
            url,
            commands_rx,
        ));

        Ok(())
    }

    /// Requests the socket to close.
    ///
    /// No-op without a socket. Close listeners run once the socket has
    /// closed. A socket that has not finished opening is released without
    /// open or close events; [`Connection::wait_ready`] keeps waiting.
    pub fn close(&self) {
        let mut socket = self.inner.socket.lock();
        let Some(handle) = socket.handle.as_mut() else {
            return;
        };

        handle.open = false;
        handle.close_requested = true;
        if handle.commands.send(SocketCommand::Close).is_err() {
            debug!("Socket task already gone");
        }
    }

    /// Waits until the connection is usable.
    ///
    /// Resolves at the next open event, or immediately if already connected.
    /// Never fails; close events in between are not reported here.
    pub async fn wait_ready(&self) {
        self.inner.wait_ready().await;
    }

    /// Sends a raw frame.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if the socket is not fully open
    /// - [`Error::Json`] if the frame cannot be serialized
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.inner.send(frame)
    }
}

// ============================================================================
// Connection - Channels
// ============================================================================

impl Connection {
    /// Creates and registers a sender for `action`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateAction`] if a sender for `action` exists.
    pub fn new_sender(&self, action: impl Into<String>) -> Result<Sender> {
        let mut senders = self.inner.senders.lock();
        match senders.entry(action.into()) {
            Entry::Occupied(entry) => Err(Error::duplicate_action(
                ChannelRole::Sender,
                entry.key().as_str(),
            )),
            Entry::Vacant(entry) => {
                let core = ChannelCore::new(ChannelRole::Sender, entry.key().clone(), &self.inner);
                entry.insert(Arc::clone(&core));
                debug!(action = %core.action(), "Sender registered");
                Ok(Sender::from_core(core))
            }
        }
    }

    /// Creates and registers a receiver for `action`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateAction`] if a receiver for `action` exists.
    pub fn new_receiver(&self, action: impl Into<String>) -> Result<Receiver> {
        let mut receivers = self.inner.receivers.lock();
        match receivers.entry(action.into()) {
            Entry::Occupied(entry) => Err(Error::duplicate_action(
                ChannelRole::Receiver,
                entry.key().as_str(),
            )),
            Entry::Vacant(entry) => {
                let core =
                    ChannelCore::new(ChannelRole::Receiver, entry.key().clone(), &self.inner);
                let inner = Arc::new(ReceiverInner::new(core));
                entry.insert(Arc::clone(&inner));
                debug!(action = %inner.core.action(), "Receiver registered");
                Ok(Receiver::from_inner(inner))
            }
        }
    }

    /// Returns the number of registered senders and receivers.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner.senders.lock().len() + self.inner.receivers.lock().len()
    }
}

// ============================================================================
// Connection - Events
// ============================================================================

impl Connection {
    /// Registers a listener for the open event.
    pub fn on_open<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.open_listeners.add(move |_| listener())
    }

    /// Registers a listener for transport errors.
    ///
    /// An error does not necessarily mean the connection closed; wait for
    /// the close event before calling [`Connection::connect`] again.
    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.error_listeners.add(listener)
    }

    /// Registers a listener for the close event.
    ///
    /// Every channel past its handshake has already been notified when the
    /// listener runs.
    pub fn on_close<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.close_listeners.add(move |_| listener())
    }
}

// ============================================================================
// Tests
// ============================================================================
