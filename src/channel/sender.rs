//! Outbound channel.
//!
//! # Example
//!
//! ```no_run
//! use muxstream::Connection;
//! use serde_json::{Value, json};
//!
//! # async fn example() -> muxstream::Result<()> {
//! let connection = Connection::new("https://example.com", "/stream")?;
//! connection.connect()?;
//!
//! let sender = connection.new_sender("chat")?;
//! sender.on_error(|e| eprintln!("sender dropped: {e}"));
//!
//! sender.open(Value::Null).await?;
//! sender.send(json!({ "text": "hello" }))?;
//! sender.close()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{RemoteError, Result};
use crate::listeners::Subscription;

use super::ChannelState;
use super::core::ChannelCore;

// ============================================================================
// Sender
// ============================================================================

/// Outbound logical channel bound to one action.
///
/// Created by [`Connection::new_sender`](crate::Connection::new_sender).
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct Sender {
    pub(crate) core: Arc<ChannelCore>,
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("action", &self.core.action())
            .field("state", &self.core.state())
            .finish()
    }
}

// ============================================================================
// Sender - Constructor
// ============================================================================

impl Sender {
    /// Wraps a registered channel core.
    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }
}

// ============================================================================
// Sender - Accessors
// ============================================================================

impl Sender {
    /// Returns the action this sender is bound to.
    #[inline]
    #[must_use]
    pub fn action(&self) -> &str {
        self.core.action()
    }

    /// Returns the current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// Returns `true` if `open()` may be called.
    #[inline]
    #[must_use]
    pub fn is_ready_to_open(&self) -> bool {
        self.state() == ChannelState::ReadyToOpen
    }

    /// Returns `true` if messages can be sent.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Opened
    }

    /// Returns `true` if the sender was closed forever.
    ///
    /// Call [`Connection::new_sender`](crate::Connection::new_sender) to
    /// obtain a fresh sender for the same action.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::ClosedForever
    }
}

// ============================================================================
// Sender - Lifecycle
// ============================================================================

impl Sender {
    /// Opens the sender.
    ///
    /// Waits until the connection is usable, sends a `SenderRequest` carrying
    /// `request` and waits for the remote to acknowledge it.
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
        self.core.open(request).await
    }

    /// Sends a message.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`](crate::Error::NotOpen) unless opened
    /// - [`Error::NotReady`](crate::Error::NotReady) if the socket is not open
    pub fn send(&self, message: Value) -> Result<()> {
        self.core.send(message)
    }

    /// Closes the sender and unregisters it from the connection.
    ///
    /// If the sender is open a `SenderClose` frame is sent; failing to send
    /// it is only logged. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StillOpening`](crate::Error::StillOpening) while an
    /// `open()` call is in flight.
    pub fn close(&self) -> Result<()> {
        self.core.shut(ChannelState::ClosedForever).map(|_| ())
    }

    /// Registers a listener for channel errors.
    ///
    /// An error means the sender is back in
    /// [`ChannelState::ReadyToOpen`] and `open()` may be called again.
    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RemoteError) + Send + Sync + 'static,
    {
        self.core.error_listeners().add(listener)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, task};

    use crate::error::Error;
    use crate::protocol::{Frame, FrameKind};
    use crate::transport::Connection;
    use crate::transport::testing::{RemotePeer, RemoteServer, connected_pair};

    const WAIT: Duration = Duration::from_secs(5);

    fn collect_errors(sender: &Sender) -> mpsc::UnboundedReceiver<RemoteError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = sender.on_error(move |e| {
            let _ = tx.send(e.clone());
        });
        rx
    }

    async fn opened_sender(connection: &Connection, peer: &mut RemotePeer) -> Sender {
        let sender = connection.new_sender("chat").expect("new sender");
        let open = tokio::spawn({
            let sender = sender.clone();
            async move { sender.open(Value::Null).await }
        });
        peer.acknowledge().await;
        open.await.expect("join").expect("open");
        sender
    }

    #[tokio::test]
    async fn test_open_waits_for_connection() {
        let server = RemoteServer::bind().await;
        let connection = Connection::new(server.addr(), "/stream").expect("config");
        let sender = connection.new_sender("chat").expect("new sender");

        connection.connect().expect("connect");
        assert_eq!(
            connection.transport_url().expect("url"),
            format!("ws://127.0.0.1:{}/stream", server.port())
        );

        let open = tokio::spawn({
            let sender = sender.clone();
            async move { sender.open(Value::Null).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sender.state(), ChannelState::WaitingOnConnection);
        assert!(!open.is_finished());

        let mut peer = server.accept().await;
        let request = peer.recv_frame().await;
        assert_eq!(request, Frame::new(FrameKind::SenderRequest, "chat", Value::Null));
        assert!(!sender.is_ready());

        peer.send_frame(&request).await;
        timeout(WAIT, open)
            .await
            .expect("open timed out")
            .expect("join")
            .expect("open");

        assert!(sender.is_ready());
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let (connection, mut peer) = connected_pair().await;
        let sender = opened_sender(&connection, &mut peer).await;

        let err = sender.open(Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyOpen { .. }));
    }

    #[tokio::test]
    async fn test_send_requires_opened() {
        let (connection, mut peer) = connected_pair().await;
        let sender = connection.new_sender("chat").expect("new sender");

        let err = sender.send(json!(1)).unwrap_err();
        assert!(matches!(err, Error::NotOpen { .. }));

        sender.close().expect("close");
        peer.expect_silence().await;
    }

    #[tokio::test]
    async fn test_send_message() {
        let (connection, mut peer) = connected_pair().await;
        let sender = opened_sender(&connection, &mut peer).await;

        sender.send(json!({ "text": "hi" })).expect("send");

        let frame = peer.recv_frame().await;
        assert_eq!(frame.kind, FrameKind::SenderMessage);
        assert_eq!(frame.action, "chat");
        assert_eq!(frame.data, json!({ "text": "hi" }));
    }

    #[tokio::test]
    async fn test_remote_rejects_open() {
        let (connection, mut peer) = connected_pair().await;
        let sender = connection.new_sender("chat").expect("new sender");
        let mut errors = collect_errors(&sender);

        let open = tokio::spawn({
            let sender = sender.clone();
            async move { sender.open(json!({ "room": 1 })).await }
        });

        let request = peer.recv_frame().await;
        assert_eq!(request.data, json!({ "room": 1 }));
        peer.send_frame(&Frame::new(FrameKind::SenderClose, "chat", json!("FORBIDDEN")))
            .await;

        let err = timeout(WAIT, open).await.expect("timeout").expect("join").unwrap_err();
        assert_eq!(err.remote().map(|e| e.kind.as_str()), Some("FORBIDDEN"));
        assert!(sender.is_ready_to_open());
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_close_while_opened() {
        let (connection, mut peer) = connected_pair().await;
        let sender = opened_sender(&connection, &mut peer).await;
        let mut errors = collect_errors(&sender);

        peer.send_frame(&Frame::new(FrameKind::SenderClose, "chat", Value::Null))
            .await;

        let error = timeout(WAIT, errors.recv()).await.expect("timeout").expect("error");
        assert_eq!(error.kind, RemoteError::OTHER);
        assert!(sender.is_ready_to_open());
    }

    #[tokio::test]
    async fn test_connection_drop_reports_once() {
        let (connection, mut peer) = connected_pair().await;
        let sender = opened_sender(&connection, &mut peer).await;
        let mut errors = collect_errors(&sender);

        peer.close().await;

        let error = timeout(WAIT, errors.recv()).await.expect("timeout").expect("error");
        assert!(error.is_stream_closed());
        assert_eq!(sender.state(), ChannelState::ReadyToOpen);
        assert!(!connection.is_connected());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_sends_frame_and_unregisters() {
        let (connection, mut peer) = connected_pair().await;
        let sender = opened_sender(&connection, &mut peer).await;

        sender.close().expect("close");
        assert!(sender.is_closed());

        let frame = peer.recv_frame().await;
        assert_eq!(frame, Frame::new(FrameKind::SenderClose, "chat", Value::Null));

        let err = sender.open(Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::ClosedForever { .. }));

        sender.close().expect("second close is a no-op");
        let fresh = connection.new_sender("chat").expect("action is free again");
        assert!(fresh.is_ready_to_open());
    }

    #[tokio::test]
    async fn test_close_while_opening_fails() {
        let (connection, mut peer) = connected_pair().await;
        let sender = connection.new_sender("chat").expect("new sender");

        let open = tokio::spawn({
            let sender = sender.clone();
            async move { sender.open(Value::Null).await }
        });
        let _request = peer.recv_frame().await;

        let err = sender.close().unwrap_err();
        assert!(matches!(err, Error::StillOpening { .. }));

        peer.send_frame(&Frame::new(FrameKind::SenderRequest, "chat", Value::Null))
            .await;
        timeout(WAIT, open).await.expect("timeout").expect("join").expect("open");
        sender.close().expect("close after open");
    }

    #[tokio::test]
    async fn test_dropped_open_reverts_state() {
        let server = RemoteServer::bind().await;
        let connection = Connection::new(server.addr(), "/stream").expect("config");
        let sender = connection.new_sender("chat").expect("new sender");

        let mut open = task::spawn(sender.open(Value::Null));
        assert_pending!(open.poll());
        drop(open);

        assert!(sender.is_ready_to_open());
    }

    #[tokio::test]
    async fn test_connection_drop_while_opening_rejects_open() {
        let (connection, mut peer) = connected_pair().await;
        let sender = connection.new_sender("chat").expect("new sender");
        let mut errors = collect_errors(&sender);

        let open = tokio::spawn({
            let sender = sender.clone();
            async move { sender.open(Value::Null).await }
        });
        let _request = peer.recv_frame().await;
        assert_eq!(sender.state(), ChannelState::Opening);

        peer.close().await;

        let err = timeout(WAIT, open).await.expect("timeout").expect("join").unwrap_err();
        assert!(err.remote().is_some_and(RemoteError::is_stream_closed));
        assert!(sender.is_ready_to_open());
        assert!(!connection.is_connected());
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_drop_while_waiting_is_ignored() {
        let server = RemoteServer::bind().await;
        let connection = Connection::new(server.addr(), "/stream").expect("config");
        let sender = connection.new_sender("chat").expect("new sender");
        let mut errors = collect_errors(&sender);

        let open = tokio::spawn({
            let sender = sender.clone();
            async move { sender.open(Value::Null).await }
        });
        timeout(WAIT, async {
            while sender.state() != ChannelState::WaitingOnConnection {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sender never waited");

        connection.inner.close_listeners().trigger(&());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sender.state(), ChannelState::WaitingOnConnection);
        assert!(!open.is_finished());
        assert!(errors.try_recv().is_err());

        connection.connect().expect("connect");
        let mut peer = server.accept().await;
        peer.acknowledge().await;
        timeout(WAIT, open).await.expect("timeout").expect("join").expect("open");
        assert!(sender.is_ready());
    }

    #[tokio::test]
    async fn test_empty_close_payload_is_unexpected_close() {
        let (connection, mut peer) = connected_pair().await;
        let sender = opened_sender(&connection, &mut peer).await;
        let mut errors = collect_errors(&sender);

        peer.send_frame(&Frame::new(FrameKind::SenderClose, "chat", json!("")))
            .await;

        let error = timeout(WAIT, errors.recv()).await.expect("timeout").expect("error");
        assert_eq!(error.kind, RemoteError::OTHER);
        assert_eq!(error.message(), "Sender closed unexpectedly");
    }
}
