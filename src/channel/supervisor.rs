//! Interest-driven receiver supervision.
//!
//! A [`ReceiverSupervisor`] opens its [`Receiver`] when the first subscriber
//! arrives, keeps retrying the open handshake while anyone is subscribed,
//! reopens after the channel drops and temporarily closes it once the last
//! subscriber leaves.
//!
//! # Pacing
//!
//! The open loop has no built-in delay between attempts. An opener that
//! calls [`Receiver::open`] is paced by the connection, since `open()`
//! waits for the connection to be ready. An opener that fails immediately
//! while subscribers remain makes the loop spin; such openers must sleep
//! themselves.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::error::{Error, RemoteError, Result};
use crate::listeners::Subscription;

use super::Receiver;

// ============================================================================
// Opener
// ============================================================================

/// Performs one open attempt for a supervised receiver.
///
/// `last_error` carries the failure of the previous attempt, if any, so the
/// opener can vary its request or surface the failure.
///
/// Implemented for async closures of the form
/// `Fn(Receiver, Option<Error>) -> impl Future<Output = Result<()>>`.
#[async_trait]
pub trait Opener: Send + Sync + 'static {
    /// Opens `receiver`, usually by calling [`Receiver::open`].
    async fn open(&self, receiver: &Receiver, last_error: Option<Error>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> Opener for F
where
    F: Fn(Receiver, Option<Error>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn open(&self, receiver: &Receiver, last_error: Option<Error>) -> Result<()> {
        self(receiver.clone(), last_error).await
    }
}

/// Opens with the same request payload on every attempt.
struct RequestOpener {
    request: Value,
}

#[async_trait]
impl Opener for RequestOpener {
    async fn open(&self, receiver: &Receiver, _last_error: Option<Error>) -> Result<()> {
        receiver.open(self.request.clone()).await
    }
}

// ============================================================================
// SupervisorState
// ============================================================================

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// No open loop is running and the receiver is not held open.
    #[default]
    ReadyToOpen,
    /// The open loop is running.
    Opening,
    /// The receiver is open for the current subscribers.
    Open,
}

// ============================================================================
// SupervisorInner
// ============================================================================

#[derive(Default)]
struct Status {
    state: SupervisorState,
    subscribers: usize,
}

struct SupervisorInner {
    receiver: Receiver,
    opener: Arc<dyn Opener>,
    status: Mutex<Status>,
    error_subscription: Mutex<Option<Subscription>>,
}

impl SupervisorInner {
    /// Restarts the open loop if the receiver dropped while open.
    fn on_receiver_error(self: &Arc<Self>, error: &RemoteError) {
        let restart = {
            let mut status = self.status.lock();
            if status.state != SupervisorState::Open {
                return;
            }

            if status.subscribers == 0 {
                status.state = SupervisorState::ReadyToOpen;
                false
            } else {
                status.state = SupervisorState::Opening;
                true
            }
        };

        if restart {
            info!(action = %self.receiver.action(), error = %error, "Receiver dropped, reopening");
            if let Err(e) = self.spawn_open_loop() {
                warn!(action = %self.receiver.action(), error = %e, "Cannot reopen receiver");
                self.status.lock().state = SupervisorState::ReadyToOpen;
            }
        }
    }

    /// Spawns the open loop on the current Tokio runtime.
    fn spawn_open_loop(self: &Arc<Self>) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::connection(format!("No Tokio runtime: {e}")))?;
        runtime.spawn(open_loop(Arc::clone(self)));
        Ok(())
    }

    /// Removes one subscriber; the last one closes the receiver.
    fn unsubscribe(&self) {
        let close = {
            let mut status = self.status.lock();
            status.subscribers = status.subscribers.saturating_sub(1);
            if status.subscribers == 0 && status.state == SupervisorState::Open {
                status.state = SupervisorState::ReadyToOpen;
                true
            } else {
                false
            }
        };

        if close {
            debug!(action = %self.receiver.action(), "Last subscriber left");
            self.close_receiver();
        }
    }

    fn close_receiver(&self) {
        if let Err(e) = self.receiver.close_temporary() {
            warn!(action = %self.receiver.action(), error = %e, "Failed to close receiver");
        }
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.error_subscription.get_mut().take() {
            subscription.unsubscribe();
        }
    }
}

/// Runs open attempts until one succeeds or interest disappears.
async fn open_loop(inner: Arc<SupervisorInner>) {
    let receiver = &inner.receiver;
    let mut last_error: Option<Error> = None;
    let mut attempt: u32 = 0;

    loop {
        {
            let mut status = inner.status.lock();
            if status.subscribers == 0 {
                status.state = SupervisorState::ReadyToOpen;
                debug!(action = %receiver.action(), "No subscribers, stopping open loop");
                return;
            }
        }

        attempt += 1;
        let opened = match inner.opener.open(receiver, last_error.take()).await {
            Ok(()) => true,
            Err(e) if receiver.is_ready() => {
                debug!(action = %receiver.action(), error = %e, "Receiver already open");
                true
            }
            Err(e) if receiver.is_closed() => {
                warn!(action = %receiver.action(), error = %e, "Receiver closed, giving up");
                inner.status.lock().state = SupervisorState::ReadyToOpen;
                return;
            }
            Err(e) => {
                debug!(action = %receiver.action(), attempt, error = %e, "Open attempt failed");
                last_error = Some(e);
                false
            }
        };

        if opened {
            let mut status = inner.status.lock();
            if status.subscribers == 0 {
                status.state = SupervisorState::ReadyToOpen;
                drop(status);

                debug!(action = %receiver.action(), "Opened without subscribers");
                inner.close_receiver();
                return;
            }

            if receiver.is_ready() {
                status.state = SupervisorState::Open;
                drop(status);

                debug!(action = %receiver.action(), attempt, "Receiver open");
                return;
            }

            debug!(action = %receiver.action(), "Receiver dropped right after open");
        }

        tokio::task::yield_now().await;
    }
}

// ============================================================================
// ReceiverSupervisor
// ============================================================================

/// Keeps a [`Receiver`] open while it has subscribers.
///
/// The open loop runs on the Tokio runtime current at subscribe time.
///
/// # Example
///
/// ```no_run
/// use muxstream::{Connection, ReceiverSupervisor};
/// use serde_json::json;
///
/// # fn example(connection: Connection) -> muxstream::Result<()> {
/// let receiver = connection.new_receiver("prices")?;
/// let supervisor = ReceiverSupervisor::with_request(receiver, json!({ "symbol": "ABC" }));
///
/// let subscription = supervisor.subscribe(|price| println!("{price}"))?;
/// // ...
/// subscription.unsubscribe();
/// # Ok(())
/// # }
/// ```
pub struct ReceiverSupervisor {
    inner: Arc<SupervisorInner>,
}

impl fmt::Debug for ReceiverSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverSupervisor")
            .field("receiver", &self.inner.receiver)
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl ReceiverSupervisor {
    /// Supervises `receiver`, opening it through `opener`.
    pub fn new(receiver: Receiver, opener: impl Opener) -> Self {
        let inner = Arc::new(SupervisorInner {
            receiver,
            opener: Arc::new(opener),
            status: Mutex::new(Status::default()),
            error_subscription: Mutex::new(None),
        });

        let weak: Weak<SupervisorInner> = Arc::downgrade(&inner);
        let subscription = inner.receiver.on_error(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.on_receiver_error(error);
            }
        });
        *inner.error_subscription.lock() = Some(subscription);

        Self { inner }
    }

    /// Supervises `receiver`, opening it with `request` on every attempt.
    pub fn with_request(receiver: Receiver, request: Value) -> Self {
        Self::new(receiver, RequestOpener { request })
    }

    /// Returns the supervised receiver.
    #[inline]
    #[must_use]
    pub fn receiver(&self) -> &Receiver {
        &self.inner.receiver
    }

    /// Returns the supervisor state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.inner.status.lock().state
    }

    /// Returns the number of active subscribers.
    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.status.lock().subscribers
    }

    /// Registers a message listener and starts opening if idle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the supervisor is idle and there is
    /// no Tokio runtime to run the open loop on. Nothing is registered in
    /// that case.
    pub fn subscribe<F>(&self, listener: F) -> Result<SupervisorSubscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let message = self.inner.receiver.on_message(listener);

        let start = {
            let mut status = self.inner.status.lock();
            status.subscribers += 1;
            if status.state == SupervisorState::ReadyToOpen {
                status.state = SupervisorState::Opening;
                true
            } else {
                false
            }
        };

        if start {
            debug!(action = %self.inner.receiver.action(), "First subscriber, opening");
            if let Err(e) = self.inner.spawn_open_loop() {
                {
                    let mut status = self.inner.status.lock();
                    status.subscribers -= 1;
                    status.state = SupervisorState::ReadyToOpen;
                }
                message.unsubscribe();
                return Err(e);
            }
        }

        Ok(SupervisorSubscription {
            supervisor: Arc::downgrade(&self.inner),
            message: Some(message),
        })
    }
}

// ============================================================================
// SupervisorSubscription
// ============================================================================

/// Handle returned by [`ReceiverSupervisor::subscribe`].
///
/// Dropping the handle keeps the subscriber registered.
pub struct SupervisorSubscription {
    supervisor: Weak<SupervisorInner>,
    message: Option<Subscription>,
}

impl SupervisorSubscription {
    /// Removes the listener; the last subscriber closes the receiver
    /// temporarily.
    pub fn unsubscribe(mut self) {
        if let Some(message) = self.message.take() {
            message.unsubscribe();
        }
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.unsubscribe();
        }
    }
}

impl fmt::Debug for SupervisorSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorSubscription")
            .field("active", &self.message.is_some())
            .finish()
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

    use crate::channel::ChannelState;
    use crate::protocol::{Frame, FrameKind};
    use crate::transport::Connection;
    use crate::transport::testing::{RemoteServer, connected_pair};

    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_for_state(supervisor: &ReceiverSupervisor, expected: SupervisorState) {
        timeout(WAIT, async {
            while supervisor.state() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("supervisor state timed out");
    }

    #[tokio::test]
    async fn test_first_subscriber_opens_once() {
        let (connection, mut peer) = connected_pair().await;
        let receiver = connection.new_receiver("feed").expect("receiver");
        let supervisor = ReceiverSupervisor::with_request(receiver, json!({ "topic": 7 }));
        assert_eq!(supervisor.state(), SupervisorState::ReadyToOpen);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = supervisor.subscribe({
            let tx = tx.clone();
            move |msg| {
                let _ = tx.send(msg.clone());
            }
        })
        .expect("subscribe");
        let second = supervisor.subscribe(move |msg| {
            let _ = tx.send(msg.clone());
        })
        .expect("subscribe");
        assert_eq!(supervisor.subscriber_count(), 2);

        let request = peer.acknowledge().await;
        assert_eq!(request, Frame::new(FrameKind::ReceiverRequest, "feed", json!({ "topic": 7 })));
        wait_for_state(&supervisor, SupervisorState::Open).await;
        peer.expect_silence().await;

        peer.send_frame(&Frame::new(FrameKind::ReceiverMessage, "feed", json!(1)))
            .await;
        for _ in 0..2 {
            let message = timeout(WAIT, rx.recv()).await.expect("timeout").expect("message");
            assert_eq!(message, json!(1));
        }

        first.unsubscribe();
        second.unsubscribe();
    }

    #[tokio::test]
    async fn test_last_subscriber_closes_once() {
        let (connection, mut peer) = connected_pair().await;
        let receiver = connection.new_receiver("feed").expect("receiver");
        let supervisor = ReceiverSupervisor::with_request(receiver, Value::Null);

        let first = supervisor.subscribe(|_| {}).expect("subscribe");
        let second = supervisor.subscribe(|_| {}).expect("subscribe");
        peer.acknowledge().await;
        wait_for_state(&supervisor, SupervisorState::Open).await;

        first.unsubscribe();
        peer.expect_silence().await;
        assert!(supervisor.receiver().is_ready());

        second.unsubscribe();
        let close = peer.recv_frame().await;
        assert_eq!(close, Frame::new(FrameKind::ReceiverClose, "feed", Value::Null));

        assert_eq!(supervisor.state(), SupervisorState::ReadyToOpen);
        assert_eq!(supervisor.subscriber_count(), 0);
        assert_eq!(supervisor.receiver().state(), ChannelState::ReadyToOpen);
        peer.expect_silence().await;
    }

    #[tokio::test]
    async fn test_retry_passes_last_error() {
        let (connection, mut peer) = connected_pair().await;
        let receiver = connection.new_receiver("feed").expect("receiver");

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let supervisor = ReceiverSupervisor::new(
            receiver,
            move |receiver: Receiver, last_error: Option<Error>| {
                let seen_tx = seen_tx.clone();
                async move {
                    let kind = last_error
                        .as_ref()
                        .and_then(Error::remote)
                        .map(|e| e.kind.clone());
                    let _ = seen_tx.send(kind);
                    receiver.open(Value::Null).await
                }
            },
        );

        let _subscription = supervisor.subscribe(|_| {}).expect("subscribe");

        let request = peer.recv_frame().await;
        assert_eq!(request.kind, FrameKind::ReceiverRequest);
        peer.send_frame(&Frame::new(FrameKind::ReceiverClose, "feed", json!("BUSY")))
            .await;

        peer.acknowledge().await;
        wait_for_state(&supervisor, SupervisorState::Open).await;

        assert_eq!(seen_rx.recv().await.expect("first attempt"), None);
        assert_eq!(
            seen_rx.recv().await.expect("second attempt"),
            Some("BUSY".to_string())
        );
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reopens_after_remote_close() {
        let (connection, mut peer) = connected_pair().await;
        let receiver = connection.new_receiver("feed").expect("receiver");
        let supervisor = ReceiverSupervisor::with_request(receiver, Value::Null);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = supervisor.subscribe(move |msg| {
            let _ = tx.send(msg.clone());
        })
        .expect("subscribe");
        peer.acknowledge().await;
        wait_for_state(&supervisor, SupervisorState::Open).await;

        peer.send_frame(&Frame::new(FrameKind::ReceiverClose, "feed", Value::Null))
            .await;

        let request = peer.acknowledge().await;
        assert_eq!(request.kind, FrameKind::ReceiverRequest);
        wait_for_state(&supervisor, SupervisorState::Open).await;
        assert!(supervisor.receiver().is_ready());

        peer.send_frame(&Frame::new(FrameKind::ReceiverMessage, "feed", json!("again")))
            .await;
        let message = timeout(WAIT, rx.recv()).await.expect("timeout").expect("message");
        assert_eq!(message, json!("again"));
    }

    #[tokio::test]
    async fn test_unsubscribe_while_opening_closes_after_ack() {
        let (connection, mut peer) = connected_pair().await;
        let receiver = connection.new_receiver("feed").expect("receiver");
        let supervisor = ReceiverSupervisor::with_request(receiver, Value::Null);

        let subscription = supervisor.subscribe(|_| {}).expect("subscribe");
        let request = peer.recv_frame().await;
        assert_eq!(supervisor.state(), SupervisorState::Opening);

        subscription.unsubscribe();
        peer.send_frame(&request).await;

        let close = peer.recv_frame().await;
        assert_eq!(close.kind, FrameKind::ReceiverClose);
        wait_for_state(&supervisor, SupervisorState::ReadyToOpen).await;
        assert!(supervisor.receiver().is_ready_to_open());
    }

    #[tokio::test]
    async fn test_closed_receiver_stops_loop() {
        let (connection, _peer) = connected_pair().await;
        let receiver = connection.new_receiver("feed").expect("receiver");
        receiver.close().expect("close");

        let supervisor = ReceiverSupervisor::with_request(receiver, Value::Null);
        let _subscription = supervisor.subscribe(|_| {}).expect("subscribe");

        wait_for_state(&supervisor, SupervisorState::ReadyToOpen).await;
        assert_eq!(supervisor.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_reopens_after_connection_drop_and_reconnect() {
        let server = RemoteServer::bind().await;
        let connection = Connection::new(server.addr(), "/stream").expect("config");
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();
        let _ = connection.on_close(move || {
            let _ = close_tx.send(());
        });

        connection.connect().expect("connect");
        let mut peer = server.accept().await;

        let receiver = connection.new_receiver("feed").expect("receiver");
        let supervisor = ReceiverSupervisor::with_request(receiver, json!("resume"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = supervisor
            .subscribe(move |msg| {
                let _ = tx.send(msg.clone());
            })
            .expect("subscribe");

        peer.acknowledge().await;
        wait_for_state(&supervisor, SupervisorState::Open).await;

        peer.close().await;
        timeout(WAIT, close_rx.recv()).await.expect("close event");
        wait_for_state(&supervisor, SupervisorState::Opening).await;
        timeout(WAIT, async {
            while supervisor.receiver().state() != ChannelState::WaitingOnConnection {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("receiver waits for the connection");

        connection.connect().expect("reconnect");
        let mut peer = server.accept().await;
        let request = peer.acknowledge().await;
        assert_eq!(request, Frame::new(FrameKind::ReceiverRequest, "feed", json!("resume")));
        wait_for_state(&supervisor, SupervisorState::Open).await;

        peer.send_frame(&Frame::new(FrameKind::ReceiverMessage, "feed", json!(2)))
            .await;
        let message = timeout(WAIT, rx.recv()).await.expect("timeout").expect("message");
        assert_eq!(message, json!(2));
    }

    #[test]
    fn test_subscribe_outside_runtime_fails() {
        let connection = Connection::new("http://example.com", "/stream").expect("config");
        let receiver = connection.new_receiver("feed").expect("receiver");
        let supervisor = ReceiverSupervisor::with_request(receiver, Value::Null);

        let err = supervisor.subscribe(|_| {}).unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(supervisor.subscriber_count(), 0);
        assert_eq!(supervisor.state(), SupervisorState::ReadyToOpen);
        assert!(supervisor.receiver().is_ready_to_open());
    }
}
