//! Muxstream - Multiplexed channels over a single WebSocket.
//!
//! This library lets many logical, named channels share one WebSocket
//! connection to a server. Each channel is either a [`Sender`] (local end
//! sends messages) or a [`Receiver`] (local end receives messages) and is
//! identified by an *action* string.
//!
//! # Architecture
//!
//! - **[`Connection`]**: owns the socket, demultiplexes inbound frames by
//!   kind and action, and fans a socket close out to every channel
//! - **[`Sender`] / [`Receiver`]**: per-action state machines with a
//!   request/acknowledge open handshake
//! - **[`ReceiverSupervisor`]**: keeps a receiver open while it has
//!   subscribers and reopens it after drops
//!
//! Every frame on the wire is a JSON text message:
//!
//! ```json
//! { "kind": "ReceiverMessage", "action": "news", "data": { "id": 1 } }
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use muxstream::{Connection, ReceiverSupervisor, Result};
//! use serde_json::{Value, json};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let connection = Connection::new("https://example.com", "/stream")?;
//!     connection.connect()?;
//!
//!     // Outbound channel
//!     let chat = connection.new_sender("chat")?;
//!     chat.open(Value::Null).await?;
//!     chat.send(json!({ "text": "hello" }))?;
//!
//!     // Inbound channel kept open while subscribed
//!     let news = connection.new_receiver("news")?;
//!     let supervisor = ReceiverSupervisor::with_request(news, Value::Null);
//!     let subscription = supervisor.subscribe(|item| println!("{item}"))?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     subscription.unsubscribe();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`channel`] | [`Sender`], [`Receiver`] and [`ReceiverSupervisor`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`listeners`] | Callback registries |
//! | [`protocol`] | Wire frame types |
//! | [`transport`] | [`Connection`] and its configuration |

// ============================================================================
// Modules
// ============================================================================

/// Logical channels: Sender, Receiver and the receiver supervisor.
pub mod channel;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Callback registries with unsubscribe handles.
pub mod listeners;

/// Wire frame types.
pub mod protocol;

/// WebSocket transport layer.
///
/// Handles the socket lifecycle and frame routing.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Channel types
pub use channel::{
    ChannelRole, ChannelState, Opener, ParseFn, Receiver, ReceiverSupervisor, Sender,
    SupervisorState, SupervisorSubscription,
};

// Error types
pub use error::{Error, RemoteError, Result};

// Listener types
pub use listeners::{Listener, Listeners, Subscription};

// Protocol types
pub use protocol::{Frame, FrameKind};

// Transport types
pub use transport::{Connection, ConnectionBuilder, ConnectionConfig};
