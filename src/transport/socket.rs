//! WebSocket task.
//!
//! One task per connect cycle owns the WebSocket stream. It reports the
//! transport events (open, message, error, close) back to the connection
//! and writes queued outbound frames. Each task carries the generation of
//! the socket handle it belongs to; events from a released handle are
//! ignored by the connection.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Weak;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use super::connection::ConnectionInner;

// ============================================================================
// SocketCommand
// ============================================================================

/// Commands from the connection to the socket task.
#[derive(Debug)]
pub(crate) enum SocketCommand {
    /// Write a serialized frame.
    Send(String),
    /// Close the socket.
    Close,
}

// ============================================================================
// Socket Task
// ============================================================================

/// Connects to `url` and runs the socket until it closes.
pub(crate) async fn run(
    connection: Weak<ConnectionInner>,
    generation: u64,
    url: String,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) {
    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,

        // Close requested (or handle released) before the handshake finished
        command = commands.recv() => {
            debug!(?command, "Connect aborted");
            if let Some(connection) = connection.upgrade() {
                connection.on_transport_close(generation);
            }
            return;
        }
    };

    let ws_stream = match connected {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            warn!(url = %url, error = %e, "WebSocket connect failed");
            if let Some(connection) = connection.upgrade() {
                connection.on_transport_error(generation, e.into());
            }
            return;
        }
    };

    match connection.upgrade() {
        Some(connection) => connection.on_transport_open(generation),
        None => return,
    }

    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            // Incoming frames from the remote end
            message = ws_read.next() => {
                let Some(connection) = connection.upgrade() else {
                    break;
                };

                match message {
                    Some(Ok(Message::Text(text))) => {
                        connection.on_transport_message(&text);
                    }

                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "WebSocket closed by remote");
                        let _ = ws_write.close().await;
                        connection.on_transport_close(generation);
                        break;
                    }

                    Some(Ok(Message::Binary(data))) => {
                        debug!(len = data.len(), "Ignoring non-text frame");
                    }

                    Some(Err(e)) => {
                        connection.on_transport_error(generation, e.into());
                        break;
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        connection.on_transport_close(generation);
                        break;
                    }

                    // Ping, Pong and raw frames are handled by tungstenite
                    Some(Ok(_)) => {}
                }
            }

            // Outbound frames from channels
            command = commands.recv() => {
                match command {
                    Some(SocketCommand::Send(text)) => {
                        if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                            if let Some(connection) = connection.upgrade() {
                                connection.on_transport_error(generation, e.into());
                            }
                            break;
                        }
                        trace!("Frame written");
                    }

                    Some(SocketCommand::Close) => {
                        debug!("Close requested");
                        let _ = ws_write.close().await;
                        if let Some(connection) = connection.upgrade() {
                            connection.on_transport_close(generation);
                        }
                        break;
                    }

                    None => {
                        debug!("Socket handle released");
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        }
    }

    debug!(generation, "Socket task terminated");
}
