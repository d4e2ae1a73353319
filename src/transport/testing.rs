//! Loopback WebSocket peer for tests.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing_subscriber::EnvFilter;

use crate::protocol::Frame;

use super::Connection;

const WAIT: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(100);

/// Installs a test log subscriber honoring `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Local server accepting one WebSocket per `accept()` call.
pub(crate) struct RemoteServer {
    listener: TcpListener,
    port: u16,
}

impl RemoteServer {
    pub(crate) async fn bind() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        Self { listener, port }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Base address to hand to a [`Connection`].
    pub(crate) fn addr(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub(crate) async fn accept(&self) -> RemotePeer {
        let stream = self.accept_tcp().await;
        let ws = timeout(WAIT, accept_async(stream))
            .await
            .expect("handshake timed out")
            .expect("handshake");
        RemotePeer { ws }
    }

    /// Accepts the TCP connection without answering the WebSocket
    /// handshake, leaving the client stuck in connect.
    pub(crate) async fn accept_tcp(&self) -> TcpStream {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("accept timed out")
            .expect("accept");
        stream
    }
}

/// Server side of one accepted socket.
pub(crate) struct RemotePeer {
    ws: WebSocketStream<TcpStream>,
}

impl RemotePeer {
    /// Receives the next text frame, skipping control frames.
    pub(crate) async fn recv_frame(&mut self) -> Frame {
        loop {
            let message = timeout(WAIT, self.ws.next())
                .await
                .expect("frame timed out")
                .expect("socket ended")
                .expect("socket error");

            if let Message::Text(text) = message {
                return Frame::decode(&text).expect("valid frame");
            }
        }
    }

    pub(crate) async fn send_frame(&mut self, frame: &Frame) {
        let text = frame.encode().expect("encode");
        self.send_text(&text).await;
    }

    pub(crate) async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .expect("send text");
    }

    pub(crate) async fn send_binary(&mut self, data: Vec<u8>) {
        self.ws
            .send(Message::Binary(data.into()))
            .await
            .expect("send binary");
    }

    /// Receives a request frame and echoes it back as acknowledgment.
    pub(crate) async fn acknowledge(&mut self) -> Frame {
        let request = self.recv_frame().await;
        self.send_frame(&request).await;
        request
    }

    /// Asserts that no text frame arrives for a short while.
    pub(crate) async fn expect_silence(&mut self) {
        let deadline = tokio::time::Instant::now() + SILENCE;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {}", text.as_str()),
                Ok(Some(Ok(_))) => {}
                Ok(other) => panic!("socket ended: {other:?}"),
            }
        }
    }

    /// Closes the socket and drains it until the client acknowledges.
    pub(crate) async fn close(mut self) {
        let _ = self.ws.close(None).await;
        let _ = timeout(WAIT, async {
            while let Some(Ok(_)) = self.ws.next().await {}
        })
        .await;
    }
}

/// Connects a [`Connection`] to a fresh loopback peer and waits for open.
pub(crate) async fn connected_pair() -> (Connection, RemotePeer) {
    let server = RemoteServer::bind().await;
    let connection = Connection::new(server.addr(), "/stream").expect("config");
    connection.connect().expect("connect");

    let peer = server.accept().await;
    timeout(WAIT, connection.wait_ready())
        .await
        .expect("connection never opened");

    (connection, peer)
}
