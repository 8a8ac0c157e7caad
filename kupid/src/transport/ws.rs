//! WebSocket transport to the chat broker.
//!
//! Each [`WsConnector::open`] performs the WebSocket handshake and spawns one
//! pump task that owns the socket: it writes queued outbound frames, forwards
//! inbound text frames, and closes the socket when the [`Link`] is dropped.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{ChannelTarget, Connector, Link, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of each frame queue.
const FRAME_BUFFER: usize = 256;

/// Dials `<ws_base>/ws/chat?userId=..&peerId=..`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// Base URL of the broker (`ws://` or `wss://`).
    base: Url,
    /// Handshake timeout.
    connect_timeout: Duration,
    /// Capacity of the inbound and outbound frame queues.
    frame_buffer: usize,
}

impl WsConnector {
    /// Creates a connector with default timeout and buffer sizes.
    #[must_use]
    pub const fn new(base: Url) -> Self {
        Self {
            base,
            connect_timeout: CONNECT_TIMEOUT,
            frame_buffer: FRAME_BUFFER,
        }
    }

    /// Overrides the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the frame queue capacity.
    #[must_use]
    pub const fn with_frame_buffer(mut self, frames: usize) -> Self {
        self.frame_buffer = frames;
        self
    }

    /// Return the broker base URL.
    #[must_use]
    pub const fn base(&self) -> &Url {
        &self.base
    }
}

impl Connector for WsConnector {
    /// Perform the WebSocket handshake and spawn the socket pump.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the handshake does not finish in time.
    /// - [`TransportError::Unreachable`] if the broker refuses the connection.
    /// - [`TransportError::Io`] for TLS or HTTP upgrade failures.
    async fn open(&self, target: &ChannelTarget) -> Result<Link, TransportError> {
        let url = target.url(&self.base)?;

        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(%target, "broker WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(%target, err = %e, "broker WebSocket connect failed");
                    map_ws_connect_error(e)
                })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel(self.frame_buffer);
        let (in_tx, in_rx) = mpsc::channel(self.frame_buffer);
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(pump(ws_sender, ws_reader, out_rx, in_tx, stop_rx));
        tracing::debug!(%target, "broker WebSocket open");

        Ok(Link::new(out_tx, in_rx, Some(stop_tx)))
    }
}

/// Owns the socket for the lifetime of one link.
///
/// Exits, dropping `inbound` so the reader sees the end of the stream, when
/// the broker closes, the socket errors, or the link is dropped. Non-text
/// frames are ignored; binary frames holding UTF-8 are treated as text.
async fn pump(
    mut ws_sender: WsSender,
    mut ws_reader: WsReader,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<String>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => {
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                break;
            }
            frame = outbound.recv() => {
                let Some(text) = frame else {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                };
                if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                    tracing::warn!(err = %e, "broker WebSocket write failed");
                    break;
                }
            }
            msg = ws_reader.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if inbound.send(text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        if inbound.send(text).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => tracing::debug!("non-UTF-8 binary frame, skipping"),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    tracing::info!("broker WebSocket closed by server");
                    break;
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite itself.
                }
                Some(Err(e)) => {
                    tracing::warn!(err = %e, "broker WebSocket read error");
                    break;
                }
            },
        }
    }
    tracing::debug!("broker WebSocket pump exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(io_err.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Unreachable(format!(
            "broker HTTP error: status {}",
            response.status()
        )),
        other => TransportError::Io(std::io::Error::other(format!(
            "broker connection error: {other}"
        ))),
    }
}
