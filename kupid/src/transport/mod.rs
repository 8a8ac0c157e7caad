//! Transport layer abstraction for conversation sockets.
//!
//! A [`Connector`] dials the broker for one (actor, peer) pair and hands back
//! a [`Link`]: a pair of text-frame queues plus a shutdown signal. Concrete
//! implementations:
//! - [`ws::WsConnector`]: WebSocket connection to the broker
//! - [`loopback::LoopbackConnector`]: in-process broker for testing

pub mod loopback;
pub mod ws;

use kupid_proto::message::{ActorId, Message};
use kupid_proto::room::RoomId;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// Who is connecting to which room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelTarget {
    /// The signed-in member.
    pub actor: ActorId,
    /// The other participant, or a global room id.
    pub peer: ActorId,
}

impl ChannelTarget {
    /// Creates a target for `actor` talking to `peer`.
    #[must_use]
    pub const fn new(actor: ActorId, peer: ActorId) -> Self {
        Self { actor, peer }
    }

    /// The logical room this target resolves to.
    #[must_use]
    pub fn room(&self) -> RoomId {
        RoomId::for_pair(self.actor, self.peer)
    }

    /// Whether `msg` belongs to this room.
    ///
    /// A global room takes anything addressed to it; a direct room only
    /// messages exchanged between its two members.
    #[must_use]
    pub fn carries(&self, msg: &Message) -> bool {
        if self.peer.is_global_room() {
            return msg.to == self.peer;
        }
        (msg.from == self.actor && msg.to == self.peer)
            || (msg.from == self.peer && msg.to == self.actor)
    }

    /// Builds the socket URL: `<ws_base>/ws/chat?userId=<actor>&peerId=<peer>`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidTarget`] if `ws_base` cannot be joined.
    pub fn url(&self, ws_base: &Url) -> Result<Url, TransportError> {
        let mut url = ws_base
            .join("ws/chat")
            .map_err(|e| TransportError::InvalidTarget(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("userId", &self.actor.to_string())
            .append_pair("peerId", &self.peer.to_string());
        Ok(url)
    }
}

impl std::fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.actor, self.peer)
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The broker refused or could not be reached.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The outbound queue is full; the frame was not written.
    #[error("outbound queue full")]
    Backpressure,

    /// The socket URL could not be built.
    #[error("invalid socket target: {0}")]
    InvalidTarget(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One open bidirectional connection.
///
/// Dropping the link closes it. The inbound queue ends (`recv` yields
/// `None`) when the remote side closes or the connection fails.
#[derive(Debug)]
pub struct Link {
    /// Frames to write to the broker.
    outbound: mpsc::Sender<String>,
    /// Frames read from the broker.
    inbound: mpsc::Receiver<String>,
    /// Tells the connection pump to close the socket.
    shutdown: Option<oneshot::Sender<()>>,
}

impl Link {
    /// Assembles a link from its queues.
    ///
    /// `shutdown` is signalled when the link is dropped; transports without
    /// a background pump pass `None`.
    #[must_use]
    pub const fn new(
        outbound: mpsc::Sender<String>,
        inbound: mpsc::Receiver<String>,
        shutdown: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            shutdown,
        }
    }

    /// Queues a text frame for writing without waiting.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ConnectionClosed`] if the connection is gone.
    /// - [`TransportError::Backpressure`] if the outbound queue is full.
    pub fn write(&self, frame: String) -> Result<(), TransportError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    /// Receives the next inbound frame, or `None` once the connection ended.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Closes the connection.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Dials conversation sockets.
///
/// Implementations must be cheap to share: the conversation channel keeps
/// one connector for its whole lifetime and dials again on every reconnect.
pub trait Connector: Send + Sync + 'static {
    /// Opens a connection for `target`.
    ///
    /// Resolves once the transport-level handshake completed, i.e. the link
    /// is ready to carry frames.
    fn open(
        &self,
        target: &ChannelTarget,
    ) -> impl std::future::Future<Output = Result<Link, TransportError>> + Send;
}
