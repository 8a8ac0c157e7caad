//! Loopback transport for testing.
//!
//! [`LoopbackConnector`] plays the client side of a conversation socket
//! using in-process [`tokio::sync::mpsc`] channels. Every successful
//! [`open`](Connector::open) hands the server end of the new connection, a
//! [`LoopbackSocket`], to the paired [`LoopbackBroker`], which lets a test
//! push inbound events, read what the client wrote, and drop the connection.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use tokio::sync::mpsc;

use kupid_proto::codec;
use kupid_proto::event::{InboundEvent, OutboundEvent};

use super::{ChannelTarget, Connector, Link, TransportError};

/// Client side of the in-process broker.
#[derive(Debug)]
pub struct LoopbackConnector {
    /// Hands accepted connections to the broker.
    accepted: mpsc::UnboundedSender<LoopbackSocket>,
    /// Number of upcoming `open` calls that fail.
    failures: AtomicU32,
    /// Total `open` calls, including failed ones.
    attempts: AtomicUsize,
    /// Capacity of each frame queue.
    buffer: usize,
}

/// Server side of the in-process broker.
#[derive(Debug)]
pub struct LoopbackBroker {
    /// Connections opened by the client, in dial order.
    accepted: mpsc::UnboundedReceiver<LoopbackSocket>,
}

/// Server end of one loopback connection.
///
/// Dropping it closes the connection as seen by the client.
#[derive(Debug)]
pub struct LoopbackSocket {
    /// The pair the client dialled.
    target: ChannelTarget,
    /// Frames delivered to the client.
    to_client: mpsc::Sender<String>,
    /// Frames the client wrote.
    from_client: mpsc::Receiver<String>,
}

impl LoopbackConnector {
    /// Create a connector and the broker that receives its connections.
    ///
    /// The `buffer` parameter controls the channel capacity for each direction.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use kupid::transport::loopback::LoopbackConnector;
    /// use kupid::transport::{ChannelTarget, Connector};
    /// use kupid_proto::event::InboundEvent;
    /// use kupid_proto::message::ActorId;
    ///
    /// # async fn example() {
    /// let (connector, mut broker) = LoopbackConnector::new(32);
    /// let target = ChannelTarget::new(ActorId::new(1), ActorId::new(2));
    /// let mut link = connector.open(&target).await.unwrap();
    /// let socket = broker.accept().await.unwrap();
    /// socket.push(&InboundEvent::Typing).await.unwrap();
    /// assert!(link.recv().await.is_some());
    /// # }
    /// ```
    #[must_use]
    pub fn new(buffer: usize) -> (Self, LoopbackBroker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accepted: tx,
            failures: AtomicU32::new(0),
            attempts: AtomicUsize::new(0),
            buffer,
        };
        (connector, LoopbackBroker { accepted: rx })
    }

    /// Make the next `count` dial attempts fail with
    /// [`TransportError::Unreachable`].
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of dial attempts so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackConnector {
    async fn open(&self, target: &ChannelTarget) -> Result<Link, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Unreachable(format!(
                "loopback refused {target}"
            )));
        }

        let (to_client, client_inbound) = mpsc::channel(self.buffer);
        let (client_outbound, from_client) = mpsc::channel(self.buffer);
        let socket = LoopbackSocket {
            target: *target,
            to_client,
            from_client,
        };
        self.accepted
            .send(socket)
            .map_err(|_| TransportError::Unreachable("loopback broker dropped".into()))?;

        Ok(Link::new(client_outbound, client_inbound, None))
    }
}

impl LoopbackBroker {
    /// Wait for the next connection the client opens.
    pub async fn accept(&mut self) -> Option<LoopbackSocket> {
        self.accepted.recv().await
    }

    /// Take an already-opened connection without waiting.
    pub fn try_accept(&mut self) -> Option<LoopbackSocket> {
        self.accepted.try_recv().ok()
    }
}

impl LoopbackSocket {
    /// The pair the client dialled.
    #[must_use]
    pub const fn target(&self) -> ChannelTarget {
        self.target
    }

    /// Deliver an event to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client closed the link.
    pub async fn push(&self, event: &InboundEvent) -> Result<(), TransportError> {
        let frame = codec::encode_inbound(event).map_err(std::io::Error::other)?;
        self.push_raw(frame).await
    }

    /// Deliver a raw text frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client closed the link.
    pub async fn push_raw(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        self.to_client
            .send(frame.into())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Next event the client wrote, or `None` once the client closed the link.
    ///
    /// Frames that do not decode as client events are skipped.
    pub async fn next_event(&mut self) -> Option<OutboundEvent> {
        while let Some(frame) = self.from_client.recv().await {
            match codec::decode_outbound(&frame) {
                Ok(event) => return Some(event),
                Err(e) => tracing::debug!(err = %e, "loopback: undecodable client frame"),
            }
        }
        None
    }

    /// Take a client event that has already been written, without waiting.
    pub fn try_next_event(&mut self) -> Option<OutboundEvent> {
        let frame = self.from_client.try_recv().ok()?;
        codec::decode_outbound(&frame).ok()
    }

    /// Whether the client has closed its end of the connection.
    #[must_use]
    pub fn is_closed_by_client(&self) -> bool {
        self.to_client.is_closed()
    }

    /// Drop the connection from the server side.
    pub fn close(self) {
        drop(self);
    }
}
