//! REST seam: history, read marking, inbox threads and presence.
//!
//! [`ChatApi`] is the single trait every background component fetches
//! through. Implementations:
//! - [`http::HttpApi`]: the site's REST backend over `reqwest`
//! - [`memory::InMemoryApi`]: scriptable in-process backend for testing

pub mod http;
pub mod memory;

use std::future::Future;

use kupid_proto::message::{ActorId, Message, MessageId};
use kupid_proto::presence::{OnlineReply, PeerPresence, PingReply};
use kupid_proto::thread::ThreadRow;

/// Errors returned by [`ChatApi`] calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never got a response.
    #[error("request failed: {0}")]
    Http(String),

    /// The server answered with a non-success status.
    #[error("server returned status {0}")]
    Status(u16),

    /// The response body did not have the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The request URL could not be built.
    #[error("invalid endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

/// Queries for the inbox thread list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadQuery {
    /// Maximum rows returned.
    pub limit: u32,
    /// Whether global rooms are listed too.
    pub include_global: bool,
}

impl Default for ThreadQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            include_global: false,
        }
    }
}

/// The REST endpoints the engine consumes.
pub trait ChatApi: Send + Sync + 'static {
    /// Up to `limit` past messages between `actor` and `peer`, newest first.
    fn history(
        &self,
        actor: ActorId,
        peer: ActorId,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// Marks every message `peer` sent to `actor` as read.
    ///
    /// Returns the ids the server updated.
    fn mark_read(
        &self,
        actor: ActorId,
        peer: ActorId,
    ) -> impl Future<Output = Result<Vec<MessageId>, ApiError>> + Send;

    /// Inbox summary for `actor`.
    fn threads(
        &self,
        actor: ActorId,
        query: ThreadQuery,
    ) -> impl Future<Output = Result<Vec<ThreadRow>, ApiError>> + Send;

    /// Heartbeat for `actor`.
    fn ping(&self, actor: ActorId) -> impl Future<Output = Result<PingReply, ApiError>> + Send;

    /// Members currently online, without `exclude`.
    fn online(
        &self,
        exclude: ActorId,
    ) -> impl Future<Output = Result<OnlineReply, ApiError>> + Send;

    /// Presence details for one member.
    fn presence_of(
        &self,
        actor: ActorId,
    ) -> impl Future<Output = Result<PeerPresence, ApiError>> + Send;
}
