//! One-shot history fetch for a conversation.

use std::sync::Arc;

use kupid_proto::message::{ActorId, Message};

use crate::api::ChatApi;

/// Default number of past messages fetched when a conversation opens.
pub const DEFAULT_HISTORY_LIMIT: u32 = 200;

/// Fetches a bounded window of past messages for one pair.
#[derive(Debug)]
pub struct HistoryLoader<A: ChatApi> {
    api: Arc<A>,
    limit: u32,
}

impl<A: ChatApi> Clone for HistoryLoader<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            limit: self.limit,
        }
    }
}

impl<A: ChatApi> HistoryLoader<A> {
    /// Creates a loader that fetches up to `limit` messages.
    #[must_use]
    pub const fn new(api: Arc<A>, limit: u32) -> Self {
        Self { api, limit }
    }

    /// The configured window size.
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Loads the history between `actor` and `peer` in ascending order.
    ///
    /// The server answers newest first; the result is reversed. A failed
    /// fetch is logged and yields an empty history.
    pub async fn load(&self, actor: ActorId, peer: ActorId) -> Vec<Message> {
        match self.api.history(actor, peer, self.limit).await {
            Ok(mut newest_first) => {
                newest_first.reverse();
                tracing::debug!(%actor, %peer, count = newest_first.len(), "history loaded");
                newest_first
            }
            Err(e) => {
                tracing::warn!(%actor, %peer, err = %e, "history fetch failed; starting empty");
                Vec::new()
            }
        }
    }
}
