//! [`ChatApi`] over the site's REST backend.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use url::Url;

use kupid_proto::message::{ActorId, Message, MessageId};
use kupid_proto::presence::{OnlineReply, PeerPresence, PingReply};
use kupid_proto::thread::ThreadRow;

use super::{ApiError, ChatApi, ThreadQuery};

/// Default per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MarkReadResponse {
    #[serde(default)]
    updated: Vec<MessageId>,
}

#[derive(Debug, Deserialize)]
struct ThreadsResponse {
    #[serde(default)]
    threads: Vec<ThreadRow>,
}

/// REST client rooted at the API base URL.
#[derive(Debug, Clone)]
pub struct HttpApi {
    http: Client,
    base: Url,
}

impl HttpApi {
    /// Creates a client for `base` (for example `https://kupid.example/api/`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] if the HTTP client cannot be built.
    pub fn new(base: Url) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Http(e.to_string()))?;
        Ok(Self { http, base })
    }

    /// Creates a client that shares an existing `reqwest` client.
    #[must_use]
    pub const fn with_client(http: Client, base: Url) -> Self {
        Self { http, base }
    }

    /// The API base URL.
    #[must_use]
    pub const fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base.join(path)?)
    }
}

impl ChatApi for HttpApi {
    async fn history(
        &self,
        actor: ActorId,
        peer: ActorId,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let body: HistoryResponse = self
            .http
            .get(self.endpoint("chat/history")?)
            .query(&[
                ("user1", actor.get().to_string()),
                ("user2", peer.get().to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages_only(body.messages))
    }

    async fn mark_read(&self, actor: ActorId, peer: ActorId) -> Result<Vec<MessageId>, ApiError> {
        let body: MarkReadResponse = self
            .http
            .get(self.endpoint("chat/mark-read")?)
            .query(&[("userId", actor.get()), ("peerId", peer.get())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.updated)
    }

    async fn threads(
        &self,
        actor: ActorId,
        query: ThreadQuery,
    ) -> Result<Vec<ThreadRow>, ApiError> {
        let body: ThreadsResponse = self
            .http
            .get(self.endpoint("chat/threads")?)
            .query(&[
                ("userId", actor.get().to_string()),
                ("limit", query.limit.to_string()),
                ("includeGlobal", query.include_global.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.threads)
    }

    async fn ping(&self, actor: ActorId) -> Result<PingReply, ApiError> {
        let reply = self
            .http
            .post(self.endpoint("presence/ping")?)
            .query(&[("userId", actor.get())])
            .json(&serde_json::json!({}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    async fn online(&self, exclude: ActorId) -> Result<OnlineReply, ApiError> {
        let reply = self
            .http
            .get(self.endpoint("presence/online")?)
            .query(&[("exclude", exclude.get())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    async fn presence_of(&self, actor: ActorId) -> Result<PeerPresence, ApiError> {
        let reply = self
            .http
            .get(self.endpoint(&format!("presence/{actor}"))?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }
}

/// Drops the `{"type":"date"}` separator rows and anything that is not a
/// message, keeping the server's order.
fn messages_only(rows: Vec<serde_json::Value>) -> Vec<Message> {
    rows.into_iter()
        .filter(|row| row.get("type").and_then(serde_json::Value::as_str) != Some("date"))
        .filter_map(|row| match serde_json::from_value::<Message>(row) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::warn!(err = %e, "skipping malformed history row");
                None
            }
        })
        .collect()
}
