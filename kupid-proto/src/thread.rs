//! Inbox thread summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::message::ActorId;

/// Summary of one conversation as shown in the inbox.
///
/// Read-only on the client: the whole collection is replaced on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRow {
    /// Room the thread belongs to.
    pub room_id: String,
    /// The other participant (or the global room id).
    pub peer_id: ActorId,
    /// Timestamp of the last peer message; `None` when the peer never wrote.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub last_at: Option<DateTime<Utc>>,
    /// Author of the last message, if any.
    #[serde(default, rename = "lastFromUserId", alias = "lastFromActorId")]
    pub last_from: Option<ActorId>,
    /// First characters of the last message.
    #[serde(default)]
    pub last_preview: String,
    /// Messages addressed to the actor that are still unread.
    #[serde(default, rename = "unread", alias = "unreadCount")]
    pub unread_count: u32,
    /// Total messages in the thread.
    #[serde(default, rename = "count", alias = "totalCount")]
    pub total_count: u32,
    /// Set by the server for global rooms.
    #[serde(default)]
    pub is_global: bool,
}

/// Sum of unread counts over every row.
#[must_use]
pub fn unread_total(rows: &[ThreadRow]) -> u32 {
    rows.iter().map(|row| row.unread_count).sum()
}

/// The server sends `""` for threads without a peer message.
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom),
    }
}
