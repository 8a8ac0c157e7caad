//! Chat message types as they appear on the wire.
//!
//! Timestamps are RFC 3339 strings on the wire and [`DateTime<Utc>`] in
//! memory. Field names follow the server's camelCase convention; the
//! `*ActorId` spellings are accepted as aliases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable numeric identifier of a site member.
///
/// Negative values never identify a member; they name global rooms
/// (see [`crate::room::RoomId`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(i64);

impl ActorId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether this identifier can name a signed-in member.
    ///
    /// Zero and negative values are placeholders for "no user".
    #[must_use]
    pub const fn is_member(self) -> bool {
        self.0 > 0
    }

    /// Whether this identifier designates a global (public) room.
    #[must_use]
    pub const fn is_global_room(self) -> bool {
        self.0 < 0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ActorId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Opaque server-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a server-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single chat message between two actors (or posted to a global room).
///
/// Immutable apart from the acknowledgement timestamps, which only move
/// from `None` to `Some` and never back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned identity.
    pub id: MessageId,
    /// Author of the message.
    #[serde(rename = "fromUserId", alias = "fromActorId")]
    pub from: ActorId,
    /// Recipient (or the global room id).
    #[serde(rename = "toUserId", alias = "toActorId")]
    pub to: ActorId,
    /// Display name of the author, when the server includes it.
    #[serde(
        rename = "fromUserName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub from_name: Option<String>,
    /// Message body.
    pub content: String,
    /// When the server accepted the message.
    pub sent_at: DateTime<Utc>,
    /// When the recipient's client first connected after the send.
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the recipient read the message.
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Records delivery at `at` unless already delivered.
    ///
    /// Returns `true` if the message changed.
    pub fn mark_delivered(&mut self, at: DateTime<Utc>) -> bool {
        if self.delivered_at.is_some() {
            return false;
        }
        let at = self.read_at.map_or(at, |read| at.min(read));
        self.delivered_at = Some(at);
        true
    }

    /// Records a read at `at` unless already read.
    ///
    /// A message read before any delivery notice is considered delivered at
    /// the same instant, so `delivered_at <= read_at` always holds.
    /// Returns `true` if the message changed.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        let at = self.delivered_at.map_or(at, |delivered| at.max(delivered));
        self.read_at = Some(at);
        if self.delivered_at.is_none() {
            self.delivered_at = Some(at);
        }
        true
    }
}
