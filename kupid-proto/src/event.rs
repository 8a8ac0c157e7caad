//! JSON frames exchanged over a conversation socket.
//!
//! Every frame is a JSON object tagged by its `type` field. The server
//! attaches extra routing fields (`roomId`) that the client ignores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ActorId, Message, MessageId};

/// Frames pushed by the broker to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundEvent {
    /// A new message in the room (including the client's own, echoed back).
    Message {
        /// The message as stored by the server.
        msg: Message,
    },
    /// The listed messages reached the recipient's client.
    #[serde(rename_all = "camelCase")]
    Delivered {
        /// Messages that were delivered.
        #[serde(default)]
        ids: Vec<MessageId>,
        /// Server-side delivery instant, when provided.
        #[serde(default)]
        delivered_at: Option<DateTime<Utc>>,
    },
    /// The listed messages were read by the recipient.
    #[serde(rename_all = "camelCase")]
    Read {
        /// Messages that were read.
        #[serde(default)]
        ids: Vec<MessageId>,
        /// Server-side read instant, when provided.
        #[serde(default)]
        read_at: Option<DateTime<Utc>>,
    },
    /// The peer pressed a key in their compose box.
    Typing,
    /// Roster snapshot of a global room.
    #[serde(rename_all = "camelCase")]
    Presence {
        /// The global room this roster belongs to.
        #[serde(default)]
        room_id: Option<String>,
        /// Members currently in the room.
        #[serde(default)]
        users: Vec<RosterEntry>,
        /// Member count as reported by the server.
        #[serde(default)]
        count: usize,
    },
    /// Any frame type this client does not understand.
    #[serde(other)]
    Unknown,
}

/// One member listed in a global room roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Member identifier.
    #[serde(rename = "userId", alias = "actorId")]
    pub actor: ActorId,
    /// Display name, if the server knows one.
    #[serde(default)]
    pub name: Option<String>,
}

/// Frames the client writes to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundEvent {
    /// Post a new message to the room.
    Message {
        /// Message body.
        content: String,
    },
    /// Best-effort "I am typing" signal.
    Typing,
    /// Everything up to and including `up_to_iso` has been read.
    #[serde(rename_all = "camelCase")]
    ReadUpTo {
        /// Inclusive upper bound, RFC 3339.
        up_to_iso: DateTime<Utc>,
    },
}
