//! Presence endpoint replies.

use serde::{Deserialize, Serialize};

use crate::message::ActorId;

/// Reply to a heartbeat ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    /// Whether the server accepted the heartbeat.
    #[serde(default)]
    pub ok: bool,
    /// Seconds the server keeps the actor online without another ping.
    #[serde(default)]
    pub ttl: u64,
}

/// Reply listing members currently online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineReply {
    /// Whether the query succeeded.
    #[serde(default)]
    pub ok: bool,
    /// Online members, excluding the requester.
    #[serde(default)]
    pub online: Vec<ActorId>,
}

/// Presence details for one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPresence {
    /// The member described.
    #[serde(rename = "userId", alias = "actorId")]
    pub actor: ActorId,
    /// Whether the member pinged within the server's TTL.
    #[serde(default)]
    pub online: bool,
    /// Last time the member was seen, epoch seconds.
    #[serde(default)]
    pub last_seen: Option<i64>,
}
