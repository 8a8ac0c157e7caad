//! Logical room identifiers.
//!
//! Exactly one direct-message room exists per unordered pair of members.
//! Negative peer ids name global rooms shared by everyone who joins them.

use serde::{Deserialize, Serialize};

use crate::message::ActorId;

/// Identifier of the room a conversation socket is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Resolves the room for `actor` talking to `peer`.
    ///
    /// Direct rooms are `dm:<low>:<high>`, independent of who opened them.
    /// A global-room peer id resolves to the id itself.
    #[must_use]
    pub fn for_pair(actor: ActorId, peer: ActorId) -> Self {
        if peer.is_global_room() {
            return Self(peer.to_string());
        }
        let (low, high) = if actor <= peer {
            (actor, peer)
        } else {
            (peer, actor)
        };
        Self(format!("dm:{low}:{high}"))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a global room.
    #[must_use]
    pub fn is_global(&self) -> bool {
        !self.0.starts_with("dm:")
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
