//! In-process [`ChatApi`] for testing.
//!
//! Every response is scripted up front and can be changed between calls.
//! Each call is recorded in a journal so tests can assert on how often and
//! in which order endpoints were hit.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use kupid_proto::message::{ActorId, Message, MessageId};
use kupid_proto::presence::{OnlineReply, PeerPresence, PingReply};
use kupid_proto::thread::ThreadRow;

use super::{ApiError, ChatApi, ThreadQuery};

/// One recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiCall {
    History { actor: ActorId, peer: ActorId, limit: u32 },
    MarkRead { actor: ActorId, peer: ActorId },
    Threads { actor: ActorId, query: ThreadQuery },
    Ping { actor: ActorId },
    Online { exclude: ActorId },
    PresenceOf { actor: ActorId },
}

/// Endpoint families that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    History,
    MarkRead,
    Threads,
    Ping,
    Online,
    PresenceOf,
}

#[derive(Debug, Default)]
struct Script {
    /// History per (actor, peer), stored newest first like the server.
    history: HashMap<(ActorId, ActorId), Vec<Message>>,
    threads: Vec<ThreadRow>,
    online: Vec<ActorId>,
    presence: HashMap<ActorId, PeerPresence>,
    failing: HashSet<Endpoint>,
    journal: Vec<ApiCall>,
}

/// Scriptable in-memory backend.
#[derive(Debug, Default)]
pub struct InMemoryApi {
    script: Mutex<Script>,
}

impl InMemoryApi {
    /// Creates a backend with empty responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the history for a pair. `newest_first` is returned as is.
    pub fn set_history(&self, actor: ActorId, peer: ActorId, newest_first: Vec<Message>) {
        self.script.lock().history.insert((actor, peer), newest_first);
    }

    /// Replaces the thread rows returned by [`ChatApi::threads`].
    pub fn set_threads(&self, rows: Vec<ThreadRow>) {
        self.script.lock().threads = rows;
    }

    /// Replaces the online set returned by [`ChatApi::online`].
    pub fn set_online(&self, online: Vec<ActorId>) {
        self.script.lock().online = online;
    }

    /// Sets the single-member presence answer for `presence.actor`.
    pub fn set_presence(&self, presence: PeerPresence) {
        self.script.lock().presence.insert(presence.actor, presence);
    }

    /// Makes every call to `endpoint` fail (or succeed again).
    pub fn set_failing(&self, endpoint: Endpoint, failing: bool) {
        let mut script = self.script.lock();
        if failing {
            script.failing.insert(endpoint);
        } else {
            script.failing.remove(&endpoint);
        }
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.script.lock().journal.clone()
    }

    /// Number of calls to `endpoint` so far.
    #[must_use]
    pub fn count(&self, endpoint: Endpoint) -> usize {
        self.script
            .lock()
            .journal
            .iter()
            .filter(|call| call.endpoint() == endpoint)
            .count()
    }

    /// Records `call` and fails it if its endpoint is scripted to fail.
    fn enter(&self, call: ApiCall) -> Result<parking_lot::MutexGuard<'_, Script>, ApiError> {
        let mut script = self.script.lock();
        script.journal.push(call);
        if script.failing.contains(&call.endpoint()) {
            return Err(ApiError::Status(503));
        }
        Ok(script)
    }
}

impl ApiCall {
    /// The endpoint this call hit.
    #[must_use]
    pub const fn endpoint(&self) -> Endpoint {
        match self {
            Self::History { .. } => Endpoint::History,
            Self::MarkRead { .. } => Endpoint::MarkRead,
            Self::Threads { .. } => Endpoint::Threads,
            Self::Ping { .. } => Endpoint::Ping,
            Self::Online { .. } => Endpoint::Online,
            Self::PresenceOf { .. } => Endpoint::PresenceOf,
        }
    }
}

impl ChatApi for InMemoryApi {
    async fn history(
        &self,
        actor: ActorId,
        peer: ActorId,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let script = self.enter(ApiCall::History { actor, peer, limit })?;
        let rows = script.history.get(&(actor, peer)).cloned().unwrap_or_default();
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(rows.into_iter().take(limit).collect())
    }

    async fn mark_read(&self, actor: ActorId, peer: ActorId) -> Result<Vec<MessageId>, ApiError> {
        let script = self.enter(ApiCall::MarkRead { actor, peer })?;
        let updated = script
            .history
            .get(&(actor, peer))
            .into_iter()
            .flatten()
            .filter(|msg| msg.to == actor && msg.read_at.is_none())
            .map(|msg| msg.id.clone())
            .collect();
        Ok(updated)
    }

    async fn threads(
        &self,
        actor: ActorId,
        query: ThreadQuery,
    ) -> Result<Vec<ThreadRow>, ApiError> {
        let script = self.enter(ApiCall::Threads { actor, query })?;
        let limit = usize::try_from(query.limit).unwrap_or(usize::MAX);
        Ok(script
            .threads
            .iter()
            .filter(|row| query.include_global || !row.is_global)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self, actor: ActorId) -> Result<PingReply, ApiError> {
        let _script = self.enter(ApiCall::Ping { actor })?;
        Ok(PingReply { ok: true, ttl: 60 })
    }

    async fn online(&self, exclude: ActorId) -> Result<OnlineReply, ApiError> {
        let script = self.enter(ApiCall::Online { exclude })?;
        Ok(OnlineReply {
            ok: true,
            online: script
                .online
                .iter()
                .copied()
                .filter(|id| *id != exclude)
                .collect(),
        })
    }

    async fn presence_of(&self, actor: ActorId) -> Result<PeerPresence, ApiError> {
        let script = self.enter(ApiCall::PresenceOf { actor })?;
        Ok(script.presence.get(&actor).cloned().unwrap_or(PeerPresence {
            actor,
            online: script.online.contains(&actor),
            last_seen: None,
        }))
    }
}
