//! A signed-in chat session.
//!
//! [`ChatSession`] owns one conversation channel, the inbox aggregator and
//! the presence tracker, and runs the open sequence in the only safe
//! order: close the previous peer's link, load history, install it, mark
//! the thread read, then connect.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use kupid_proto::message::ActorId;

use crate::api::ChatApi;
use crate::chat::history::{DEFAULT_HISTORY_LIMIT, HistoryLoader};
use crate::chat::{ChannelConfig, ChannelError, ConversationChannel};
use crate::clock::Clock;
use crate::cue::Cue;
use crate::identity::{self, IdentityProvider};
use crate::presence::{HEARTBEAT_PERIOD, PresenceTracker};
use crate::threads::{ThreadAggregator, ThreadConfig};
use crate::transport::Connector;

/// Settings for every component of a [`ChatSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Conversation channel tuning.
    pub channel: ChannelConfig,
    /// Inbox aggregator tuning.
    pub threads: ThreadConfig,
    /// Past messages fetched per conversation.
    pub history_limit: u32,
    /// Presence heartbeat period.
    pub heartbeat: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            threads: ThreadConfig::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            heartbeat: HEARTBEAT_PERIOD,
        }
    }
}

/// Everything a signed-in client runs.
pub struct ChatSession<A: ChatApi> {
    api: Arc<A>,
    identity: Arc<dyn IdentityProvider>,
    channel: ConversationChannel,
    history: HistoryLoader<A>,
    threads: ThreadAggregator<A>,
    presence: PresenceTracker<A>,
    heartbeat: Duration,
    current: Mutex<Option<ActorId>>,
}

impl<A: ChatApi> std::fmt::Debug for ChatSession<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("channel", &self.channel)
            .field("threads", &self.threads)
            .field("presence", &self.presence)
            .finish_non_exhaustive()
    }
}

impl<A: ChatApi> ChatSession<A> {
    /// Builds the session's components. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new<C: Connector>(
        connector: Arc<C>,
        api: Arc<A>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        cue: Arc<dyn Cue>,
        config: SessionConfig,
    ) -> Self {
        let channel =
            ConversationChannel::spawn(connector, Arc::clone(&identity), clock, config.channel);
        let threads =
            ThreadAggregator::new(Arc::clone(&api), Arc::clone(&identity), cue, config.threads);
        Self {
            history: HistoryLoader::new(Arc::clone(&api), config.history_limit),
            presence: PresenceTracker::new(Arc::clone(&api)),
            api,
            identity,
            channel,
            threads,
            heartbeat: config.heartbeat,
            current: Mutex::new(None),
        }
    }

    /// Starts presence heartbeats, inbox polling, and inbox refreshes on
    /// channel activity.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::MissingIdentity`] if nobody is signed in.
    pub fn start(&self) -> Result<(), ChannelError> {
        let actor = self.actor()?;
        self.presence.start(actor, self.heartbeat);
        self.threads.start();
        self.threads.watch_channel(self.channel.subscribe());
        tracing::info!(%actor, "chat session started");
        Ok(())
    }

    /// Opens the conversation with `peer`.
    ///
    /// A link to a different peer is closed first, so none of its frames can
    /// land in the new log. History is installed before the connection
    /// opens, so no live message can be overwritten by it. History and
    /// mark-read failures are logged and do not stop the sequence.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::MissingIdentity`] if nobody is signed in.
    /// - [`ChannelError::Closed`] if the channel task has stopped.
    pub async fn open_conversation(&self, peer: ActorId) -> Result<(), ChannelError> {
        let actor = self.actor()?;
        let previous = self.current.lock().replace(peer);
        if let Some(previous) = previous.filter(|p| *p != peer) {
            tracing::debug!(%previous, %peer, "switching conversation");
            self.channel.disconnect().await;
        }

        let history = self.history.load(actor, peer).await;
        self.channel.install_history(history).await;

        if !peer.is_global_room() {
            match self.api.mark_read(actor, peer).await {
                Ok(updated) => {
                    tracing::debug!(%peer, updated = updated.len(), "thread marked read");
                    if !updated.is_empty() {
                        self.threads.refresh();
                    }
                }
                Err(e) => tracing::warn!(%peer, err = %e, "mark-read failed"),
            }
        }

        self.channel.connect(peer).await
    }

    /// Closes the current conversation.
    pub async fn close_conversation(&self) {
        self.current.lock().take();
        self.channel.disconnect().await;
    }

    /// Closes the conversation and stops every background task.
    pub async fn stop(&self) {
        self.close_conversation().await;
        self.threads.stop();
        self.presence.stop();
        tracing::info!("chat session stopped");
    }

    /// Peer of the open conversation, if any.
    #[must_use]
    pub fn current_peer(&self) -> Option<ActorId> {
        *self.current.lock()
    }

    /// The conversation channel.
    #[must_use]
    pub const fn channel(&self) -> &ConversationChannel {
        &self.channel
    }

    /// The inbox aggregator.
    #[must_use]
    pub const fn threads(&self) -> &ThreadAggregator<A> {
        &self.threads
    }

    /// The presence tracker.
    #[must_use]
    pub const fn presence(&self) -> &PresenceTracker<A> {
        &self.presence
    }

    fn actor(&self) -> Result<ActorId, ChannelError> {
        identity::resolve(self.identity.as_ref()).ok_or_else(|| {
            tracing::error!("no signed-in actor");
            ChannelError::MissingIdentity
        })
    }
}
