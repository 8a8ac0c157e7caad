//! The in-memory conversation log.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kupid_proto::message::{Message, MessageId};

/// Ordered messages of one conversation, without duplicate ids.
///
/// Owned by the channel task. Readers get [`snapshot`](Self::snapshot)s,
/// never a reference into the live log.
#[derive(Debug, Default, Clone)]
pub struct ConversationLog {
    /// Messages in arrival order (ascending `sent_at` for history).
    messages: Vec<Message>,
    /// Ids present in `messages`.
    ids: HashSet<MessageId>,
}

impl ConversationLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole log with `history`, which must already be in
    /// ascending order. Later duplicates of an id are dropped.
    pub fn install(&mut self, history: Vec<Message>) {
        self.messages.clear();
        self.ids.clear();
        for msg in history {
            self.append(msg);
        }
    }

    /// Appends a live message. Returns `false` if its id is already present.
    pub fn append(&mut self, msg: Message) -> bool {
        if !self.ids.insert(msg.id.clone()) {
            return false;
        }
        self.messages.push(msg);
        true
    }

    /// Stamps `delivered_at` on the listed messages that lack it.
    ///
    /// Returns the ids that changed.
    pub fn apply_delivered(&mut self, ids: &[MessageId], at: DateTime<Utc>) -> Vec<MessageId> {
        self.patch(ids, |msg| msg.mark_delivered(at))
    }

    /// Stamps `read_at` on the listed messages that lack it.
    ///
    /// Returns the ids that changed.
    pub fn apply_read(&mut self, ids: &[MessageId], at: DateTime<Utc>) -> Vec<MessageId> {
        self.patch(ids, |msg| msg.mark_read(at))
    }

    fn patch(
        &mut self,
        ids: &[MessageId],
        mut apply: impl FnMut(&mut Message) -> bool,
    ) -> Vec<MessageId> {
        let wanted: HashSet<&MessageId> = ids.iter().filter(|id| self.ids.contains(*id)).collect();
        if wanted.is_empty() {
            return Vec::new();
        }
        self.messages
            .iter_mut()
            .filter(|msg| wanted.contains(&msg.id))
            .filter_map(|msg| apply(msg).then(|| msg.id.clone()))
            .collect()
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The newest message, if any.
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// An immutable copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        Arc::new(self.messages.clone())
    }
}
