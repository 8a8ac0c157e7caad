//! Inbox thread aggregator.
//!
//! Keeps the actor's thread summaries and the global unread total. Refresh
//! requests are coalesced: while one is pending, further requests are
//! dropped, so a burst of triggers inside the debounce window costs one
//! fetch. Triggers come from channel events, a polling timer, and the
//! client regaining visibility.
//!
//! Fetches are numbered when issued. A reply older than the last one
//! applied is discarded, so a slow fetch can never overwrite newer rows.
//!
//! The first successful refresh sets the unread baseline. After that the
//! [`Cue`] rings whenever the total grows.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use kupid_proto::message::ActorId;
use kupid_proto::thread::{ThreadRow, unread_total};

use crate::api::{ChatApi, ThreadQuery};
use crate::chat::ChannelEvent;
use crate::cue::Cue;
use crate::identity::{self, IdentityProvider};

/// Shortest accepted poll period.
pub const MIN_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Tuning for a [`ThreadAggregator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadConfig {
    /// Window in which refresh requests are merged.
    pub debounce: Duration,
    /// Period of the background poll.
    pub poll: Duration,
    /// Query sent to the threads endpoint.
    pub query: ThreadQuery,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            poll: Duration::from_secs(60),
            query: ThreadQuery::default(),
        }
    }
}

/// Whether moving from `baseline` to `total` deserves a cue.
///
/// Never true for the first refresh (no baseline yet).
#[must_use]
pub fn should_cue(baseline: Option<u32>, total: u32) -> bool {
    baseline.is_some_and(|before| total > before)
}

/// Last applied fetch.
#[derive(Debug, Default)]
struct Applied {
    /// Sequence number of the fetch, 0 before any.
    seq: u64,
    /// Unread total it carried; `None` until the first success.
    baseline: Option<u32>,
}

struct Inner<A: ChatApi> {
    api: Arc<A>,
    identity: Arc<dyn IdentityProvider>,
    cue: Arc<dyn Cue>,
    config: ThreadConfig,
    pending: AtomicBool,
    issued: AtomicU64,
    applied: Mutex<Applied>,
    rows: watch::Sender<Arc<Vec<ThreadRow>>>,
    unread: watch::Sender<u32>,
    poller: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the inbox aggregator.
pub struct ThreadAggregator<A: ChatApi> {
    inner: Arc<Inner<A>>,
}

impl<A: ChatApi> Clone for ThreadAggregator<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: ChatApi> std::fmt::Debug for ThreadAggregator<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadAggregator")
            .field("threads", &self.inner.rows.borrow().len())
            .field("unread", &*self.inner.unread.borrow())
            .finish_non_exhaustive()
    }
}

impl<A: ChatApi> ThreadAggregator<A> {
    /// Creates an aggregator with no rows and an unread total of zero.
    #[must_use]
    pub fn new(
        api: Arc<A>,
        identity: Arc<dyn IdentityProvider>,
        cue: Arc<dyn Cue>,
        config: ThreadConfig,
    ) -> Self {
        let (rows, _) = watch::channel(Arc::new(Vec::new()));
        let (unread, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                api,
                identity,
                cue,
                config,
                pending: AtomicBool::new(false),
                issued: AtomicU64::new(0),
                applied: Mutex::new(Applied::default()),
                rows,
                unread,
                poller: Mutex::new(None),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Requests a refresh after the debounce window.
    ///
    /// A no-op while another request is pending.
    pub fn refresh(&self) {
        if self.inner.pending.swap(true, Ordering::AcqRel) {
            tracing::trace!("thread refresh already pending");
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.debounce).await;
            inner.pending.store(false, Ordering::Release);
            inner.fetch().await;
        });
    }

    /// Fetches immediately, bypassing the debounce.
    pub async fn refresh_now(&self) {
        self.inner.fetch().await;
    }

    /// Starts the polling timer. The first poll runs immediately.
    ///
    /// Calling it again while polling is a no-op.
    pub fn start(&self) {
        let mut poller = self.inner.poller.lock();
        if poller.is_some() {
            tracing::debug!("thread polling already running");
            return;
        }
        let this = self.clone();
        let period = self.inner.config.poll.max(MIN_POLL_PERIOD);
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.refresh();
            }
        }));
    }

    /// Refreshes whenever `events` reports a new message or a read receipt.
    ///
    /// Only one channel is watched at a time; while a watcher runs, further
    /// calls drop their receiver.
    pub fn watch_channel(&self, mut events: broadcast::Receiver<ChannelEvent>) {
        let mut watcher = self.inner.watcher.lock();
        if watcher.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!("already watching a conversation channel");
            return;
        }
        let this = self.clone();
        *watcher = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::MessageReceived(_) | ChannelEvent::Read { .. }) => {
                        this.refresh();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "thread aggregator lagged behind channel");
                        this.refresh();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Call when the client becomes visible again.
    pub fn notify_visible(&self) {
        self.refresh();
    }

    /// Stops polling and channel watching. Rows are kept.
    pub fn stop(&self) {
        if let Some(poller) = self.inner.poller.lock().take() {
            poller.abort();
        }
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }
    }

    /// Latest thread rows.
    #[must_use]
    pub fn threads(&self) -> Arc<Vec<ThreadRow>> {
        Arc::clone(&self.inner.rows.borrow())
    }

    /// Latest unread total.
    #[must_use]
    pub fn unread_total(&self) -> u32 {
        *self.inner.unread.borrow()
    }

    /// Unread count of the thread with `peer`, zero if unknown.
    #[must_use]
    pub fn unread_for(&self, peer: ActorId) -> u32 {
        self.inner
            .rows
            .borrow()
            .iter()
            .find(|row| row.peer_id == peer)
            .map_or(0, |row| row.unread_count)
    }

    /// Watches the thread rows.
    #[must_use]
    pub fn watch_threads(&self) -> watch::Receiver<Arc<Vec<ThreadRow>>> {
        self.inner.rows.subscribe()
    }

    /// Watches the unread total.
    #[must_use]
    pub fn watch_unread(&self) -> watch::Receiver<u32> {
        self.inner.unread.subscribe()
    }
}

impl<A: ChatApi> Inner<A> {
    async fn fetch(&self) {
        let Some(actor) = identity::resolve(self.identity.as_ref()) else {
            tracing::debug!("no signed-in actor; skipping thread refresh");
            return;
        };
        let seq = self.issued.fetch_add(1, Ordering::AcqRel) + 1;
        match self.api.threads(actor, self.config.query).await {
            Ok(rows) => self.apply(seq, rows),
            Err(e) => tracing::warn!(%actor, seq, err = %e, "thread refresh failed; keeping previous rows"),
        }
    }

    fn apply(&self, seq: u64, rows: Vec<ThreadRow>) {
        let total = unread_total(&rows);
        let ring = {
            let mut applied = self.applied.lock();
            if seq < applied.seq {
                tracing::debug!(seq, newer = applied.seq, "discarding stale thread refresh");
                return;
            }
            let ring = should_cue(applied.baseline, total);
            applied.seq = seq;
            applied.baseline = Some(total);

            tracing::debug!(seq, threads = rows.len(), unread = total, "threads refreshed");
            self.rows.send_replace(Arc::new(rows));
            self.unread.send_replace(total);
            ring
        };
        if ring {
            self.cue.ring();
        }
    }
}
