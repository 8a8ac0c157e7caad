// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Inbox aggregation: refresh coalescing, unread cue rules, polling,
//! refreshes driven by conversation activity, and replies that arrive out
//! of order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use kupid::api::{ApiError, ChatApi, ThreadQuery};
use kupid::api::memory::{Endpoint, InMemoryApi};
use kupid::chat::ChannelEvent;
use kupid::chat::machine::ConnectionState;
use kupid::cue::Cue;
use kupid::identity::StaticIdentity;
use kupid::threads::{MIN_POLL_PERIOD, ThreadAggregator, ThreadConfig};
use kupid_proto::message::{ActorId, Message, MessageId};
use kupid_proto::presence::{OnlineReply, PeerPresence, PingReply};
use kupid_proto::thread::ThreadRow;

const ME: ActorId = ActorId::new(1);

#[derive(Default)]
struct CountingCue(AtomicUsize);

impl CountingCue {
    fn rings(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Cue for CountingCue {
    fn ring(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn row(peer: i64, unread: u32) -> ThreadRow {
    ThreadRow {
        room_id: format!("dm:{}:{}", ME.get().min(peer), ME.get().max(peer)),
        peer_id: ActorId::new(peer),
        last_at: Utc.timestamp_opt(1_714_550_400 + peer, 0).single(),
        last_from: Some(ActorId::new(peer)),
        last_preview: format!("hello from {peer}"),
        unread_count: unread,
        total_count: unread + 2,
        is_global: false,
    }
}

struct Inbox {
    api: Arc<InMemoryApi>,
    cue: Arc<CountingCue>,
    threads: ThreadAggregator<InMemoryApi>,
}

fn inbox() -> Inbox {
    let api = Arc::new(InMemoryApi::new());
    let cue = Arc::new(CountingCue::default());
    let threads = ThreadAggregator::new(
        Arc::clone(&api),
        Arc::new(StaticIdentity::new(ME)),
        Arc::clone(&cue) as Arc<dyn Cue>,
        ThreadConfig::default(),
    );
    Inbox { api, cue, threads }
}

/// Let a debounced refresh run to completion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test(start_paused = true)]
async fn burst_of_refreshes_costs_one_fetch() {
    let inbox = inbox();
    inbox.api.set_threads(vec![row(2, 1)]);

    for _ in 0..5 {
        inbox.threads.refresh();
    }
    settle().await;

    assert_eq!(inbox.api.count(Endpoint::Threads), 1);
    assert_eq!(inbox.threads.unread_total(), 1);

    // The window is over; the next request fetches again.
    inbox.threads.refresh();
    settle().await;
    assert_eq!(inbox.api.count(Endpoint::Threads), 2);
}

#[tokio::test(start_paused = true)]
async fn cue_rings_only_on_growth() {
    let inbox = inbox();

    let mut rings = Vec::new();
    for unread in [3, 5, 5, 2] {
        inbox.api.set_threads(vec![row(2, unread)]);
        inbox.threads.refresh_now().await;
        rings.push(inbox.cue.rings());
    }

    // 3 is the baseline, 5 grows, 5 is flat, 2 shrinks.
    assert_eq!(rings, [0, 1, 1, 1]);
    assert_eq!(inbox.threads.unread_total(), 2);
}

#[tokio::test(start_paused = true)]
async fn first_refresh_sets_baseline_silently() {
    let inbox = inbox();
    inbox.api.set_threads(vec![row(2, 7), row(3, 4)]);

    inbox.threads.refresh_now().await;

    assert_eq!(inbox.cue.rings(), 0);
    assert_eq!(inbox.threads.unread_total(), 11);
}

#[tokio::test(start_paused = true)]
async fn growth_in_any_thread_rings() {
    let inbox = inbox();
    inbox.api.set_threads(vec![row(2, 0), row(3, 1)]);
    inbox.threads.refresh_now().await;

    inbox.api.set_threads(vec![row(2, 4), row(3, 1)]);
    inbox.threads.refresh_now().await;
    assert_eq!(inbox.cue.rings(), 1);

    // Same total spread differently.
    inbox.api.set_threads(vec![row(2, 1), row(3, 4)]);
    inbox.threads.refresh_now().await;
    assert_eq!(inbox.cue.rings(), 1);
}

/// Answers thread queries from a script of (latency, rows) pairs, one per
/// call. Every other endpoint is a 404.
#[derive(Default)]
struct ScriptedThreads {
    replies: Mutex<VecDeque<(Duration, Vec<ThreadRow>)>>,
}

impl ScriptedThreads {
    fn then(&self, latency: Duration, rows: Vec<ThreadRow>) {
        self.replies.lock().push_back((latency, rows));
    }
}

impl ChatApi for ScriptedThreads {
    async fn history(&self, _: ActorId, _: ActorId, _: u32) -> Result<Vec<Message>, ApiError> {
        Err(ApiError::Status(404))
    }

    async fn mark_read(&self, _: ActorId, _: ActorId) -> Result<Vec<MessageId>, ApiError> {
        Err(ApiError::Status(404))
    }

    async fn threads(&self, _: ActorId, _: ThreadQuery) -> Result<Vec<ThreadRow>, ApiError> {
        let next = self.replies.lock().pop_front();
        let (latency, rows) = next.ok_or(ApiError::Status(404))?;
        tokio::time::sleep(latency).await;
        Ok(rows)
    }

    async fn ping(&self, _: ActorId) -> Result<PingReply, ApiError> {
        Err(ApiError::Status(404))
    }

    async fn online(&self, _: ActorId) -> Result<OnlineReply, ApiError> {
        Err(ApiError::Status(404))
    }

    async fn presence_of(&self, _: ActorId) -> Result<PeerPresence, ApiError> {
        Err(ApiError::Status(404))
    }
}

#[tokio::test(start_paused = true)]
async fn slow_stale_reply_never_overwrites_newer_rows() {
    let api = Arc::new(ScriptedThreads::default());
    let cue = Arc::new(CountingCue::default());
    let threads = ThreadAggregator::new(
        Arc::clone(&api),
        Arc::new(StaticIdentity::new(ME)),
        Arc::clone(&cue) as Arc<dyn Cue>,
        ThreadConfig::default(),
    );

    api.then(Duration::ZERO, vec![row(2, 5)]);
    threads.refresh_now().await;
    assert_eq!(threads.unread_total(), 5);

    // Issued first, answers last with an older view.
    api.then(Duration::from_millis(500), vec![row(2, 3)]);
    api.then(Duration::ZERO, vec![row(2, 5)]);
    tokio::join!(threads.refresh_now(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        threads.refresh_now().await;
    });
    assert_eq!(threads.unread_total(), 5);
    assert_eq!(threads.unread_for(ActorId::new(2)), 5);

    // The baseline is still 5, so an unchanged total stays quiet.
    api.then(Duration::ZERO, vec![row(2, 5)]);
    threads.refresh_now().await;
    assert_eq!(cue.rings(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_previous_rows() {
    let inbox = inbox();
    inbox.api.set_threads(vec![row(2, 3)]);
    inbox.threads.refresh_now().await;

    inbox.api.set_failing(Endpoint::Threads, true);
    inbox.threads.refresh_now().await;

    assert_eq!(inbox.threads.threads().len(), 1);
    assert_eq!(inbox.threads.unread_total(), 3);

    // Recovery compares against the last good baseline.
    inbox.api.set_failing(Endpoint::Threads, false);
    inbox.api.set_threads(vec![row(2, 4)]);
    inbox.threads.refresh_now().await;
    assert_eq!(inbox.cue.rings(), 1);
}

#[tokio::test(start_paused = true)]
async fn channel_activity_triggers_coalesced_refresh() {
    let inbox = inbox();
    inbox.api.set_threads(vec![row(2, 1)]);
    let (tx, rx) = broadcast::channel(16);
    inbox.threads.watch_channel(rx);

    let msg = Message {
        id: MessageId::new("m1"),
        from: ActorId::new(2),
        to: ME,
        from_name: None,
        content: "hi".into(),
        sent_at: Utc.timestamp_opt(1_714_550_400, 0).unwrap(),
        delivered_at: None,
        read_at: None,
    };
    tx.send(ChannelEvent::StateChanged(ConnectionState::Open))
        .unwrap();
    tx.send(ChannelEvent::MessageReceived(msg)).unwrap();
    tx.send(ChannelEvent::Read {
        ids: vec![MessageId::new("m1")],
    })
    .unwrap();
    tx.send(ChannelEvent::TypingChanged(true)).unwrap();
    settle().await;

    assert_eq!(inbox.api.count(Endpoint::Threads), 1);

    inbox.threads.stop();
    tx.send(ChannelEvent::Read { ids: Vec::new() }).ok();
    settle().await;
    assert_eq!(inbox.api.count(Endpoint::Threads), 1);
}

#[tokio::test(start_paused = true)]
async fn only_one_channel_is_watched() {
    let inbox = inbox();
    let (tx, _) = broadcast::channel::<ChannelEvent>(16);

    inbox.threads.watch_channel(tx.subscribe());
    inbox.threads.watch_channel(tx.subscribe());
    inbox.threads.watch_channel(tx.subscribe());
    assert_eq!(tx.receiver_count(), 1);

    // Once stopped, a new watcher may take over.
    inbox.threads.stop();
    inbox.threads.watch_channel(tx.subscribe());
    tx.send(ChannelEvent::Read { ids: Vec::new() }).unwrap();
    settle().await;
    assert_eq!(inbox.api.count(Endpoint::Threads), 1);
}

#[tokio::test(start_paused = true)]
async fn polling_refreshes_periodically() {
    let inbox = inbox();
    inbox.api.set_threads(vec![row(2, 1)]);

    inbox.threads.start();
    inbox.threads.start();
    settle().await;
    assert_eq!(inbox.api.count(Endpoint::Threads), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(inbox.api.count(Endpoint::Threads), 2);

    inbox.threads.stop();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(inbox.api.count(Endpoint::Threads), 2);
}

#[tokio::test(start_paused = true)]
async fn zero_poll_period_uses_the_minimum() {
    let api = Arc::new(InMemoryApi::new());
    let threads = ThreadAggregator::new(
        Arc::clone(&api),
        Arc::new(StaticIdentity::new(ME)),
        Arc::new(CountingCue::default()) as Arc<dyn Cue>,
        ThreadConfig {
            poll: Duration::ZERO,
            ..ThreadConfig::default()
        },
    );

    threads.start();
    settle().await;
    assert_eq!(api.count(Endpoint::Threads), 1);

    tokio::time::sleep(MIN_POLL_PERIOD).await;
    assert_eq!(api.count(Endpoint::Threads), 2);
    threads.stop();
}

#[tokio::test(start_paused = true)]
async fn visibility_requests_a_refresh() {
    let inbox = inbox();
    inbox.api.set_threads(vec![row(4, 2)]);

    inbox.threads.notify_visible();
    settle().await;

    assert_eq!(inbox.threads.unread_for(ActorId::new(4)), 2);
    assert_eq!(inbox.threads.unread_for(ActorId::new(9)), 0);
}

#[tokio::test(start_paused = true)]
async fn query_is_forwarded() {
    let api = Arc::new(InMemoryApi::new());
    let mut global = row(-1000, 0);
    global.is_global = true;
    api.set_threads(vec![global, row(2, 1), row(3, 1)]);

    let threads = ThreadAggregator::new(
        Arc::clone(&api),
        Arc::new(StaticIdentity::new(ME)),
        Arc::new(CountingCue::default()) as Arc<dyn Cue>,
        ThreadConfig {
            query: ThreadQuery {
                limit: 1,
                include_global: false,
            },
            ..ThreadConfig::default()
        },
    );
    threads.refresh_now().await;

    let rows = threads.threads();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].peer_id, ActorId::new(2));
}

#[tokio::test(start_paused = true)]
async fn anonymous_actor_never_fetches() {
    let api = Arc::new(InMemoryApi::new());
    let threads = ThreadAggregator::new(
        Arc::clone(&api),
        Arc::new(StaticIdentity::anonymous()),
        Arc::new(CountingCue::default()) as Arc<dyn Cue>,
        ThreadConfig::default(),
    );
    threads.refresh_now().await;
    assert_eq!(api.count(Endpoint::Threads), 0);
}
