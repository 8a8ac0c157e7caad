// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for the conversation channel over the loopback transport.
//!
//! These tests validate:
//! - History installed before `connect` precedes live messages
//! - Acknowledgements are idempotent and never regress timestamps
//! - The typing flag clears itself after 1.5 s of silence
//! - Outbound operations are dropped unless the channel is open
//! - Malformed and unknown frames do not disturb the connection
//! - Messages for a different pair never reach the log
//! - Switching peers tears down the previous connection first

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;

use kupid::api::memory::InMemoryApi;
use kupid::chat::history::HistoryLoader;
use kupid::chat::machine::ConnectionState;
use kupid::chat::{ChannelConfig, ChannelEvent, ConversationChannel};
use kupid::clock::ManualClock;
use kupid::identity::StaticIdentity;
use kupid::transport::ChannelTarget;
use kupid::transport::loopback::{LoopbackBroker, LoopbackConnector, LoopbackSocket};
use kupid_proto::event::{InboundEvent, OutboundEvent, RosterEntry};
use kupid_proto::message::{ActorId, Message, MessageId};

const ME: ActorId = ActorId::new(1);
const PEER: ActorId = ActorId::new(2);

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_550_400 + secs, 0).unwrap()
}

fn msg(id: &str, at: i64) -> Message {
    Message {
        id: MessageId::new(id),
        from: PEER,
        to: ME,
        from_name: Some("Noa".into()),
        content: format!("text of {id}"),
        sent_at: ts(at),
        delivered_at: None,
        read_at: None,
    }
}

fn ids(list: &[&str]) -> Vec<MessageId> {
    list.iter().map(|id| MessageId::new(*id)).collect()
}

struct Harness {
    channel: ConversationChannel,
    broker: LoopbackBroker,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let (connector, broker) = LoopbackConnector::new(32);
    let clock = Arc::new(ManualClock::new(ts(1_000)));
    let channel = ConversationChannel::spawn(
        Arc::new(connector),
        Arc::new(StaticIdentity::new(ME)),
        Arc::clone(&clock) as Arc<dyn kupid::clock::Clock>,
        ChannelConfig::default(),
    );
    Harness {
        channel,
        broker,
        clock,
    }
}

/// Connect to `peer`, accept the loopback socket, and wait until Open.
async fn open(h: &mut Harness, peer: ActorId) -> LoopbackSocket {
    h.channel.connect(peer).await.unwrap();
    let socket = tokio::time::timeout(Duration::from_secs(5), h.broker.accept())
        .await
        .expect("dial timed out")
        .expect("broker closed");
    h.channel
        .watch_state()
        .wait_for(|s| *s == ConnectionState::Open)
        .await
        .unwrap();
    socket
}

/// Wait until `rx` yields an event matching `pred`.
async fn wait_for_event<F>(rx: &mut broadcast::Receiver<ChannelEvent>, pred: F) -> ChannelEvent
where
    F: Fn(&ChannelEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn log_ids(channel: &ConversationChannel) -> Vec<String> {
    channel
        .messages()
        .iter()
        .map(|m| m.id.as_str().to_string())
        .collect()
}

#[tokio::test]
async fn history_then_live_keeps_ascending_order() {
    let mut h = harness();
    let api = Arc::new(InMemoryApi::new());
    api.set_history(ME, PEER, vec![msg("m3", 3), msg("m2", 2), msg("m1", 1)]);

    let history = HistoryLoader::new(api, 200).load(ME, PEER).await;
    h.channel.install_history(history).await;
    let mut events = h.channel.subscribe();
    let socket = open(&mut h, PEER).await;

    socket
        .push(&InboundEvent::Message { msg: msg("m4", 4) })
        .await
        .unwrap();
    socket
        .push(&InboundEvent::Message { msg: msg("m5", 5) })
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, ChannelEvent::MessageReceived(m) if m.id.as_str() == "m5")
    })
    .await;

    assert_eq!(log_ids(&h.channel), ["m1", "m2", "m3", "m4", "m5"]);
    let log = h.channel.messages();
    assert!(log.windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
}

#[tokio::test]
async fn live_duplicate_of_history_is_dropped() {
    let mut h = harness();
    h.channel.install_history(vec![msg("m1", 1)]).await;
    let mut events = h.channel.subscribe();
    let socket = open(&mut h, PEER).await;

    socket
        .push(&InboundEvent::Message { msg: msg("m1", 1) })
        .await
        .unwrap();
    socket
        .push(&InboundEvent::Message { msg: msg("m2", 2) })
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, ChannelEvent::MessageReceived(m) if m.id.as_str() == "m2")
    })
    .await;

    assert_eq!(log_ids(&h.channel), ["m1", "m2"]);
}

#[tokio::test]
async fn acknowledgements_are_idempotent() {
    let mut h = harness();
    h.channel
        .install_history(vec![msg("a", 1), msg("b", 2), msg("c", 3)])
        .await;
    let mut events = h.channel.subscribe();
    let socket = open(&mut h, PEER).await;

    let delivered = InboundEvent::Delivered {
        ids: ids(&["a", "b"]),
        delivered_at: Some(ts(10)),
    };
    socket.push(&delivered).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, ChannelEvent::Delivered { .. })).await;
    let once = h.channel.messages();

    socket.push(&delivered).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, ChannelEvent::Delivered { .. })).await;
    assert_eq!(h.channel.messages(), once);

    let read = InboundEvent::Read {
        ids: ids(&["a"]),
        read_at: Some(ts(20)),
    };
    socket.push(&read).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, ChannelEvent::Read { .. })).await;
    let after_read = h.channel.messages();

    // A later read for the same id must not move the timestamp.
    let late = InboundEvent::Read {
        ids: ids(&["a"]),
        read_at: Some(ts(99)),
    };
    socket.push(&late).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, ChannelEvent::Read { .. })).await;
    assert_eq!(h.channel.messages(), after_read);

    let a = &after_read[0];
    assert_eq!(a.delivered_at, Some(ts(10)));
    assert_eq!(a.read_at, Some(ts(20)));
    assert!(after_read[2].delivered_at.is_none());
}

#[tokio::test]
async fn acknowledgement_without_timestamp_uses_clock() {
    let mut h = harness();
    h.channel.install_history(vec![msg("a", 1)]).await;
    let mut events = h.channel.subscribe();
    let socket = open(&mut h, PEER).await;

    h.clock.set(ts(500));
    socket
        .push(&InboundEvent::Read {
            ids: ids(&["a"]),
            read_at: None,
        })
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, ChannelEvent::Read { .. })).await;

    let log = h.channel.messages();
    assert_eq!(log[0].read_at, Some(ts(500)));
    assert_eq!(log[0].delivered_at, Some(ts(500)));
}

#[tokio::test(start_paused = true)]
async fn typing_flag_debounces_to_false() {
    let mut h = harness();
    let socket = open(&mut h, PEER).await;
    let mut typing = h.channel.watch_typing();

    socket.push(&InboundEvent::Typing).await.unwrap();
    typing.wait_for(|t| *t).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_400)).await;
    assert!(h.channel.is_peer_typing());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!h.channel.is_peer_typing());
}

#[tokio::test(start_paused = true)]
async fn connection_loss_clears_typing() {
    let mut h = harness();
    let socket = open(&mut h, PEER).await;
    let mut typing = h.channel.watch_typing();

    socket.push(&InboundEvent::Typing).await.unwrap();
    typing.wait_for(|t| *t).await.unwrap();
    socket.close();

    typing.wait_for(|t| !*t).await.unwrap();
    assert_ne!(h.channel.state(), ConnectionState::Open);
}

#[tokio::test]
async fn outbound_is_dropped_unless_open() {
    let mut h = harness();
    h.channel.send("too early").await;
    h.channel.send_typing().await;

    let mut socket = open(&mut h, PEER).await;
    h.channel.send("hello").await;
    h.channel.send_typing().await;
    h.channel.mark_read_up_to(ts(42)).await;

    assert_eq!(
        socket.next_event().await,
        Some(OutboundEvent::Message {
            content: "hello".into()
        })
    );
    assert_eq!(socket.next_event().await, Some(OutboundEvent::Typing));
    assert_eq!(
        socket.next_event().await,
        Some(OutboundEvent::ReadUpTo { up_to_iso: ts(42) })
    );

    h.channel.disconnect().await;
    h.channel.send("too late").await;
    assert!(socket.next_event().await.is_none(), "link closed, nothing more written");
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_skipped() {
    let mut h = harness();
    let mut events = h.channel.subscribe();
    let socket = open(&mut h, PEER).await;

    socket.push_raw("{not json").await.unwrap();
    socket.push_raw(r#"{"type":"pong"}"#).await.unwrap();
    socket.push_raw(r#"{"type":"message"}"#).await.unwrap();
    socket
        .push(&InboundEvent::Message { msg: msg("ok", 1) })
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, ChannelEvent::MessageReceived(_))).await;

    assert_eq!(log_ids(&h.channel), ["ok"]);
    assert_eq!(h.channel.state(), ConnectionState::Open);
}

#[tokio::test]
async fn message_for_another_pair_is_ignored() {
    let mut h = harness();
    let mut events = h.channel.subscribe();
    let socket = open(&mut h, PEER).await;

    let mut stray = msg("stray", 1);
    stray.from = ActorId::new(3);
    socket
        .push(&InboundEvent::Message { msg: stray })
        .await
        .unwrap();
    let mut mine = msg("mine", 2);
    mine.from = ME;
    mine.to = PEER;
    socket
        .push(&InboundEvent::Message { msg: mine })
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, ChannelEvent::MessageReceived(_))).await;

    assert_eq!(log_ids(&h.channel), ["mine"]);
}

#[tokio::test]
async fn roster_snapshot_is_replaced() {
    let mut h = harness();
    let global = ActorId::new(-1000);
    let mut events = h.channel.subscribe();
    let socket = open(&mut h, global).await;

    let entry = |id: i64, name: &str| RosterEntry {
        actor: ActorId::new(id),
        name: Some(name.into()),
    };
    socket
        .push(&InboundEvent::Presence {
            room_id: Some("-1000".into()),
            users: vec![entry(5, "Dana"), entry(8, "Omer")],
            count: 2,
        })
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, ChannelEvent::RosterChanged { count: 2 })
    })
    .await;

    socket
        .push(&InboundEvent::Presence {
            room_id: Some("-1000".into()),
            users: vec![entry(8, "Omer")],
            count: 1,
        })
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, ChannelEvent::RosterChanged { count: 1 })
    })
    .await;

    let roster = h.channel.roster();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].actor, ActorId::new(8));
}

#[tokio::test]
async fn switching_peer_closes_previous_connection() {
    let mut h = harness();
    let first = open(&mut h, PEER).await;

    let other = ActorId::new(3);
    h.channel.connect(other).await.unwrap();
    let second = h.broker.accept().await.unwrap();
    assert_eq!(second.target(), ChannelTarget::new(ME, other));

    h.channel
        .watch_state()
        .wait_for(|s| *s == ConnectionState::Open)
        .await
        .unwrap();
    assert!(first.is_closed_by_client());
    assert!(!second.is_closed_by_client());
}

#[tokio::test]
async fn reconnect_to_same_peer_while_open_is_noop() {
    let mut h = harness();
    let mut socket = open(&mut h, PEER).await;

    h.channel.connect(PEER).await.unwrap();
    h.channel.send("still here").await;

    assert_eq!(
        socket.next_event().await,
        Some(OutboundEvent::Message {
            content: "still here".into()
        })
    );
    assert!(h.broker.try_accept().is_none());
}
