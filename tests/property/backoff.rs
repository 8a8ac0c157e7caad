//! Property-based tests for reconnect backoff and the channel state machine.
//!
//! Uses proptest to verify:
//! 1. Backoff delays never shrink, never exceed the cap, and never drop
//!    below the retry floor.
//! 2. `reset` always returns to the initial delay.
//! 3. No input sequence makes the machine dial without a target.
//! 4. After `Disconnect`, events from earlier epochs never dial or open.
//! 5. Acknowledgements keep `delivered_at <= read_at` in any order.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use kupid::chat::log::ConversationLog;
use kupid::chat::machine::{
    Action, Backoff, ChannelMachine, ConnectionState, Input, MIN_RETRY_DELAY,
};
use kupid_proto::message::{ActorId, Message, MessageId};

/// Strategy for `(initial, max)` in milliseconds.
fn arb_bounds() -> impl Strategy<Value = (u64, u64)> {
    (0u64..10_000, 0u64..120_000)
}

/// Strategy for a single machine input. Epochs are small so that stale and
/// current epochs both come up.
fn arb_input() -> impl Strategy<Value = Input> {
    prop_oneof![
        (1i64..4).prop_map(|p| Input::Connect(ActorId::new(p))),
        Just(Input::Disconnect),
        (0u64..8).prop_map(|epoch| Input::Opened { epoch }),
        (0u64..8).prop_map(|epoch| Input::OpenFailed { epoch }),
        Just(Input::Dropped),
        (0u64..8).prop_map(|epoch| Input::RetryDue { epoch }),
    ]
}

fn machine() -> ChannelMachine {
    ChannelMachine::new(Backoff::new(
        Duration::from_secs(1),
        Duration::from_secs(30),
    ))
}

proptest! {
    #[test]
    fn delays_are_monotonic_and_capped((initial, max) in arb_bounds(), steps in 1usize..40) {
        let mut backoff = Backoff::new(Duration::from_millis(initial), Duration::from_millis(max));
        let cap = backoff.max();
        let mut last = Duration::ZERO;
        for _ in 0..steps {
            let delay = backoff.next_delay();
            prop_assert!(delay >= last, "{delay:?} < {last:?}");
            prop_assert!(delay >= MIN_RETRY_DELAY);
            prop_assert!(delay <= cap);
            last = delay;
        }
        prop_assert_eq!(backoff.attempt() as usize, steps);
    }

    #[test]
    fn reset_returns_to_initial((initial, max) in arb_bounds(), steps in 0usize..20) {
        let mut backoff = Backoff::new(Duration::from_millis(initial), Duration::from_millis(max));
        let first = backoff.next_delay();
        for _ in 0..steps {
            backoff.next_delay();
        }
        backoff.reset();
        prop_assert_eq!(backoff.attempt(), 0);
        prop_assert_eq!(backoff.next_delay(), first);
    }

    #[test]
    fn never_dials_without_target(inputs in prop::collection::vec(arb_input(), 0..64)) {
        let mut m = machine();
        for input in inputs {
            let actions = m.apply(input);
            for action in &actions {
                if let Action::Dial { peer, epoch } = action {
                    prop_assert_eq!(Some(*peer), m.target());
                    prop_assert_eq!(*epoch, m.epoch());
                    prop_assert_eq!(m.state(), ConnectionState::Connecting);
                }
                if let Action::ScheduleRetry { delay, .. } = action {
                    prop_assert!(*delay <= Duration::from_secs(30));
                }
            }
            if m.target().is_none() {
                prop_assert_ne!(m.state(), ConnectionState::Open);
                prop_assert_ne!(m.state(), ConnectionState::Connecting);
            }
        }
    }

    #[test]
    fn disconnect_invalidates_pending_work(
        before in prop::collection::vec(arb_input(), 0..32),
        after in prop::collection::vec(0u64..8, 0..16),
    ) {
        let mut m = machine();
        for input in before {
            m.apply(input);
        }
        m.apply(Input::Disconnect);
        let settled = m.epoch();

        for epoch in after.into_iter().filter(|e| *e <= settled) {
            for input in [Input::RetryDue { epoch }, Input::Opened { epoch }, Input::OpenFailed { epoch }] {
                let actions = m.apply(input);
                prop_assert!(!actions.iter().any(|a| matches!(
                    a,
                    Action::Dial { .. } | Action::AcceptLink | Action::ScheduleRetry { .. }
                )), "stale epoch {epoch} produced a connect action: {actions:?}");
            }
        }
        prop_assert_eq!(m.state(), ConnectionState::Closed);
    }

    #[test]
    fn acknowledgements_keep_timestamps_ordered(
        acks in prop::collection::vec((any::<bool>(), 0usize..4, 0i64..1_000), 0..32)
    ) {
        let base = Utc.timestamp_opt(1_714_550_400, 0).unwrap();
        let mut log = ConversationLog::default();
        log.install((0..4).map(|i| Message {
            id: MessageId::new(format!("m{i}")),
            from: ActorId::new(2),
            to: ActorId::new(1),
            from_name: None,
            content: String::new(),
            sent_at: base,
            delivered_at: None,
            read_at: None,
        }).collect());

        for (read, index, secs) in acks {
            let ids = [MessageId::new(format!("m{index}"))];
            let at = base + chrono::TimeDelta::seconds(secs);
            if read {
                log.apply_read(&ids, at);
            } else {
                log.apply_delivered(&ids, at);
            }
        }

        for msg in log.snapshot().iter() {
            if let Some(read) = msg.read_at {
                prop_assert!(msg.delivered_at.is_some_and(|d| d <= read));
            }
        }
    }
}
