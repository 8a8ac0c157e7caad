//! Connection state machine for a conversation channel.
//!
//! [`ChannelMachine`] is pure: it consumes [`Input`]s and answers with the
//! [`Action`]s the channel task must carry out. It owns the current
//! [`ConnectionState`], the designated peer, the reconnect [`Backoff`], and an
//! epoch counter. Every dial is tagged with the epoch it was issued in; any
//! result or timer from an older epoch is stale and ignored. `Disconnect`
//! and `Connect` bump the epoch, so a retry scheduled before them can never
//! resurrect the connection.

use std::time::Duration;

use kupid_proto::message::ActorId;

/// Lifecycle of the channel's single physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Dial in flight.
    Connecting,
    /// Connection up; outbound operations are allowed.
    Open,
    /// Connection down, either for good or until the next retry.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Smallest reconnect delay handed out.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Exponential reconnect delay: starts at `initial`, doubles on each
/// consecutive failure, never exceeds `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff. `initial` is raised to [`MIN_RETRY_DELAY`] and a
    /// `max` below `initial` is raised to `initial`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(MIN_RETRY_DELAY);
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Restarts the sequence at the initial delay.
    pub const fn reset(&mut self) {
        self.next = self.initial;
        self.attempt = 0;
    }

    /// The configured initial delay.
    #[must_use]
    pub const fn initial(&self) -> Duration {
        self.initial
    }

    /// The configured cap.
    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }
}

/// Something that happened to the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Caller asked to talk to `peer`.
    Connect(ActorId),
    /// Caller asked to stop.
    Disconnect,
    /// The dial issued in `epoch` succeeded.
    Opened { epoch: u64 },
    /// The dial issued in `epoch` failed.
    OpenFailed { epoch: u64 },
    /// The open connection closed or errored.
    Dropped,
    /// The retry timer armed in `epoch` fired.
    RetryDue { epoch: u64 },
}

/// What the channel task must do in response to an [`Input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Close and discard the current link, if any.
    CloseLink,
    /// Start dialling `peer`; tag the result with `epoch`.
    Dial { peer: ActorId, epoch: u64 },
    /// Install the link that the dial in the current epoch produced.
    AcceptLink,
    /// Close the link a stale dial produced.
    DiscardLink,
    /// Arm the retry timer.
    ScheduleRetry {
        delay: Duration,
        attempt: u32,
        epoch: u64,
    },
    /// Disarm the retry timer.
    CancelRetry,
    /// Reset the typing indicator to false.
    ClearTyping,
    /// Publish a new connection state.
    Publish(ConnectionState),
}

/// The conversation channel's connection state machine.
#[derive(Debug, Clone)]
pub struct ChannelMachine {
    state: ConnectionState,
    target: Option<ActorId>,
    epoch: u64,
    backoff: Backoff,
}

impl ChannelMachine {
    /// Creates an idle machine.
    #[must_use]
    pub const fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Idle,
            target: None,
            epoch: 0,
            backoff,
        }
    }

    /// Current connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// The designated peer, if the caller has not disconnected.
    #[must_use]
    pub const fn target(&self) -> Option<ActorId> {
        self.target
    }

    /// Current epoch.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Applies `input` and returns the actions to carry out, in order.
    pub fn apply(&mut self, input: Input) -> Vec<Action> {
        match input {
            Input::Connect(peer) => self.on_connect(peer),
            Input::Disconnect => self.on_disconnect(),
            Input::Opened { epoch } => self.on_opened(epoch),
            Input::OpenFailed { epoch } => {
                if epoch != self.epoch || self.state != ConnectionState::Connecting {
                    return Vec::new();
                }
                self.on_lost()
            }
            Input::Dropped => {
                if self.state != ConnectionState::Open {
                    return Vec::new();
                }
                self.on_lost()
            }
            Input::RetryDue { epoch } => self.on_retry(epoch),
        }
    }

    fn on_connect(&mut self, peer: ActorId) -> Vec<Action> {
        let live = matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        );
        if live && self.target == Some(peer) {
            return Vec::new();
        }

        self.target = Some(peer);
        self.epoch += 1;
        self.backoff.reset();
        let mut actions = vec![Action::CancelRetry];
        if live {
            actions.push(Action::CloseLink);
            actions.push(Action::ClearTyping);
        }
        self.state = ConnectionState::Connecting;
        actions.push(Action::Publish(ConnectionState::Connecting));
        actions.push(Action::Dial {
            peer,
            epoch: self.epoch,
        });
        actions
    }

    fn on_disconnect(&mut self) -> Vec<Action> {
        self.target = None;
        self.epoch += 1;
        let changed = self.state != ConnectionState::Closed;
        self.state = ConnectionState::Closed;
        let mut actions = vec![Action::CancelRetry, Action::CloseLink, Action::ClearTyping];
        if changed {
            actions.push(Action::Publish(ConnectionState::Closed));
        }
        actions
    }

    fn on_opened(&mut self, epoch: u64) -> Vec<Action> {
        if epoch != self.epoch
            || self.target.is_none()
            || self.state != ConnectionState::Connecting
        {
            return vec![Action::DiscardLink];
        }
        self.state = ConnectionState::Open;
        self.backoff.reset();
        vec![Action::AcceptLink, Action::Publish(ConnectionState::Open)]
    }

    fn on_lost(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Closed;
        let mut actions = vec![
            Action::CloseLink,
            Action::ClearTyping,
            Action::Publish(ConnectionState::Closed),
        ];
        if self.target.is_some() {
            let delay = self.backoff.next_delay();
            actions.push(Action::ScheduleRetry {
                delay,
                attempt: self.backoff.attempt(),
                epoch: self.epoch,
            });
        }
        actions
    }

    fn on_retry(&mut self, epoch: u64) -> Vec<Action> {
        let Some(peer) = self.target else {
            return Vec::new();
        };
        if epoch != self.epoch || self.state != ConnectionState::Closed {
            return Vec::new();
        }
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        vec![
            Action::Publish(ConnectionState::Connecting),
            Action::Dial {
                peer,
                epoch: self.epoch,
            },
        ]
    }
}
