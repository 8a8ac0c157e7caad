//! Conversation channel: one live connection per (actor, peer) pair.
//!
//! [`ConversationChannel`] is a cheap handle to a background task that owns
//! the connection, the [`ConversationLog`] and the [`ChannelMachine`].
//! Callers talk to it over a command queue and observe it through:
//! - `watch` snapshots (log, typing flag, connection state, roster), which
//!   are replaced wholesale so readers never see a half-applied update
//! - a `broadcast` stream of [`ChannelEvent`]s, in the order the task
//!   processed them
//!
//! Commands are handled strictly in the order they were issued, so a
//! history installed before `connect` is always in the log before the
//! first live frame is applied.

pub mod history;
pub mod log;
pub mod machine;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use kupid_proto::codec;
use kupid_proto::event::{InboundEvent, OutboundEvent, RosterEntry};
use kupid_proto::message::{ActorId, Message, MessageId};

use crate::clock::Clock;
use crate::identity::{self, IdentityProvider};
use crate::transport::{ChannelTarget, Connector, Link, TransportError};

use log::ConversationLog;
use machine::{Action, Backoff, ChannelMachine, ConnectionState, Input};

/// Errors surfaced by [`ConversationChannel`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    /// No signed-in actor; the channel refuses to connect.
    #[error("no signed-in actor")]
    MissingIdentity,

    /// The channel task has stopped.
    #[error("conversation channel is gone")]
    Closed,
}

/// Tuning for a [`ConversationChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Silence after which the peer is no longer considered typing.
    pub typing_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_initial: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
    /// Capacity of the event broadcast.
    pub event_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            typing_timeout: Duration::from_millis(1500),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

/// Notifications published by the channel task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A new message was appended to the log.
    MessageReceived(Message),
    /// A `delivered` acknowledgement arrived.
    Delivered {
        /// Ids listed by the server.
        ids: Vec<MessageId>,
    },
    /// A `read` acknowledgement arrived.
    Read {
        /// Ids listed by the server.
        ids: Vec<MessageId>,
    },
    /// The peer-is-typing flag flipped.
    TypingChanged(bool),
    /// A global-room roster replaced the previous one.
    RosterChanged {
        /// Members in the new roster.
        count: usize,
    },
    /// A reconnect attempt was scheduled.
    ReconnectScheduled {
        /// Consecutive failures so far.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// History replaced the log.
    HistoryInstalled {
        /// Messages installed.
        count: usize,
    },
}

#[derive(Debug)]
enum Command {
    Connect { actor: ActorId, peer: ActorId },
    Disconnect,
    Send(String),
    Typing,
    ReadUpTo(DateTime<Utc>),
    InstallHistory(Vec<Message>, oneshot::Sender<()>),
}

/// Handle to a conversation channel task.
///
/// Cloning the handle shares the same task. The task stops, closing any
/// open connection, once every handle is dropped.
#[derive(Clone)]
pub struct ConversationChannel {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ChannelEvent>,
    log: watch::Receiver<Arc<Vec<Message>>>,
    typing: watch::Receiver<bool>,
    state: watch::Receiver<ConnectionState>,
    roster: watch::Receiver<Arc<Vec<RosterEntry>>>,
    identity: Arc<dyn IdentityProvider>,
}

impl std::fmt::Debug for ConversationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationChannel")
            .field("state", &*self.state.borrow())
            .field("messages", &self.log.borrow().len())
            .finish_non_exhaustive()
    }
}

impl ConversationChannel {
    /// Spawns the channel task on the current runtime.
    #[must_use]
    pub fn spawn<C: Connector>(
        connector: Arc<C>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        config: ChannelConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (opens_tx, opens_rx) = mpsc::channel(8);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (log_tx, log_rx) = watch::channel(Arc::new(Vec::new()));
        let (typing_tx, typing_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (roster_tx, roster_rx) = watch::channel(Arc::new(Vec::new()));

        let worker = Worker {
            connector,
            clock,
            typing_timeout: config.typing_timeout,
            machine: ChannelMachine::new(Backoff::new(
                config.reconnect_initial,
                config.reconnect_max,
            )),
            actor: None,
            link: None,
            staged: None,
            log: ConversationLog::new(),
            typing_until: None,
            retry: None,
            commands: cmd_rx,
            opens_tx,
            opens_rx,
            events: events.clone(),
            log_tx,
            typing_tx,
            state_tx,
            roster_tx,
        };
        tokio::spawn(worker.run());

        Self {
            commands: cmd_tx,
            events,
            log: log_rx,
            typing: typing_rx,
            state: state_rx,
            roster: roster_rx,
            identity,
        }
    }

    /// Starts talking to `peer`, replacing any other connection.
    ///
    /// Transport failures are never returned; they drive reconnection.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::MissingIdentity`] if nobody is signed in. The
    ///   channel does not leave its current state.
    /// - [`ChannelError::Closed`] if the channel task has stopped.
    pub async fn connect(&self, peer: ActorId) -> Result<(), ChannelError> {
        let Some(actor) = identity::resolve(self.identity.as_ref()) else {
            tracing::error!(%peer, "connect refused: no signed-in actor");
            return Err(ChannelError::MissingIdentity);
        };
        self.commands
            .send(Command::Connect { actor, peer })
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Closes the connection and cancels any pending reconnect.
    pub async fn disconnect(&self) {
        self.command(Command::Disconnect).await;
    }

    /// Posts a message. Dropped unless the channel is open.
    pub async fn send(&self, content: impl Into<String>) {
        self.command(Command::Send(content.into())).await;
    }

    /// Tells the peer we are typing. Dropped unless the channel is open.
    pub async fn send_typing(&self) {
        self.command(Command::Typing).await;
    }

    /// Acknowledges everything up to and including `up_to` as read.
    /// Dropped unless the channel is open.
    pub async fn mark_read_up_to(&self, up_to: DateTime<Utc>) {
        self.command(Command::ReadUpTo(up_to)).await;
    }

    /// Replaces the log with `history` (ascending) and waits until the new
    /// snapshot is published.
    pub async fn install_history(&self, history: Vec<Message>) {
        let (done_tx, done_rx) = oneshot::channel();
        self.command(Command::InstallHistory(history, done_tx)).await;
        let _ = done_rx.await;
    }

    /// Current log contents.
    #[must_use]
    pub fn messages(&self) -> Arc<Vec<Message>> {
        Arc::clone(&self.log.borrow())
    }

    /// Whether the peer is typing.
    #[must_use]
    pub fn is_peer_typing(&self) -> bool {
        *self.typing.borrow()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Latest global-room roster.
    #[must_use]
    pub fn roster(&self) -> Arc<Vec<RosterEntry>> {
        Arc::clone(&self.roster.borrow())
    }

    /// Watches the log snapshot.
    #[must_use]
    pub fn watch_messages(&self) -> watch::Receiver<Arc<Vec<Message>>> {
        self.log.clone()
    }

    /// Watches the typing flag.
    #[must_use]
    pub fn watch_typing(&self) -> watch::Receiver<bool> {
        self.typing.clone()
    }

    /// Watches the connection state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribes to channel events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn command(&self, cmd: Command) {
        if self.commands.send(cmd).await.is_err() {
            tracing::warn!("conversation channel task is gone; command dropped");
        }
    }
}

/// State owned by the channel task.
struct Worker<C: Connector> {
    connector: Arc<C>,
    clock: Arc<dyn Clock>,
    typing_timeout: Duration,
    machine: ChannelMachine,
    /// Actor the current target was dialled for.
    actor: Option<ActorId>,
    /// The open connection.
    link: Option<Link>,
    /// A freshly opened link waiting for the machine's verdict.
    staged: Option<Link>,
    log: ConversationLog,
    typing_until: Option<Instant>,
    /// Retry deadline and the epoch it was armed in.
    retry: Option<(Instant, u64)>,
    commands: mpsc::Receiver<Command>,
    opens_tx: mpsc::Sender<(u64, Result<Link, TransportError>)>,
    opens_rx: mpsc::Receiver<(u64, Result<Link, TransportError>)>,
    events: broadcast::Sender<ChannelEvent>,
    log_tx: watch::Sender<Arc<Vec<Message>>>,
    typing_tx: watch::Sender<bool>,
    state_tx: watch::Sender<ConnectionState>,
    roster_tx: watch::Sender<Arc<Vec<RosterEntry>>>,
}

impl<C: Connector> Worker<C> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                Some((epoch, result)) = self.opens_rx.recv() => self.on_open_result(epoch, result),
                frame = next_frame(&mut self.link) => match frame {
                    Some(text) => self.on_frame(&text),
                    None => {
                        tracing::info!("conversation connection lost");
                        self.link = None;
                        self.step(Input::Dropped);
                    }
                },
                () = sleep_until_opt(self.retry.map(|(at, _)| at)) => {
                    if let Some((_, epoch)) = self.retry.take() {
                        self.step(Input::RetryDue { epoch });
                    }
                }
                () = sleep_until_opt(self.typing_until) => {
                    self.typing_until = None;
                    self.set_typing(false);
                }
            }
        }
        tracing::debug!("conversation channel task exiting");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { actor, peer } => {
                self.actor = Some(actor);
                self.step(Input::Connect(peer));
            }
            Command::Disconnect => self.step(Input::Disconnect),
            Command::Send(content) => self.write(&OutboundEvent::Message { content }),
            Command::Typing => self.write(&OutboundEvent::Typing),
            Command::ReadUpTo(up_to_iso) => self.write(&OutboundEvent::ReadUpTo { up_to_iso }),
            Command::InstallHistory(history, done) => {
                self.log.install(history);
                let count = self.log.len();
                self.log_tx.send_replace(self.log.snapshot());
                self.emit(ChannelEvent::HistoryInstalled { count });
                let _ = done.send(());
            }
        }
    }

    fn on_open_result(&mut self, epoch: u64, result: Result<Link, TransportError>) {
        match result {
            Ok(link) => {
                self.staged = Some(link);
                self.step(Input::Opened { epoch });
            }
            Err(e) => {
                tracing::warn!(epoch, err = %e, "conversation connect failed");
                self.step(Input::OpenFailed { epoch });
            }
        }
    }

    fn step(&mut self, input: Input) {
        for action in self.machine.apply(input) {
            self.perform(action);
        }
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::CloseLink => {
                if let Some(link) = self.link.take() {
                    link.close();
                }
            }
            Action::Dial { peer, epoch } => self.dial(peer, epoch),
            Action::AcceptLink => self.link = self.staged.take(),
            Action::DiscardLink => {
                if let Some(link) = self.staged.take() {
                    tracing::debug!(epoch = self.machine.epoch(), "discarding stale connection");
                    link.close();
                }
            }
            Action::ScheduleRetry {
                delay,
                attempt,
                epoch,
            } => {
                tracing::info!(attempt, ?delay, "reconnect scheduled");
                self.retry = Some((Instant::now() + delay, epoch));
                self.emit(ChannelEvent::ReconnectScheduled { attempt, delay });
            }
            Action::CancelRetry => self.retry = None,
            Action::ClearTyping => {
                self.typing_until = None;
                self.set_typing(false);
            }
            Action::Publish(state) => {
                tracing::info!(%state, peer = ?self.machine.target(), "conversation state");
                self.state_tx.send_replace(state);
                self.emit(ChannelEvent::StateChanged(state));
            }
        }
    }

    fn dial(&self, peer: ActorId, epoch: u64) {
        let Some(actor) = self.actor else {
            tracing::error!(%peer, "dial without a signed-in actor");
            return;
        };
        let target = ChannelTarget::new(actor, peer);
        let connector = Arc::clone(&self.connector);
        let opens = self.opens_tx.clone();
        tracing::debug!(%target, epoch, "dialling");
        tokio::spawn(async move {
            let result = connector.open(&target).await;
            let _ = opens.send((epoch, result)).await;
        });
    }

    fn write(&self, event: &OutboundEvent) {
        let Some(link) = self.link.as_ref() else {
            tracing::debug!(state = %self.machine.state(), "channel not open; outbound event dropped");
            return;
        };
        let frame = match codec::encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(err = %e, "failed to encode outbound event");
                return;
            }
        };
        if let Err(e) = link.write(frame) {
            tracing::warn!(err = %e, "conversation write failed");
        }
    }

    fn accepts(&self, msg: &Message) -> bool {
        match (self.actor, self.machine.target()) {
            (Some(actor), Some(peer)) => ChannelTarget::new(actor, peer).carries(msg),
            _ => false,
        }
    }

    fn on_frame(&mut self, text: &str) {
        let event = match codec::decode(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(err = %e, "skipping malformed frame");
                return;
            }
        };
        match event {
            InboundEvent::Message { msg } => {
                if !self.accepts(&msg) {
                    tracing::debug!(id = %msg.id, from = %msg.from, to = %msg.to, "message for another room dropped");
                    return;
                }
                if self.log.append(msg.clone()) {
                    self.log_tx.send_replace(self.log.snapshot());
                    self.emit(ChannelEvent::MessageReceived(msg));
                } else {
                    tracing::debug!(id = %msg.id, "duplicate message dropped");
                }
            }
            InboundEvent::Delivered { ids, delivered_at } => {
                let at = delivered_at.unwrap_or_else(|| self.clock.now());
                if !self.log.apply_delivered(&ids, at).is_empty() {
                    self.log_tx.send_replace(self.log.snapshot());
                }
                self.emit(ChannelEvent::Delivered { ids });
            }
            InboundEvent::Read { ids, read_at } => {
                let at = read_at.unwrap_or_else(|| self.clock.now());
                if !self.log.apply_read(&ids, at).is_empty() {
                    self.log_tx.send_replace(self.log.snapshot());
                }
                self.emit(ChannelEvent::Read { ids });
            }
            InboundEvent::Typing => {
                self.typing_until = Some(Instant::now() + self.typing_timeout);
                self.set_typing(true);
            }
            InboundEvent::Presence { users, .. } => {
                let count = users.len();
                self.roster_tx.send_replace(Arc::new(users));
                self.emit(ChannelEvent::RosterChanged { count });
            }
            InboundEvent::Unknown => tracing::debug!("ignoring unknown frame type"),
        }
    }

    fn set_typing(&self, typing: bool) {
        let changed = self.typing_tx.send_if_modified(|current| {
            let changed = *current != typing;
            *current = typing;
            changed
        });
        if changed {
            self.emit(ChannelEvent::TypingChanged(typing));
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<String> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
