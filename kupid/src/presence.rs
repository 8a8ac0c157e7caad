//! Heartbeat-based presence tracking.
//!
//! One cycle per session: ping for the actor, fetch who else is online,
//! publish the set. Each snapshot replaces the previous one. Any failure
//! publishes an empty set, so a broken connection shows everyone offline
//! rather than a stale picture.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use kupid_proto::message::ActorId;
use kupid_proto::presence::PeerPresence;

use crate::api::{ApiError, ChatApi};

/// Default heartbeat period.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(25);

/// Shortest accepted heartbeat period.
pub const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Snapshot of online members, excluding the actor.
pub type PresenceSet = Arc<HashSet<ActorId>>;

static NEXT_CYCLE: AtomicU64 = AtomicU64::new(1);

/// Identifies a running heartbeat cycle.
///
/// Two handles are equal when they refer to the same cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CycleHandle {
    id: u64,
    actor: ActorId,
    period: Duration,
}

impl CycleHandle {
    /// The actor the cycle pings for.
    #[must_use]
    pub const fn actor(&self) -> ActorId {
        self.actor
    }

    /// Time between heartbeats.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }
}

struct Running {
    handle: CycleHandle,
    task: JoinHandle<()>,
}

/// Tracks which members are online.
pub struct PresenceTracker<A: ChatApi> {
    api: Arc<A>,
    snapshot: watch::Sender<PresenceSet>,
    running: Mutex<Option<Running>>,
}

impl<A: ChatApi> std::fmt::Debug for PresenceTracker<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("online", &self.snapshot.borrow().len())
            .field("cycle", &self.running.lock().as_ref().map(|r| r.handle.id))
            .finish_non_exhaustive()
    }
}

impl<A: ChatApi> PresenceTracker<A> {
    /// Creates a tracker with an empty snapshot and no cycle.
    #[must_use]
    pub fn new(api: Arc<A>) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(HashSet::new()));
        Self {
            api,
            snapshot,
            running: Mutex::new(None),
        }
    }

    /// Starts the heartbeat cycle for `actor`; the first beat runs at once.
    ///
    /// If a cycle is already running, it is returned unchanged and no
    /// second cycle starts. Periods below [`MIN_HEARTBEAT_PERIOD`] are raised
    /// to it.
    pub fn start(&self, actor: ActorId, period: Duration) -> CycleHandle {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if current.handle.actor != actor {
                tracing::warn!(
                    running = %current.handle.actor,
                    requested = %actor,
                    "presence cycle already running for another actor"
                );
            }
            return current.handle.clone();
        }

        let period = period.max(MIN_HEARTBEAT_PERIOD);
        let handle = CycleHandle {
            id: NEXT_CYCLE.fetch_add(1, Ordering::Relaxed),
            actor,
            period,
        };
        let api = Arc::clone(&self.api);
        let snapshot = self.snapshot.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = match beat(api.as_ref(), actor).await {
                    Ok(online) => online,
                    Err(e) => {
                        tracing::warn!(%actor, err = %e, "presence cycle failed; assuming nobody online");
                        HashSet::new()
                    }
                };
                snapshot.send_replace(Arc::new(online));
            }
        });
        tracing::info!(%actor, ?period, "presence cycle started");
        *running = Some(Running {
            handle: handle.clone(),
            task,
        });
        handle
    }

    /// Stops the cycle and clears the snapshot.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.task.abort();
            tracing::info!(actor = %running.handle.actor, "presence cycle stopped");
        }
        self.snapshot.send_replace(Arc::new(HashSet::new()));
    }

    /// The running cycle, if any.
    #[must_use]
    pub fn current(&self) -> Option<CycleHandle> {
        self.running.lock().as_ref().map(|r| r.handle.clone())
    }

    /// Whether `actor` was online in the last snapshot. Never fetches.
    #[must_use]
    pub fn is_online(&self, actor: ActorId) -> bool {
        self.snapshot.borrow().contains(&actor)
    }

    /// The last published snapshot.
    #[must_use]
    pub fn online(&self) -> PresenceSet {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Watches the snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<PresenceSet> {
        self.snapshot.subscribe()
    }

    /// Asks the server about one member. `None` if the request fails.
    pub async fn lookup(&self, actor: ActorId) -> Option<PeerPresence> {
        match self.api.presence_of(actor).await {
            Ok(presence) => Some(presence),
            Err(e) => {
                tracing::warn!(%actor, err = %e, "presence lookup failed");
                None
            }
        }
    }
}

impl<A: ChatApi> Drop for PresenceTracker<A> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.task.abort();
        }
    }
}

/// One heartbeat: ping, then fetch the online set.
async fn beat<A: ChatApi>(api: &A, actor: ActorId) -> Result<HashSet<ActorId>, ApiError> {
    let ping = api.ping(actor).await?;
    if !ping.ok {
        return Err(ApiError::Decode("ping rejected".into()));
    }
    let reply = api.online(actor).await?;
    if !reply.ok {
        return Err(ApiError::Decode("online query rejected".into()));
    }
    Ok(reply.online.into_iter().filter(|id| *id != actor).collect())
}
