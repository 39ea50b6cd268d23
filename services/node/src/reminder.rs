//! Deferred reminder scheduling.
//!
//! A single worker owns a min-heap keyed by fire time.  It sleeps exactly
//! until the earliest entry is due; inserting an earlier reminder wakes it
//! immediately so the new head is reconsidered.  An empty heap waits at
//! most [`IDLE_WAIT`] so shutdown is never delayed indefinitely.
//!
//! Cross-server targets are recorded as `userId@serverId` by the scheduling
//! server; on fire, the `REMINDER` frame is forwarded to the user's home
//! server, which delivers it like any locally fired reminder.

use crate::events::NodeEvent;
use crate::state::NodeState;
use cm_protocol::{Packet, Reminder, UserRef};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on the worker's wait when the heap is empty.
pub const IDLE_WAIT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Who a reminder is for.  The string form `userId@serverId` marks a user
/// whose home server is elsewhere; a bare id is a local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderTarget {
    Local(String),
    Remote { user_id: String, server_id: String },
}

impl ReminderTarget {
    /// Parse the internal `userId[@serverId]` encoding.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('@') {
            Some((user_id, server_id)) if !server_id.is_empty() => ReminderTarget::Remote {
                user_id: user_id.to_owned(),
                server_id: server_id.to_owned(),
            },
            _ => ReminderTarget::Local(raw.to_owned()),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ReminderTarget::Local(user_id) => user_id.clone(),
            ReminderTarget::Remote { user_id, server_id } => format!("{user_id}@{server_id}"),
        }
    }

    /// The target for a `SET_REMINDER` from `user`: remote form when the
    /// user's home server is not this node.
    pub fn for_user(user: &UserRef, self_server_id: &str) -> Self {
        if user.server_id.is_empty() || user.server_id == self_server_id {
            ReminderTarget::Local(user.user_id.clone())
        } else {
            ReminderTarget::Remote {
                user_id: user.user_id.clone(),
                server_id: user.server_id.clone(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    fire_at: Instant,
    /// Insertion order; breaks fire-time ties deterministically.
    seq: u64,
    target: ReminderTarget,
    event: String,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The reminder min-heap plus the wake-on-insert signal.
#[derive(Debug, Default)]
pub struct ReminderQueue {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl ReminderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a reminder that fires after `countdown`, waking the worker so
    /// it can reconsider its sleep.
    pub fn schedule(&self, target: ReminderTarget, event: String, countdown: Duration) {
        self.schedule_at(Instant::now() + countdown, target, event);
    }

    pub fn schedule_at(&self, fire_at: Instant, target: ReminderTarget, event: String) {
        let entry = Entry {
            fire_at,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            target,
            event,
        };
        self.heap
            .lock()
            .expect("reminder heap lock poisoned")
            .push(Reverse(entry));
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("reminder heap lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop the earliest entry if it is due at `now`.
    fn pop_due(&self, now: Instant) -> Option<Entry> {
        let mut heap = self.heap.lock().expect("reminder heap lock poisoned");
        match heap.peek() {
            Some(Reverse(head)) if head.fire_at <= now => heap.pop().map(|Reverse(e)| e),
            _ => None,
        }
    }

    /// Time until the earliest entry fires; `None` when the heap is empty.
    fn next_delay(&self, now: Instant) -> Option<Duration> {
        let heap = self.heap.lock().expect("reminder heap lock poisoned");
        heap.peek()
            .map(|Reverse(head)| head.fire_at.saturating_duration_since(now))
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// The scheduler worker.  Runs until shutdown is signalled.
pub async fn run_scheduler(state: Arc<NodeState>, mut shutdown: watch::Receiver<bool>) {
    info!("reminder scheduler started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        while let Some(entry) = state.reminders.pop_due(Instant::now()) {
            deliver(&state, entry).await;
        }

        let wait = state
            .reminders
            .next_delay(Instant::now())
            .unwrap_or(IDLE_WAIT);
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = state.reminders.notified() => {}
            _ = shutdown.changed() => {}
        }
    }
    info!("reminder scheduler stopped");
}

async fn deliver(state: &Arc<NodeState>, entry: Entry) {
    let (user_id, home_server) = match &entry.target {
        ReminderTarget::Local(user_id) => (user_id.clone(), None),
        ReminderTarget::Remote { user_id, server_id } => {
            (user_id.clone(), Some(server_id.clone()))
        }
    };

    // A local session wins even for the remote form: if the user is
    // connected here there is no point in a peer round-trip.
    if let Some(session) = state.client(&user_id).await {
        let packet = Packet::Reminder(Reminder {
            user: state.user_ref(&user_id),
            content: entry.event.clone(),
        });
        if session.writer.send(&packet).await.is_err() {
            warn!(user_id = %user_id, "reminder write failed, evicting client");
            state.evict_client(&user_id).await;
        } else {
            debug!(user_id = %user_id, event = %entry.event, "reminder delivered locally");
        }
        state.emit(NodeEvent::ReminderFired {
            target: entry.target.encode(),
        });
        return;
    }

    if let Some(server_id) = home_server {
        if let Some(peer) = state.peer(&server_id).await {
            let packet = Packet::Reminder(Reminder {
                user: UserRef::new(user_id.clone(), server_id.clone()),
                content: entry.event.clone(),
            });
            if peer.writer.send(&packet).await.is_err() {
                warn!(server_id = %server_id, "reminder forward failed, evicting peer");
                state.evict_peer(&server_id).await;
            } else {
                debug!(
                    user_id = %user_id,
                    server_id = %server_id,
                    "reminder forwarded to home server"
                );
            }
            state.emit(NodeEvent::ReminderFired {
                target: entry.target.encode(),
            });
            return;
        }
        warn!(
            user_id = %user_id,
            server_id = %server_id,
            "reminder target's home server is not connected, dropped"
        );
        return;
    }

    debug!(user_id = %user_id, "reminder target offline, dropped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_encode_targets() {
        assert_eq!(
            ReminderTarget::parse("alice"),
            ReminderTarget::Local("alice".to_owned())
        );
        assert_eq!(
            ReminderTarget::parse("alice@S2"),
            ReminderTarget::Remote {
                user_id: "alice".to_owned(),
                server_id: "S2".to_owned(),
            }
        );
        // A trailing '@' is not a server id.
        assert_eq!(
            ReminderTarget::parse("alice@"),
            ReminderTarget::Local("alice@".to_owned())
        );
        assert_eq!(ReminderTarget::parse("alice@S2").encode(), "alice@S2");
    }

    #[test]
    fn target_for_user_distinguishes_home_server() {
        let local = ReminderTarget::for_user(&UserRef::new("a", "S1"), "S1");
        assert_eq!(local, ReminderTarget::Local("a".to_owned()));

        let remote = ReminderTarget::for_user(&UserRef::new("a", "S2"), "S1");
        assert_eq!(
            remote,
            ReminderTarget::Remote {
                user_id: "a".to_owned(),
                server_id: "S2".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn heap_pops_in_fire_time_order() {
        let queue = ReminderQueue::new();
        let base = Instant::now();

        queue.schedule_at(base + Duration::from_secs(3), ReminderTarget::Local("c".into()), "3".into());
        queue.schedule_at(base + Duration::from_secs(1), ReminderTarget::Local("a".into()), "1".into());
        queue.schedule_at(base + Duration::from_secs(2), ReminderTarget::Local("b".into()), "2".into());

        let late = base + Duration::from_secs(10);
        let order: Vec<String> = std::iter::from_fn(|| queue.pop_due(late).map(|e| e.event))
            .collect();
        assert_eq!(order, vec!["1", "2", "3"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn equal_fire_times_pop_in_insertion_order() {
        let queue = ReminderQueue::new();
        let at = Instant::now() + Duration::from_secs(1);
        queue.schedule_at(at, ReminderTarget::Local("u".into()), "first".into());
        queue.schedule_at(at, ReminderTarget::Local("u".into()), "second".into());

        let late = at + Duration::from_secs(1);
        assert_eq!(queue.pop_due(late).expect("entry").event, "first");
        assert_eq!(queue.pop_due(late).expect("entry").event, "second");
    }

    #[tokio::test]
    async fn nothing_pops_before_its_fire_time() {
        let queue = ReminderQueue::new();
        let base = Instant::now();
        queue.schedule_at(base + Duration::from_secs(5), ReminderTarget::Local("u".into()), "e".into());

        assert!(queue.pop_due(base).is_none());
        assert_eq!(queue.len(), 1);
        let delay = queue.next_delay(base).expect("delay");
        assert!(delay > Duration::from_secs(4) && delay <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn earlier_insertion_becomes_the_new_head() {
        let queue = ReminderQueue::new();
        let base = Instant::now();
        queue.schedule_at(base + Duration::from_secs(10), ReminderTarget::Local("u".into()), "late".into());
        queue.schedule_at(base + Duration::from_secs(1), ReminderTarget::Local("u".into()), "early".into());

        let delay = queue.next_delay(base).expect("delay");
        assert!(delay <= Duration::from_secs(1));
        assert_eq!(
            queue.pop_due(base + Duration::from_secs(2)).expect("entry").event,
            "early"
        );
    }
}
