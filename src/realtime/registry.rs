//! Registry of live subscribers and their room memberships.
//!
//! Each subscriber owns a bounded mailbox. The registry keeps only the
//! sending half, so dropping a subscriber's entry is enough to close it.
//! Fan-out never waits: a full mailbox means the subscriber has fallen
//! behind and is cut off instead of slowing everyone else down.

use super::events::{ChangeEvent, Room, Target};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Identifier assigned to each subscriber at registration.
pub type SubscriberId = u64;

/// Why a mailbox stopped receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Still registered.
    Open,
    /// The session asked to leave.
    Unregistered,
    /// The mailbox filled up and the subscriber was dropped.
    Overrun,
    /// The bus shut down.
    Shutdown,
}

impl CloseReason {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CloseReason::Unregistered,
            2 => CloseReason::Overrun,
            3 => CloseReason::Shutdown,
            _ => CloseReason::Open,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CloseReason::Open => 0,
            CloseReason::Unregistered => 1,
            CloseReason::Overrun => 2,
            CloseReason::Shutdown => 3,
        }
    }
}

/// Receiving end of a subscriber's queue.
///
/// Dropping it unregisters the subscriber.
pub struct Mailbox {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<ChangeEvent>>,
    reason: Arc<AtomicU8>,
    registry: Weak<SessionManager>,
}

impl Mailbox {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the mailbox is closed.
    ///
    /// Events still queued when the subscriber unregisters or the bus shuts
    /// down are delivered first. After an overrun they are discarded, since
    /// the client has to resynchronize anyway.
    pub async fn recv(&mut self) -> Option<Arc<ChangeEvent>> {
        if self.close_reason() == CloseReason::Overrun {
            return None;
        }
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Mailbox::recv`].
    pub fn try_recv(&mut self) -> Option<Arc<ChangeEvent>> {
        if self.close_reason() == CloseReason::Overrun {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn close_reason(&self) -> CloseReason {
        CloseReason::from_u8(self.reason.load(Ordering::Acquire))
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

struct Subscriber {
    sender: mpsc::Sender<Arc<ChangeEvent>>,
    reason: Arc<AtomicU8>,
    rooms: HashSet<Room>,
}

impl Subscriber {
    fn close(&self, reason: CloseReason) {
        self.reason.store(reason.as_u8(), Ordering::Release);
    }
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<SubscriberId, Subscriber>,
    rooms: HashMap<Room, HashSet<SubscriberId>>,
    next_id: SubscriberId,
    closed: bool,
}

impl Registry {
    fn remove(&mut self, id: SubscriberId, reason: CloseReason) -> bool {
        let Some(subscriber) = self.subscribers.remove(&id) else {
            return false;
        };
        subscriber.close(reason);
        for room in &subscriber.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        true
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    /// Subscribers cut off because their mailbox was full.
    pub overrun: usize,
}

/// Thread-safe registry of subscribers.
pub struct SessionManager {
    inner: Mutex<Registry>,
    capacity: usize,
}

impl SessionManager {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Registry::default()),
            capacity: capacity.max(1),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a new subscriber. Returns `None` after shutdown.
    pub fn register(self: &Arc<Self>) -> Option<Mailbox> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let (sender, rx) = mpsc::channel(self.capacity);
        let reason = Arc::new(AtomicU8::new(CloseReason::Open.as_u8()));
        inner.subscribers.insert(
            id,
            Subscriber {
                sender,
                reason: Arc::clone(&reason),
                rooms: HashSet::new(),
            },
        );
        debug!(subscriber = id, "subscriber registered");
        Some(Mailbox {
            id,
            rx,
            reason,
            registry: Arc::downgrade(self),
        })
    }

    /// Remove a subscriber and all its memberships. Idempotent.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.inner.lock().remove(id, CloseReason::Unregistered);
        if removed {
            debug!(subscriber = id, "subscriber unregistered");
        }
        removed
    }

    /// Add a subscriber to a room. Returns `false` if it is not registered.
    pub fn join(&self, id: SubscriberId, room: Room) -> bool {
        let mut inner = self.inner.lock();
        let Some(subscriber) = inner.subscribers.get_mut(&id) else {
            return false;
        };
        subscriber.rooms.insert(room);
        inner.rooms.entry(room).or_default().insert(id);
        debug!(subscriber = id, room = %room, "joined room");
        true
    }

    /// Remove a subscriber from a room. Leaving a room you are not in is a no-op.
    pub fn leave(&self, id: SubscriberId, room: Room) {
        let mut inner = self.inner.lock();
        if let Some(subscriber) = inner.subscribers.get_mut(&id) {
            subscriber.rooms.remove(&room);
        }
        if let Some(members) = inner.rooms.get_mut(&room) {
            members.remove(&id);
            if members.is_empty() {
                inner.rooms.remove(&room);
            }
        }
        debug!(subscriber = id, room = %room, "left room");
    }

    /// Deliver `event` at most once to every subscriber matched by `targets`.
    ///
    /// Runs under the registry lock, so concurrent fan-outs are serialized and
    /// each subscriber sees events in publish order.
    pub fn fanout(&self, event: Arc<ChangeEvent>, targets: &[Target]) -> FanoutReport {
        let mut inner = self.inner.lock();
        let mut recipients = BTreeSet::new();
        for target in targets {
            match target {
                Target::Global => recipients.extend(inner.subscribers.keys().copied()),
                Target::Room(room) => {
                    if let Some(members) = inner.rooms.get(room) {
                        recipients.extend(members.iter().copied());
                    }
                }
            }
        }

        let mut report = FanoutReport::default();
        let mut overrun = Vec::new();
        let mut gone = Vec::new();
        for id in recipients {
            let Some(subscriber) = inner.subscribers.get(&id) else {
                continue;
            };
            match subscriber.sender.try_send(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => overrun.push(id),
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }

        for id in overrun {
            warn!(
                subscriber = id,
                capacity = self.capacity,
                event = event.kind(),
                "mailbox full, dropping subscriber"
            );
            inner.remove(id, CloseReason::Overrun);
            report.overrun += 1;
        }
        for id in gone {
            inner.remove(id, CloseReason::Unregistered);
        }
        report
    }

    /// Close every mailbox and refuse new registrations.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let ids: Vec<_> = inner.subscribers.keys().copied().collect();
        for id in ids {
            inner.remove(id, CloseReason::Shutdown);
        }
        debug!("subscriber registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn room_size(&self, room: Room) -> usize {
        self.inner.lock().rooms.get(&room).map_or(0, HashSet::len)
    }

    pub fn is_member(&self, id: SubscriberId, room: Room) -> bool {
        self.inner
            .lock()
            .rooms
            .get(&room)
            .is_some_and(|members| members.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::events::DeletedTask;

    fn event(id: u64) -> Arc<ChangeEvent> {
        Arc::new(ChangeEvent::TaskDeleted(DeletedTask {
            id,
            assignee_id: None,
        }))
    }

    #[test]
    fn register_assigns_distinct_ids() {
        let manager = SessionManager::new(4);
        let a = manager.register().unwrap();
        let b = manager.register().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.subscriber_count(), 2);
    }

    #[test]
    fn dropping_mailbox_unregisters() {
        let manager = SessionManager::new(4);
        let mailbox = manager.register().unwrap();
        let id = mailbox.id();
        manager.join(id, Room::Task(1));
        drop(mailbox);
        assert_eq!(manager.subscriber_count(), 0);
        assert_eq!(manager.room_size(Room::Task(1)), 0);
        assert!(!manager.unregister(id));
    }

    #[test]
    fn join_is_idempotent_and_leave_is_noop_when_absent() {
        let manager = SessionManager::new(4);
        let mailbox = manager.register().unwrap();
        assert!(manager.join(mailbox.id(), Room::Task(1)));
        assert!(manager.join(mailbox.id(), Room::Task(1)));
        assert_eq!(manager.room_size(Room::Task(1)), 1);
        manager.leave(mailbox.id(), Room::Task(2));
        assert!(manager.is_member(mailbox.id(), Room::Task(1)));
        assert!(!manager.join(999, Room::Task(1)));
    }

    #[test]
    fn global_and_room_targets_deliver_once() {
        let manager = SessionManager::new(4);
        let mut mailbox = manager.register().unwrap();
        manager.join(mailbox.id(), Room::Task(7));

        let report = manager.fanout(
            event(7),
            &[Target::Global, Target::Room(Room::Task(7))],
        );
        assert_eq!(report.delivered, 1);
        assert!(mailbox.try_recv().is_some());
        assert!(mailbox.try_recv().is_none());
    }

    #[test]
    fn room_target_skips_non_members() {
        let manager = SessionManager::new(4);
        let mut member = manager.register().unwrap();
        let mut outsider = manager.register().unwrap();
        manager.join(member.id(), Room::User(1));

        manager.fanout(event(1), &[Target::Room(Room::User(1))]);
        assert!(member.try_recv().is_some());
        assert!(outsider.try_recv().is_none());
    }

    #[test]
    fn overrun_closes_after_capacity_plus_one() {
        let manager = SessionManager::new(3);
        let mut mailbox = manager.register().unwrap();
        for i in 0..3 {
            let report = manager.fanout(event(i), &[Target::Global]);
            assert_eq!(report.delivered, 1);
        }
        assert_eq!(mailbox.close_reason(), CloseReason::Open);

        let report = manager.fanout(event(3), &[Target::Global]);
        assert_eq!(report.overrun, 1);
        assert_eq!(mailbox.close_reason(), CloseReason::Overrun);
        assert_eq!(manager.subscriber_count(), 0);
        assert!(mailbox.try_recv().is_none());
    }

    #[test]
    fn shutdown_drains_then_closes() {
        let manager = SessionManager::new(4);
        let mut mailbox = manager.register().unwrap();
        manager.fanout(event(1), &[Target::Global]);
        manager.shutdown();
        assert_eq!(mailbox.close_reason(), CloseReason::Shutdown);
        assert!(mailbox.try_recv().is_some());
        assert!(mailbox.try_recv().is_none());
        assert!(manager.register().is_none());
    }
}
