//! Object locks: time-bounded exclusive or shared claims on model objects.
//!
//! Locking exists so that conflicting edits are prevented before they
//! happen instead of merged after the fact. Grant rules for
//! `acquire(object, user, kind, ttl)`:
//!
//! 1. No existing lock → granted immediately.
//! 2. Held by the same user → idempotent refresh; a shared→exclusive
//!    upgrade refreshes in place when the user is the sole holder.
//! 3. Exclusive lock held by someone else → queued (FIFO), caller polls.
//! 4. Shared lock + shared request → granted (shared locks are compatible).
//! 5. Shared lock + exclusive request → queued.
//!
//! There is no blocking wait: contended callers get `Queued` back and
//! retry. Expiry sweeps and explicit releases both replay the freed
//! object's queue, granting the next compatible requests.

use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock compatibility class. `Pending` only appears on queued requests
/// surfaced through [`LockManager::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Exclusive,
    Shared,
    Pending,
}

/// The single lock record an object can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectLock {
    pub object_id: Uuid,
    /// First grantee; stays the primary holder while others share.
    pub user_id: Uuid,
    pub kind: LockKind,
    pub holders: BTreeSet<Uuid>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ObjectLock {
    fn new(object_id: Uuid, user_id: Uuid, kind: LockKind, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        let mut holders = BTreeSet::new();
        holders.insert(user_id);
        Self {
            object_id,
            user_id,
            kind,
            holders,
            acquired_at: now,
            expires_at: ttl.map(|t| now + t),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    fn refresh(&mut self, ttl: Option<Duration>) {
        let now = Utc::now();
        self.acquired_at = now;
        self.expires_at = ttl.map(|t| now + t);
    }
}

/// Result of an acquire call. Contention is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    Granted,
    /// The caller already holds a compatible lock; refreshed in place.
    AlreadyHeld,
    /// Parked in the FIFO queue; poll again after a release or expiry.
    Queued,
}

impl LockGrant {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockGrant::Granted | LockGrant::AlreadyHeld)
    }
}

/// A parked acquire call.
#[derive(Debug, Clone)]
struct QueuedRequest {
    user_id: Uuid,
    kind: LockKind,
    ttl: Option<Duration>,
}

/// Lock changes worth broadcasting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Granted { object_id: Uuid, user_id: Uuid, kind: LockKind },
    Released { object_id: Uuid, user_id: Uuid, kind: LockKind },
    Expired { object_id: Uuid, user_id: Uuid, kind: LockKind },
}

/// Per-document lock arbiter. Owned by the document's session; all grant
/// decisions are serialized through it — the distributed cache only ever
/// sees a read projection.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: HashMap<Uuid, ObjectLock>,
    queues: HashMap<Uuid, VecDeque<QueuedRequest>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take a lock. Never blocks; contended requests queue FIFO.
    pub fn acquire(
        &mut self,
        object_id: Uuid,
        user_id: Uuid,
        kind: LockKind,
        ttl: Option<Duration>,
    ) -> LockGrant {
        debug_assert!(kind != LockKind::Pending, "Pending is not requestable");

        let Some(existing) = self.locks.get_mut(&object_id) else {
            self.locks.insert(object_id, ObjectLock::new(object_id, user_id, kind, ttl));
            return LockGrant::Granted;
        };

        if existing.holders.contains(&user_id) {
            // Upgrade only when nobody else shares the lock; otherwise the
            // exclusivity request must wait its turn.
            if kind == LockKind::Exclusive && existing.kind == LockKind::Shared {
                if existing.holders.len() == 1 {
                    existing.kind = LockKind::Exclusive;
                    existing.refresh(ttl);
                    return LockGrant::AlreadyHeld;
                }
                self.enqueue(object_id, user_id, kind, ttl);
                return LockGrant::Queued;
            }
            existing.refresh(ttl);
            return LockGrant::AlreadyHeld;
        }

        if existing.kind == LockKind::Shared && kind == LockKind::Shared {
            existing.holders.insert(user_id);
            return LockGrant::Granted;
        }

        self.enqueue(object_id, user_id, kind, ttl);
        LockGrant::Queued
    }

    fn enqueue(&mut self, object_id: Uuid, user_id: Uuid, kind: LockKind, ttl: Option<Duration>) {
        let queue = self.queues.entry(object_id).or_default();
        let duplicate = queue.iter().any(|r| r.user_id == user_id && r.kind == kind);
        if !duplicate {
            queue.push_back(QueuedRequest { user_id, kind, ttl });
        }
    }

    /// Release one user's hold. Unconditional and immediate; frees the
    /// record once the last holder leaves and replays the wait queue.
    pub fn release(&mut self, object_id: Uuid, user_id: Uuid) -> Vec<LockEvent> {
        let mut events = Vec::new();
        let Some(lock) = self.locks.get_mut(&object_id) else {
            return events;
        };
        if !lock.holders.remove(&user_id) {
            return events;
        }
        events.push(LockEvent::Released { object_id, user_id, kind: lock.kind });

        if lock.holders.is_empty() {
            self.locks.remove(&object_id);
        } else if lock.user_id == user_id {
            // Promote the next shared holder to primary.
            if let Some(next) = lock.holders.iter().next().copied() {
                lock.user_id = next;
            }
        }
        events.extend(self.replay_queue(object_id));
        events
    }

    /// Drop every lock a departing user holds and cancel their queued
    /// requests.
    pub fn release_all(&mut self, user_id: Uuid) -> Vec<LockEvent> {
        let held: Vec<Uuid> = self
            .locks
            .values()
            .filter(|l| l.holders.contains(&user_id))
            .map(|l| l.object_id)
            .collect();

        for queue in self.queues.values_mut() {
            queue.retain(|r| r.user_id != user_id);
        }

        let mut events = Vec::new();
        for object_id in held {
            events.extend(self.release(object_id, user_id));
        }
        events
    }

    /// Expiry sweep. Removes every lock past its deadline and replays the
    /// freed queues. Run from the periodic background task.
    pub fn sweep_expired(&mut self) -> Vec<LockEvent> {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .locks
            .values()
            .filter(|l| l.is_expired(now))
            .map(|l| l.object_id)
            .collect();

        let mut events = Vec::new();
        for object_id in expired {
            if let Some(lock) = self.locks.remove(&object_id) {
                log::debug!("lock on {object_id} expired (primary holder {})", lock.user_id);
                for holder in lock.holders {
                    events.push(LockEvent::Expired { object_id, user_id: holder, kind: lock.kind });
                }
            }
            events.extend(self.replay_queue(object_id));
        }
        events
    }

    /// Grant the next compatible queued requests for a freed object:
    /// the head of the queue always proceeds, and a run of shared requests
    /// behind a shared head proceeds with it.
    fn replay_queue(&mut self, object_id: Uuid) -> Vec<LockEvent> {
        let mut events = Vec::new();
        loop {
            let Some(queue) = self.queues.get_mut(&object_id) else {
                break;
            };
            let Some(next) = queue.front().cloned() else {
                self.queues.remove(&object_id);
                break;
            };

            let compatible = match self.locks.get(&object_id) {
                None => true,
                Some(lock) => lock.kind == LockKind::Shared && next.kind == LockKind::Shared,
            };
            if !compatible {
                break;
            }

            queue.pop_front();
            let grant = self.acquire(object_id, next.user_id, next.kind, next.ttl);
            if grant.is_granted() {
                events.push(LockEvent::Granted {
                    object_id,
                    user_id: next.user_id,
                    kind: next.kind,
                });
            }
        }
        events
    }

    /// Whether `user_id` may add `object_id` to a selection: anything goes
    /// except an exclusive lock held by someone else.
    pub fn selectable(&self, object_id: Uuid, user_id: Uuid) -> bool {
        match self.locks.get(&object_id) {
            Some(lock) => lock.kind != LockKind::Exclusive || lock.holders.contains(&user_id),
            None => true,
        }
    }

    pub fn lock(&self, object_id: &Uuid) -> Option<&ObjectLock> {
        self.locks.get(object_id)
    }

    pub fn is_locked(&self, object_id: &Uuid) -> bool {
        self.locks.contains_key(object_id)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn queue_len(&self, object_id: &Uuid) -> usize {
        self.queues.get(object_id).map_or(0, VecDeque::len)
    }

    /// Read projection for the cache mirror: every active lock, plus one
    /// `Pending` record per queued request.
    pub fn snapshot(&self) -> Vec<ObjectLock> {
        let mut out: Vec<ObjectLock> = self.locks.values().cloned().collect();
        for (object_id, queue) in &self.queues {
            for request in queue {
                out.push(ObjectLock::new(*object_id, request.user_id, LockKind::Pending, None));
            }
        }
        out
    }
}
