//! Distributed-cache projection of presence and lock state.
//!
//! The cache is a read projection for horizontal fan-out and crash
//! recovery — never the authority. Lock grants and presence truth live in
//! the per-document session; the mirror republishes them with short TTLs so
//! sibling instances can render who-is-where without asking the owner.
//!
//! Key layout:
//! - `presence:<document_id>` — hash of user_id → bincode `UserPresence`, TTL ~60 s
//! - `locks:<document_id>`    — hash of object_id → bincode `ObjectLock`, TTL ~300 s
//!
//! Mirror failures are logged and swallowed: an unavailable cache must
//! never fail a foreground request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::CollabError;
use crate::lock::ObjectLock;
use crate::presence::UserPresence;

/// TTL for mirrored presence entries.
pub const PRESENCE_TTL: Duration = Duration::from_secs(60);
/// TTL for mirrored lock entries.
pub const LOCK_TTL: Duration = Duration::from_secs(300);

pub fn presence_key(document_id: Uuid) -> String {
    format!("presence:{document_id}")
}

pub fn locks_key(document_id: Uuid) -> String {
    format!("locks:{document_id}")
}

/// Hash-shaped cache with per-entry TTLs (the shape a Redis-style backing
/// store exposes). Implementations must be safe to call from the periodic
/// mirror task.
pub trait DistributedCache: Send + Sync {
    fn put_field(&self, key: &str, field: &str, value: Vec<u8>, ttl: Duration)
        -> Result<(), CollabError>;
    fn get_field(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, CollabError>;
    fn delete_field(&self, key: &str, field: &str) -> Result<(), CollabError>;
    fn delete_key(&self, key: &str) -> Result<(), CollabError>;
}

/// In-process cache for tests and single-instance deployments.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<(String, String), (Vec<u8>, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("cache poisoned")
            .values()
            .filter(|(_, deadline)| *deadline > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DistributedCache for InMemoryCache {
    fn put_field(
        &self,
        key: &str,
        field: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CollabError> {
        let deadline = Instant::now() + ttl;
        self.entries
            .lock()
            .expect("cache poisoned")
            .insert((key.to_string(), field.to_string()), (value, deadline));
        Ok(())
    }

    fn get_field(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, CollabError> {
        let entries = self.entries.lock().expect("cache poisoned");
        Ok(entries
            .get(&(key.to_string(), field.to_string()))
            .filter(|(_, deadline)| *deadline > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    fn delete_field(&self, key: &str, field: &str) -> Result<(), CollabError> {
        self.entries
            .lock()
            .expect("cache poisoned")
            .remove(&(key.to_string(), field.to_string()));
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<(), CollabError> {
        self.entries
            .lock()
            .expect("cache poisoned")
            .retain(|(k, _), _| k != key);
        Ok(())
    }
}

/// Pushes presence/lock snapshots into a cache backend.
pub struct CacheMirror<C: DistributedCache> {
    cache: C,
}

impl<C: DistributedCache> CacheMirror<C> {
    pub fn new(cache: C) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Mirror every user's presence. Returns how many entries were written;
    /// individual failures are logged, not propagated.
    pub fn mirror_presence(
        &self,
        document_id: Uuid,
        users: &HashMap<Uuid, UserPresence>,
    ) -> usize {
        let key = presence_key(document_id);
        let mut written = 0;
        for (user_id, presence) in users {
            let encoded =
                match bincode::serde::encode_to_vec(presence, bincode::config::standard()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("presence mirror encode failed for {user_id}: {e}");
                        continue;
                    }
                };
            match self.cache.put_field(&key, &user_id.to_string(), encoded, PRESENCE_TTL) {
                Ok(()) => written += 1,
                Err(e) => log::warn!("presence mirror write failed for {user_id}: {e}"),
            }
        }
        written
    }

    /// Mirror the lock snapshot (active locks plus pending requests).
    pub fn mirror_locks(&self, document_id: Uuid, locks: &[ObjectLock]) -> usize {
        let key = locks_key(document_id);
        let mut written = 0;
        for lock in locks {
            let encoded = match bincode::serde::encode_to_vec(lock, bincode::config::standard()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("lock mirror encode failed for {}: {e}", lock.object_id);
                    continue;
                }
            };
            match self.cache.put_field(&key, &lock.object_id.to_string(), encoded, LOCK_TTL) {
                Ok(()) => written += 1,
                Err(e) => log::warn!("lock mirror write failed for {}: {e}", lock.object_id),
            }
        }
        written
    }

    /// Read one mirrored presence record (advisory, may be stale).
    pub fn read_presence(
        &self,
        document_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<UserPresence>, CollabError> {
        let bytes = self.cache.get_field(&presence_key(document_id), &user_id.to_string())?;
        match bytes {
            None => Ok(None),
            Some(bytes) => {
                let (presence, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| CollabError::Deserialization(e.to_string()))?;
                Ok(Some(presence))
            }
        }
    }

    /// Drop a document's mirrored state entirely (document closed).
    pub fn evict_document(&self, document_id: Uuid) {
        if let Err(e) = self.cache.delete_key(&presence_key(document_id)) {
            log::warn!("presence mirror evict failed: {e}");
        }
        if let Err(e) = self.cache.delete_key(&locks_key(document_id)) {
            log::warn!("lock mirror evict failed: {e}");
        }
    }
}
