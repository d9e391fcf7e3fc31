//! Per-document presence: who is looking at what.
//!
//! Tracks each user's cursor, viewport, selection and activity state, and
//! decides which updates are worth broadcasting:
//!
//! ```text
//! Cursor move
//!      │
//!      ▼
//! PresenceManager::update_cursor()
//!      │  (rate-limited: ~30 updates/s per user; the stored position is
//!      │   always refreshed, only the broadcast is throttled)
//!      ▼
//! PresenceEvent::CursorMoved ──► BroadcastSink
//! ```
//!
//! Status machine per user: `Active ⇄ Idle` (idle after a configurable
//! inactivity threshold, default 60 s; any tracked activity returns the
//! user to `Active`), `Offline` on removal. `Away` is client-declared.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use atelier_core::Point3D;

/// Activity state of one user in one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
    Offline,
}

/// Latest known cursor position in model coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub position: Point3D,
    pub updated_at: DateTime<Utc>,
}

/// Camera pose a user is viewing the model through.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub eye: Point3D,
    pub target: Point3D,
    pub zoom: f64,
}

/// Everything the platform knows about one user's presence in a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: Uuid,
    pub name: String,
    /// RGBA display color, stable across restarts and instances.
    pub color: [f32; 4],
    pub status: PresenceStatus,
    pub cursor: Option<CursorState>,
    pub viewport: Option<Viewport>,
    pub selected_objects: BTreeSet<Uuid>,
    pub locked_objects: BTreeSet<Uuid>,
    pub last_activity: DateTime<Utc>,
}

impl UserPresence {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            color: stable_color(user_id),
            status: PresenceStatus::Active,
            cursor: None,
            viewport: None,
            selected_objects: BTreeSet::new(),
            locked_objects: BTreeSet::new(),
            last_activity: Utc::now(),
        }
    }
}

/// Stable display color from the user id.
///
/// Same scheme for every process: the uuid's low bytes, not a per-process
/// hasher, so the same user renders the same color everywhere.
pub fn stable_color(user_id: Uuid) -> [f32; 4] {
    let hash = user_id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// Presence changes worth pushing to the broadcast sink.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Joined { user_id: Uuid, name: String, color: [f32; 4] },
    Left { user_id: Uuid },
    CursorMoved { user_id: Uuid, position: Point3D },
    ViewportChanged { user_id: Uuid, viewport: Viewport },
    SelectionChanged { user_id: Uuid, selected: Vec<Uuid> },
    StatusChanged { user_id: Uuid, status: PresenceStatus },
}

/// Tuning knobs for the presence manager.
#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    /// Inactivity span after which an `Active` user flips to `Idle`.
    pub idle_threshold: Duration,
    /// Minimum interval between cursor broadcasts per user (33 ms ≈ 30/s).
    pub cursor_broadcast_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(60),
            cursor_broadcast_interval: Duration::from_millis(33),
        }
    }
}

/// Presence state for all users of a single document.
///
/// Owned by the document's session; never shared across documents.
pub struct PresenceManager {
    users: HashMap<Uuid, UserPresence>,
    /// Rate limiter state per user; `Instant` is process-local on purpose.
    last_cursor_broadcast: HashMap<Uuid, Instant>,
    config: PresenceConfig,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self::with_config(PresenceConfig::default())
    }

    pub fn with_config(config: PresenceConfig) -> Self {
        Self {
            users: HashMap::new(),
            last_cursor_broadcast: HashMap::new(),
            config,
        }
    }

    /// Register a user; re-joining refreshes the existing record.
    pub fn join(&mut self, user_id: Uuid, name: impl Into<String>) -> PresenceEvent {
        let presence = self
            .users
            .entry(user_id)
            .or_insert_with(|| UserPresence::new(user_id, ""));
        presence.name = name.into();
        presence.status = PresenceStatus::Active;
        presence.last_activity = Utc::now();
        PresenceEvent::Joined {
            user_id,
            name: presence.name.clone(),
            color: presence.color,
        }
    }

    /// Remove a user entirely. Returns the final record (status `Offline`)
    /// so the caller can release their locks.
    pub fn remove(&mut self, user_id: Uuid) -> Option<UserPresence> {
        self.last_cursor_broadcast.remove(&user_id);
        let mut presence = self.users.remove(&user_id)?;
        presence.status = PresenceStatus::Offline;
        Some(presence)
    }

    /// Store a cursor position. The position always sticks; the returned
    /// event is `None` when the per-user broadcast budget is exhausted.
    pub fn update_cursor(&mut self, user_id: Uuid, position: Point3D) -> Option<PresenceEvent> {
        let presence = self.users.get_mut(&user_id)?;
        presence.cursor = Some(CursorState { position, updated_at: Utc::now() });
        Self::touch_record(presence);

        let now = Instant::now();
        let throttled = self
            .last_cursor_broadcast
            .get(&user_id)
            .is_some_and(|last| now.duration_since(*last) < self.config.cursor_broadcast_interval);
        if throttled {
            return None;
        }
        self.last_cursor_broadcast.insert(user_id, now);
        Some(PresenceEvent::CursorMoved { user_id, position })
    }

    /// Viewport changes are low-frequency and always broadcast.
    pub fn update_viewport(&mut self, user_id: Uuid, viewport: Viewport) -> Option<PresenceEvent> {
        let presence = self.users.get_mut(&user_id)?;
        presence.viewport = Some(viewport);
        Self::touch_record(presence);
        Some(PresenceEvent::ViewportChanged { user_id, viewport })
    }

    /// Replace a user's selection set. Lock filtering happens in the
    /// session before this is called.
    pub fn set_selection(&mut self, user_id: Uuid, selected: Vec<Uuid>) -> Option<PresenceEvent> {
        let presence = self.users.get_mut(&user_id)?;
        presence.selected_objects = selected.iter().copied().collect();
        Self::touch_record(presence);
        Some(PresenceEvent::SelectionChanged { user_id, selected })
    }

    pub fn set_status(&mut self, user_id: Uuid, status: PresenceStatus) -> Option<PresenceEvent> {
        let presence = self.users.get_mut(&user_id)?;
        if presence.status == status {
            return None;
        }
        presence.status = status;
        if status == PresenceStatus::Active {
            presence.last_activity = Utc::now();
        }
        Some(PresenceEvent::StatusChanged { user_id, status })
    }

    /// Mark any tracked activity; an `Idle` user flips back to `Active`.
    pub fn touch(&mut self, user_id: Uuid) -> Option<PresenceEvent> {
        let presence = self.users.get_mut(&user_id)?;
        let was_idle = presence.status == PresenceStatus::Idle;
        Self::touch_record(presence);
        if was_idle {
            Some(PresenceEvent::StatusChanged { user_id, status: PresenceStatus::Active })
        } else {
            None
        }
    }

    fn touch_record(presence: &mut UserPresence) {
        presence.last_activity = Utc::now();
        if presence.status == PresenceStatus::Idle {
            presence.status = PresenceStatus::Active;
        }
    }

    /// Idle sweep: flip users whose `last_activity` is older than the
    /// threshold. Run from the periodic background task.
    pub fn check_idle(&mut self) -> Vec<PresenceEvent> {
        let threshold = chrono::Duration::from_std(self.config.idle_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = Utc::now();
        let mut events = Vec::new();
        for presence in self.users.values_mut() {
            if presence.status == PresenceStatus::Active && now - presence.last_activity >= threshold
            {
                presence.status = PresenceStatus::Idle;
                events.push(PresenceEvent::StatusChanged {
                    user_id: presence.user_id,
                    status: PresenceStatus::Idle,
                });
            }
        }
        events
    }

    /// Bookkeeping hooks the lock manager drives.
    pub fn note_lock_granted(&mut self, user_id: Uuid, object_id: Uuid) {
        if let Some(p) = self.users.get_mut(&user_id) {
            p.locked_objects.insert(object_id);
        }
    }

    pub fn note_lock_released(&mut self, user_id: Uuid, object_id: Uuid) {
        if let Some(p) = self.users.get_mut(&user_id) {
            p.locked_objects.remove(&object_id);
        }
    }

    pub fn user(&self, user_id: &Uuid) -> Option<&UserPresence> {
        self.users.get(user_id)
    }

    pub fn users(&self) -> &HashMap<Uuid, UserPresence> {
        &self.users
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager() -> PresenceManager {
        PresenceManager::new()
    }

    #[test]
    fn test_join_creates_active_presence() {
        let mut m = manager();
        let user = Uuid::new_v4();
        let event = m.join(user, "Alice");

        assert!(matches!(event, PresenceEvent::Joined { .. }));
        let presence = m.user(&user).unwrap();
        assert_eq!(presence.status, PresenceStatus::Active);
        assert_eq!(presence.name, "Alice");
    }

    #[test]
    fn test_stable_color_is_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(stable_color(id), stable_color(id));
        assert_eq!(stable_color(id)[3], 1.0);
    }

    #[test]
    fn test_remove_returns_offline_record() {
        let mut m = manager();
        let user = Uuid::new_v4();
        m.join(user, "Alice");

        let record = m.remove(user).unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
        assert!(m.user(&user).is_none());
    }

    #[test]
    fn test_cursor_update_stores_position() {
        let mut m = manager();
        let user = Uuid::new_v4();
        m.join(user, "Alice");

        let event = m.update_cursor(user, Point3D::new(1.0, 2.0, 3.0));
        assert!(matches!(event, Some(PresenceEvent::CursorMoved { .. })));
        let cursor = m.user(&user).unwrap().cursor.unwrap();
        assert_eq!(cursor.position, Point3D::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_cursor_broadcast_throttled_but_position_kept() {
        let mut m = manager();
        let user = Uuid::new_v4();
        m.join(user, "Alice");

        let first = m.update_cursor(user, Point3D::new(1.0, 0.0, 0.0));
        assert!(first.is_some());

        // Immediately after: throttled, but the newer position sticks.
        let second = m.update_cursor(user, Point3D::new(2.0, 0.0, 0.0));
        assert!(second.is_none());
        let stored = m.user(&user).unwrap().cursor.unwrap().position;
        assert_eq!(stored, Point3D::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn test_cursor_broadcast_resumes_after_interval() {
        let mut m = PresenceManager::with_config(PresenceConfig {
            cursor_broadcast_interval: Duration::from_millis(5),
            ..PresenceConfig::default()
        });
        let user = Uuid::new_v4();
        m.join(user, "Alice");

        let _ = m.update_cursor(user, Point3D::new(1.0, 0.0, 0.0));
        thread::sleep(Duration::from_millis(10));
        assert!(m.update_cursor(user, Point3D::new(2.0, 0.0, 0.0)).is_some());
    }

    #[test]
    fn test_cursor_update_for_unknown_user_ignored() {
        let mut m = manager();
        assert!(m.update_cursor(Uuid::new_v4(), Point3D::ZERO).is_none());
    }

    #[test]
    fn test_idle_flip_and_activity_flip_back() {
        // Zero threshold: everything is instantly idle on the next sweep.
        let mut m = PresenceManager::with_config(PresenceConfig {
            idle_threshold: Duration::from_secs(0),
            ..PresenceConfig::default()
        });
        let user = Uuid::new_v4();
        m.join(user, "Alice");

        let events = m.check_idle();
        assert_eq!(events.len(), 1);
        assert_eq!(m.user(&user).unwrap().status, PresenceStatus::Idle);

        // Any tracked activity returns the user to Active.
        let event = m.touch(user);
        assert_eq!(
            event,
            Some(PresenceEvent::StatusChanged { user_id: user, status: PresenceStatus::Active })
        );
        assert_eq!(m.user(&user).unwrap().status, PresenceStatus::Active);
    }

    #[test]
    fn test_idle_sweep_skips_recent_activity() {
        let mut m = manager(); // 60 s threshold
        let user = Uuid::new_v4();
        m.join(user, "Alice");

        assert!(m.check_idle().is_empty());
        assert_eq!(m.user(&user).unwrap().status, PresenceStatus::Active);
    }

    #[test]
    fn test_selection_replaces_set() {
        let mut m = manager();
        let user = Uuid::new_v4();
        m.join(user, "Alice");

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        m.set_selection(user, vec![a, b]);
        assert_eq!(m.user(&user).unwrap().selected_objects.len(), 2);

        m.set_selection(user, vec![a]);
        let selected = &m.user(&user).unwrap().selected_objects;
        assert!(selected.contains(&a));
        assert!(!selected.contains(&b));
    }

    #[test]
    fn test_status_change_events_deduplicated() {
        let mut m = manager();
        let user = Uuid::new_v4();
        m.join(user, "Alice");

        assert!(m.set_status(user, PresenceStatus::Away).is_some());
        assert!(m.set_status(user, PresenceStatus::Away).is_none());
    }

    #[test]
    fn test_lock_bookkeeping() {
        let mut m = manager();
        let user = Uuid::new_v4();
        let object = Uuid::new_v4();
        m.join(user, "Alice");

        m.note_lock_granted(user, object);
        assert!(m.user(&user).unwrap().locked_objects.contains(&object));

        m.note_lock_released(user, object);
        assert!(m.user(&user).unwrap().locked_objects.is_empty());
    }

    #[test]
    fn test_viewport_always_broadcast() {
        let mut m = manager();
        let user = Uuid::new_v4();
        m.join(user, "Alice");

        let viewport = Viewport {
            eye: Point3D::new(0.0, 0.0, 10.0),
            target: Point3D::ZERO,
            zoom: 1.0,
        };
        assert!(m.update_viewport(user, viewport).is_some());
        assert!(m.update_viewport(user, viewport).is_some());
    }
}
