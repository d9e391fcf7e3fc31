//! Integration tests for presence, locking and the cache projection.
//!
//! These wire a `DocumentSession` to a real `ChannelBroadcaster` and an
//! in-memory cache, verifying that presence and lock changes reach
//! subscribers as decodable protocol messages and that the mirror stays an
//! advisory projection of session truth.

use std::sync::Arc;

use atelier_collab::{
    CacheMirror, ChannelBroadcaster, CollabMessage, DocumentSession, InMemoryCache, LockGrant,
    LockKind, MessageType, PresenceConfig, PresenceStatus, SessionConfig, SessionManager,
};
use atelier_core::Point3D;
use uuid::Uuid;

fn session_with_channel() -> (DocumentSession, Arc<ChannelBroadcaster>) {
    let broadcaster = Arc::new(ChannelBroadcaster::new(256));
    let session = DocumentSession::new(
        Uuid::new_v4(),
        SessionConfig::default(),
        Box::new(atelier_collab::NullGeometry),
        broadcaster.clone(),
    );
    (session, broadcaster)
}

async fn drain(rx: &mut tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>) -> Vec<CollabMessage> {
    let mut messages = Vec::new();
    while let Ok(raw) = rx.try_recv() {
        messages.push(CollabMessage::decode(&raw).unwrap());
    }
    messages
}

#[tokio::test]
async fn join_and_leave_reach_subscribers() {
    let (mut session, broadcaster) = session_with_channel();
    let mut rx = broadcaster.subscribe();
    let user = Uuid::new_v4();

    session.join_user(user, "Alice");
    session.leave_user(user);

    let messages = drain(&mut rx).await;
    let types: Vec<MessageType> = messages.iter().map(|m| m.msg_type).collect();
    assert!(types.contains(&MessageType::UserJoined));
    assert!(types.contains(&MessageType::UserLeft));

    let join = messages.iter().find(|m| m.msg_type == MessageType::UserJoined).unwrap();
    let payload = join.join_payload().unwrap();
    assert_eq!(payload.name, "Alice");
    // Stable color: the same user id always maps to the same color.
    assert_eq!(payload.color, atelier_collab::stable_color(user));
}

#[tokio::test]
async fn cursor_updates_are_rate_limited_on_the_wire() {
    let (mut session, broadcaster) = session_with_channel();
    let mut rx = broadcaster.subscribe();
    let user = Uuid::new_v4();
    session.join_user(user, "Alice");

    // A burst far above 30/s: only the first broadcast goes out.
    for x in 0..50 {
        session.update_cursor(user, Point3D::new(x as f64, 0.0, 0.0));
    }

    let cursor_count = drain(&mut rx)
        .await
        .iter()
        .filter(|m| m.msg_type == MessageType::CursorMoved)
        .count();
    assert_eq!(cursor_count, 1);

    // The latest position is still what the session stores.
    let stored = session.presence().user(&user).unwrap().cursor.unwrap();
    assert_eq!(stored.position, Point3D::new(49.0, 0.0, 0.0));
}

#[tokio::test]
async fn exclusive_lock_mutual_exclusion_with_replay() {
    let (mut session, broadcaster) = session_with_channel();
    let mut rx = broadcaster.subscribe();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let object = Uuid::new_v4();
    session.join_user(alice, "Alice");
    session.join_user(bob, "Bob");

    // Two concurrent exclusive requests: exactly one is granted.
    let first = session.acquire_lock(object, alice, LockKind::Exclusive, None);
    let second = session.acquire_lock(object, bob, LockKind::Exclusive, None);
    assert!(first.is_granted());
    assert_eq!(second, LockGrant::Queued);

    // Release: the queued request is granted automatically.
    session.release_lock(object, alice);
    assert_eq!(session.lock_manager().lock(&object).unwrap().user_id, bob);

    let messages = drain(&mut rx).await;
    let grants: Vec<Uuid> = messages
        .iter()
        .filter(|m| m.msg_type == MessageType::LockGranted)
        .map(|m| m.lock_payload().unwrap().holder)
        .collect();
    assert_eq!(grants, vec![alice, bob]);
}

#[tokio::test]
async fn selection_takes_shared_locks_and_skips_foreign_exclusive() {
    let (mut session, broadcaster) = session_with_channel();
    let mut rx = broadcaster.subscribe();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    session.join_user(alice, "Alice");
    session.join_user(bob, "Bob");

    let free_a = Uuid::new_v4();
    let free_b = Uuid::new_v4();
    let taken = Uuid::new_v4();
    session.acquire_lock(taken, bob, LockKind::Exclusive, None);

    let granted = session.select_objects(alice, vec![free_a, taken, free_b]);
    assert_eq!(granted, vec![free_a, free_b]);

    let selection = drain(&mut rx)
        .await
        .into_iter()
        .find(|m| m.msg_type == MessageType::SelectionChanged)
        .unwrap();
    assert_eq!(selection.selection_payload().unwrap().selected, vec![free_a, free_b]);

    // Both selected objects carry shared locks; two users can select the
    // same object concurrently.
    let granted_bob = session.select_objects(bob, vec![free_a]);
    assert_eq!(granted_bob, vec![free_a]);
    assert_eq!(session.lock_manager().lock(&free_a).unwrap().holders.len(), 2);
}

#[tokio::test]
async fn idle_sweep_flips_status_and_activity_flips_back() {
    let broadcaster = Arc::new(ChannelBroadcaster::new(256));
    let config = SessionConfig {
        presence: PresenceConfig {
            idle_threshold: std::time::Duration::from_secs(0),
            ..PresenceConfig::default()
        },
        ..SessionConfig::default()
    };
    let mut session = DocumentSession::new(
        Uuid::new_v4(),
        config,
        Box::new(atelier_collab::NullGeometry),
        broadcaster.clone(),
    );
    let mut rx = broadcaster.subscribe();
    let user = Uuid::new_v4();
    session.join_user(user, "Alice");

    session.sweep_idle();
    assert_eq!(session.presence().user(&user).unwrap().status, PresenceStatus::Idle);

    // Any tracked activity flips the user back to Active.
    session.update_cursor(user, Point3D::new(1.0, 0.0, 0.0));
    assert_eq!(session.presence().user(&user).unwrap().status, PresenceStatus::Active);

    let statuses: Vec<PresenceStatus> = drain(&mut rx)
        .await
        .iter()
        .filter(|m| m.msg_type == MessageType::StatusChanged)
        .map(|m| m.status_payload().unwrap().status)
        .collect();
    assert!(statuses.contains(&PresenceStatus::Idle));
}

#[tokio::test]
async fn expired_locks_are_swept_and_queue_replayed() {
    let (mut session, _broadcaster) = session_with_channel();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let object = Uuid::new_v4();
    session.join_user(alice, "Alice");
    session.join_user(bob, "Bob");

    // Alice's lock is already past its deadline; Bob waits in the queue.
    session.acquire_lock(object, alice, LockKind::Exclusive, Some(chrono::Duration::milliseconds(-1)));
    session.acquire_lock(object, bob, LockKind::Exclusive, None);

    session.sweep_locks();
    let lock = session.lock_manager().lock(&object).unwrap();
    assert_eq!(lock.user_id, bob);
    // Presence bookkeeping followed the handover.
    assert!(session.presence().user(&bob).unwrap().locked_objects.contains(&object));
    assert!(!session.presence().user(&alice).unwrap().locked_objects.contains(&object));
}

#[tokio::test]
async fn cache_mirror_projects_presence_and_locks() {
    let (mut session, _broadcaster) = session_with_channel();
    let user = Uuid::new_v4();
    let object = Uuid::new_v4();
    session.join_user(user, "Alice");
    session.acquire_lock(object, user, LockKind::Exclusive, None);

    let mirror = CacheMirror::new(InMemoryCache::new());
    session.mirror_state(&mirror);

    let projected = mirror.read_presence(session.document_id(), user).unwrap().unwrap();
    assert_eq!(projected.user_id, user);
    assert_eq!(projected.name, "Alice");
    assert!(projected.locked_objects.contains(&object));
    assert!(!mirror.cache().is_empty());
}

#[tokio::test]
async fn sweeps_run_in_background_without_blocking() {
    let manager = SessionManager::new(SessionConfig {
        idle_sweep_interval: std::time::Duration::from_millis(10),
        lock_sweep_interval: std::time::Duration::from_millis(10),
        mirror_interval: std::time::Duration::from_millis(10),
        ..SessionConfig::default()
    });
    let doc = Uuid::new_v4();
    let session = manager.get_or_create(doc).await;
    let user = Uuid::new_v4();
    session.lock().await.join_user(user, "Alice");

    let mirror = Arc::new(CacheMirror::new(InMemoryCache::new()));
    let handles = manager.spawn_sweeps(mirror.clone());

    // Give the mirror sweep a few ticks, then check the projection landed.
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    let projected = mirror.read_presence(doc, user).unwrap();
    assert!(projected.is_some());

    // Foreground requests proceed while sweeps run.
    session.lock().await.update_cursor(user, Point3D::new(1.0, 2.0, 3.0));

    for handle in handles {
        handle.abort();
    }
}
