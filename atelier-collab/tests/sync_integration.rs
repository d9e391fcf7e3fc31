//! Integration tests for offline editing and reconnection.
//!
//! These drive a full `DocumentSession` — buffer, transform engine,
//! resolver and sync coordinator wired together — through the offline →
//! edit → reconnect cycle and verify convergence, rejection handling and
//! checksum behavior end to end.

use std::sync::Arc;

use atelier_collab::{
    DocumentSession, MessageType, RecordingSink, ResolutionStrategy, SessionConfig, SubmitOutcome,
};
use atelier_core::{Operation, OperationKind, Point3D};
use uuid::Uuid;

fn session_with_sink() -> (DocumentSession, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let session = DocumentSession::new(
        Uuid::new_v4(),
        SessionConfig::default(),
        Box::new(atelier_collab::NullGeometry),
        sink.clone(),
    );
    (session, sink)
}

fn move_op(obj: Uuid, user: Uuid, x: f64) -> Operation {
    Operation::new(OperationKind::Move, obj, user)
        .with_point_param("position", Point3D::new(x, 0.0, 0.0))
}

fn modify_op(obj: Uuid, user: Uuid, key: &str, value: f64) -> Operation {
    Operation::new(OperationKind::Modify, obj, user).with_param(key, value)
}

#[test]
fn offline_edits_replay_after_reconnect() {
    let (mut session, _sink) = session_with_sink();
    let away = Uuid::new_v4();
    let here = Uuid::new_v4();

    let checksum = session.join_user(away, "Away").checksum.clone();
    session.join_user(here, "Here");
    session.mark_offline(away).unwrap();

    // Online user keeps working on unrelated objects.
    for x in 0..3 {
        session.submit_operation(move_op(Uuid::new_v4(), here, x as f64)).unwrap();
    }

    // The away user edited three other objects meanwhile.
    let offline_ops: Vec<Operation> =
        (0..3).map(|x| move_op(Uuid::new_v4(), away, 100.0 + x as f64)).collect();

    let report = session.reconnect(away, offline_ops.clone(), &checksum).unwrap();
    assert!(!report.full_resync);
    assert_eq!(report.fetched, 3);
    assert_eq!(report.applied.len(), 3);
    assert_eq!(report.rejected, 0);
    // old(0) + fetched(3) + applied(3)
    assert_eq!(report.new_version, 6);

    for op in &offline_ops {
        assert!(session.buffer().contains(&op.id));
    }
}

#[test]
fn contended_moves_converge_to_midpoint() {
    let (mut session, _sink) = session_with_sink();
    let away = Uuid::new_v4();
    let here = Uuid::new_v4();
    let object = Uuid::new_v4();

    let checksum = session.join_user(away, "Away").checksum.clone();
    session.join_user(here, "Here");
    session.mark_offline(away).unwrap();

    session.submit_operation(move_op(object, here, 10.0)).unwrap();

    let report = session.reconnect(away, vec![move_op(object, away, 0.0)], &checksum).unwrap();
    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(report.applied.len(), 1);

    let merged = &report.applied[0];
    assert!(merged
        .point_param("position")
        .unwrap()
        .approx_eq(&Point3D::new(5.0, 0.0, 0.0), 1e-9));
    assert_eq!(merged.merged_from().len(), 2);
}

#[test]
fn deleted_object_edits_land_in_manual_queue() {
    let (mut session, _sink) = session_with_sink();
    let away = Uuid::new_v4();
    let here = Uuid::new_v4();
    let object = Uuid::new_v4();

    let checksum = session.join_user(away, "Away").checksum.clone();
    session.join_user(here, "Here");
    session.mark_offline(away).unwrap();

    session
        .submit_operation(
            Operation::new(OperationKind::Delete, object, here).with_param("cascade", true),
        )
        .unwrap();

    let report = session.reconnect(away, vec![move_op(object, away, 5.0)], &checksum).unwrap();
    assert_eq!(report.rejected, 1);
    assert!(report.applied.is_empty());

    // The deletion conflict is exposed for a human decision.
    let queue = session.sync().manual_queue();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].op1.object_id, object);
}

#[test]
fn manual_decision_completes_queued_conflict() {
    let (mut session, _sink) = session_with_sink();
    let away = Uuid::new_v4();
    let here = Uuid::new_v4();
    let reviewer = Uuid::new_v4();
    let object = Uuid::new_v4();

    let checksum = session.join_user(away, "Away").checksum.clone();
    session.join_user(here, "Here");
    session.mark_offline(away).unwrap();

    session
        .submit_operation(
            Operation::new(OperationKind::Delete, object, here).with_param("cascade", true),
        )
        .unwrap();
    session.reconnect(away, vec![move_op(object, away, 5.0)], &checksum).unwrap();

    let conflict_id = session.sync().manual_queue()[0].id;
    let decision = modify_op(object, reviewer, "restored", 1.0);
    let outcome = session.resolve_manual(conflict_id, decision.clone(), reviewer).unwrap();

    assert_eq!(outcome, Some(SubmitOutcome::Applied { version: 2 }));
    assert!(session.sync().manual_queue().is_empty());
    assert!(session.buffer().contains(&decision.id));
    // An unknown conflict id is a quiet no-op.
    assert_eq!(session.resolve_manual(Uuid::new_v4(), decision, reviewer).unwrap(), None);
}

#[test]
fn wrong_checksum_forces_full_resync() {
    let (mut session, _sink) = session_with_sink();
    let away = Uuid::new_v4();
    let here = Uuid::new_v4();

    session.join_user(away, "Away");
    session.join_user(here, "Here");
    session.mark_offline(away).unwrap();
    session.queue_offline(away, move_op(Uuid::new_v4(), away, 1.0)).unwrap();
    session.submit_operation(move_op(Uuid::new_v4(), here, 2.0)).unwrap();

    let report = session.reconnect(away, Vec::new(), "bogus-checksum").unwrap();
    assert!(report.full_resync);
    assert!(report.applied.is_empty());

    let state = session.sync().client(&away).unwrap();
    assert!(state.pending_operations.is_empty());
    assert_eq!(state.last_sync_version, session.buffer().latest_version());
    assert_eq!(state.checksum, session.sync().checksum());
}

#[test]
fn disjoint_objects_are_order_independent() {
    // Two sessions accept the same two operations in opposite orders; the
    // resulting buffers hold the same set with the same per-object payloads.
    let user = Uuid::new_v4();
    let op_a = move_op(Uuid::new_v4(), user, 1.0);
    let op_b = move_op(Uuid::new_v4(), user, 2.0);

    let (mut left, _) = session_with_sink();
    left.submit_operation(op_a.clone()).unwrap();
    left.submit_operation(op_b.clone()).unwrap();

    let (mut right, _) = session_with_sink();
    right.submit_operation(op_b.clone()).unwrap();
    right.submit_operation(op_a.clone()).unwrap();

    for op in [&op_a, &op_b] {
        let l = left.buffer().get(&op.id).unwrap();
        let r = right.buffer().get(&op.id).unwrap();
        assert_eq!(l.point_param("position"), r.point_param("position"));
    }
    assert_eq!(left.buffer().len(), right.buffer().len());
}

#[test]
fn timestamp_strategy_resolved_timestamp_is_latest() {
    // Under the Timestamp strategy the surviving operation's timestamp is
    // never older than the loser's.
    let object = Uuid::new_v4();
    let away = Uuid::new_v4();
    let here = Uuid::new_v4();

    let config = SessionConfig {
        default_strategy: ResolutionStrategy::Timestamp,
        ..SessionConfig::default()
    };
    let mut session = DocumentSession::new(
        Uuid::new_v4(),
        config,
        Box::new(atelier_collab::NullGeometry),
        Arc::new(RecordingSink::new()),
    );

    let checksum = session.join_user(away, "Away").checksum.clone();
    session.join_user(here, "Here");
    session.mark_offline(away).unwrap();

    let server_op = move_op(object, here, 10.0);
    let server_ts = server_op.timestamp;
    session.submit_operation(server_op).unwrap();

    // The offline op is older; the inline timestamp transform drops it.
    let stale = move_op(object, away, 0.0)
        .with_timestamp(server_ts - chrono::Duration::seconds(30));
    let report = session.reconnect(away, vec![stale], &checksum).unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(report.rejected, 0);

    // The surviving buffer entry is the strictly later server op.
    let survivor = session.buffer().ops_since(0).pop().unwrap();
    assert!(survivor.timestamp >= server_ts);
}

#[test]
fn partial_sync_resumes_interrupted_catchup() {
    let (mut session, _sink) = session_with_sink();
    let away = Uuid::new_v4();
    let here = Uuid::new_v4();

    session.join_user(away, "Away");
    session.join_user(here, "Here");
    session.mark_offline(away).unwrap();

    for x in 0..10 {
        session.submit_operation(move_op(Uuid::new_v4(), here, x as f64)).unwrap();
    }

    // Catch up in two windows.
    let first = session.partial_sync(away, Vec::new(), 0, 5).unwrap();
    assert_eq!(first.fetched, 5);
    assert_eq!(session.sync().client(&away).unwrap().last_sync_version, 5);
    assert!(!session.sync().client(&away).unwrap().is_online());

    let second = session.partial_sync(away, Vec::new(), 5, 10).unwrap();
    assert_eq!(second.fetched, 5);
    assert_eq!(session.sync().client(&away).unwrap().last_sync_version, 10);
}

#[test]
fn duplicate_operation_delivery_is_idempotent() {
    let (mut session, _sink) = session_with_sink();
    let user = Uuid::new_v4();
    session.join_user(user, "Alice");

    let op = move_op(Uuid::new_v4(), user, 1.0);
    assert_eq!(
        session.submit_operation(op.clone()).unwrap(),
        SubmitOutcome::Applied { version: 1 }
    );
    // At-least-once transport redelivers; the buffer dedups by id.
    assert_eq!(session.submit_operation(op.clone()).unwrap(), SubmitOutcome::Duplicate);
    assert_eq!(session.submit_operation(op).unwrap(), SubmitOutcome::Duplicate);
    assert_eq!(session.buffer().len(), 1);
}

#[test]
fn checksum_is_stable_across_recomputation() {
    let (mut session, _sink) = session_with_sink();
    let user = Uuid::new_v4();
    session.join_user(user, "Alice");
    session.submit_operation(move_op(Uuid::new_v4(), user, 1.0)).unwrap();

    let first = session.sync().checksum();
    let second = session.sync().checksum();
    assert_eq!(first, second);
    assert_eq!(first.len(), 64); // sha-256 hex
}

#[test]
fn every_accepted_operation_is_broadcast() {
    let (mut session, sink) = session_with_sink();
    let user = Uuid::new_v4();
    session.join_user(user, "Alice");

    for x in 0..5 {
        session.submit_operation(move_op(Uuid::new_v4(), user, x as f64)).unwrap();
    }

    let op_messages: Vec<_> = sink
        .messages()
        .into_iter()
        .filter(|m| m.msg_type == MessageType::Operation)
        .collect();
    assert_eq!(op_messages.len(), 5);
    // Payloads decode back into the accepted operations.
    for message in op_messages {
        let op = message.operation_payload().unwrap();
        assert!(session.buffer().contains(&op.id));
    }
}
