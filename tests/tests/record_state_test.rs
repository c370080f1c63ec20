
use common::{nodes, running_record};
use gnsd::consensus::{NodeId, TransitionId};
use gnsd::storage::{ActiveState, MovingAverage, RecordState, RemovalRequest, StorageError};
use uuid::Uuid;

#[test]
fn new_record_waits_for_its_first_start() {
    let id = TransitionId::generate();
    let record = RecordState::new("alpha", nodes(&[1, 2, 3]), nodes(&[4, 5, 6]), id, 20);

    assert_eq!(record.compute_state(), ActiveState::NoActiveRunning);
    assert_eq!(record.active_transition_id(), id);
    assert_ne!(record.old_transition_id(), id);
    assert!(record.old_active_set().is_empty());
}

#[test]
fn begin_transition_moves_to_old_active_running() {
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    let previous = record.active_transition_id();
    let next = TransitionId::generate();

    record.begin_transition(nodes(&[7, 8, 9]), next).unwrap();

    assert_eq!(record.compute_state(), ActiveState::OldActiveRunning);
    assert_eq!(record.old_transition_id(), previous);
    assert_eq!(record.old_active_set(), &nodes(&[4, 5, 6]));
    assert_eq!(record.active_set(), &nodes(&[7, 8, 9]));
    assert!(record.last_transition_at.is_some());
}

#[test]
fn full_transition_returns_to_active_running() {
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    let old = record.active_transition_id();
    let next = TransitionId::generate();

    record.begin_transition(nodes(&[7, 8, 9]), next).unwrap();
    assert!(record.confirm_old_stopped(old));
    assert_eq!(record.compute_state(), ActiveState::NoActiveRunning);
    assert!(record.confirm_new_running(next));
    assert_eq!(record.compute_state(), ActiveState::ActiveRunning);
}

#[test]
fn begin_transition_refuses_while_in_flight() {
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    record
        .begin_transition(nodes(&[7]), TransitionId::generate())
        .unwrap();

    let err = record
        .begin_transition(nodes(&[8]), TransitionId::generate())
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::TransitionInProgress {
            state: ActiveState::OldActiveRunning,
            ..
        }
    ));
    assert_eq!(record.active_set(), &nodes(&[7]));
}

#[test]
fn begin_transition_refuses_a_reused_id() {
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    let current = record.active_transition_id();

    let err = record.begin_transition(nodes(&[7]), current).unwrap_err();
    assert!(matches!(err, StorageError::DuplicateTransition { .. }));
    assert_eq!(record.compute_state(), ActiveState::ActiveRunning);
}

#[test]
fn confirm_old_stopped_is_idempotent() {
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    let old = record.active_transition_id();
    record
        .begin_transition(nodes(&[7]), TransitionId::generate())
        .unwrap();

    assert!(record.confirm_old_stopped(old));
    let after_first = record.clone();
    assert!(!record.confirm_old_stopped(old));
    assert_eq!(record, after_first);
}

#[test]
fn stale_confirmations_change_nothing() {
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    record
        .begin_transition(nodes(&[7]), TransitionId::generate())
        .unwrap();
    let before = record.clone();
    let stale = TransitionId::generate();

    assert!(!record.confirm_old_stopped(stale));
    assert!(!record.confirm_new_running(stale));
    assert!(!record.confirm_active_stopped(stale));
    assert_eq!(record, before);
}

#[test]
fn starting_before_the_old_set_stops_is_a_conflict() {
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    let next = TransitionId::generate();
    record.begin_transition(nodes(&[7]), next).unwrap();

    assert!(record.confirm_new_running(next));
    assert_eq!(record.compute_state(), ActiveState::Conflict);
}

#[test]
fn removal_stops_the_current_generation() {
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    let current = record.active_transition_id();

    // Not marked yet: the removal path is closed.
    assert!(!record.confirm_active_stopped(current));

    let request = RemovalRequest {
        request_id: Uuid::new_v4(),
        requested_by: NodeId(2),
    };
    assert!(record.mark_for_removal(request.clone()));
    assert!(!record.mark_for_removal(RemovalRequest {
        request_id: Uuid::new_v4(),
        requested_by: NodeId(3),
    }));
    assert_eq!(record.removal_request(), Some(&request));

    assert!(record.confirm_active_stopped(current));
    assert!(!record.confirm_active_stopped(current));
    assert_eq!(record.compute_state(), ActiveState::NoActiveRunning);
}

#[test]
fn demand_reports_become_votes() {
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    record.record_demand(NodeId(7), 5, 1);
    record.record_demand(NodeId(8), 9, 0);
    record.record_demand(NodeId(7), 4, 0);
    record.record_demand(NodeId(9), 0, 3);

    assert_eq!(record.votes().get(&NodeId(7)), Some(&9));
    assert_eq!(record.votes().get(&NodeId(9)), None);
    // Tie between 7 and 8 goes to the lower id.
    assert_eq!(record.ranked_voters(), vec![NodeId(7), NodeId(8)]);
    assert_eq!(record.demand.pending_totals(), (18, 4));
}

#[test]
fn oversized_demand_reports_saturate() {
    let mut record = running_record("alpha", &[1, 2, 3], &[4, 5, 6]);
    record.record_demand(NodeId(1), u64::MAX, u64::MAX);
    record.record_demand(NodeId(1), 1, 1);

    assert_eq!(record.votes().get(&NodeId(1)), Some(&u64::MAX));
    assert_eq!(record.demand.node_demand(NodeId(1)).reads, u64::MAX);
    assert_eq!(record.demand.pending_totals(), (u64::MAX, u64::MAX));

    let (lookup_rate, update_rate) = record.demand.roll_window();
    assert_eq!(lookup_rate, u64::MAX as f64);
    assert_eq!(update_rate, u64::MAX as f64);
}

#[test]
fn moving_average_recovers_after_a_saturating_sample() {
    let mut average = MovingAverage::new(2);
    average.add(u64::MAX);
    average.add(1);
    assert_eq!(average.average(), u64::MAX as f64 / 2.0);

    average.add(3);
    assert_eq!(average.len(), 2);
    assert_eq!(average.average(), 2.0);
}
